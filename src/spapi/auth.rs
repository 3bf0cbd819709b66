use crate::config::{Credentials, LWA_TOKEN_URL};
use crate::http::build_client;
use serde::Deserialize;
use thiserror::Error;
use tracing::info;

#[derive(Debug, Error)]
pub enum AuthError {
    #[error("missing login-with-amazon credentials (refresh token, app id, client secret)")]
    MissingCredentials,
    #[error("token refresh failed: {0}")]
    Request(String),
    #[error("token response carried no access_token")]
    EmptyToken,
}

#[derive(Deserialize)]
struct TokenResponse {
    #[serde(default)]
    access_token: String,
}

/// Exchanges the long-lived refresh token for a short-lived access token.
/// The same token authorizes both the SP-API and the advertising API.
pub async fn refresh_access_token(credentials: &Credentials) -> Result<String, AuthError> {
    if !credentials.is_complete() {
        return Err(AuthError::MissingCredentials);
    }
    let params = [
        ("grant_type", "refresh_token"),
        ("refresh_token", credentials.refresh_token.as_str()),
        ("client_id", credentials.client_id.as_str()),
        ("client_secret", credentials.client_secret.as_str()),
    ];
    let client = build_client();
    let response = client
        .post(LWA_TOKEN_URL.as_str())
        .form(&params)
        .send()
        .await
        .map_err(|err| AuthError::Request(err.to_string()))?;

    if !response.status().is_success() {
        let status = response.status();
        let body = response.text().await.unwrap_or_default();
        return Err(AuthError::Request(format!(
            "HTTP {status} - {}",
            body.chars().take(200).collect::<String>()
        )));
    }

    let payload: TokenResponse = response
        .json()
        .await
        .map_err(|err| AuthError::Request(err.to_string()))?;
    if payload.access_token.is_empty() {
        return Err(AuthError::EmptyToken);
    }
    info!(target = "extractor.auth", "access token refreshed");
    Ok(payload.access_token)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn incomplete_credentials_fail_before_any_request() {
        let credentials = Credentials {
            refresh_token: "rt".into(),
            client_id: String::new(),
            client_secret: "sec".into(),
        };
        let err = refresh_access_token(&credentials).await.unwrap_err();
        assert!(matches!(err, AuthError::MissingCredentials));
    }
}
