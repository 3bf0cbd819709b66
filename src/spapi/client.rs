use crate::http::{HttpRequest, HttpResponse, HttpTransport, Sleeper, TransportError};
use reqwest::Method;
use serde_json::Value;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, warn};

pub const MAX_RATE_LIMIT_RETRIES: u32 = 5;

#[derive(Debug, Clone, Error)]
pub enum ClientError {
    #[error(transparent)]
    Transport(#[from] TransportError),
    #[error("rate limit still active after {retries} retries")]
    RateLimitExhausted { retries: u32 },
}

/// `2^attempt` seconds plus `jitter` (expected in `[0, 1)`).
pub fn backoff_delay(attempt: u32, jitter: f64) -> Duration {
    let base = 2f64.powi(attempt as i32);
    Duration::from_secs_f64(base + jitter.clamp(0.0, 0.999_999))
}

/// Issues requests and absorbs HTTP 429 throttling with jittered exponential backoff.
/// Transport failures are returned immediately; any other status passes through.
pub struct RateLimitedClient<T, S> {
    transport: T,
    sleeper: S,
    max_retries: u32,
}

impl<T: HttpTransport, S: Sleeper> RateLimitedClient<T, S> {
    pub fn new(transport: T, sleeper: S) -> Self {
        Self {
            transport,
            sleeper,
            max_retries: MAX_RATE_LIMIT_RETRIES,
        }
    }

    pub fn sleeper(&self) -> &S {
        &self.sleeper
    }

    #[allow(dead_code)]
    pub fn transport(&self) -> &T {
        &self.transport
    }

    pub async fn send(
        &self,
        method: Method,
        url: &str,
        headers: &[(&str, String)],
        params: &[(&str, String)],
        body: Option<Value>,
    ) -> Result<HttpResponse, ClientError> {
        let mut request = HttpRequest::get(url);
        request.method = method;
        request.body = body;
        for (name, value) in headers {
            request = request.header(name, value.clone());
        }
        for (name, value) in params {
            request = request.param(name, value.clone());
        }
        self.execute(request).await
    }

    pub async fn execute(&self, request: HttpRequest) -> Result<HttpResponse, ClientError> {
        let mut attempt = 0u32;
        loop {
            let response = self.transport.execute(request.clone()).await?;
            if response.status != 429 {
                debug!(
                    target = "extractor.http",
                    method = %request.method,
                    url = %request.url,
                    status = response.status,
                    "request completed"
                );
                return Ok(response);
            }
            if attempt >= self.max_retries {
                warn!(
                    target = "extractor.http",
                    url = %request.url,
                    retries = attempt,
                    "rate limit retries exhausted"
                );
                return Err(ClientError::RateLimitExhausted { retries: attempt });
            }
            let wait = backoff_delay(attempt, rand::random::<f64>());
            crate::metrics::inc_throttled("send", attempt);
            warn!(
                target = "extractor.http",
                url = %request.url,
                attempt = attempt,
                wait_ms = wait.as_millis() as u64,
                "throttled (429), backing off"
            );
            self.sleeper.sleep(wait).await;
            attempt += 1;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::http::testing::{RecordingSleeper, ScriptedTransport, json_response};
    use serde_json::json;

    #[test]
    fn backoff_bounds() {
        for attempt in 0..MAX_RATE_LIMIT_RETRIES {
            let floor = Duration::from_secs(1 << attempt);
            let ceiling = Duration::from_secs((1 << attempt) + 1);
            for jitter in [0.0, 0.25, 0.999, 1.0, rand::random::<f64>()] {
                let wait = backoff_delay(attempt, jitter);
                assert!(wait >= floor && wait < ceiling, "attempt {attempt}: {wait:?}");
            }
        }
    }

    #[tokio::test]
    async fn retries_429_until_success() {
        let transport = ScriptedTransport::new().route(
            Method::GET,
            "/status",
            vec![
                json_response(429, json!({})),
                json_response(429, json!({})),
                json_response(200, json!({"ok": true})),
            ],
        );
        let client = RateLimitedClient::new(transport, RecordingSleeper::default());
        let response = client
            .send(Method::GET, "https://api.test/status", &[], &[], None)
            .await
            .expect("eventually succeeds");
        assert_eq!(response.status, 200);
        assert_eq!(client.sleeper().waits().len(), 2);
        assert_eq!(client.transport().count(Method::GET, "/status"), 3);
    }

    #[tokio::test]
    async fn gives_up_after_five_retries_with_bounded_waits() {
        let transport =
            ScriptedTransport::new().route(Method::GET, "/busy", vec![json_response(429, json!({}))]);
        let client = RateLimitedClient::new(transport, RecordingSleeper::default());
        let err = client
            .send(Method::GET, "https://api.test/busy", &[], &[], None)
            .await
            .expect_err("throttled forever");
        assert!(matches!(err, ClientError::RateLimitExhausted { retries: 5 }));
        let waits = client.sleeper().waits();
        assert_eq!(waits.len(), 5);
        for (i, wait) in waits.iter().enumerate() {
            let floor = Duration::from_secs(1 << i);
            assert!(*wait >= floor && *wait < floor + Duration::from_secs(1));
        }
        assert_eq!(client.transport().count(Method::GET, "/busy"), 6);
    }

    #[tokio::test]
    async fn transport_failure_is_not_retried() {
        let transport = ScriptedTransport::new().route(
            Method::GET,
            "/down",
            vec![Err(TransportError("connection refused".into()))],
        );
        let client = RateLimitedClient::new(transport, RecordingSleeper::default());
        let err = client
            .send(Method::GET, "https://api.test/down", &[], &[], None)
            .await
            .expect_err("transport failure");
        assert!(matches!(err, ClientError::Transport(_)));
        assert!(client.sleeper().waits().is_empty());
        assert_eq!(client.transport().count(Method::GET, "/down"), 1);
    }

    #[tokio::test]
    async fn other_statuses_pass_through() {
        let transport = ScriptedTransport::new().route(
            Method::POST,
            "/reports",
            vec![json_response(400, json!({"errors": [{"code": "InvalidInput"}]}))],
        );
        let client = RateLimitedClient::new(transport, RecordingSleeper::default());
        let response = client
            .send(
                Method::POST,
                "https://api.test/reports",
                &[("x-amz-access-token", "t".to_string())],
                &[("a", "1".to_string())],
                Some(json!({})),
            )
            .await
            .expect("400 is not a client failure");
        assert_eq!(response.status, 400);
        let sent = client.transport().requests();
        assert_eq!(sent[0].headers[0].0, "x-amz-access-token");
        assert_eq!(sent[0].query[0], ("a".to_string(), "1".to_string()));
    }
}
