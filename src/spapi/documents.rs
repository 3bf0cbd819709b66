use crate::http::{HttpTransport, Sleeper};
use crate::models::{Compression, ReportDocument};
use crate::spapi::client::{ClientError, RateLimitedClient};
use async_compression::tokio::bufread::GzipDecoder;
use reqwest::Method;
use thiserror::Error;
use tokio::io::AsyncReadExt;
use tracing::{error, info};

#[derive(Debug, Error)]
pub enum DecodeError {
    #[error(transparent)]
    Client(#[from] ClientError),
    #[error("document download returned HTTP {0}")]
    Status(u16),
    #[error("gzip decompression failed: {0}")]
    Gzip(String),
}

pub async fn gunzip(bytes: &[u8]) -> Result<Vec<u8>, DecodeError> {
    let mut decoder = GzipDecoder::new(bytes);
    let mut out = Vec::with_capacity(bytes.len().saturating_mul(4));
    decoder
        .read_to_end(&mut out)
        .await
        .map_err(|err| DecodeError::Gzip(err.to_string()))?;
    Ok(out)
}

/// Downloads report content from its pre-signed URL. No auth headers are sent.
pub struct PayloadDecoder<'a, T, S> {
    client: &'a RateLimitedClient<T, S>,
}

impl<'a, T: HttpTransport, S: Sleeper> PayloadDecoder<'a, T, S> {
    pub fn new(client: &'a RateLimitedClient<T, S>) -> Self {
        Self { client }
    }

    pub async fn try_decode(&self, document: &ReportDocument) -> Result<Vec<u8>, DecodeError> {
        let response = self
            .client
            .send(Method::GET, &document.url, &[], &[], None)
            .await?;
        crate::metrics::inc_api_calls("download_document", response.status);
        if !response.is_success() {
            return Err(DecodeError::Status(response.status));
        }
        let body = match document.compression {
            Compression::Gzip => gunzip(&response.body).await?,
            Compression::None => response.body,
        };
        info!(
            target = "extractor.documents",
            bytes = body.len() as u64,
            compression = ?document.compression,
            "report document downloaded"
        );
        Ok(body)
    }

    /// Failures are logged and surface as empty content.
    #[allow(dead_code)]
    pub async fn decode(&self, document: &ReportDocument) -> Vec<u8> {
        match self.try_decode(document).await {
            Ok(body) => body,
            Err(err) => {
                error!(
                    target = "extractor.documents",
                    error = %err,
                    "report document could not be decoded"
                );
                Vec::new()
            }
        }
    }
}
