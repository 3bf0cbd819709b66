use crate::http::{HttpTransport, Sleeper};
use crate::segment::DateWindow;
use crate::spapi::client::{ClientError, RateLimitedClient};
use reqwest::Method;
use serde::Deserialize;
use serde_json::Value;
use thiserror::Error;
use tracing::debug;

const FINANCES_PATH: &str = "/finances/v0/financialEvents";
const PAGE_SIZE: &str = "100";

#[derive(Debug, Error)]
pub enum FinancesError {
    #[error(transparent)]
    Client(#[from] ClientError),
    #[error("financial events returned HTTP {status}: {body}")]
    Status { status: u16, body: String },
    #[error("unexpected financial events payload: {0}")]
    Schema(String),
}

#[derive(Deserialize)]
struct Envelope {
    payload: Option<EnvelopePayload>,
}

#[derive(Deserialize)]
#[serde(rename_all = "PascalCase")]
struct EnvelopePayload {
    next_token: Option<String>,
    #[serde(default)]
    financial_events: Value,
}

#[derive(Debug)]
pub struct FinancePage {
    pub events: Value,
    pub next_token: Option<String>,
}

/// Pages through `listFinancialEvents` for one posted-date window.
pub struct FinancialEventsReader<'a, T, S> {
    client: &'a RateLimitedClient<T, S>,
    root: String,
    access_token: String,
    window: DateWindow,
    next_token: Option<String>,
    finished: bool,
}

impl<'a, T: HttpTransport, S: Sleeper> FinancialEventsReader<'a, T, S> {
    pub fn new(
        client: &'a RateLimitedClient<T, S>,
        root: &str,
        access_token: &str,
        window: DateWindow,
    ) -> Self {
        Self {
            client,
            root: root.trim_end_matches('/').to_string(),
            access_token: access_token.to_string(),
            window,
            next_token: None,
            finished: false,
        }
    }

    /// `Ok(None)` once the last page has been returned.
    pub async fn next_page(&mut self) -> Result<Option<FinancePage>, FinancesError> {
        if self.finished {
            return Ok(None);
        }
        let params: Vec<(&str, String)> = match &self.next_token {
            Some(token) => vec![("NextToken", token.clone())],
            None => vec![
                ("PostedAfter", self.window.start_iso()),
                ("PostedBefore", self.window.end_iso()),
                ("MaxResultsPerPage", PAGE_SIZE.to_string()),
            ],
        };
        let url = format!("{}{}", self.root, FINANCES_PATH);
        let headers = [
            ("x-amz-access-token", self.access_token.clone()),
            ("accept", "application/json".to_string()),
        ];
        let response = self
            .client
            .send(Method::GET, &url, &headers, &params, None)
            .await
            .inspect_err(|_| self.finished = true)?;
        crate::metrics::inc_api_calls("list_financial_events", response.status);
        if !response.is_success() {
            self.finished = true;
            return Err(FinancesError::Status {
                status: response.status,
                body: response.text_preview(),
            });
        }
        let envelope: Envelope = response.json().map_err(|err| {
            self.finished = true;
            FinancesError::Schema(err.to_string())
        })?;
        let Some(payload) = envelope.payload else {
            self.finished = true;
            return Err(FinancesError::Schema("missing payload".into()));
        };
        self.next_token = payload.next_token.filter(|t| !t.is_empty());
        self.finished = self.next_token.is_none();
        debug!(
            target = "extractor.finances",
            has_next = !self.finished,
            "financial events page received"
        );
        Ok(Some(FinancePage {
            events: payload.financial_events,
            next_token: self.next_token.clone(),
        }))
    }
}
