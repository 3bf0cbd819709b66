use crate::http::{HttpTransport, Sleeper};
use crate::models::{Compression, ProcessingStatus, ReportDocument, ReportJob, ReportRequest};
use crate::spapi::client::{ClientError, RateLimitedClient};
use reqwest::Method;
use serde::Deserialize;
use serde_json::json;
use std::time::Duration;
use thiserror::Error;
use tracing::{error, info, warn};
use urlencoding::encode;

pub const DATA_REPORT_POLL_INTERVAL: Duration = Duration::from_secs(10);
const REPORTS_PATH: &str = "/reports/2021-06-30";

#[derive(Debug, Clone, Error)]
pub enum JobFailure {
    #[error("job ended with status {0:?}")]
    Terminal(ProcessingStatus),
    #[error(transparent)]
    Client(#[from] ClientError),
    #[error("{call} rejected with HTTP {status}: {body}")]
    Rejected {
        call: &'static str,
        status: u16,
        body: String,
    },
    #[error("unexpected response: {0}")]
    Schema(String),
}

#[derive(Debug, Clone)]
pub enum JobOutcome {
    Completed(ReportDocument),
    TimedOut { polls: u32 },
    Failed(JobFailure),
}

#[derive(Debug, Clone, Copy)]
pub struct PollPolicy {
    pub interval: Duration,
    pub max_polls: u32,
}

/// One asynchronous report backend: how to submit, inspect, and resolve a job.
pub trait ReportApi {
    fn name(&self) -> &'static str;

    async fn create_report(&self, request: &ReportRequest) -> Result<String, JobFailure>;

    async fn fetch_job(&self, job_id: &str) -> Result<ReportJob, JobFailure>;

    async fn resolve_document(&self, job: &ReportJob) -> Result<ReportDocument, JobFailure>;
}

/// Drives a report job from submission to a terminal state.
pub struct ReportJobController<'a, A, S> {
    api: &'a A,
    sleeper: &'a S,
    policy: PollPolicy,
}

impl<'a, A: ReportApi, S: Sleeper> ReportJobController<'a, A, S> {
    pub fn new(api: &'a A, sleeper: &'a S, policy: PollPolicy) -> Self {
        Self {
            api,
            sleeper,
            policy,
        }
    }

    pub async fn create(&self, request: &ReportRequest) -> Result<String, JobFailure> {
        self.api.create_report(request).await
    }

    pub async fn poll_until_terminal(&self, job_id: &str) -> JobOutcome {
        let mut polls = 0u32;
        loop {
            if polls >= self.policy.max_polls {
                warn!(
                    target = "extractor.reports",
                    api = self.api.name(),
                    job_id = job_id,
                    polls = polls,
                    "report job did not finish within the poll budget"
                );
                return JobOutcome::TimedOut { polls };
            }
            polls += 1;
            let job = match self.api.fetch_job(job_id).await {
                Ok(job) => job,
                Err(err) => {
                    error!(
                        target = "extractor.reports",
                        api = self.api.name(),
                        job_id = job_id,
                        error = %err,
                        "report status check failed"
                    );
                    return JobOutcome::Failed(err);
                }
            };
            match job.status {
                ProcessingStatus::InQueue | ProcessingStatus::InProgress => {
                    info!(
                        target = "extractor.reports",
                        api = self.api.name(),
                        job_id = job_id,
                        status = ?job.status,
                        "report not ready, waiting"
                    );
                    self.sleeper.sleep(self.policy.interval).await;
                }
                ProcessingStatus::Done => {
                    return match self.api.resolve_document(&job).await {
                        Ok(document) => JobOutcome::Completed(document),
                        Err(err) => {
                            error!(
                                target = "extractor.reports",
                                api = self.api.name(),
                                job_id = job_id,
                                error = %err,
                                "report document could not be resolved"
                            );
                            JobOutcome::Failed(err)
                        }
                    };
                }
                ProcessingStatus::Cancelled | ProcessingStatus::Fatal => {
                    error!(
                        target = "extractor.reports",
                        api = self.api.name(),
                        job_id = job_id,
                        status = ?job.status,
                        "report job ended without a document"
                    );
                    return JobOutcome::Failed(JobFailure::Terminal(job.status));
                }
            }
        }
    }
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct CreateReportResponse {
    report_id: Option<String>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct ReportStatusResponse {
    report_id: Option<String>,
    processing_status: ProcessingStatus,
    report_document_id: Option<String>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct DocumentResponse {
    url: String,
    #[serde(default)]
    compression_algorithm: Option<String>,
}

/// Reports API v2021-06-30.
pub struct SellingPartnerReports<'a, T, S> {
    client: &'a RateLimitedClient<T, S>,
    root: String,
    access_token: String,
}

impl<'a, T: HttpTransport, S: Sleeper> SellingPartnerReports<'a, T, S> {
    pub fn new(client: &'a RateLimitedClient<T, S>, root: &str, access_token: &str) -> Self {
        Self {
            client,
            root: root.trim_end_matches('/').to_string(),
            access_token: access_token.to_string(),
        }
    }

    fn headers(&self) -> [(&'static str, String); 2] {
        [
            ("x-amz-access-token", self.access_token.clone()),
            ("accept", "application/json".to_string()),
        ]
    }
}

impl<T: HttpTransport, S: Sleeper> ReportApi for SellingPartnerReports<'_, T, S> {
    fn name(&self) -> &'static str {
        "sp-api"
    }

    async fn create_report(&self, request: &ReportRequest) -> Result<String, JobFailure> {
        let mut body = json!({
            "reportType": request.report_type.api_code(),
            "marketplaceIds": [request.marketplace_id],
        });
        if let Some(window) = &request.window {
            body["dataStartTime"] = json!(window.start_iso());
            body["dataEndTime"] = json!(window.end_iso());
        }
        let url = format!("{}{}/reports", self.root, REPORTS_PATH);
        let response = self
            .client
            .send(Method::POST, &url, &self.headers(), &[], Some(body))
            .await
            .inspect_err(|err| {
                error!(
                    target = "extractor.reports",
                    report_type = request.report_type.api_code(),
                    marketplace = %request.marketplace_id,
                    error = %err,
                    "report creation request failed"
                );
            })?;
        crate::metrics::inc_api_calls("create_report", response.status);
        if response.status != 202 {
            error!(
                target = "extractor.reports",
                report_type = request.report_type.api_code(),
                marketplace = %request.marketplace_id,
                status = response.status,
                body = %response.text_preview(),
                "report creation was not accepted"
            );
            return Err(JobFailure::Rejected {
                call: "createReport",
                status: response.status,
                body: response.text_preview(),
            });
        }
        match response.json::<CreateReportResponse>() {
            Ok(CreateReportResponse {
                report_id: Some(id),
            }) if !id.is_empty() => {
                info!(
                    target = "extractor.reports",
                    report_type = request.report_type.api_code(),
                    marketplace = %request.marketplace_id,
                    report_id = %id,
                    "report job created"
                );
                Ok(id)
            }
            _ => {
                error!(
                    target = "extractor.reports",
                    body = %response.text_preview(),
                    "report creation response carried no reportId"
                );
                Err(JobFailure::Schema("report creation response carried no reportId".into()))
            }
        }
    }

    async fn fetch_job(&self, job_id: &str) -> Result<ReportJob, JobFailure> {
        let url = format!("{}{}/reports/{}", self.root, REPORTS_PATH, encode(job_id));
        let response = self
            .client
            .send(Method::GET, &url, &self.headers(), &[], None)
            .await?;
        crate::metrics::inc_api_calls("get_report", response.status);
        if response.status != 200 {
            return Err(JobFailure::Rejected {
                call: "getReport",
                status: response.status,
                body: response.text_preview(),
            });
        }
        let payload: ReportStatusResponse = response
            .json()
            .map_err(|err| JobFailure::Schema(err.to_string()))?;
        Ok(ReportJob {
            job_id: payload.report_id.unwrap_or_else(|| job_id.to_string()),
            status: payload.processing_status,
            document_ref: payload.report_document_id,
        })
    }

    async fn resolve_document(&self, job: &ReportJob) -> Result<ReportDocument, JobFailure> {
        let document_id = job
            .document_ref
            .as_deref()
            .filter(|id| !id.is_empty())
            .ok_or_else(|| JobFailure::Schema("DONE job without reportDocumentId".into()))?;
        let url = format!("{}{}/documents/{}", self.root, REPORTS_PATH, encode(document_id));
        let response = self
            .client
            .send(Method::GET, &url, &self.headers(), &[], None)
            .await?;
        crate::metrics::inc_api_calls("get_report_document", response.status);
        if !response.is_success() {
            return Err(JobFailure::Rejected {
                call: "getReportDocument",
                status: response.status,
                body: response.text_preview(),
            });
        }
        let payload: DocumentResponse = response
            .json()
            .map_err(|err| JobFailure::Schema(err.to_string()))?;
        Ok(ReportDocument {
            url: payload.url,
            compression: Compression::from_raw(payload.compression_algorithm.as_deref()),
        })
    }
}
