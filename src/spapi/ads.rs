use crate::http::{HttpTransport, Sleeper};
use crate::models::{Compression, ProcessingStatus, ReportDocument, ReportJob, ReportRequest};
use crate::spapi::client::RateLimitedClient;
use crate::spapi::reports::{JobFailure, ReportApi};
use reqwest::Method;
use serde::Deserialize;
use serde_json::json;
use std::time::Duration;
use tracing::{error, info};
use urlencoding::encode;

pub const AD_REPORT_POLL_INTERVAL: Duration = Duration::from_secs(30);

const CREATE_CONTENT_TYPE: &str = "application/vnd.createasyncreportrequest.v3+json";

const ADVERTISED_PRODUCT_COLUMNS: &[&str] = &[
    "date",
    "campaignName",
    "campaignId",
    "adGroupName",
    "adGroupId",
    "adId",
    "portfolioId",
    "impressions",
    "clicks",
    "costPerClick",
    "clickThroughRate",
    "cost",
    "campaignBudgetCurrencyCode",
    "advertisedAsin",
    "advertisedSku",
    "purchases7d",
    "sales7d",
    "unitsSoldClicks7d",
];

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct AdReportResponse {
    report_id: Option<String>,
    #[serde(default)]
    status: Option<String>,
    #[serde(default)]
    url: Option<String>,
    #[serde(default)]
    failure_reason: Option<String>,
}

/// Maps the advertising API's lifecycle onto the shared job states.
fn map_status(raw: &str) -> Option<ProcessingStatus> {
    match raw.to_uppercase().as_str() {
        "PENDING" => Some(ProcessingStatus::InQueue),
        "PROCESSING" => Some(ProcessingStatus::InProgress),
        "COMPLETED" => Some(ProcessingStatus::Done),
        "FAILED" => Some(ProcessingStatus::Fatal),
        "CANCELLED" => Some(ProcessingStatus::Cancelled),
        _ => None,
    }
}

/// Amazon Ads reporting v3 (sponsored products, advertised product granularity).
pub struct AdvertisingReports<'a, T, S> {
    client: &'a RateLimitedClient<T, S>,
    root: String,
    access_token: String,
    client_id: String,
    profile_id: String,
}

impl<'a, T: HttpTransport, S: Sleeper> AdvertisingReports<'a, T, S> {
    pub fn new(
        client: &'a RateLimitedClient<T, S>,
        root: &str,
        access_token: &str,
        client_id: &str,
        profile_id: &str,
    ) -> Self {
        Self {
            client,
            root: root.trim_end_matches('/').to_string(),
            access_token: access_token.to_string(),
            client_id: client_id.to_string(),
            profile_id: profile_id.to_string(),
        }
    }

    fn headers(&self, content_type: &str) -> [(&'static str, String); 4] {
        [
            ("authorization", format!("Bearer {}", self.access_token)),
            ("amazon-advertising-api-clientid", self.client_id.clone()),
            ("amazon-advertising-api-scope", self.profile_id.clone()),
            ("content-type", content_type.to_string()),
        ]
    }
}

impl<T: HttpTransport, S: Sleeper> ReportApi for AdvertisingReports<'_, T, S> {
    fn name(&self) -> &'static str {
        "ads-api"
    }

    async fn create_report(&self, request: &ReportRequest) -> Result<String, JobFailure> {
        let window = request
            .window
            .ok_or_else(|| JobFailure::Schema("advertising reports need a date window".into()))?;
        let (start, end) = window.inclusive_dates();
        let body = json!({
            "name": format!("advertised-product {start}..{end}"),
            "startDate": start.format("%Y-%m-%d").to_string(),
            "endDate": end.format("%Y-%m-%d").to_string(),
            "configuration": {
                "adProduct": "SPONSORED_PRODUCTS",
                "groupBy": ["advertiser"],
                "columns": ADVERTISED_PRODUCT_COLUMNS,
                "reportTypeId": request.report_type.api_code(),
                "timeUnit": "DAILY",
                "format": "GZIP_JSON",
            }
        });
        let url = format!("{}/reporting/reports", self.root);
        let response = self
            .client
            .send(Method::POST, &url, &self.headers(CREATE_CONTENT_TYPE), &[], Some(body))
            .await
            .inspect_err(|err| {
                error!(target = "extractor.ads", error = %err, "ad report creation request failed");
            })?;
        crate::metrics::inc_api_calls("create_ad_report", response.status);
        if response.status != 200 && response.status != 202 {
            error!(
                target = "extractor.ads",
                status = response.status,
                body = %response.text_preview(),
                "ad report creation was not accepted"
            );
            return Err(JobFailure::Rejected {
                call: "createAdReport",
                status: response.status,
                body: response.text_preview(),
            });
        }
        let report_id = response
            .json::<AdReportResponse>()
            .ok()
            .and_then(|payload| payload.report_id)
            .filter(|id| !id.is_empty())
            .ok_or_else(|| JobFailure::Schema("ad report response carried no reportId".into()))?;
        info!(
            target = "extractor.ads",
            report_id = %report_id,
            start = %start,
            end = %end,
            "ad report job created"
        );
        Ok(report_id)
    }

    async fn fetch_job(&self, job_id: &str) -> Result<ReportJob, JobFailure> {
        let url = format!("{}/reporting/reports/{}", self.root, encode(job_id));
        let response = self
            .client
            .send(Method::GET, &url, &self.headers("application/json"), &[], None)
            .await?;
        crate::metrics::inc_api_calls("get_ad_report", response.status);
        if response.status != 200 {
            return Err(JobFailure::Rejected {
                call: "getAdReport",
                status: response.status,
                body: response.text_preview(),
            });
        }
        let payload: AdReportResponse = response
            .json()
            .map_err(|err| JobFailure::Schema(err.to_string()))?;
        let raw_status = payload.status.unwrap_or_default();
        let status = map_status(&raw_status)
            .ok_or_else(|| JobFailure::Schema(format!("unknown ad report status `{raw_status}`")))?;
        if let Some(reason) = payload.failure_reason.filter(|_| status == ProcessingStatus::Fatal) {
            error!(target = "extractor.ads", job_id = job_id, reason = %reason, "ad report failed");
        }
        Ok(ReportJob {
            job_id: payload.report_id.unwrap_or_else(|| job_id.to_string()),
            status,
            document_ref: payload.url,
        })
    }

    async fn resolve_document(&self, job: &ReportJob) -> Result<ReportDocument, JobFailure> {
        let url = job
            .document_ref
            .clone()
            .filter(|url| !url.is_empty())
            .ok_or_else(|| JobFailure::Schema("COMPLETED ad report without url".into()))?;
        Ok(ReportDocument {
            url,
            compression: Compression::Gzip,
        })
    }
}
