use crate::config::ExtractorConfig;
use crate::http::{HttpTransport, Sleeper};
use crate::models::{
    MarketplaceId, OutputTable, PayloadShape, ReportDocument, ReportRequest, ReportType,
    RunSummary, StageReport,
};
use crate::normalize::orders_xml::{BATCH_SIZE, OrderBatches};
use crate::normalize::{FlatRecord, delimited, finance, json_rows};
use crate::segment::{DateWindow, segment};
use crate::sink::{IngestionSink, PrimaryKeyDeduper};
use crate::spapi::ads::{AD_REPORT_POLL_INTERVAL, AdvertisingReports};
use crate::spapi::client::{ClientError, RateLimitedClient};
use crate::spapi::documents::{DecodeError, PayloadDecoder};
use crate::spapi::finances::{FinancesError, FinancialEventsReader};
use crate::spapi::reports::{
    DATA_REPORT_POLL_INTERVAL, JobFailure, JobOutcome, PollPolicy, ReportApi, ReportJobController,
    SellingPartnerReports,
};
use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::{Value, json};
use std::collections::{BTreeMap, HashMap};
use std::future::Future;
use std::time::{Duration, Instant};
use thiserror::Error;
use tracing::{info, warn};
use uuid::Uuid;

/// Everything a run needs besides the access token and the sink.
#[derive(Debug, Clone)]
pub struct PipelineSettings {
    pub marketplaces: Vec<MarketplaceId>,
    pub reports: Vec<ReportType>,
    pub date_range_days: u32,
    pub max_polls: u32,
    pub selling_partner_root: String,
    pub advertising_root: String,
    pub ads_profile_id: Option<String>,
    pub client_id: String,
}

impl PipelineSettings {
    pub fn from_config(config: &ExtractorConfig) -> Self {
        Self {
            marketplaces: config.marketplaces.clone(),
            reports: config.reports.clone(),
            date_range_days: config.date_range_days,
            max_polls: config.max_polls,
            selling_partner_root: config.selling_partner_root(),
            advertising_root: config.advertising_root(),
            ads_profile_id: config.ads_profile_id.clone(),
            client_id: config.credentials.client_id.clone(),
        }
    }
}

/// Dedupe state and row counters for one run. Passed by `&mut` into every flow.
#[derive(Debug, Default)]
pub struct RunAccumulators {
    dedupers: HashMap<String, PrimaryKeyDeduper>,
    rows: BTreeMap<String, u64>,
}

impl RunAccumulators {
    pub fn duplicates_dropped(&self) -> u64 {
        self.dedupers.values().map(PrimaryKeyDeduper::dropped).sum()
    }

    fn rows_for(&self, table: &str) -> u64 {
        self.rows.get(table).copied().unwrap_or(0)
    }
}

#[derive(Debug)]
pub struct RunReport {
    pub summary: RunSummary,
    pub rows: BTreeMap<String, u64>,
    pub duplicates_dropped: u64,
}

pub struct Pipeline<T, S> {
    client: RateLimitedClient<T, S>,
    settings: PipelineSettings,
}

impl<T: HttpTransport, S: Sleeper> Pipeline<T, S> {
    pub fn new(client: RateLimitedClient<T, S>, settings: PipelineSettings) -> Self {
        Self { client, settings }
    }

    #[cfg(test)]
    pub fn client(&self) -> &RateLimitedClient<T, S> {
        &self.client
    }

    /// Runs every configured report type. Failures are recorded per stage and never
    /// stop the remaining segments, marketplaces, or report types.
    pub async fn run<K: IngestionSink>(
        &self,
        access_token: &str,
        sink: &mut K,
        now: DateTime<Utc>,
    ) -> RunReport {
        let run_id = Uuid::new_v4().to_string();
        let mut stages = Vec::new();
        let mut acc = RunAccumulators::default();
        info!(
            target = "extractor.pipeline",
            run_id = %run_id,
            reports = self.settings.reports.len(),
            marketplaces = self.settings.marketplaces.len(),
            days = self.settings.date_range_days,
            "extraction run started"
        );

        for &report_type in &self.settings.reports {
            let table = report_type.table();
            match report_type.shape() {
                PayloadShape::FinancePages => {
                    for window in self.windows(report_type, now) {
                        let name = format!("{}/{}", table.name, window_label(&window));
                        let flow = self.finance_window(
                            &name,
                            access_token,
                            window,
                            &table,
                            &mut acc,
                            &mut *sink,
                        );
                        self.capture_stage(name.clone(), &mut stages, flow).await;
                    }
                }
                PayloadShape::AdvertisingJson => {
                    let Some(profile_id) = self.settings.ads_profile_id.as_deref() else {
                        info!(
                            target = "extractor.pipeline",
                            "no advertising profile configured, skipping ad reports"
                        );
                        continue;
                    };
                    let Some(marketplace) = self.settings.marketplaces.first() else {
                        continue;
                    };
                    let api = AdvertisingReports::new(
                        &self.client,
                        &self.settings.advertising_root,
                        access_token,
                        &self.settings.client_id,
                        profile_id,
                    );
                    for window in self.windows(report_type, now) {
                        let request = ReportRequest {
                            report_type,
                            marketplace_id: marketplace.amazon_code().to_string(),
                            window: Some(window),
                        };
                        let name = format!("{}/{}", table.name, window_label(&window));
                        let flow = self.report_flow(
                            &name,
                            &api,
                            AD_REPORT_POLL_INTERVAL,
                            request,
                            &table,
                            &mut acc,
                            &mut *sink,
                        );
                        self.capture_stage(name.clone(), &mut stages, flow).await;
                    }
                }
                PayloadShape::OrdersXml | PayloadShape::Delimited => {
                    let api = SellingPartnerReports::new(
                        &self.client,
                        &self.settings.selling_partner_root,
                        access_token,
                    );
                    for marketplace in &self.settings.marketplaces {
                        let windows: Vec<Option<DateWindow>> = match report_type.max_window_days() {
                            Some(_) => {
                                self.windows(report_type, now).into_iter().map(Some).collect()
                            }
                            None => vec![None],
                        };
                        for window in windows {
                            let request = ReportRequest {
                                report_type,
                                marketplace_id: marketplace.amazon_code().to_string(),
                                window,
                            };
                            let name = match &window {
                                Some(window) => format!(
                                    "{}/{:?}/{}",
                                    table.name,
                                    marketplace,
                                    window_label(window)
                                ),
                                None => format!("{}/{:?}", table.name, marketplace),
                            };
                            let flow = self.report_flow(
                                &name,
                                &api,
                                DATA_REPORT_POLL_INTERVAL,
                                request,
                                &table,
                                &mut acc,
                                &mut *sink,
                            );
                            self.capture_stage(name.clone(), &mut stages, flow).await;
                        }
                    }
                }
            }

            if acc.rows_for(&table.name) == 0
                && let Err(err) = sink.write(&[], &table, true)
            {
                warn!(
                    target = "extractor.pipeline",
                    table = %table.name,
                    error = %err,
                    "empty table could not be created"
                );
            }
        }

        if let Err(err) = sink.finish() {
            warn!(target = "extractor.pipeline", error = %err, "sink did not flush cleanly");
            stages.push(StageReport::new(
                "finish_sink",
                false,
                0,
                json!({"error": err.to_string(), "kind": FailureKind::SinkFailure}),
            ));
        }

        let summary = RunSummary { run_id, stages };
        info!(
            target = "extractor.pipeline",
            run_id = %summary.run_id,
            stages = summary.stages.len(),
            failed = summary.failed_stages(),
            duplicates = acc.duplicates_dropped(),
            "extraction run finished"
        );
        RunReport {
            summary,
            duplicates_dropped: acc.duplicates_dropped(),
            rows: acc.rows,
        }
    }

    fn windows(&self, report_type: ReportType, now: DateTime<Utc>) -> Vec<DateWindow> {
        let max = report_type.max_window_days().unwrap_or(self.settings.date_range_days);
        segment(self.settings.date_range_days, max, now)
    }

    /// Create, poll, download, normalize and ingest one report job.
    #[allow(clippy::too_many_arguments)]
    async fn report_flow<A: ReportApi, K: IngestionSink>(
        &self,
        stage: &str,
        api: &A,
        interval: Duration,
        request: ReportRequest,
        table: &OutputTable,
        acc: &mut RunAccumulators,
        sink: &mut K,
    ) -> Result<StageOutcome<usize>, PipelineError> {
        let controller = ReportJobController::new(
            api,
            self.client.sleeper(),
            PollPolicy {
                interval,
                max_polls: self.settings.max_polls,
            },
        );
        let job_id = controller.create(&request).await.map_err(|failure| {
            PipelineError::new(stage, failure.to_string(), FailureKind::from(&failure))
        })?;
        let document = match controller.poll_until_terminal(&job_id).await {
            JobOutcome::Completed(document) => document,
            JobOutcome::TimedOut { polls } => {
                return Err(PipelineError::new(
                    stage,
                    format!("job {job_id} still running after {polls} polls"),
                    FailureKind::JobTerminalFailure,
                ));
            }
            JobOutcome::Failed(failure) => {
                return Err(PipelineError::new(stage, failure.to_string(), FailureKind::from(&failure)));
            }
        };

        let body = PayloadDecoder::new(&self.client)
            .try_decode(&document)
            .await
            .map_err(|err| PipelineError::new(stage, err.to_string(), FailureKind::from(&err)))?;
        let marketplace = request.marketplace_id.as_str();
        let rows = match request.report_type.shape() {
            PayloadShape::OrdersXml => {
                let mut rows = 0;
                for batch in OrderBatches::new(body.as_slice(), BATCH_SIZE) {
                    let batch = batch.map_err(|err| {
                        PipelineError::new(stage, err.to_string(), FailureKind::DecodeFailure)
                    })?;
                    rows += ingest(stage, tag_marketplace(batch, marketplace), table, acc, sink)?;
                }
                rows
            }
            PayloadShape::Delimited => {
                let records = delimited::parse_tab_separated(&body).map_err(|err| {
                    PipelineError::new(stage, err.to_string(), FailureKind::DecodeFailure)
                })?;
                ingest(stage, tag_marketplace(records, marketplace), table, acc, sink)?
            }
            PayloadShape::AdvertisingJson => {
                let records = json_rows::parse_json_rows(&body).map_err(|err| {
                    PipelineError::new(stage, err.to_string(), FailureKind::DecodeFailure)
                })?;
                ingest(stage, records, table, acc, sink)?
            }
            PayloadShape::FinancePages => {
                return Err(PipelineError::new(
                    stage,
                    "financial events are not delivered as report documents",
                    FailureKind::SchemaMismatch,
                ));
            }
        };
        Ok(StageOutcome::new(rows, outcome_output(&job_id, &document, body.len(), rows)))
    }

    async fn finance_window<K: IngestionSink>(
        &self,
        stage: &str,
        access_token: &str,
        window: DateWindow,
        table: &OutputTable,
        acc: &mut RunAccumulators,
        sink: &mut K,
    ) -> Result<StageOutcome<usize>, PipelineError> {
        let mut reader = FinancialEventsReader::new(
            &self.client,
            &self.settings.selling_partner_root,
            access_token,
            window,
        );
        let mut pages = 0u32;
        let mut rows = 0usize;
        while let Some(page) = reader.next_page().await.map_err(|err| {
            let kind = FailureKind::from(&err);
            PipelineError::new(stage, err.to_string(), kind)
        })? {
            pages += 1;
            let (_, records) = finance::normalize_page(&page.events).map_err(|err| {
                PipelineError::new(stage, err.to_string(), FailureKind::SchemaMismatch)
            })?;
            rows += ingest(stage, records, table, acc, sink)?;
        }
        Ok(StageOutcome::new(
            rows,
            json!({
                "pages": pages,
                "rows": rows,
                "posted_after": window.start_iso(),
                "posted_before": window.end_iso(),
            }),
        ))
    }

    async fn capture_stage<Fut>(&self, name: String, stages: &mut Vec<StageReport>, fut: Fut) -> Option<usize>
    where
        Fut: Future<Output = Result<StageOutcome<usize>, PipelineError>>,
    {
        let started = Instant::now();
        let result = fut.await;
        let elapsed_ms = started.elapsed().as_millis();
        crate::metrics::stage_elapsed(&name, elapsed_ms);
        match result {
            Ok(outcome) => {
                stages.push(StageReport::new(&name, true, elapsed_ms, outcome.output));
                Some(outcome.value)
            }
            Err(err) => {
                warn!(
                    target = "extractor.pipeline",
                    stage = %err.stage(),
                    kind = ?err.kind(),
                    error = %err.detail(),
                    "stage failed, continuing"
                );
                stages.push(StageReport::new(
                    &name,
                    false,
                    elapsed_ms,
                    json!({"error": err.detail(), "kind": err.kind()}),
                ));
                None
            }
        }
    }
}

/// Deduplicates by primary key, then hands the survivors to the sink.
fn ingest<K: IngestionSink>(
    stage: &str,
    records: Vec<FlatRecord>,
    table: &OutputTable,
    acc: &mut RunAccumulators,
    sink: &mut K,
) -> Result<usize, PipelineError> {
    let fresh = acc
        .dedupers
        .entry(table.name.clone())
        .or_default()
        .retain_new(records, &table.primary_key);
    let written = sink
        .write(&fresh, table, false)
        .map_err(|err| PipelineError::new(stage, err.to_string(), FailureKind::SinkFailure))?;
    *acc.rows.entry(table.name.clone()).or_default() += written as u64;
    Ok(written)
}

fn tag_marketplace(records: Vec<FlatRecord>, marketplace: &str) -> Vec<FlatRecord> {
    records
        .into_iter()
        .map(|mut record| {
            record.insert("marketplace_id", marketplace);
            record
        })
        .collect()
}

fn window_label(window: &DateWindow) -> String {
    format!(
        "{}..{}",
        window.start.format("%Y-%m-%d"),
        window.end.format("%Y-%m-%d")
    )
}

fn outcome_output(job_id: &str, document: &ReportDocument, bytes: usize, rows: usize) -> Value {
    json!({
        "job_id": job_id,
        "compression": format!("{:?}", document.compression),
        "bytes": bytes,
        "rows": rows,
    })
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    TransportFailure,
    RateLimitExhausted,
    RequestRejected,
    JobTerminalFailure,
    DecodeFailure,
    SchemaMismatch,
    SinkFailure,
}

impl From<&ClientError> for FailureKind {
    fn from(err: &ClientError) -> Self {
        match err {
            ClientError::Transport(_) => FailureKind::TransportFailure,
            ClientError::RateLimitExhausted { .. } => FailureKind::RateLimitExhausted,
        }
    }
}

impl From<&JobFailure> for FailureKind {
    fn from(failure: &JobFailure) -> Self {
        match failure {
            JobFailure::Terminal(_) => FailureKind::JobTerminalFailure,
            JobFailure::Client(err) => FailureKind::from(err),
            JobFailure::Rejected { .. } => FailureKind::RequestRejected,
            JobFailure::Schema(_) => FailureKind::SchemaMismatch,
        }
    }
}

impl From<&FinancesError> for FailureKind {
    fn from(err: &FinancesError) -> Self {
        match err {
            FinancesError::Client(err) => FailureKind::from(err),
            FinancesError::Status { .. } => FailureKind::RequestRejected,
            FinancesError::Schema(_) => FailureKind::SchemaMismatch,
        }
    }
}

impl From<&DecodeError> for FailureKind {
    fn from(err: &DecodeError) -> Self {
        match err {
            DecodeError::Client(err) => FailureKind::from(err),
            DecodeError::Status(_) | DecodeError::Gzip(_) => FailureKind::DecodeFailure,
        }
    }
}

#[derive(Debug, Error)]
#[error("stage `{stage}` failed: {message}")]
pub struct PipelineError {
    stage: String,
    message: String,
    kind: FailureKind,
}

impl PipelineError {
    pub fn new(stage: &str, message: impl Into<String>, kind: FailureKind) -> Self {
        Self {
            stage: stage.to_string(),
            message: message.into(),
            kind,
        }
    }

    pub fn stage(&self) -> &str {
        &self.stage
    }

    pub fn kind(&self) -> FailureKind {
        self.kind
    }

    pub fn detail(&self) -> &str {
        &self.message
    }
}

#[derive(Debug)]
pub struct StageOutcome<T> {
    pub value: T,
    pub output: Value,
}

impl<T> StageOutcome<T> {
    fn new(value: T, output: Value) -> Self {
        Self { value, output }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::http::testing::{RecordingSleeper, ScriptedTransport, json_response, raw_response};
    use crate::normalize::Scalar;
    use crate::normalize::orders_xml::tests::order_xml;
    use crate::sink::testing::MemorySink;
    use crate::spapi::client::MAX_RATE_LIMIT_RETRIES;
    use crate::spapi::documents::tests::gzip;
    use chrono::TimeZone;
    use reqwest::Method;

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 6, 1, 12, 0, 0).unwrap()
    }

    fn settings(reports: &[ReportType], days: u32) -> PipelineSettings {
        PipelineSettings {
            marketplaces: vec![MarketplaceId::De],
            reports: reports.to_vec(),
            date_range_days: days,
            max_polls: 20,
            selling_partner_root: "https://sp.test".into(),
            advertising_root: "https://ads.test".into(),
            ads_profile_id: Some("profile-1".into()),
            client_id: "app".into(),
        }
    }

    fn status(s: &str) -> Result<crate::http::HttpResponse, crate::http::TransportError> {
        let document = if s == "DONE" { json!("DOC1") } else { json!(null) };
        json_response(200, json!({"reportId": "R1", "processingStatus": s, "reportDocumentId": document}))
    }

    async fn orders_transport(statuses: &[&str]) -> ScriptedTransport {
        let packed = gzip(order_xml(2, 2).as_bytes()).await;
        orders_transport_serving(statuses, raw_response(200, &packed))
    }

    fn orders_transport_serving(
        statuses: &[&str],
        download: Result<crate::http::HttpResponse, crate::http::TransportError>,
    ) -> ScriptedTransport {
        ScriptedTransport::new()
            .route(
                Method::POST,
                "/reports/2021-06-30/reports",
                vec![json_response(202, json!({"reportId": "R1"}))],
            )
            .route(
                Method::GET,
                "/reports/2021-06-30/reports/R1",
                statuses.iter().map(|s| status(s)).collect(),
            )
            .route(
                Method::GET,
                "/reports/2021-06-30/documents/DOC1",
                vec![json_response(
                    200,
                    json!({"url": "https://s3.test/orders.xml.gz", "compressionAlgorithm": "GZIP"}),
                )],
            )
            .route(Method::GET, "s3.test/orders", vec![download])
    }

    #[tokio::test]
    async fn orders_flow_polls_then_downloads_once() {
        let transport = orders_transport(&["IN_QUEUE", "IN_PROGRESS", "DONE"]).await;
        let pipeline = Pipeline::new(
            RateLimitedClient::new(transport, RecordingSleeper::default()),
            settings(&[ReportType::Orders], 7),
        );
        let mut sink = MemorySink::default();
        let report = pipeline.run("tok", &mut sink, now()).await;

        assert_eq!(report.summary.failed_stages(), 0);
        assert_eq!(
            pipeline.client().sleeper().waits(),
            vec![DATA_REPORT_POLL_INTERVAL, DATA_REPORT_POLL_INTERVAL]
        );
        let transport = pipeline.client().transport();
        assert_eq!(transport.count(Method::GET, "s3.test/orders"), 1);
        assert_eq!(transport.count(Method::GET, "/documents/DOC1"), 1);

        let rows = &sink.tables["orders"];
        assert_eq!(rows.len(), 4);
        assert_eq!(rows[0].text("marketplace_id"), "A1PA6795UKMFR9");
        assert_eq!(report.rows.get("orders"), Some(&4));
    }

    #[tokio::test]
    async fn fatal_job_is_recorded_and_never_downloaded() {
        let transport = orders_transport(&["IN_PROGRESS", "FATAL"]).await;
        let pipeline = Pipeline::new(
            RateLimitedClient::new(transport, RecordingSleeper::default()),
            settings(&[ReportType::Orders], 7),
        );
        let mut sink = MemorySink::default();
        let report = pipeline.run("tok", &mut sink, now()).await;

        assert_eq!(pipeline.client().sleeper().waits().len(), 1);
        let transport = pipeline.client().transport();
        assert_eq!(transport.count(Method::GET, "/documents/"), 0);
        assert_eq!(transport.count(Method::GET, "s3.test"), 0);
        assert_eq!(report.summary.failed_stages(), 1);
        assert_eq!(report.summary.stages[0].output["kind"], "job_terminal_failure");
        assert!(sink.tables.get("orders").is_none_or(Vec::is_empty));
    }

    #[tokio::test]
    async fn denied_download_is_a_failed_stage() {
        let transport = orders_transport_serving(&["DONE"], raw_response(403, b"AccessDenied"));
        let pipeline = Pipeline::new(
            RateLimitedClient::new(transport, RecordingSleeper::default()),
            settings(&[ReportType::Orders], 7),
        );
        let mut sink = MemorySink::default();
        let report = pipeline.run("tok", &mut sink, now()).await;

        assert_eq!(pipeline.client().transport().count(Method::GET, "s3.test/orders"), 1);
        assert_eq!(report.summary.failed_stages(), 1);
        let stage = &report.summary.stages[0];
        assert!(!stage.ok);
        assert_eq!(stage.output["kind"], "decode_failure");
        assert!(stage.output["error"].as_str().unwrap().contains("403"));
        assert!(sink.tables["orders"].is_empty());
    }

    #[tokio::test]
    async fn corrupt_gzip_is_a_failed_stage() {
        let transport = orders_transport_serving(&["DONE"], raw_response(200, b"not gzip at all"));
        let pipeline = Pipeline::new(
            RateLimitedClient::new(transport, RecordingSleeper::default()),
            settings(&[ReportType::Orders], 7),
        );
        let mut sink = MemorySink::default();
        let report = pipeline.run("tok", &mut sink, now()).await;

        assert_eq!(report.summary.failed_stages(), 1);
        assert_eq!(report.summary.stages[0].output["kind"], "decode_failure");
    }

    #[tokio::test]
    async fn throttled_creation_reports_rate_limit_exhausted() {
        let transport = ScriptedTransport::new().route(
            Method::POST,
            "/reports/2021-06-30/reports",
            vec![json_response(429, json!({"errors": [{"code": "QuotaExceeded"}]}))],
        );
        let pipeline = Pipeline::new(
            RateLimitedClient::new(transport, RecordingSleeper::default()),
            settings(&[ReportType::Returns], 7),
        );
        let mut sink = MemorySink::default();
        let report = pipeline.run("tok", &mut sink, now()).await;

        let transport = pipeline.client().transport();
        assert_eq!(
            transport.count(Method::POST, "/reports"),
            MAX_RATE_LIMIT_RETRIES as usize + 1
        );
        assert_eq!(
            pipeline.client().sleeper().waits().len(),
            MAX_RATE_LIMIT_RETRIES as usize
        );
        assert_eq!(report.summary.stages.len(), 1);
        assert_eq!(report.summary.stages[0].output["kind"], "rate_limit_exhausted");
        assert_eq!(transport.count(Method::GET, "/reports/"), 0);
    }

    #[tokio::test]
    async fn repeated_documents_are_ingested_once() {
        let transport = orders_transport(&["DONE"]).await;
        let pipeline = Pipeline::new(
            RateLimitedClient::new(transport, RecordingSleeper::default()),
            settings(&[ReportType::Orders], 40),
        );
        let mut sink = MemorySink::default();
        let report = pipeline.run("tok", &mut sink, now()).await;

        assert_eq!(report.summary.stages.len(), 2);
        assert_eq!(pipeline.client().transport().count(Method::GET, "s3.test/orders"), 2);
        assert!(pipeline.client().sleeper().waits().is_empty());
        assert_eq!(sink.tables["orders"].len(), 4);
        assert_eq!(report.duplicates_dropped, 4);
    }

    #[tokio::test]
    async fn failed_marketplace_does_not_stop_the_next_report() {
        let transport = ScriptedTransport::new()
            .route(
                Method::POST,
                "/reports/2021-06-30/reports",
                vec![json_response(400, json!({"errors": [{"code": "InvalidInput"}]}))],
            )
            .route(
                Method::GET,
                "/finances/v0/financialEvents",
                vec![json_response(
                    200,
                    json!({"payload": {"FinancialEvents": {"ShipmentEventList": [{
                        "AmazonOrderId": "A1",
                        "PostedDate": "2024-05-30T00:00:00Z",
                        "ShipmentItemList": [{"OrderItemId": "1", "ItemChargeList": [
                            {"ChargeType": "Principal", "ChargeAmount": {"CurrencyCode": "EUR", "CurrencyAmount": 9.5}}
                        ]}]
                    }]}}}),
                )],
            );
        let pipeline = Pipeline::new(
            RateLimitedClient::new(transport, RecordingSleeper::default()),
            settings(&[ReportType::Returns, ReportType::FinancialEvents], 7),
        );
        let mut sink = MemorySink::default();
        let report = pipeline.run("tok", &mut sink, now()).await;

        assert_eq!(report.summary.stages.len(), 2);
        assert!(!report.summary.stages[0].ok);
        assert_eq!(report.summary.stages[0].output["kind"], "request_rejected");
        assert!(report.summary.stages[1].ok);
        let finance = &sink.tables["financial_events"];
        assert_eq!(finance.len(), 1);
        assert_eq!(finance[0].get("principal_amount"), Some(&Scalar::Float(9.5)));
        assert!(sink.tables["returns"].is_empty());
    }

    #[tokio::test]
    async fn advertising_flow_reads_gzip_json() {
        let packed = gzip(
            br#"[{"date": "2024-05-31", "campaignId": 5, "adId": 9, "advertisedSku": "S", "advertisedAsin": "B", "clicks": 3}]"#,
        )
        .await;
        let transport = ScriptedTransport::new()
            .route(
                Method::POST,
                "/reporting/reports",
                vec![json_response(200, json!({"reportId": "AD1", "status": "PENDING"}))],
            )
            .route(
                Method::GET,
                "/reporting/reports/AD1",
                vec![
                    json_response(200, json!({"reportId": "AD1", "status": "PROCESSING"})),
                    json_response(200, json!({"reportId": "AD1", "status": "COMPLETED", "url": "https://s3.test/ad1.gz"})),
                ],
            )
            .route(Method::GET, "s3.test/ad1", vec![raw_response(200, &packed)]);
        let pipeline = Pipeline::new(
            RateLimitedClient::new(transport, RecordingSleeper::default()),
            settings(&[ReportType::Advertising], 7),
        );
        let mut sink = MemorySink::default();
        let report = pipeline.run("tok", &mut sink, now()).await;

        assert_eq!(report.summary.failed_stages(), 0);
        assert_eq!(pipeline.client().sleeper().waits(), vec![AD_REPORT_POLL_INTERVAL]);
        let rows = &sink.tables["advertising"];
        assert_eq!(rows[0].get("ad_id"), Some(&Scalar::Int(9)));
        assert_eq!(rows[0].text("advertised_sku"), "S");
    }
}
