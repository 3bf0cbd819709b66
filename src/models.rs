use crate::segment::DateWindow;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Region {
    NorthAmerica,
    Europe,
    FarEast,
}

impl Region {
    pub fn selling_partner_root(&self) -> &'static str {
        match self {
            Region::NorthAmerica => "https://sellingpartnerapi-na.amazon.com",
            Region::Europe => "https://sellingpartnerapi-eu.amazon.com",
            Region::FarEast => "https://sellingpartnerapi-fe.amazon.com",
        }
    }

    pub fn advertising_root(&self) -> &'static str {
        match self {
            Region::NorthAmerica => "https://advertising-api.amazon.com",
            Region::Europe => "https://advertising-api-eu.amazon.com",
            Region::FarEast => "https://advertising-api-fe.amazon.com",
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum MarketplaceId {
    Us,
    Ca,
    Mx,
    Uk,
    De,
    Fr,
    It,
    Es,
    Nl,
    Se,
    Pl,
    Jp,
}

impl MarketplaceId {
    pub fn amazon_code(&self) -> &'static str {
        match self {
            MarketplaceId::Us => "ATVPDKIKX0DER",
            MarketplaceId::Ca => "A2EUQ1WTGCTBG2",
            MarketplaceId::Mx => "A1AM78C64UM0Y8",
            MarketplaceId::Uk => "A1F83G8C2ARO7P",
            MarketplaceId::De => "A1PA6795UKMFR9",
            MarketplaceId::Fr => "A13V1IB3VIYZZH",
            MarketplaceId::It => "APJ6JRA9NG5V4",
            MarketplaceId::Es => "A1RKKUPIHCS9HS",
            MarketplaceId::Nl => "A1805IZSGTT6HS",
            MarketplaceId::Se => "A2NODRKZP88ZB9",
            MarketplaceId::Pl => "A1C3SOZRARQ6R3",
            MarketplaceId::Jp => "A1VC38T7YXB528",
        }
    }

    pub fn region(&self) -> Region {
        match self {
            MarketplaceId::Us | MarketplaceId::Ca | MarketplaceId::Mx => Region::NorthAmerica,
            MarketplaceId::Jp => Region::FarEast,
            _ => Region::Europe,
        }
    }

    /// Accepts either the marketplace code (`A1PA6795UKMFR9`) or a country code (`DE`).
    pub fn from_str(input: &str) -> Option<Self> {
        const ALL: [MarketplaceId; 12] = [
            MarketplaceId::Us,
            MarketplaceId::Ca,
            MarketplaceId::Mx,
            MarketplaceId::Uk,
            MarketplaceId::De,
            MarketplaceId::Fr,
            MarketplaceId::It,
            MarketplaceId::Es,
            MarketplaceId::Nl,
            MarketplaceId::Se,
            MarketplaceId::Pl,
            MarketplaceId::Jp,
        ];
        let needle = input.trim().to_uppercase();
        if let Some(found) = ALL.iter().find(|m| m.amazon_code() == needle) {
            return Some(*found);
        }
        match needle.as_str() {
            "US" => Some(MarketplaceId::Us),
            "CA" => Some(MarketplaceId::Ca),
            "MX" => Some(MarketplaceId::Mx),
            "UK" | "GB" => Some(MarketplaceId::Uk),
            "DE" => Some(MarketplaceId::De),
            "FR" => Some(MarketplaceId::Fr),
            "IT" => Some(MarketplaceId::It),
            "ES" => Some(MarketplaceId::Es),
            "NL" => Some(MarketplaceId::Nl),
            "SE" => Some(MarketplaceId::Se),
            "PL" => Some(MarketplaceId::Pl),
            "JP" => Some(MarketplaceId::Jp),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PayloadShape {
    OrdersXml,
    Delimited,
    FinancePages,
    AdvertisingJson,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ReportType {
    Orders,
    Returns,
    Inventory,
    FinancialEvents,
    Advertising,
}

impl ReportType {
    pub const ALL: [ReportType; 5] = [
        ReportType::Orders,
        ReportType::Returns,
        ReportType::Inventory,
        ReportType::FinancialEvents,
        ReportType::Advertising,
    ];

    pub fn api_code(&self) -> &'static str {
        match self {
            ReportType::Orders => "GET_XML_ALL_ORDERS_DATA_BY_ORDER_DATE_GENERAL",
            ReportType::Returns => "GET_FLAT_FILE_RETURNS_DATA_BY_RETURN_DATE",
            ReportType::Inventory => "GET_FBA_MYI_UNSUPPRESSED_INVENTORY_DATA",
            ReportType::FinancialEvents => "financialEvents",
            ReportType::Advertising => "spAdvertisedProduct",
        }
    }

    /// Longest window the upstream API accepts for one request, in days.
    /// `None` marks snapshot reports that take no date range.
    pub fn max_window_days(&self) -> Option<u32> {
        match self {
            ReportType::Orders => Some(30),
            ReportType::Returns => Some(60),
            ReportType::Inventory => None,
            ReportType::FinancialEvents => Some(30),
            ReportType::Advertising => Some(31),
        }
    }

    pub fn shape(&self) -> PayloadShape {
        match self {
            ReportType::Orders => PayloadShape::OrdersXml,
            ReportType::Returns | ReportType::Inventory => PayloadShape::Delimited,
            ReportType::FinancialEvents => PayloadShape::FinancePages,
            ReportType::Advertising => PayloadShape::AdvertisingJson,
        }
    }

    pub fn table(&self) -> OutputTable {
        match self {
            ReportType::Orders => OutputTable::new("orders", &["amazon_order_id", "sku", "asin"]),
            ReportType::Returns => OutputTable::new("returns", &["amazon_rma_id", "order_id"]),
            ReportType::Inventory => {
                OutputTable::new("inventory", &["sku", "fnsku", "marketplace_id"])
            }
            ReportType::FinancialEvents => OutputTable::new(
                "financial_events",
                &[
                    "event_type",
                    "amazon_order_id",
                    "order_item_id",
                    "order_adjustment_item_id",
                    "posted_date",
                ],
            ),
            ReportType::Advertising => OutputTable::new(
                "advertising",
                &["ad_id", "campaign_id", "date", "advertised_sku", "advertised_asin"],
            ),
        }
    }

    pub fn from_str(input: &str) -> Option<Self> {
        match input.trim().to_lowercase().as_str() {
            "orders" => Some(ReportType::Orders),
            "returns" => Some(ReportType::Returns),
            "inventory" => Some(ReportType::Inventory),
            "financial_events" | "finances" => Some(ReportType::FinancialEvents),
            "advertising" | "ads" => Some(ReportType::Advertising),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReportRequest {
    pub report_type: ReportType,
    pub marketplace_id: String,
    pub window: Option<DateWindow>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ProcessingStatus {
    InQueue,
    InProgress,
    Done,
    Cancelled,
    Fatal,
}

impl ProcessingStatus {
    #[allow(dead_code)]
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            ProcessingStatus::Done | ProcessingStatus::Cancelled | ProcessingStatus::Fatal
        )
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReportJob {
    pub job_id: String,
    pub status: ProcessingStatus,
    /// Document id for SP-API jobs, direct download URL for advertising jobs.
    pub document_ref: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Compression {
    #[default]
    None,
    Gzip,
}

impl Compression {
    pub fn from_raw(value: Option<&str>) -> Self {
        match value.unwrap_or("").trim().to_uppercase().as_str() {
            "GZIP" => Compression::Gzip,
            _ => Compression::None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReportDocument {
    pub url: String,
    pub compression: Compression,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct OutputTable {
    pub name: String,
    pub primary_key: Vec<String>,
    pub incremental: bool,
}

impl OutputTable {
    pub fn new(name: &str, primary_key: &[&str]) -> Self {
        Self {
            name: name.to_string(),
            primary_key: primary_key.iter().map(|k| k.to_string()).collect(),
            incremental: true,
        }
    }
}

#[derive(Debug, Serialize, Clone)]
pub struct RunSummary {
    pub run_id: String,
    pub stages: Vec<StageReport>,
}

impl RunSummary {
    pub fn failed_stages(&self) -> usize {
        self.stages.iter().filter(|s| !s.ok).count()
    }
}

#[derive(Debug, Serialize, Clone)]
pub struct StageReport {
    pub name: String,
    pub ok: bool,
    pub elapsed_ms: u128,
    pub timestamp: DateTime<Utc>,
    pub output: Value,
}

impl StageReport {
    pub fn new(name: &str, ok: bool, elapsed_ms: u128, output: Value) -> Self {
        Self {
            name: name.to_string(),
            ok,
            elapsed_ms,
            timestamp: Utc::now(),
            output,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn marketplace_lookup_accepts_codes_and_countries() {
        assert_eq!(
            MarketplaceId::from_str("A1PA6795UKMFR9"),
            Some(MarketplaceId::De)
        );
        assert_eq!(MarketplaceId::from_str(" gb "), Some(MarketplaceId::Uk));
        assert_eq!(MarketplaceId::from_str("XX"), None);
        assert_eq!(MarketplaceId::Jp.region(), Region::FarEast);
    }

    #[test]
    fn processing_status_wire_names() {
        let status: ProcessingStatus = serde_json::from_str("\"IN_PROGRESS\"").unwrap();
        assert_eq!(status, ProcessingStatus::InProgress);
        assert!(!status.is_terminal());
        assert!(ProcessingStatus::Cancelled.is_terminal());
    }

    #[test]
    fn compression_defaults_to_none() {
        assert_eq!(Compression::from_raw(Some("GZIP")), Compression::Gzip);
        assert_eq!(Compression::from_raw(Some("")), Compression::None);
        assert_eq!(Compression::from_raw(None), Compression::None);
    }
}
