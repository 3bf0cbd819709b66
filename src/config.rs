use crate::models::{MarketplaceId, Region, ReportType};
use once_cell::sync::Lazy;
use serde::Deserialize;
use std::{env, path::PathBuf};
use thiserror::Error;

pub static LWA_TOKEN_URL: Lazy<String> = Lazy::new(|| {
    env::var("LWA_TOKEN_URL").unwrap_or_else(|_| "https://api.amazon.com/auth/o2/token".to_string())
});

pub static SPAPI_ENDPOINT: Lazy<Option<String>> =
    Lazy::new(|| env::var("SPAPI_ENDPOINT").ok().filter(|v| !v.is_empty()));

pub static ADS_ENDPOINT: Lazy<Option<String>> =
    Lazy::new(|| env::var("ADS_ENDPOINT").ok().filter(|v| !v.is_empty()));

pub const DEFAULT_DATE_RANGE_DAYS: u32 = 7;
pub const DEFAULT_MAX_POLLS: u32 = 360;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("unable to read {path}: {message}")]
    Read { path: String, message: String },
    #[error("invalid config.json: {0}")]
    Parse(String),
    #[error("unknown marketplace `{0}`")]
    UnknownMarketplace(String),
    #[error("unknown report `{0}`")]
    UnknownReport(String),
    #[error("no marketplace configured")]
    NoMarketplace,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
enum MarketplaceSource {
    Single(String),
    Multiple(Vec<String>),
}

impl MarketplaceSource {
    fn values(&self) -> Vec<String> {
        match self {
            MarketplaceSource::Single(raw) => raw
                .split(',')
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(str::to_string)
                .collect(),
            MarketplaceSource::Multiple(list) => list.clone(),
        }
    }
}

#[derive(Debug, Default, Deserialize)]
struct ConfigFile {
    #[serde(default)]
    parameters: Parameters,
}

#[derive(Debug, Default, Deserialize)]
struct Parameters {
    #[serde(rename = "#refresh_token", default)]
    refresh_token: Option<String>,
    #[serde(rename = "#app_id", default)]
    app_id: Option<String>,
    #[serde(rename = "#client_secret_id", default)]
    client_secret: Option<String>,
    #[serde(default)]
    marketplace_id: Option<MarketplaceSource>,
    #[serde(default)]
    date_range: Option<u32>,
    #[serde(default)]
    reports: Option<Vec<String>>,
    #[serde(default)]
    ads_profile_id: Option<String>,
    #[serde(default)]
    max_polls: Option<u32>,
}

#[derive(Debug, Clone)]
pub struct Credentials {
    pub refresh_token: String,
    pub client_id: String,
    pub client_secret: String,
}

impl Credentials {
    pub fn is_complete(&self) -> bool {
        !self.refresh_token.is_empty() && !self.client_id.is_empty() && !self.client_secret.is_empty()
    }
}

#[derive(Debug, Clone)]
pub struct ExtractorConfig {
    pub data_dir: PathBuf,
    pub credentials: Credentials,
    pub marketplaces: Vec<MarketplaceId>,
    pub date_range_days: u32,
    pub reports: Vec<ReportType>,
    pub ads_profile_id: Option<String>,
    pub max_polls: u32,
}

impl ExtractorConfig {
    /// Reads `<data_dir>/config.json` (missing file is allowed) and applies env overrides.
    pub fn load() -> Result<Self, ConfigError> {
        let data_dir = PathBuf::from(env::var("KBC_DATADIR").unwrap_or_else(|_| "data".into()));
        let path = data_dir.join("config.json");
        let file = match std::fs::read_to_string(&path) {
            Ok(raw) => serde_json::from_str::<ConfigFile>(&raw)
                .map_err(|err| ConfigError::Parse(err.to_string()))?,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => ConfigFile::default(),
            Err(err) => {
                return Err(ConfigError::Read {
                    path: path.display().to_string(),
                    message: err.to_string(),
                });
            }
        };
        Self::from_parameters(data_dir, file.parameters, |key| env::var(key).ok())
    }

    fn from_parameters(
        data_dir: PathBuf,
        params: Parameters,
        lookup: impl Fn(&str) -> Option<String>,
    ) -> Result<Self, ConfigError> {
        let pick = |key: &str, fallback: Option<String>| {
            lookup(key)
                .filter(|v| !v.trim().is_empty())
                .or(fallback)
                .unwrap_or_default()
        };
        let credentials = Credentials {
            refresh_token: pick("SPAPI_REFRESH_TOKEN", params.refresh_token),
            client_id: pick("SPAPI_APP_ID", params.app_id),
            client_secret: pick("SPAPI_CLIENT_SECRET", params.client_secret),
        };

        let raw_marketplaces = match lookup("SPAPI_MARKETPLACE_IDS") {
            Some(value) if !value.trim().is_empty() => MarketplaceSource::Single(value).values(),
            _ => params
                .marketplace_id
                .as_ref()
                .map(MarketplaceSource::values)
                .unwrap_or_default(),
        };
        let mut marketplaces = Vec::new();
        for raw in raw_marketplaces {
            let id = MarketplaceId::from_str(&raw)
                .ok_or_else(|| ConfigError::UnknownMarketplace(raw.clone()))?;
            if !marketplaces.contains(&id) {
                marketplaces.push(id);
            }
        }
        if marketplaces.is_empty() {
            return Err(ConfigError::NoMarketplace);
        }

        let date_range_days = lookup("SPAPI_DATE_RANGE")
            .and_then(|v| v.parse::<u32>().ok())
            .or(params.date_range)
            .filter(|v| *v > 0)
            .unwrap_or(DEFAULT_DATE_RANGE_DAYS);

        let reports = match params.reports {
            Some(names) => names
                .iter()
                .map(|name| {
                    ReportType::from_str(name).ok_or_else(|| ConfigError::UnknownReport(name.clone()))
                })
                .collect::<Result<Vec<_>, _>>()?,
            None => ReportType::ALL.to_vec(),
        };

        let ads_profile_id = lookup("ADS_PROFILE_ID")
            .or(params.ads_profile_id)
            .filter(|v| !v.trim().is_empty());

        Ok(Self {
            data_dir,
            credentials,
            marketplaces,
            date_range_days,
            reports,
            ads_profile_id,
            max_polls: params.max_polls.filter(|v| *v > 0).unwrap_or(DEFAULT_MAX_POLLS),
        })
    }

    pub fn region(&self) -> Region {
        self.marketplaces
            .first()
            .map(MarketplaceId::region)
            .unwrap_or(Region::Europe)
    }

    pub fn selling_partner_root(&self) -> String {
        SPAPI_ENDPOINT
            .clone()
            .unwrap_or_else(|| self.region().selling_partner_root().to_string())
    }

    pub fn advertising_root(&self) -> String {
        ADS_ENDPOINT
            .clone()
            .unwrap_or_else(|| self.region().advertising_root().to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn parse(raw: &str, env: &[(&str, &str)]) -> Result<ExtractorConfig, ConfigError> {
        let file: ConfigFile = serde_json::from_str(raw).unwrap();
        let env: HashMap<String, String> = env
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        ExtractorConfig::from_parameters(PathBuf::from("data"), file.parameters, |key| {
            env.get(key).cloned()
        })
    }

    #[test]
    fn reads_keboola_style_parameters() {
        let cfg = parse(
            r##"{"parameters": {"#refresh_token": "rt", "#app_id": "app", "#client_secret_id": "sec",
                "marketplace_id": "A1PA6795UKMFR9", "date_range": 14, "reports": ["orders", "returns"]}}"##,
            &[],
        )
        .unwrap();
        assert!(cfg.credentials.is_complete());
        assert_eq!(cfg.marketplaces, vec![MarketplaceId::De]);
        assert_eq!(cfg.date_range_days, 14);
        assert_eq!(cfg.reports, vec![ReportType::Orders, ReportType::Returns]);
        assert_eq!(cfg.region(), Region::Europe);
        assert_eq!(cfg.max_polls, DEFAULT_MAX_POLLS);
    }

    #[test]
    fn env_overrides_file_values() {
        let cfg = parse(
            r##"{"parameters": {"#refresh_token": "file", "marketplace_id": ["DE", "FR", "DE"]}}"##,
            &[("SPAPI_REFRESH_TOKEN", "env"), ("SPAPI_DATE_RANGE", "3")],
        )
        .unwrap();
        assert_eq!(cfg.credentials.refresh_token, "env");
        assert_eq!(cfg.marketplaces, vec![MarketplaceId::De, MarketplaceId::Fr]);
        assert_eq!(cfg.date_range_days, 3);
        assert_eq!(cfg.reports.len(), ReportType::ALL.len());
        assert!(!cfg.credentials.is_complete());
    }

    #[test]
    fn rejects_unknown_marketplace_and_report() {
        let err = parse(r#"{"parameters": {"marketplace_id": "ZZ"}}"#, &[]).unwrap_err();
        assert!(matches!(err, ConfigError::UnknownMarketplace(_)));
        let err = parse(
            r#"{"parameters": {"marketplace_id": "US", "reports": ["weather"]}}"#,
            &[],
        )
        .unwrap_err();
        assert!(matches!(err, ConfigError::UnknownReport(_)));
        let err = parse(r#"{"parameters": {}}"#, &[]).unwrap_err();
        assert!(matches!(err, ConfigError::NoMarketplace));
    }
}
