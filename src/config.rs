//! Process configuration, read once from the environment and passed down
//! explicitly.
//!
//! A single feed is described with `PROVIDER` / `FEED_URL` (plus optional
//! `API_KEY`, `API_KEY_HEADER`, `API_KEY_QUERY`, `HTTPS_VERIFY`). Several feeds
//! can be listed in a JSON file named by `FEEDS_FILE`:
//!
//! ```json
//! [
//!   { "provider": "MBTA", "url": "https://cdn.mbta.com/realtime/VehiclePositions.pb" },
//!   { "provider": "CTA", "url": "https://example.org/vp", "headers": { "X-API-Key": "..." } }
//! ]
//! ```

use anyhow::{Context, Result, bail};
use serde::Deserialize;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

const DEFAULT_API_KEY_HEADER: &str = "X-API-Key";

/// One monitored vehicle-positions feed.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct FeedConfig {
    pub provider: String,
    pub url: String,
    #[serde(default)]
    pub headers: BTreeMap<String, String>,
    #[serde(default)]
    pub query_params: BTreeMap<String, String>,
    #[serde(default = "default_true")]
    pub https_verify: bool,
}

fn default_true() -> bool {
    true
}

/// Poll-loop tuning shared by every feed.
#[derive(Debug, Clone, PartialEq)]
pub struct ReconcilerConfig {
    /// Registry size above which the oldest entity is evicted each cycle.
    pub max_entities: usize,
    pub poll_interval: Duration,
    /// Interval used after an empty feed or an unclassified fetch failure.
    pub error_interval: Duration,
    pub request_timeout: Duration,
}

impl Default for ReconcilerConfig {
    fn default() -> Self {
        Self {
            max_entities: 1000,
            poll_interval: Duration::from_secs(30),
            error_interval: Duration::from_secs(300),
            request_timeout: Duration::from_secs(10),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct AggregationConfig {
    /// Local hour at which the previous day is aggregated.
    pub hour: u32,
    pub segment_matching: bool,
    pub gtfs_static_path: Option<PathBuf>,
    pub segment_index_path: Option<PathBuf>,
    pub delete_after_upload: bool,
    pub delete_raw_files: bool,
}

impl Default for AggregationConfig {
    fn default() -> Self {
        Self {
            hour: 2,
            segment_matching: false,
            gtfs_static_path: None,
            segment_index_path: None,
            delete_after_upload: true,
            delete_raw_files: true,
        }
    }
}

impl AggregationConfig {
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Reads the aggregation variables only; no feed needs to be configured.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let get = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());
        let defaults = Self::default();

        let hour = parse_or(&get, "AGGREGATION_HOUR", defaults.hour)?;
        if hour > 23 {
            bail!("AGGREGATION_HOUR must be between 0 and 23, got {hour}");
        }
        Ok(Self {
            hour,
            segment_matching: parse_or(&get, "SEGMENT_MATCHING_ENABLED", false)?,
            gtfs_static_path: get("GTFS_STATIC_PATH").map(PathBuf::from),
            segment_index_path: get("SEGMENT_INDEX_PATH").map(PathBuf::from),
            delete_after_upload: parse_or(&get, "DELETE_AFTER_UPLOAD", defaults.delete_after_upload)?,
            delete_raw_files: parse_or(&get, "DELETE_RAW_FILES", defaults.delete_raw_files)?,
        })
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct AppConfig {
    pub data_dir: PathBuf,
    pub s3_bucket: Option<String>,
    pub feeds: Vec<FeedConfig>,
    pub reconciler: ReconcilerConfig,
    pub aggregation: AggregationConfig,
}

impl AppConfig {
    /// Reads configuration from the process environment.
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Reads configuration through `lookup`; empty values count as unset.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let get = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        let feeds = match get("FEEDS_FILE") {
            Some(path) => load_feeds_file(Path::new(&path))?,
            None => vec![single_feed(&get)?],
        };
        if feeds.is_empty() {
            bail!("FEEDS_FILE lists no feeds");
        }

        let defaults = ReconcilerConfig::default();
        let reconciler = ReconcilerConfig {
            max_entities: parse_or(&get, "MAX_ENTITIES", defaults.max_entities)?,
            poll_interval: secs_or(&get, "POLL_INTERVAL_SECS", defaults.poll_interval)?,
            error_interval: secs_or(&get, "ERROR_INTERVAL_SECS", defaults.error_interval)?,
            request_timeout: secs_or(&get, "REQUEST_TIMEOUT_SECS", defaults.request_timeout)?,
        };

        let aggregation = AggregationConfig::from_lookup(&get)?;

        Ok(Self {
            data_dir: get("DATA_DIR").map(PathBuf::from).unwrap_or_else(|| PathBuf::from("./data")),
            s3_bucket: get("S3_BUCKET"),
            feeds,
            reconciler,
            aggregation,
        })
    }
}

fn single_feed(get: &impl Fn(&str) -> Option<String>) -> Result<FeedConfig> {
    let provider = get("PROVIDER");
    let url = get("FEED_URL");

    let mut missing = Vec::new();
    if provider.is_none() {
        missing.push("PROVIDER");
    }
    if url.is_none() {
        missing.push("FEED_URL");
    }
    let api_key = get("API_KEY");
    let api_key_query = get("API_KEY_QUERY");
    let api_key_header = get("API_KEY_HEADER");
    if (api_key_query.is_some() || api_key_header.is_some()) && api_key.is_none() {
        missing.push("API_KEY");
    }
    if !missing.is_empty() {
        bail!("Missing required environment variables: {}", missing.join(", "));
    }

    let mut headers = BTreeMap::new();
    let mut query_params = BTreeMap::new();
    if let Some(key) = api_key {
        if let Some(param) = api_key_query {
            query_params.insert(param, key.clone());
            if let Some(header) = api_key_header {
                headers.insert(header, key);
            }
        } else {
            let header = api_key_header.unwrap_or_else(|| DEFAULT_API_KEY_HEADER.to_string());
            headers.insert(header, key);
        }
    }

    Ok(FeedConfig {
        provider: provider.unwrap_or_default(),
        url: url.unwrap_or_default(),
        headers,
        query_params,
        https_verify: parse_or(get, "HTTPS_VERIFY", true)?,
    })
}

/// Loads a JSON array of [`FeedConfig`] objects.
pub fn load_feeds_file(path: &Path) -> Result<Vec<FeedConfig>> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read feeds file {}", path.display()))?;
    let feeds: Vec<FeedConfig> = serde_json::from_str(&content)
        .with_context(|| format!("invalid feeds file {}", path.display()))?;
    Ok(feeds)
}

fn parse_or<T>(get: &impl Fn(&str) -> Option<String>, key: &str, default: T) -> Result<T>
where
    T: FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    match get(key) {
        Some(raw) => raw
            .trim()
            .to_ascii_lowercase()
            .parse()
            .with_context(|| format!("invalid value for {key}: '{raw}'")),
        None => Ok(default),
    }
}

fn secs_or(get: &impl Fn(&str) -> Option<String>, key: &str, default: Duration) -> Result<Duration> {
    parse_or(get, key, default.as_secs()).map(Duration::from_secs)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn config_from(vars: &[(&str, &str)]) -> Result<AppConfig> {
        let map: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        AppConfig::from_lookup(|key| map.get(key).cloned())
    }

    #[test]
    fn test_minimal_single_feed_uses_defaults() {
        let config = config_from(&[("PROVIDER", "MBTA"), ("FEED_URL", "https://x/vp.pb")]).unwrap();
        assert_eq!(config.data_dir, PathBuf::from("./data"));
        assert_eq!(config.s3_bucket, None);
        assert_eq!(config.feeds.len(), 1);
        assert_eq!(config.feeds[0].provider, "MBTA");
        assert!(config.feeds[0].headers.is_empty());
        assert!(config.feeds[0].https_verify);
        assert_eq!(config.reconciler, ReconcilerConfig::default());
        assert_eq!(config.aggregation.hour, 2);
        assert!(!config.aggregation.segment_matching);
    }

    #[test]
    fn test_missing_required_variables_are_all_reported() {
        let err = config_from(&[]).unwrap_err().to_string();
        assert!(err.contains("PROVIDER"));
        assert!(err.contains("FEED_URL"));
    }

    #[test]
    fn test_api_key_defaults_to_header() {
        let config = config_from(&[
            ("PROVIDER", "MBTA"),
            ("FEED_URL", "https://x/vp.pb"),
            ("API_KEY", "secret"),
        ])
        .unwrap();
        assert_eq!(
            config.feeds[0].headers.get("X-API-Key").map(String::as_str),
            Some("secret")
        );
        assert!(config.feeds[0].query_params.is_empty());
    }

    #[test]
    fn test_api_key_as_query_param() {
        let config = config_from(&[
            ("PROVIDER", "MBTA"),
            ("FEED_URL", "https://x/vp.pb"),
            ("API_KEY", "secret"),
            ("API_KEY_QUERY", "api_key"),
        ])
        .unwrap();
        assert!(config.feeds[0].headers.is_empty());
        assert_eq!(
            config.feeds[0].query_params.get("api_key").map(String::as_str),
            Some("secret")
        );
    }

    #[test]
    fn test_auth_method_without_key_is_an_error() {
        let err = config_from(&[
            ("PROVIDER", "MBTA"),
            ("FEED_URL", "https://x/vp.pb"),
            ("API_KEY_HEADER", "Authorization"),
        ])
        .unwrap_err();
        assert!(err.to_string().contains("API_KEY"));
    }

    #[test]
    fn test_tuning_overrides() {
        let config = config_from(&[
            ("PROVIDER", "MBTA"),
            ("FEED_URL", "https://x/vp.pb"),
            ("MAX_ENTITIES", "50"),
            ("POLL_INTERVAL_SECS", "5"),
            ("HTTPS_VERIFY", "False"),
            ("SEGMENT_MATCHING_ENABLED", "TRUE"),
            ("AGGREGATION_HOUR", "4"),
            ("S3_BUCKET", "bucket"),
        ])
        .unwrap();
        assert_eq!(config.reconciler.max_entities, 50);
        assert_eq!(config.reconciler.poll_interval, Duration::from_secs(5));
        assert!(!config.feeds[0].https_verify);
        assert!(config.aggregation.segment_matching);
        assert_eq!(config.aggregation.hour, 4);
        assert_eq!(config.s3_bucket.as_deref(), Some("bucket"));
    }

    #[test]
    fn test_invalid_number_is_an_error() {
        let err = config_from(&[
            ("PROVIDER", "MBTA"),
            ("FEED_URL", "https://x/vp.pb"),
            ("MAX_ENTITIES", "lots"),
        ])
        .unwrap_err();
        assert!(err.to_string().contains("MAX_ENTITIES"));
    }

    #[test]
    fn test_aggregation_config_without_feeds() {
        let config = AggregationConfig::from_lookup(|key| match key {
            "DELETE_RAW_FILES" => Some("false".to_string()),
            "GTFS_STATIC_PATH" => Some("/srv/gtfs".to_string()),
            "SEGMENT_INDEX_PATH" => Some(" ".to_string()),
            _ => None,
        })
        .unwrap();
        assert!(!config.delete_raw_files);
        assert!(config.delete_after_upload);
        assert_eq!(config.gtfs_static_path, Some(PathBuf::from("/srv/gtfs")));
        assert_eq!(config.segment_index_path, None);

        let err = AggregationConfig::from_lookup(|key| {
            (key == "AGGREGATION_HOUR").then(|| "24".to_string())
        })
        .unwrap_err();
        assert!(err.to_string().contains("AGGREGATION_HOUR"));
    }

    #[test]
    fn test_feeds_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("feeds.json");
        std::fs::write(
            &path,
            r#"[
                {"provider": "MBTA", "url": "https://a/vp.pb"},
                {"provider": "CTA", "url": "https://b/vp.pb",
                 "headers": {"X-API-Key": "k"}, "https_verify": false}
            ]"#,
        )
        .unwrap();

        let config = config_from(&[("FEEDS_FILE", path.to_str().unwrap())]).unwrap();
        assert_eq!(config.feeds.len(), 2);
        assert_eq!(config.feeds[1].provider, "CTA");
        assert!(!config.feeds[1].https_verify);
        assert!(config.feeds[0].https_verify);
    }
}
