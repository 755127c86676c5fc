//! Feeder configuration: built-in defaults, then a YAML file, then `AHF_*`
//! environment variables (highest precedence).

use std::fmt::Display;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use ahf_api::{ApiConfig, ApiCredentials, BackoffPolicy, RateLimitConfig, DEFAULT_MAX_PAGES};
use ahf_core::{BucketGranularity, Region};
use ahf_storage::{CompressionCodec, ParquetOptions, SinkOptions, StorageBackend};
use anyhow::{bail, Context, Result};
use serde::Deserialize;

use crate::CyclePolicy;

pub const ENV_PREFIX: &str = "AHF_";
pub const DEFAULT_CONFIG_FILE: &str = "ahf.yaml";

/// One configuration source. Every field is optional so sources can be layered.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ConfigLayer {
    pub region: Option<String>,
    pub locale: Option<String>,
    pub client_id: Option<String>,
    pub client_secret: Option<String>,
    pub api_base_url: Option<String>,
    pub token_url: Option<String>,
    pub storage_backend: Option<String>,
    pub storage_path: Option<PathBuf>,
    pub bucket: Option<String>,
    pub s3_prefix: Option<String>,
    pub s3_region: Option<String>,
    pub s3_endpoint: Option<String>,
    pub s3_allow_http: Option<bool>,
    pub compression: Option<String>,
    pub ledger_path: Option<PathBuf>,
    pub rate_limit_rps: Option<u32>,
    pub rate_limit_per_hour: Option<u32>,
    pub skip_threshold: Option<f64>,
    pub bucket_granularity: Option<String>,
    pub max_page_retries: Option<usize>,
    pub max_pages: Option<usize>,
    pub max_rate_limit_retries: Option<usize>,
    pub http_timeout_secs: Option<u64>,
    pub max_concurrent_realms: Option<usize>,
    pub realms: Option<Vec<u32>>,
    pub include_commodities: Option<bool>,
    pub include_realm_metadata: Option<bool>,
    pub scheduler_cron: Option<String>,
    pub user_agent: Option<String>,
}

macro_rules! overlay_fields {
    ($base:ident, $top:ident, $($field:ident),+ $(,)?) => {
        ConfigLayer { $($field: $top.$field.or($base.$field)),+ }
    };
}

impl ConfigLayer {
    /// Values from `top` win over values already in `self`.
    pub fn overlay(self, top: ConfigLayer) -> ConfigLayer {
        let base = self;
        overlay_fields!(
            base,
            top,
            region,
            locale,
            client_id,
            client_secret,
            api_base_url,
            token_url,
            storage_backend,
            storage_path,
            bucket,
            s3_prefix,
            s3_region,
            s3_endpoint,
            s3_allow_http,
            compression,
            ledger_path,
            rate_limit_rps,
            rate_limit_per_hour,
            skip_threshold,
            bucket_granularity,
            max_page_retries,
            max_pages,
            max_rate_limit_retries,
            http_timeout_secs,
            max_concurrent_realms,
            realms,
            include_commodities,
            include_realm_metadata,
            scheduler_cron,
            user_agent,
        )
    }

    pub fn from_yaml(text: &str) -> Result<Self> {
        serde_yaml::from_str(text).context("parsing feeder config yaml")
    }

    pub async fn from_file(path: &Path) -> Result<Self> {
        let text = tokio::fs::read_to_string(path)
            .await
            .with_context(|| format!("reading {}", path.display()))?;
        Self::from_yaml(&text).with_context(|| format!("parsing {}", path.display()))
    }

    /// Reads `AHF_<KEY>` variables through `lookup`. Empty values count as unset.
    pub fn from_env_with(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let get = |key: &str| {
            lookup(&format!("{ENV_PREFIX}{}", key.to_ascii_uppercase()))
                .map(|v| v.trim().to_string())
                .filter(|v| !v.is_empty())
        };

        Ok(Self {
            region: get("region"),
            locale: get("locale"),
            client_id: get("client_id"),
            client_secret: get("client_secret"),
            api_base_url: get("api_base_url"),
            token_url: get("token_url"),
            storage_backend: get("storage_backend"),
            storage_path: get("storage_path").map(PathBuf::from),
            bucket: get("bucket"),
            s3_prefix: get("s3_prefix"),
            s3_region: get("s3_region"),
            s3_endpoint: get("s3_endpoint"),
            s3_allow_http: parse_opt("s3_allow_http", get("s3_allow_http"), parse_bool)?,
            compression: get("compression"),
            ledger_path: get("ledger_path").map(PathBuf::from),
            rate_limit_rps: parse_opt("rate_limit_rps", get("rate_limit_rps"), parse_from_str)?,
            rate_limit_per_hour: parse_opt("rate_limit_per_hour", get("rate_limit_per_hour"), parse_from_str)?,
            skip_threshold: parse_opt("skip_threshold", get("skip_threshold"), parse_from_str)?,
            bucket_granularity: get("bucket_granularity"),
            max_page_retries: parse_opt("max_page_retries", get("max_page_retries"), parse_from_str)?,
            max_pages: parse_opt("max_pages", get("max_pages"), parse_from_str)?,
            max_rate_limit_retries: parse_opt(
                "max_rate_limit_retries",
                get("max_rate_limit_retries"),
                parse_from_str,
            )?,
            http_timeout_secs: parse_opt("http_timeout_secs", get("http_timeout_secs"), parse_from_str)?,
            max_concurrent_realms: parse_opt(
                "max_concurrent_realms",
                get("max_concurrent_realms"),
                parse_from_str,
            )?,
            realms: parse_opt("realms", get("realms"), parse_realm_list)?,
            include_commodities: parse_opt("include_commodities", get("include_commodities"), parse_bool)?,
            include_realm_metadata: parse_opt(
                "include_realm_metadata",
                get("include_realm_metadata"),
                parse_bool,
            )?,
            scheduler_cron: get("scheduler_cron"),
            user_agent: get("user_agent"),
        })
    }
}

fn parse_opt<T>(
    key: &str,
    value: Option<String>,
    parse: impl Fn(&str) -> Result<T>,
) -> Result<Option<T>> {
    value
        .map(|v| parse(&v).with_context(|| format!("invalid value for {ENV_PREFIX}{}", key.to_ascii_uppercase())))
        .transpose()
}

fn parse_from_str<T>(value: &str) -> Result<T>
where
    T: FromStr,
    T::Err: Display,
{
    value
        .parse::<T>()
        .map_err(|e| anyhow::anyhow!("`{value}`: {e}"))
}

fn parse_bool(value: &str) -> Result<bool> {
    match value.to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" => Ok(false),
        other => bail!("`{other}` is not a boolean"),
    }
}

fn parse_realm_list(value: &str) -> Result<Vec<u32>> {
    value
        .split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(parse_from_str::<u32>)
        .collect()
}

/// Fully resolved and validated feeder settings.
#[derive(Debug, Clone)]
pub struct FeederConfig {
    pub region: Region,
    pub locale: Option<String>,
    pub client_id: String,
    pub client_secret: String,
    pub api_base_url: Option<String>,
    pub token_url: Option<String>,
    pub storage: StorageBackend,
    pub compression: CompressionCodec,
    pub ledger_path: PathBuf,
    pub rate_limit: RateLimitConfig,
    pub skip_threshold: f64,
    pub granularity: BucketGranularity,
    pub max_page_retries: usize,
    pub max_pages: usize,
    pub max_rate_limit_retries: usize,
    pub http_timeout: Duration,
    pub max_concurrent_realms: usize,
    pub realms: Vec<u32>,
    pub include_commodities: bool,
    pub include_realm_metadata: bool,
    pub scheduler_cron: String,
    pub user_agent: Option<String>,
}

impl FeederConfig {
    /// Loads defaults, then the config file, then the process environment.
    ///
    /// The file is `path` when given, else `$AHF_CONFIG`, else `ahf.yaml` if it exists.
    pub async fn load(path: Option<&Path>) -> Result<Self> {
        Self::load_with(path, |key| std::env::var(key).ok()).await
    }

    pub async fn load_with(
        path: Option<&Path>,
        lookup: impl Fn(&str) -> Option<String>,
    ) -> Result<Self> {
        let explicit = path
            .map(Path::to_path_buf)
            .or_else(|| lookup("AHF_CONFIG").filter(|v| !v.is_empty()).map(PathBuf::from));
        let file_layer = match explicit {
            Some(path) => ConfigLayer::from_file(&path).await?,
            None => {
                let default = PathBuf::from(DEFAULT_CONFIG_FILE);
                if tokio::fs::try_exists(&default).await.unwrap_or(false) {
                    ConfigLayer::from_file(&default).await?
                } else {
                    ConfigLayer::default()
                }
            }
        };
        let env_layer = ConfigLayer::from_env_with(lookup)?;
        Self::from_layer(file_layer.overlay(env_layer))
    }

    pub fn from_layer(layer: ConfigLayer) -> Result<Self> {
        let region = layer
            .region
            .as_deref()
            .unwrap_or("eu")
            .parse::<Region>()
            .context("invalid region")?;

        let storage_path = layer.storage_path.unwrap_or_else(|| PathBuf::from("./data"));
        let storage = match layer.storage_backend.as_deref().unwrap_or("local") {
            "local" => StorageBackend::Local { root: storage_path },
            "s3" => {
                let Some(bucket) = layer.bucket.filter(|b| !b.is_empty()) else {
                    bail!("storage_backend `s3` requires `bucket`");
                };
                StorageBackend::S3 {
                    bucket,
                    prefix: layer.s3_prefix,
                    region: layer.s3_region,
                    endpoint: layer.s3_endpoint,
                    allow_http: layer.s3_allow_http.unwrap_or(false),
                }
            }
            other => bail!("unknown storage_backend `{other}` (expected local or s3)"),
        };

        let compression = layer
            .compression
            .as_deref()
            .map(CompressionCodec::from_str)
            .transpose()
            .map_err(|e| anyhow::anyhow!(e))?
            .unwrap_or_default();

        let granularity = layer
            .bucket_granularity
            .as_deref()
            .map(BucketGranularity::from_str)
            .transpose()?
            .unwrap_or_default();

        let skip_threshold = layer.skip_threshold.unwrap_or(ahf_adapters::DEFAULT_SKIP_THRESHOLD);
        if !(0.0..=1.0).contains(&skip_threshold) {
            bail!("skip_threshold must be within [0, 1], got {skip_threshold}");
        }

        let defaults = RateLimitConfig::default();
        let rate_limit = RateLimitConfig {
            per_second: layer.rate_limit_rps.unwrap_or(defaults.per_second),
            per_hour: layer.rate_limit_per_hour.unwrap_or(defaults.per_hour),
        };
        if rate_limit.per_second == 0 || rate_limit.per_hour == 0 {
            bail!("rate limits must be greater than zero");
        }

        let max_concurrent_realms = layer.max_concurrent_realms.unwrap_or(4);
        if max_concurrent_realms == 0 {
            bail!("max_concurrent_realms must be greater than zero");
        }

        let max_pages = layer.max_pages.unwrap_or(DEFAULT_MAX_PAGES);
        if max_pages == 0 {
            bail!("max_pages must be greater than zero");
        }

        Ok(Self {
            region,
            locale: layer.locale,
            client_id: layer.client_id.unwrap_or_default(),
            client_secret: layer.client_secret.unwrap_or_default(),
            api_base_url: layer.api_base_url,
            token_url: layer.token_url,
            storage,
            compression,
            ledger_path: layer
                .ledger_path
                .unwrap_or_else(|| PathBuf::from("./state/ledger.json")),
            rate_limit,
            skip_threshold,
            granularity,
            max_page_retries: layer.max_page_retries.unwrap_or(3),
            max_pages,
            max_rate_limit_retries: layer.max_rate_limit_retries.unwrap_or(5),
            http_timeout: Duration::from_secs(layer.http_timeout_secs.unwrap_or(30)),
            max_concurrent_realms,
            realms: layer.realms.unwrap_or_default(),
            include_commodities: layer.include_commodities.unwrap_or(false),
            include_realm_metadata: layer.include_realm_metadata.unwrap_or(false),
            scheduler_cron: layer
                .scheduler_cron
                .unwrap_or_else(|| "0 5 * * * *".to_string()),
            user_agent: layer.user_agent,
        })
    }

    pub fn credentials(&self) -> Result<ApiCredentials> {
        if self.client_id.is_empty() || self.client_secret.is_empty() {
            bail!("client_id and client_secret are required (set AHF_CLIENT_ID / AHF_CLIENT_SECRET)");
        }
        Ok(ApiCredentials {
            client_id: self.client_id.clone(),
            client_secret: self.client_secret.clone(),
        })
    }

    pub fn api_config(&self) -> ApiConfig {
        let mut config = ApiConfig::for_region(self.region);
        if let Some(locale) = &self.locale {
            config.locale = locale.clone();
        }
        if let Some(base) = &self.api_base_url {
            config.api_base_url = base.clone();
        }
        if let Some(token_url) = &self.token_url {
            config.token_url = token_url.clone();
        }
        if self.user_agent.is_some() {
            config.user_agent = self.user_agent.clone();
        }
        config.timeout = self.http_timeout;
        config.rate_limit_backoff = BackoffPolicy {
            max_retries: self.max_rate_limit_retries,
            ..BackoffPolicy::rate_limited()
        };
        config
    }

    pub fn sink_options(&self) -> SinkOptions {
        SinkOptions {
            granularity: self.granularity,
            parquet: ParquetOptions {
                compression: self.compression,
                ..ParquetOptions::default()
            },
        }
    }

    pub fn cycle_policy(&self) -> CyclePolicy {
        CyclePolicy {
            page_backoff: BackoffPolicy {
                max_retries: self.max_page_retries,
                ..BackoffPolicy::default()
            },
            skip_threshold: self.skip_threshold,
            max_pages: self.max_pages,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use tempfile::tempdir;

    fn env(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect::<HashMap<_, _>>();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn defaults_are_local_hourly_and_five_percent() {
        let config = FeederConfig::from_layer(ConfigLayer::default()).unwrap();
        assert_eq!(config.region, Region::Eu);
        assert_eq!(
            config.storage,
            StorageBackend::Local {
                root: PathBuf::from("./data")
            }
        );
        assert_eq!(config.granularity, BucketGranularity::Hour);
        assert_eq!(config.skip_threshold, 0.05);
        assert_eq!(config.max_page_retries, 3);
        assert_eq!(config.max_pages, DEFAULT_MAX_PAGES);
        assert!(!config.include_realm_metadata);
        assert_eq!(config.rate_limit, RateLimitConfig::default());
        assert!(config.credentials().is_err());
    }

    #[tokio::test]
    async fn environment_overrides_file_values() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("ahf.yaml");
        tokio::fs::write(
            &path,
            "region: us\nskip_threshold: 0.1\nrate_limit_rps: 10\nrealms: [1, 2]\nclient_id: from-file\n",
        )
        .await
        .unwrap();

        let lookup = env(&[
            ("AHF_REGION", "kr"),
            ("AHF_CLIENT_SECRET", "s3cr3t"),
            ("AHF_REALMS", "205, 210"),
        ]);
        let config = FeederConfig::load_with(Some(&path), lookup).await.unwrap();

        assert_eq!(config.region, Region::Kr);
        assert_eq!(config.skip_threshold, 0.1);
        assert_eq!(config.rate_limit.per_second, 10);
        assert_eq!(config.realms, vec![205, 210]);
        let creds = config.credentials().unwrap();
        assert_eq!(creds.client_id, "from-file");
        assert_eq!(creds.client_secret, "s3cr3t");
    }

    #[tokio::test]
    async fn config_path_can_come_from_environment() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("custom.yaml");
        tokio::fs::write(&path, "bucket_granularity: day\n").await.unwrap();
        let path_str = path.display().to_string();

        let lookup = env(&[("AHF_CONFIG", path_str.as_str())]);
        let config = FeederConfig::load_with(None, lookup).await.unwrap();
        assert_eq!(config.granularity, BucketGranularity::Day);
    }

    #[test]
    fn s3_backend_requires_a_bucket() {
        let layer = ConfigLayer {
            storage_backend: Some("s3".to_string()),
            ..ConfigLayer::default()
        };
        let err = FeederConfig::from_layer(layer).unwrap_err();
        assert!(err.to_string().contains("bucket"));

        let layer = ConfigLayer {
            storage_backend: Some("s3".to_string()),
            bucket: Some("auctions".to_string()),
            s3_prefix: Some("raw".to_string()),
            ..ConfigLayer::default()
        };
        let config = FeederConfig::from_layer(layer).unwrap();
        assert!(matches!(config.storage, StorageBackend::S3 { ref bucket, .. } if bucket == "auctions"));
    }

    #[test]
    fn invalid_values_are_rejected() {
        let layer = ConfigLayer {
            skip_threshold: Some(1.5),
            ..ConfigLayer::default()
        };
        assert!(FeederConfig::from_layer(layer).is_err());

        let layer = ConfigLayer {
            rate_limit_rps: Some(0),
            ..ConfigLayer::default()
        };
        assert!(FeederConfig::from_layer(layer).is_err());

        let layer = ConfigLayer {
            max_pages: Some(0),
            ..ConfigLayer::default()
        };
        assert!(FeederConfig::from_layer(layer).is_err());

        assert!(ConfigLayer::from_env_with(env(&[("AHF_RATE_LIMIT_RPS", "fast")])).is_err());
        assert!(ConfigLayer::from_yaml("unknown_key: 1\n").is_err());
    }

    #[test]
    fn api_config_applies_overrides() {
        let layer = ConfigLayer {
            region: Some("cn".to_string()),
            max_rate_limit_retries: Some(2),
            ..ConfigLayer::default()
        };
        let api = FeederConfig::from_layer(layer).unwrap().api_config();
        assert_eq!(api.api_base_url, "https://gateway.battlenet.com.cn");
        assert_eq!(api.token_url, "https://oauth.battlenet.com.cn/token");
        assert_eq!(api.rate_limit_backoff.max_retries, 2);
    }

    #[test]
    fn page_bound_flows_into_the_cycle_policy() {
        let layer = ConfigLayer::from_env_with(env(&[
            ("AHF_MAX_PAGES", "25"),
            ("AHF_INCLUDE_REALM_METADATA", "yes"),
        ]))
        .unwrap();
        let config = FeederConfig::from_layer(layer).unwrap();
        assert_eq!(config.cycle_policy().max_pages, 25);
        assert!(config.include_realm_metadata);
    }
}
