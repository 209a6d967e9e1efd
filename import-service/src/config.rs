use serde::Deserialize;
use std::{collections::BTreeMap, collections::BTreeSet, fs, path::PathBuf, time::Duration};

use statistics_client::domain::{naming, MeterPoint};

use crate::importer::{ImportSettings, MeterJob, MAX_HISTORY_DAYS};
use crate::transform::EnabledKinds;

#[derive(Debug, Clone, Deserialize)]
pub struct DatabaseConfig {
    pub uri: String,
    #[serde(default = "default_max_connections")]
    pub max_connections: u32,
}

fn default_max_connections() -> u32 {
    4
}

#[derive(Debug, Clone, Deserialize)]
pub struct SinkConfig {
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_retry_backoff_ms")]
    pub retry_backoff_ms: u64,
}

fn default_max_retries() -> u32 {
    3
}

fn default_retry_backoff_ms() -> u64 {
    500
}

impl Default for SinkConfig {
    fn default() -> Self {
        Self {
            max_retries: default_max_retries(),
            retry_backoff_ms: default_retry_backoff_ms(),
        }
    }
}

impl SinkConfig {
    pub fn retry_backoff(&self) -> Duration {
        Duration::from_millis(self.retry_backoff_ms)
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct SourceConfig {
    pub payload_dir: PathBuf,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ImportConfig {
    #[serde(default = "default_namespace")]
    pub namespace: String,
    #[serde(default = "default_unit")]
    pub unit: String,
    #[serde(default = "default_cycle_interval_minutes")]
    pub cycle_interval_minutes: u64,
    #[serde(default = "default_history_days")]
    pub history_days: u32,
    #[serde(default = "default_tail_lookback")]
    pub tail_lookback: usize,
    /// Key statistic ids by slugified alias instead of meter id.
    #[serde(default)]
    pub use_alias_for_ids: bool,
}

fn default_namespace() -> String {
    "meter_stats".to_string()
}

fn default_unit() -> String {
    "kWh".to_string()
}

fn default_cycle_interval_minutes() -> u64 {
    360
}

fn default_history_days() -> u32 {
    1095
}

fn default_tail_lookback() -> usize {
    5
}

impl Default for ImportConfig {
    fn default() -> Self {
        Self {
            namespace: default_namespace(),
            unit: default_unit(),
            cycle_interval_minutes: default_cycle_interval_minutes(),
            history_days: default_history_days(),
            tail_lookback: default_tail_lookback(),
            use_alias_for_ids: false,
        }
    }
}

impl ImportConfig {
    pub fn cycle_interval(&self) -> Duration {
        Duration::from_secs(self.cycle_interval_minutes * 60)
    }

    pub fn settings(&self) -> ImportSettings {
        ImportSettings {
            namespace: self.namespace.clone(),
            unit: self.unit.clone(),
            history_days: self.history_days,
            tail_lookback: self.tail_lookback,
        }
    }
}

fn enabled_by_default() -> bool {
    true
}

#[derive(Debug, Clone, Deserialize)]
pub struct MeterConfig {
    pub id: String,
    #[serde(default)]
    pub alias: Option<String>,
    #[serde(default = "enabled_by_default")]
    pub enable_daily_cons: bool,
    #[serde(default = "enabled_by_default")]
    pub enable_daily_meter_read: bool,
}

#[derive(Debug, Clone, Deserialize)]
pub struct MetricsConfig {
    pub bind_addr: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct AppConfig {
    pub database: DatabaseConfig,
    #[serde(default)]
    pub sink: SinkConfig,
    pub source: SourceConfig,
    #[serde(default)]
    pub import: ImportConfig,
    #[serde(default)]
    pub meters: Vec<MeterConfig>,
    pub metrics: Option<MetricsConfig>,
}

impl AppConfig {
    pub fn load() -> anyhow::Result<Self> {
        use std::env;

        let path = env::var("METER_IMPORT_CONFIG").unwrap_or_else(|_| "meter-import.toml".to_string());
        let contents = fs::read_to_string(&path).map_err(|e| anyhow::anyhow!("failed to read config {path}: {e}"))?;
        Self::from_toml_str(&contents)
    }

    pub fn from_toml_str(contents: &str) -> anyhow::Result<Self> {
        let cfg: AppConfig = toml::from_str(contents)?;
        cfg.validate()?;
        Ok(cfg)
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        let import = &self.import;
        anyhow::ensure!(import.tail_lookback >= 1, "import.tail_lookback must be at least 1");
        anyhow::ensure!(
            import.cycle_interval_minutes >= 1,
            "import.cycle_interval_minutes must be at least 1"
        );
        anyhow::ensure!(
            (1..=MAX_HISTORY_DAYS).contains(&import.history_days),
            "import.history_days must be between 1 and {MAX_HISTORY_DAYS}"
        );
        anyhow::ensure!(!self.meters.is_empty(), "at least one [[meters]] entry is required");

        let mut seen = BTreeSet::new();
        for m in &self.meters {
            anyhow::ensure!(!m.id.trim().is_empty(), "meter id must not be empty");
            anyhow::ensure!(seen.insert(m.id.as_str()), "duplicate meter id {}", m.id);
        }
        Ok(())
    }

    /// Meters to import, with statistic keys resolved.
    pub fn meter_jobs(&self) -> Vec<MeterJob> {
        let ids: Vec<String> = self.meters.iter().map(|m| m.id.clone()).collect();
        let alias_keys = if self.import.use_alias_for_ids {
            let aliases: BTreeMap<String, String> = self
                .meters
                .iter()
                .filter_map(|m| Some((m.id.clone(), m.alias.clone()?)))
                .collect();
            naming::build_alias_keys(&ids, &naming::normalize_aliases(&aliases, None))
        } else {
            BTreeMap::new()
        };

        self.meters
            .iter()
            .map(|m| {
                let mut meter = MeterPoint::new(m.id.clone()).with_slug(naming::statistic_key(&m.id, &alias_keys));
                if let Some(alias) = &m.alias {
                    meter = meter.with_alias(alias.clone());
                }
                MeterJob {
                    meter,
                    enabled: EnabledKinds {
                        daily_cons: m.enable_daily_cons,
                        daily_meter_read: m.enable_daily_meter_read,
                    },
                }
            })
            .collect()
    }
}
