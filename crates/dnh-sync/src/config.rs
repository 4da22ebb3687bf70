//! Environment configuration, per-run options, and the venue registry.

use std::path::{Path, PathBuf};
use std::time::Duration;

use chrono::{Local, NaiveDate};
use dnh_adapters::VenueListing;
use dnh_storage::{HttpClientConfig, ParseStoreConfig, STORE_MAX_PAGE_SIZE};
use serde::Deserialize;
use thiserror::Error;

pub const MAX_LOOKAHEAD_DAYS: u32 = 7;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("invalid date `{value}`, expected YYYY-MM-DD")]
    InvalidDate {
        value: String,
        #[source]
        source: chrono::ParseError,
    },
    #[error("working directory {0} does not exist")]
    MissingWorkdir(PathBuf),
    #[error("lookahead of {0} days is outside 1..=7")]
    LookaheadOutOfRange(u32),
    #[error("{name} must be at least 1")]
    ZeroLimit { name: &'static str },
}

#[derive(Debug, Clone)]
pub struct SyncConfig {
    pub rpc_url: String,
    pub store_url: String,
    pub store_app_id: String,
    pub store_api_key: String,
    pub workdir: PathBuf,
    pub harvest_concurrency: usize,
    pub notify_concurrency: usize,
    pub page_size: usize,
    pub lookahead_days: u32,
    pub attribution_user: Option<String>,
    pub user_agent: String,
    pub http_timeout_secs: u64,
    pub scheduler_enabled: bool,
    pub sync_cron: String,
}

impl SyncConfig {
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let text = |key: &str, default: &str| lookup(key).unwrap_or_else(|| default.to_string());
        let number = |key: &str| lookup(key).and_then(|v| v.trim().parse::<u64>().ok());

        Self {
            rpc_url: text("DNH_RPC_URL", "http://nutrition.dartmouth.edu:8088/cwp"),
            store_url: text("DNH_STORE_URL", "https://parseapi.back4app.com"),
            store_app_id: text("DNH_STORE_APP_ID", ""),
            store_api_key: text("DNH_STORE_API_KEY", ""),
            workdir: PathBuf::from(text("DNH_WORKDIR", ".")),
            harvest_concurrency: number("DNH_HARVEST_CONCURRENCY").map_or(25, |n| n as usize),
            notify_concurrency: number("DNH_NOTIFY_CONCURRENCY").map_or(20, |n| n as usize),
            page_size: number("DNH_PAGE_SIZE").map_or(STORE_MAX_PAGE_SIZE, |n| (n as usize).min(STORE_MAX_PAGE_SIZE)),
            lookahead_days: number("DNH_LOOKAHEAD_DAYS").map_or(1, |n| n as u32),
            attribution_user: lookup("DNH_ATTRIBUTION_USER").filter(|v| !v.trim().is_empty()),
            user_agent: text("DNH_USER_AGENT", "dnh-bot/0.1"),
            http_timeout_secs: number("DNH_HTTP_TIMEOUT_SECS").unwrap_or(20),
            scheduler_enabled: lookup("DNH_SCHEDULER_ENABLED")
                .map(|v| matches!(v.as_str(), "1" | "true" | "TRUE" | "True"))
                .unwrap_or(false),
            sync_cron: text("DNH_SYNC_CRON", "0 0 5 * * *"),
        }
    }

    /// Startup checks; any failure here is fatal before work begins.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if !self.workdir.is_dir() {
            return Err(ConfigError::MissingWorkdir(self.workdir.clone()));
        }
        check_lookahead(self.lookahead_days)?;
        for (name, value) in [
            ("harvest concurrency", self.harvest_concurrency),
            ("notify concurrency", self.notify_concurrency),
            ("page size", self.page_size),
        ] {
            if value == 0 {
                return Err(ConfigError::ZeroLimit { name });
            }
        }
        Ok(())
    }

    pub fn http_client_config(&self) -> HttpClientConfig {
        HttpClientConfig {
            timeout: Duration::from_secs(self.http_timeout_secs),
            user_agent: Some(self.user_agent.clone()),
            max_in_flight: self.harvest_concurrency.max(self.notify_concurrency),
            ..HttpClientConfig::default()
        }
    }

    /// Ceiling for one batch item, covering the transport's retries.
    pub fn item_timeout(&self) -> Duration {
        let attempts = HttpClientConfig::default().backoff.max_retries as u64 + 2;
        Duration::from_secs(self.http_timeout_secs.max(1) * attempts)
    }

    pub fn store_config(&self) -> ParseStoreConfig {
        ParseStoreConfig {
            base_url: self.store_url.clone(),
            application_id: self.store_app_id.clone(),
            api_key: self.store_api_key.clone(),
        }
    }

    pub fn artifacts_dir(&self) -> PathBuf {
        self.workdir.join("artifacts")
    }

    pub fn reports_dir(&self) -> PathBuf {
        self.workdir.join("reports")
    }
}

fn check_lookahead(days: u32) -> Result<(), ConfigError> {
    if (1..=MAX_LOOKAHEAD_DAYS).contains(&days) {
        Ok(())
    } else {
        Err(ConfigError::LookaheadOutOfRange(days))
    }
}

pub fn parse_harvest_date(value: &str) -> Result<NaiveDate, ConfigError> {
    NaiveDate::parse_from_str(value.trim(), "%Y-%m-%d").map_err(|source| ConfigError::InvalidDate {
        value: value.to_string(),
        source,
    })
}

/// Per-invocation options layered on top of `SyncConfig`.
#[derive(Debug, Clone, Default)]
pub struct RunOptions {
    /// First harvest date; today (local time) when unset.
    pub start_date: Option<NaiveDate>,
    /// Overrides `SyncConfig::lookahead_days`.
    pub days: Option<u32>,
    /// Venue keys to harvest; empty means every eligible venue.
    pub venues: Vec<String>,
    /// Snapshot artifacts to re-run instead of a live harvest.
    pub mock_snapshots: Vec<PathBuf>,
    pub dry_run: bool,
}

impl RunOptions {
    pub fn validate(&self) -> Result<(), ConfigError> {
        match self.days {
            Some(days) => check_lookahead(days),
            None => Ok(()),
        }
    }

    pub fn harvest_dates(&self, config: &SyncConfig) -> Vec<NaiveDate> {
        let start = self.start_date.unwrap_or_else(|| Local::now().date_naive());
        let days = self.days.unwrap_or(config.lookahead_days).clamp(1, MAX_LOOKAHEAD_DAYS);
        start.iter_days().take(days as usize).collect()
    }

    pub fn wants_venue(&self, key: &str) -> bool {
        self.venues.is_empty() || self.venues.iter().any(|v| v.eq_ignore_ascii_case(key))
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct VenueRegistry {
    pub venues: Vec<VenueEntry>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct VenueEntry {
    pub key: String,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
}

fn default_enabled() -> bool {
    true
}

impl VenueRegistry {
    pub const FILE_NAME: &'static str = "venues.yaml";

    /// `None` when the working directory has no registry file.
    pub async fn load(workdir: &Path) -> anyhow::Result<Option<Self>> {
        use anyhow::Context;

        let path = workdir.join(Self::FILE_NAME);
        if !tokio::fs::try_exists(&path)
            .await
            .with_context(|| format!("checking {}", path.display()))?
        {
            return Ok(None);
        }
        let text = tokio::fs::read_to_string(&path)
            .await
            .with_context(|| format!("reading {}", path.display()))?;
        let registry = serde_yaml::from_str(&text).with_context(|| format!("parsing {}", path.display()))?;
        Ok(Some(registry))
    }

    /// Listed venues that the registry enables, in service order. A registry
    /// name overrides the service's display name.
    pub fn select(&self, listing: Vec<VenueListing>) -> Vec<VenueListing> {
        listing
            .into_iter()
            .filter_map(|venue| {
                let entry = self.venues.iter().find(|e| e.key == venue.key && e.enabled)?;
                Some(VenueListing {
                    name: entry.name.clone().unwrap_or(venue.name),
                    key: venue.key,
                })
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn defaults_apply_when_nothing_is_set() {
        let config = SyncConfig::from_lookup(|_| None);
        assert_eq!(config.rpc_url, "http://nutrition.dartmouth.edu:8088/cwp");
        assert_eq!(config.harvest_concurrency, 25);
        assert_eq!(config.notify_concurrency, 20);
        assert_eq!(config.page_size, 1000);
        assert_eq!(config.lookahead_days, 1);
        assert_eq!(config.attribution_user, None);
        assert!(!config.scheduler_enabled);
    }

    #[test]
    fn overrides_are_parsed_and_page_size_is_capped() {
        let vars: HashMap<&str, &str> = HashMap::from([
            ("DNH_HARVEST_CONCURRENCY", "40"),
            ("DNH_PAGE_SIZE", "5000"),
            ("DNH_LOOKAHEAD_DAYS", "3"),
            ("DNH_ATTRIBUTION_USER", "abc123"),
            ("DNH_SCHEDULER_ENABLED", "true"),
            ("DNH_HTTP_TIMEOUT_SECS", "not-a-number"),
        ]);
        let config = SyncConfig::from_lookup(|key| vars.get(key).map(|v| v.to_string()));
        assert_eq!(config.harvest_concurrency, 40);
        assert_eq!(config.page_size, 1000);
        assert_eq!(config.lookahead_days, 3);
        assert_eq!(config.attribution_user.as_deref(), Some("abc123"));
        assert!(config.scheduler_enabled);
        assert_eq!(config.http_timeout_secs, 20);
    }

    #[test]
    fn validation_rejects_bad_startup_state() {
        let dir = tempfile::tempdir().expect("tempdir");
        let mut config = SyncConfig::from_lookup(|_| None);
        config.workdir = dir.path().join("missing");
        assert!(matches!(config.validate(), Err(ConfigError::MissingWorkdir(_))));

        config.workdir = dir.path().to_path_buf();
        config.lookahead_days = 8;
        assert!(matches!(config.validate(), Err(ConfigError::LookaheadOutOfRange(8))));

        config.lookahead_days = 2;
        config.notify_concurrency = 0;
        assert!(matches!(config.validate(), Err(ConfigError::ZeroLimit { .. })));

        config.notify_concurrency = 20;
        assert!(config.validate().is_ok());
    }

    #[test]
    fn harvest_dates_follow_the_lookahead() {
        let config = SyncConfig::from_lookup(|_| None);
        let options = RunOptions {
            start_date: Some(parse_harvest_date("2015-09-30").expect("date")),
            days: Some(3),
            ..RunOptions::default()
        };
        let dates: Vec<String> = options.harvest_dates(&config).iter().map(|d| d.to_string()).collect();
        assert_eq!(dates, vec!["2015-09-30", "2015-10-01", "2015-10-02"]);

        assert!(matches!(parse_harvest_date("09/26/2015"), Err(ConfigError::InvalidDate { .. })));
        assert!(matches!(
            RunOptions { days: Some(0), ..RunOptions::default() }.validate(),
            Err(ConfigError::LookaheadOutOfRange(0))
        ));
    }

    #[test]
    fn venue_filter_is_case_insensitive() {
        let options = RunOptions {
            venues: vec!["cyc".into()],
            ..RunOptions::default()
        };
        assert!(options.wants_venue("CYC"));
        assert!(!options.wants_venue("DDS"));
        assert!(RunOptions::default().wants_venue("DDS"));
    }

    #[tokio::test]
    async fn registry_selects_enabled_listed_venues() {
        let dir = tempfile::tempdir().expect("tempdir");
        assert!(VenueRegistry::load(dir.path()).await.expect("load").is_none());

        std::fs::write(
            dir.path().join(VenueRegistry::FILE_NAME),
            "venues:\n  - key: CYC\n    name: The Courtyard\n  - key: DDS\n    enabled: false\n",
        )
        .expect("write");
        let registry = VenueRegistry::load(dir.path()).await.expect("load").expect("present");

        let listing = vec![
            VenueListing { key: "DDS".into(), name: "53 Commons".into() },
            VenueListing { key: "CYC".into(), name: "Courtyard Cafe".into() },
            VenueListing { key: "NOVACK".into(), name: "Novack Cafe".into() },
        ];
        assert_eq!(
            registry.select(listing),
            vec![VenueListing { key: "CYC".into(), name: "The Courtyard".into() }]
        );
    }
}
