use std::env;
use std::path::PathBuf;

use config::builder::DefaultState;
use config::{Config, ConfigBuilder, ConfigError, Environment, File};
use serde::Deserialize;

use crate::engine::{EngineSettings, PricingSettings};

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    pub data_dir: PathBuf,
    /// Commits since the last compaction that trigger the next one.
    pub compact_threshold: u64,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct BookingConfig {
    pub hold_minutes: u32,
    pub reminder_lead_minutes: u32,
    pub max_advance_days: u32,
    pub min_notice_minutes: u32,
    pub slot_minutes: u32,
    pub reaper_interval_secs: u64,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct PricingConfig {
    pub tax_rate_bps: u32,
    pub booking_fee_cents: i64,
    pub currency: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    Pretty,
    Json,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LogConfig {
    pub level: String,
    pub format: LogFormat,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct MetricsConfig {
    pub port: Option<u16>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub server: ServerConfig,
    pub storage: StorageConfig,
    pub booking: BookingConfig,
    pub pricing: PricingConfig,
    pub log: LogConfig,
    pub metrics: MetricsConfig,
}

impl AppConfig {
    /// Defaults, then `config/slotd.toml` (or `$SLOTD_CONFIG`), then `SLOTD_*` variables.
    pub fn load() -> Result<Self, ConfigError> {
        let file = env::var("SLOTD_CONFIG").unwrap_or_else(|_| "config/slotd".into());
        Self::from_builder(
            Config::builder()
                .add_source(File::with_name(&file).required(false))
                .add_source(
                    Environment::with_prefix("SLOTD")
                        .prefix_separator("_")
                        .separator("__")
                        .try_parsing(true),
                ),
        )
    }

    pub fn from_builder(builder: ConfigBuilder<DefaultState>) -> Result<Self, ConfigError> {
        let cfg: Self = builder.build()?.try_deserialize()?;
        cfg.validate()?;
        Ok(cfg)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.booking.hold_minutes == 0 {
            return Err(ConfigError::Message("booking.hold_minutes must be positive".into()));
        }
        if self.booking.slot_minutes == 0 {
            return Err(ConfigError::Message("booking.slot_minutes must be positive".into()));
        }
        if self.booking.reaper_interval_secs == 0 {
            return Err(ConfigError::Message(
                "booking.reaper_interval_secs must be positive".into(),
            ));
        }
        if self.pricing.booking_fee_cents < 0 {
            return Err(ConfigError::Message("pricing.booking_fee_cents must not be negative".into()));
        }
        Ok(())
    }

    pub fn wal_path(&self) -> PathBuf {
        self.storage.data_dir.join("slotd.wal")
    }

    pub fn engine_settings(&self) -> EngineSettings {
        EngineSettings {
            hold_minutes: self.booking.hold_minutes,
            reminder_lead_minutes: self.booking.reminder_lead_minutes,
            max_advance_days: self.booking.max_advance_days,
            min_notice_minutes: self.booking.min_notice_minutes,
            slot_minutes: self.booking.slot_minutes,
            pricing: PricingSettings {
                tax_rate_bps: self.pricing.tax_rate_bps,
                booking_fee_cents: self.pricing.booking_fee_cents,
                currency: self.pricing.currency.clone(),
            },
        }
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 8080,
        }
    }
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("./data"),
            compact_threshold: 10_000,
        }
    }
}

impl Default for BookingConfig {
    fn default() -> Self {
        Self {
            hold_minutes: 15,
            reminder_lead_minutes: 60,
            max_advance_days: 180,
            min_notice_minutes: 0,
            slot_minutes: 15,
            reaper_interval_secs: 5,
        }
    }
}

impl Default for PricingConfig {
    fn default() -> Self {
        Self {
            tax_rate_bps: 0,
            booking_fee_cents: 0,
            currency: "USD".to_string(),
        }
    }
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: LogFormat::Pretty,
        }
    }
}
