use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use tracing::{debug, warn};

use crate::{
    classifier::OperationClass,
    error::{AdmissionError, Result},
    store::Tier,
    utils::WINDOW_SECONDS,
};

/// Admission control settings.
///
/// Field names on the wire match the process environment keys, lowercased,
/// so the same struct reads from YAML and from `RATE_LIMIT_*` variables.
/// Class limits are nullable: an explicit null leaves the class without a
/// threshold and it falls back to the per-client limit.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AdmissionSettings {
    #[serde(rename = "rate_limiting_enabled", default = "defaults::enabled")]
    pub enabled: bool,

    #[serde(rename = "rate_limit_per_ip", default = "defaults::per_client_limit")]
    pub per_client_limit: u32,

    #[serde(
        rename = "rate_limit_story_generation",
        default = "defaults::story_generation_limit"
    )]
    pub story_generation_limit: Option<u32>,

    #[serde(
        rename = "rate_limit_list_endpoints",
        default = "defaults::list_endpoints_limit"
    )]
    pub list_endpoints_limit: Option<u32>,

    #[serde(
        rename = "rate_limit_health_status",
        default = "defaults::health_status_limit"
    )]
    pub health_status_limit: Option<u32>,

    #[serde(
        rename = "rate_limit_global_server",
        default = "defaults::global_server_limit"
    )]
    pub global_server_limit: u32,

    #[serde(
        rename = "rate_limit_return_status_code",
        default = "defaults::return_status_code"
    )]
    pub return_status_code: u16,

    /// Informational; counters always live in process memory.
    #[serde(
        rename = "rate_limit_storage_backend",
        default = "defaults::storage_backend"
    )]
    pub storage_backend: String,

    /// Informational; the window is fixed at 60 seconds.
    #[serde(rename = "rate_limit_time_window", default = "defaults::time_window")]
    pub time_window: u64,
}

mod defaults {
    pub fn enabled() -> bool {
        true
    }
    pub fn per_client_limit() -> u32 {
        60
    }
    pub fn story_generation_limit() -> Option<u32> {
        Some(15)
    }
    pub fn list_endpoints_limit() -> Option<u32> {
        Some(30)
    }
    pub fn health_status_limit() -> Option<u32> {
        Some(100)
    }
    pub fn global_server_limit() -> u32 {
        1000
    }
    pub fn return_status_code() -> u16 {
        429
    }
    pub fn storage_backend() -> String {
        "memory".to_string()
    }
    pub fn time_window() -> u64 {
        60
    }
}

impl Default for AdmissionSettings {
    fn default() -> Self {
        Self {
            enabled: defaults::enabled(),
            per_client_limit: defaults::per_client_limit(),
            story_generation_limit: defaults::story_generation_limit(),
            list_endpoints_limit: defaults::list_endpoints_limit(),
            health_status_limit: defaults::health_status_limit(),
            global_server_limit: defaults::global_server_limit(),
            return_status_code: defaults::return_status_code(),
            storage_backend: defaults::storage_backend(),
            time_window: defaults::time_window(),
        }
    }
}

impl AdmissionSettings {
    /// Check values the middleware cannot work around
    pub fn validate(&self) -> Result<()> {
        if !(400..=599).contains(&self.return_status_code)
            || http::StatusCode::from_u16(self.return_status_code).is_err()
        {
            return Err(AdmissionError::Config(format!(
                "rate_limit_return_status_code must be an HTTP error status (400-599), got {}",
                self.return_status_code
            )));
        }

        if self.time_window != WINDOW_SECONDS as u64 {
            warn!(
                configured = self.time_window,
                effective = WINDOW_SECONDS,
                "rate_limit_time_window is informational; windows are fixed"
            );
        }

        if self.storage_backend != "memory" {
            warn!(
                storage_backend = %self.storage_backend,
                "Only in-process counters are supported; ignoring storage backend"
            );
        }

        Ok(())
    }

    /// Snapshot of the effective configuration for status endpoints and logs
    pub fn stats(&self) -> RateLimitStats {
        RateLimitStats {
            enabled: self.enabled,
            limits: StatsLimits {
                per_ip: self.per_client_limit,
                story_generation: self.story_generation_limit,
                list_endpoints: self.list_endpoints_limit,
                health_status: self.health_status_limit,
                global_server: self.global_server_limit,
            },
            config: StatsConfig {
                storage_backend: self.storage_backend.clone(),
                time_window: self.time_window,
                return_status_code: self.return_status_code,
            },
        }
    }
}

/// Serializable view of the admission configuration
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RateLimitStats {
    pub enabled: bool,
    pub limits: StatsLimits,
    pub config: StatsConfig,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StatsLimits {
    pub per_ip: u32,
    pub story_generation: Option<u32>,
    pub list_endpoints: Option<u32>,
    pub health_status: Option<u32>,
    pub global_server: u32,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StatsConfig {
    pub storage_backend: String,
    pub time_window: u64,
    pub return_status_code: u16,
}

/// Thresholds per (tier, class), fixed for the life of the process
#[derive(Debug, Clone, PartialEq)]
pub struct LimitPolicy {
    global: u64,
    per_client: u64,
    classes: HashMap<OperationClass, u64>,
}

impl LimitPolicy {
    /// Policy with no class thresholds; every class resolves to `per_client`
    pub fn new(global: u64, per_client: u64) -> Self {
        Self {
            global,
            per_client,
            classes: HashMap::new(),
        }
    }

    pub fn with_class_limit(mut self, class: OperationClass, limit: u64) -> Self {
        self.classes.insert(class, limit);
        self
    }

    /// Compile settings into a policy for constant-time lookups
    pub fn compile(settings: &AdmissionSettings) -> Self {
        let mut policy = Self::new(
            settings.global_server_limit as u64,
            settings.per_client_limit as u64,
        )
        .with_class_limit(OperationClass::Default, settings.per_client_limit as u64);

        let class_limits = [
            (OperationClass::StoryGeneration, settings.story_generation_limit),
            (OperationClass::ListOrQuery, settings.list_endpoints_limit),
            (OperationClass::HealthStatus, settings.health_status_limit),
        ];
        for (class, limit) in class_limits {
            if let Some(limit) = limit {
                policy = policy.with_class_limit(class, limit as u64);
            }
        }

        policy
    }

    pub fn global_limit(&self) -> u64 {
        self.global
    }

    pub fn per_client_limit(&self) -> u64 {
        self.per_client
    }

    /// Threshold for an operation class, falling back to the per-client limit
    pub fn class_limit(&self, class: OperationClass) -> u64 {
        match self.classes.get(&class) {
            Some(limit) => *limit,
            None => {
                debug!(
                    class = %class,
                    fallback = self.per_client,
                    "No threshold configured for operation class, using per-client limit"
                );
                self.per_client
            }
        }
    }

    /// Threshold for a tier; `class` only matters for the class tier
    pub fn limit_for(&self, tier: Tier, class: OperationClass) -> u64 {
        match tier {
            Tier::Global => self.global,
            Tier::Client => self.per_client,
            Tier::Class => self.class_limit(class),
        }
    }
}

impl Default for LimitPolicy {
    fn default() -> Self {
        Self::compile(&AdmissionSettings::default())
    }
}

/// Load settings from YAML string
pub fn load_settings_from_yaml(yaml: &str) -> Result<AdmissionSettings> {
    let settings: AdmissionSettings = serde_yaml::from_str(yaml)?;
    settings.validate()?;
    Ok(settings)
}

/// Load settings from YAML file
pub fn load_settings_from_file(path: &str) -> Result<AdmissionSettings> {
    let content = std::fs::read_to_string(path)?;
    load_settings_from_yaml(&content)
}

/// Load settings from built-in defaults, an optional YAML file and the
/// process environment, in increasing priority.
pub fn load_settings(path: Option<&str>) -> Result<AdmissionSettings> {
    let mut builder = config::Config::builder();

    if let Some(path) = path {
        builder = builder.add_source(config::File::new(path, config::FileFormat::Yaml));
    }

    builder = builder.add_source(config::Environment::default().try_parsing(true));

    let settings: AdmissionSettings = builder.build()?.try_deserialize()?;
    settings.validate()?;
    Ok(settings)
}
