use http::StatusCode;
use std::{fmt, sync::Arc};
use tracing::{debug, info, warn};

use crate::{
    classifier::{classify, OperationClass},
    config::{AdmissionSettings, LimitPolicy},
    error::{AdmissionError, Result},
    metrics::Metrics,
    store::{CounterStore, Tier},
    utils::{retry_after, SystemTimeSource, TimeSource},
};

/// Identifier of the single global counter
pub const GLOBAL_IDENTIFIER: &str = "server";

/// Client identifier used when no address can be resolved
pub const UNKNOWN_CLIENT: &str = "unknown";

/// Per-request view of what the admission layer needs
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClassifiedRequest {
    pub path: String,
    pub method: String,
    pub client_identifier: String,
    pub operation_class: OperationClass,
}

impl ClassifiedRequest {
    pub fn new(path: &str, method: &str, client_identifier: &str) -> Self {
        Self {
            path: path.to_string(),
            method: method.to_string(),
            client_identifier: client_identifier.to_string(),
            operation_class: classify(path),
        }
    }

    /// Counter identifier for `tier`
    pub fn identifier_for(&self, tier: Tier) -> String {
        match tier {
            Tier::Global => GLOBAL_IDENTIFIER.to_string(),
            Tier::Client => self.client_identifier.clone(),
            Tier::Class => format!("{}:{}", self.client_identifier, self.operation_class),
        }
    }
}

/// Which limit a rejected request ran into
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LimitType {
    GlobalServer,
    PerClient,
    Endpoint(OperationClass),
}

impl LimitType {
    pub fn for_tier(tier: Tier, class: OperationClass) -> Self {
        match tier {
            Tier::Global => LimitType::GlobalServer,
            Tier::Client => LimitType::PerClient,
            Tier::Class => LimitType::Endpoint(class),
        }
    }
}

impl fmt::Display for LimitType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LimitType::GlobalServer => f.write_str("global_server"),
            LimitType::PerClient => f.write_str("per_ip"),
            LimitType::Endpoint(class) => write!(f, "endpoint_{}", class),
        }
    }
}

/// Post-increment state of one tier that admitted the request
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TierStatus {
    pub tier: Tier,
    pub limit: u64,
    pub count: u64,
    pub remaining: u64,
}

/// Outcome of evaluating one request.
///
/// For admitted requests `limit`, `current_count` and `remaining` describe the
/// most restrictive tier. For rejected ones they describe the violated tier,
/// with `current_count` being the position the request would have taken.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AdmissionDecision {
    pub allowed: bool,
    pub violated: Option<LimitType>,
    pub limit: u64,
    pub current_count: u64,
    pub remaining: u64,
    /// Tiers that admitted the request, in evaluation order
    pub tiers: Vec<TierStatus>,
}

impl AdmissionDecision {
    fn admitted(tiers: Vec<TierStatus>) -> Self {
        // min_by_key keeps the first minimum, so ties go to the earlier tier.
        let (limit, current_count, remaining) = tiers
            .iter()
            .min_by_key(|status| status.remaining)
            .map(|status| (status.limit, status.count, status.remaining))
            .unwrap_or((0, 0, 0));

        Self {
            allowed: true,
            violated: None,
            limit,
            current_count,
            remaining,
            tiers,
        }
    }

    fn rejected(
        limit_type: LimitType,
        limit: u64,
        current_count: u64,
        tiers: Vec<TierStatus>,
    ) -> Self {
        Self {
            allowed: false,
            violated: Some(limit_type),
            limit,
            current_count,
            remaining: 0,
            tiers,
        }
    }

    fn remaining_for(&self, tier: Tier) -> Option<u64> {
        self.tiers
            .iter()
            .find(|status| status.tier == tier)
            .map(|status| status.remaining)
    }
}

/// Three-tier fixed-window admission control.
///
/// Tiers are evaluated Global, Client, Class and evaluation stops at the
/// first violation: a rejected request never touches the counters of the
/// tier it violated or of any later tier.
pub struct AdmissionController {
    store: Arc<dyn CounterStore>,
    policy: LimitPolicy,
    time_source: Arc<dyn TimeSource>,
    enabled: bool,
    rejection_status: StatusCode,
    metrics: Option<Arc<Metrics>>,
}

impl AdmissionController {
    /// Create an enabled controller that rejects with 429
    pub fn new(store: Arc<dyn CounterStore>, policy: LimitPolicy) -> Self {
        Self {
            store,
            policy,
            time_source: Arc::new(SystemTimeSource::new()),
            enabled: true,
            rejection_status: StatusCode::TOO_MANY_REQUESTS,
            metrics: None,
        }
    }

    /// Create a controller from validated settings
    pub fn from_settings(
        settings: &AdmissionSettings,
        store: Arc<dyn CounterStore>,
    ) -> Result<Self> {
        settings.validate()?;

        let controller = Self::new(store, LimitPolicy::compile(settings))
            .enabled(settings.enabled)
            .with_rejection_status(settings.return_status_code)?;

        if settings.enabled {
            info!(
                per_ip_limit = settings.per_client_limit,
                story_generation_limit = ?settings.story_generation_limit,
                list_endpoints_limit = ?settings.list_endpoints_limit,
                health_status_limit = ?settings.health_status_limit,
                global_server_limit = settings.global_server_limit,
                storage_backend = %settings.storage_backend,
                time_window = settings.time_window,
                "Rate limiting middleware initialized"
            );
        } else {
            info!("Rate limiting middleware disabled");
        }

        Ok(controller)
    }

    pub fn enabled(mut self, enabled: bool) -> Self {
        self.enabled = enabled;
        self
    }

    pub fn with_time_source(mut self, time_source: Arc<dyn TimeSource>) -> Self {
        self.time_source = time_source;
        self
    }

    pub fn with_metrics(mut self, metrics: Arc<Metrics>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    pub fn with_rejection_status(mut self, code: u16) -> Result<Self> {
        self.rejection_status = StatusCode::from_u16(code).map_err(|e| {
            AdmissionError::Config(format!("invalid rejection status {}: {}", code, e))
        })?;
        Ok(self)
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    pub fn rejection_status(&self) -> StatusCode {
        self.rejection_status
    }

    pub fn policy(&self) -> &LimitPolicy {
        &self.policy
    }

    pub fn metrics(&self) -> Option<&Arc<Metrics>> {
        self.metrics.as_ref()
    }

    pub fn unix_now(&self) -> i64 {
        self.time_source.unix_now()
    }

    /// Decide whether the request may proceed, consuming capacity on every
    /// tier that admits it.
    pub async fn check(&self, request: &ClassifiedRequest) -> Result<AdmissionDecision> {
        let _timer = self.metrics.as_ref().map(|m| m.start_decision_timer());
        let class = request.operation_class;
        let mut tiers = Vec::with_capacity(Tier::ALL.len());

        for tier in Tier::ALL {
            let limit = self.policy.limit_for(tier, class);
            let identifier = request.identifier_for(tier);
            let outcome = self
                .store
                .increment_if_below(tier, &identifier, limit)
                .await?;

            if !outcome.admitted {
                let limit_type = LimitType::for_tier(tier, class);
                self.log_rejection(request, limit_type, limit, outcome.count);
                if let Some(metrics) = &self.metrics {
                    metrics.record_rejected(&limit_type.to_string());
                }
                return Ok(AdmissionDecision::rejected(limit_type, limit, outcome.count, tiers));
            }

            tiers.push(TierStatus {
                tier,
                limit,
                count: outcome.count,
                remaining: limit.saturating_sub(outcome.count),
            });
        }

        let decision = AdmissionDecision::admitted(tiers);

        debug!(
            client_ip = %request.client_identifier,
            path = %request.path,
            method = %request.method,
            endpoint_type = %class,
            global_remaining = ?decision.remaining_for(Tier::Global),
            ip_remaining = ?decision.remaining_for(Tier::Client),
            endpoint_remaining = ?decision.remaining_for(Tier::Class),
            "Request processed with rate limiting"
        );
        if let Some(metrics) = &self.metrics {
            metrics.record_admitted();
        }

        Ok(decision)
    }

    fn log_rejection(
        &self,
        request: &ClassifiedRequest,
        limit_type: LimitType,
        limit: u64,
        current_count: u64,
    ) {
        if limit_type == LimitType::GlobalServer {
            warn!(
                global_limit = limit,
                current_count,
                "Global server rate limit exceeded"
            );
        }

        warn!(
            client_ip = %request.client_identifier,
            path = %request.path,
            method = %request.method,
            limit_type = %limit_type,
            limit,
            current_count,
            retry_after_seconds = retry_after(self.unix_now()),
            "Rate limit exceeded"
        );
    }
}
