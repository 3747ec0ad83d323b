//! Sliding-window admission control across the {global, bot, user, channel}
//! dimensions. Decisions are pure functions of state plus the request; the
//! limiter never errors.

use std::collections::{HashMap, VecDeque};

use chrono::{DateTime, Duration, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

const MINUTE_WINDOW_SECS: i64 = 60;
const HOUR_WINDOW_SECS: i64 = 3600;
/// Idle window state is garbage-collected after this long.
const IDLE_GC_SECS: i64 = 2 * 3600;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum Dimension {
    Global,
    Bot,
    User,
    Channel,
}

impl Dimension {
    pub fn as_str(self) -> &'static str {
        match self {
            Dimension::Global => "global",
            Dimension::Bot => "bot",
            Dimension::User => "user",
            Dimension::Channel => "channel",
        }
    }
}

/// Per-dimension limits; a zero disables that particular cap.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct DimensionLimits {
    #[serde(default)]
    pub requests_per_minute: u32,
    #[serde(default)]
    pub requests_per_hour: u32,
    #[serde(default)]
    pub concurrent_requests: u32,
}

impl DimensionLimits {
    fn is_configured(&self) -> bool {
        self.requests_per_minute > 0 || self.requests_per_hour > 0 || self.concurrent_requests > 0
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct RateLimitConfig {
    #[serde(default)]
    pub global: Option<DimensionLimits>,
    #[serde(default)]
    pub bot: Option<DimensionLimits>,
    #[serde(default)]
    pub user: Option<DimensionLimits>,
    #[serde(default)]
    pub channel: Option<DimensionLimits>,
    /// When set, admissions close to a window limit return
    /// [`AdmissionDecision::ShouldQueue`] instead of admitting.
    #[serde(default)]
    pub queue_when_near_limit: bool,
    /// Fraction of a window considered "near"; defaults to 0.8.
    #[serde(default = "default_queue_threshold")]
    pub queue_threshold: f64,
}

fn default_queue_threshold() -> f64 {
    0.8
}

/// Identity of an inbound request along the limiter's dimensions. Missing
/// ids simply skip that dimension.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RateRequest {
    pub bot: Option<String>,
    pub user: Option<String>,
    pub channel: Option<String>,
}

#[derive(Debug, Clone, Serialize, PartialEq)]
#[serde(tag = "decision", rename_all = "snake_case")]
pub enum AdmissionDecision {
    Allowed {
        /// Most restrictive remaining/limit pair across all dimensions.
        remaining: u32,
        limit: u32,
    },
    Blocked {
        dimension: Dimension,
        retry_after_secs: i64,
        reset_at: DateTime<Utc>,
        limit: u32,
    },
    ShouldQueue {
        dimension: Dimension,
        remaining: u32,
        limit: u32,
    },
}

impl AdmissionDecision {
    pub fn is_allowed(&self) -> bool {
        matches!(self, AdmissionDecision::Allowed { .. })
    }
}

#[derive(Default)]
struct WindowState {
    minute: VecDeque<DateTime<Utc>>,
    hour: VecDeque<DateTime<Utc>>,
    concurrent: u32,
    last_seen: Option<DateTime<Utc>>,
}

impl WindowState {
    fn evict(&mut self, now: DateTime<Utc>) {
        let minute_cutoff = now - Duration::seconds(MINUTE_WINDOW_SECS);
        while self.minute.front().is_some_and(|ts| *ts <= minute_cutoff) {
            self.minute.pop_front();
        }
        let hour_cutoff = now - Duration::seconds(HOUR_WINDOW_SECS);
        while self.hour.front().is_some_and(|ts| *ts <= hour_cutoff) {
            self.hour.pop_front();
        }
    }

    fn is_idle(&self, now: DateTime<Utc>) -> bool {
        self.concurrent == 0
            && self
                .last_seen
                .map(|seen| now - seen > Duration::seconds(IDLE_GC_SECS))
                .unwrap_or(true)
    }
}

struct LimiterState {
    windows: HashMap<String, WindowState>,
    last_gc: DateTime<Utc>,
}

pub struct RateLimiter {
    config: RateLimitConfig,
    state: Mutex<LimiterState>,
}

impl RateLimiter {
    pub fn new(config: RateLimitConfig) -> Self {
        Self {
            config,
            state: Mutex::new(LimiterState {
                windows: HashMap::new(),
                last_gc: Utc::now(),
            }),
        }
    }

    pub fn check(&self, request: &RateRequest) -> AdmissionDecision {
        self.check_at(request, Utc::now())
    }

    /// Admission check at an explicit instant. Dimensions are examined in
    /// {global, bot, user, channel} order; within a dimension the concurrent
    /// cap is enforced first, then the minute window, then the hour window.
    pub fn check_at(&self, request: &RateRequest, now: DateTime<Utc>) -> AdmissionDecision {
        let dims = self.dimensions_for(request);
        let mut state = self.state.lock();
        Self::maybe_gc(&mut state, now);

        let mut most_restrictive: Option<(u32, u32)> = None;
        let mut queue_hint: Option<(Dimension, u32, u32)> = None;

        for (dimension, key, limits) in &dims {
            let window = state.windows.entry(key.clone()).or_default();
            window.evict(now);

            if limits.concurrent_requests > 0 && window.concurrent >= limits.concurrent_requests {
                return AdmissionDecision::Blocked {
                    dimension: *dimension,
                    retry_after_secs: 1,
                    reset_at: now + Duration::seconds(1),
                    limit: limits.concurrent_requests,
                };
            }

            for (len, limit, window_secs) in [
                (window.minute.len(), limits.requests_per_minute, MINUTE_WINDOW_SECS),
                (window.hour.len(), limits.requests_per_hour, HOUR_WINDOW_SECS),
            ] {
                if limit == 0 {
                    continue;
                }
                if len as u32 >= limit {
                    let oldest = match window_secs {
                        MINUTE_WINDOW_SECS => window.minute.front().copied(),
                        _ => window.hour.front().copied(),
                    }
                    .unwrap_or(now);
                    let reset_at = oldest + Duration::seconds(window_secs);
                    let retry_after_secs = (reset_at - now).num_seconds().max(1);
                    return AdmissionDecision::Blocked {
                        dimension: *dimension,
                        retry_after_secs,
                        reset_at,
                        limit,
                    };
                }
                let remaining = limit - len as u32 - 1;
                if most_restrictive.map_or(true, |(r, _)| remaining < r) {
                    most_restrictive = Some((remaining, limit));
                }
                if self.config.queue_when_near_limit
                    && queue_hint.is_none()
                    && (remaining as f64) / (limit as f64) < 1.0 - self.config.queue_threshold
                {
                    queue_hint = Some((*dimension, remaining, limit));
                }
            }
        }

        if let Some((dimension, remaining, limit)) = queue_hint {
            return AdmissionDecision::ShouldQueue {
                dimension,
                remaining,
                limit,
            };
        }

        // Admit: record the request in every configured dimension.
        for (_, key, limits) in &dims {
            let window = state.windows.entry(key.clone()).or_default();
            if limits.requests_per_minute > 0 {
                window.minute.push_back(now);
            }
            if limits.requests_per_hour > 0 {
                window.hour.push_back(now);
            }
            if limits.concurrent_requests > 0 {
                window.concurrent += 1;
            }
            window.last_seen = Some(now);
        }

        let (remaining, limit) = most_restrictive.unwrap_or((u32::MAX, u32::MAX));
        AdmissionDecision::Allowed { remaining, limit }
    }

    /// Release a previously-admitted request, decrementing concurrent
    /// counters. Must be paired with an admitted `check`.
    pub fn release(&self, request: &RateRequest) {
        let dims = self.dimensions_for(request);
        let mut state = self.state.lock();
        for (_, key, limits) in &dims {
            if limits.concurrent_requests == 0 {
                continue;
            }
            if let Some(window) = state.windows.get_mut(key) {
                window.concurrent = window.concurrent.saturating_sub(1);
            }
        }
    }

    /// Outstanding concurrent count for a dimension key; test and
    /// diagnostics surface.
    pub fn concurrent(&self, dimension: Dimension, id: Option<&str>) -> u32 {
        let key = match (dimension, id) {
            (Dimension::Global, _) => "global".to_string(),
            (dim, Some(id)) => format!("{}:{}", dim.as_str(), id),
            (_, None) => return 0,
        };
        self.state
            .lock()
            .windows
            .get(&key)
            .map(|w| w.concurrent)
            .unwrap_or(0)
    }

    fn dimensions_for(&self, request: &RateRequest) -> Vec<(Dimension, String, DimensionLimits)> {
        let mut dims = Vec::with_capacity(4);
        if let Some(limits) = self.config.global.filter(DimensionLimits::is_configured) {
            dims.push((Dimension::Global, "global".to_string(), limits));
        }
        let scoped = [
            (Dimension::Bot, &self.config.bot, &request.bot),
            (Dimension::User, &self.config.user, &request.user),
            (Dimension::Channel, &self.config.channel, &request.channel),
        ];
        for (dimension, limits, id) in scoped {
            let (Some(limits), Some(id)) = (limits.filter(DimensionLimits::is_configured), id)
            else {
                continue;
            };
            dims.push((dimension, format!("{}:{}", dimension.as_str(), id), limits));
        }
        dims
    }

    fn maybe_gc(state: &mut LimiterState, now: DateTime<Utc>) {
        if now - state.last_gc < Duration::minutes(10) {
            return;
        }
        state.last_gc = now;
        state.windows.retain(|_, window| !window.is_idle(now));
    }
}
