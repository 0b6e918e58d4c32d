//! Health derived from endpoint, dispatcher and reactor state.
//!
//! Nothing here polls: each subject builds a [`HealthCheck`] from what it already tracks.
//!
//! | Subject    | Healthy                       | Degraded                              | Unhealthy             |
//! |------------|-------------------------------|---------------------------------------|-----------------------|
//! | endpoint   | `Active`, no violations       | starting up, stopping, or violations  | `Failed`, `Destroyed` |
//! | dispatcher | load below the degraded mark  | load at or above the degraded mark    | destroyed             |
//! | reactor    | always                        |                                       |                       |
//!
//! [`HealthReport`] folds checks into the worst status among them.

use std::collections::BTreeMap;
use std::fmt;
use switchyard_core::lifecycle::{ComponentLifecycle, FsmState, StateGraph};

/// In-flight load, as a percentage of the dispatcher's limit, at which it reports degraded
pub const DEGRADED_LOAD_PERCENT: usize = 80;

/// How well a subject is doing; later variants are worse.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum HealthStatus {
    /// Serving normally
    Healthy,
    /// Serving, but starting, stopping, loaded or misbehaving peers
    Degraded,
    /// Not serving
    Unhealthy,
}

impl HealthStatus {
    /// Status of an endpoint in `state` that has recorded `violations`
    #[must_use]
    pub fn of_endpoint(state: FsmState, violations: usize) -> Self {
        if ComponentLifecycle::is_terminal(state) {
            Self::Unhealthy
        } else if state == FsmState::Active && violations == 0 {
            Self::Healthy
        } else {
            Self::Degraded
        }
    }

    /// Status of a dispatcher with `pending` operations in flight out of `limit`
    #[must_use]
    pub const fn of_load(pending: usize, limit: usize) -> Self {
        if pending.saturating_mul(100) >= limit.saturating_mul(DEGRADED_LOAD_PERCENT) {
            Self::Degraded
        } else {
            Self::Healthy
        }
    }

    /// Stable lowercase name
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Healthy => "healthy",
            Self::Degraded => "degraded",
            Self::Unhealthy => "unhealthy",
        }
    }

    /// Whether the subject serves normally
    #[must_use]
    pub const fn is_healthy(self) -> bool {
        matches!(self, Self::Healthy)
    }

    /// Whether the subject serves with reservations
    #[must_use]
    pub const fn is_degraded(self) -> bool {
        matches!(self, Self::Degraded)
    }

    /// Whether the subject no longer serves
    #[must_use]
    pub const fn is_unhealthy(self) -> bool {
        matches!(self, Self::Unhealthy)
    }
}

impl fmt::Display for HealthStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Health of one endpoint, dispatcher or reactor.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HealthCheck {
    /// What was checked, e.g. `component:s1` or `driver:kv`
    pub subject: String,
    /// Derived status
    pub status: HealthStatus,
    /// Why the subject is not healthy
    pub reason: Option<String>,
    /// Counters behind the status (pending calls, clients, isolates)
    pub figures: BTreeMap<&'static str, usize>,
}

impl HealthCheck {
    /// A check for `subject` with `status` and no figures
    #[must_use]
    pub fn new(subject: impl Into<String>, status: HealthStatus) -> Self {
        Self {
            subject: subject.into(),
            status,
            reason: None,
            figures: BTreeMap::new(),
        }
    }

    /// Explain the status
    #[must_use]
    pub fn because(mut self, reason: impl Into<String>) -> Self {
        self.reason = Some(reason.into());
        self
    }

    /// Attach a counter
    #[must_use]
    pub fn with_figure(mut self, name: &'static str, value: usize) -> Self {
        self.figures.insert(name, value);
        self
    }

    /// Look up a counter
    #[must_use]
    pub fn figure(&self, name: &str) -> Option<usize> {
        self.figures.get(name).copied()
    }
}

/// Several checks and the worst status among them.
#[derive(Debug, Clone)]
pub struct HealthReport {
    /// Worst status of any check; healthy when there are none
    pub status: HealthStatus,
    /// The checks, in the order given
    pub checks: Vec<HealthCheck>,
    /// When the report was assembled
    pub generated_at: chrono::DateTime<chrono::Utc>,
}

impl HealthReport {
    /// Fold `checks` into a report
    #[must_use]
    pub fn new(checks: Vec<HealthCheck>) -> Self {
        let status = checks
            .iter()
            .map(|check| check.status)
            .max()
            .unwrap_or(HealthStatus::Healthy);
        Self {
            status,
            checks,
            generated_at: chrono::Utc::now(),
        }
    }

    /// The check for `subject`, if any
    #[must_use]
    pub fn check(&self, subject: &str) -> Option<&HealthCheck> {
        self.checks.iter().find(|check| check.subject == subject)
    }

    /// Whether every check is healthy
    #[must_use]
    pub const fn is_healthy(&self) -> bool {
        self.status.is_healthy()
    }

    /// Whether some check is unhealthy
    #[must_use]
    pub const fn is_unhealthy(&self) -> bool {
        self.status.is_unhealthy()
    }
}

impl FromIterator<HealthCheck> for HealthReport {
    fn from_iter<I: IntoIterator<Item = HealthCheck>>(checks: I) -> Self {
        Self::new(checks.into_iter().collect())
    }
}
