//! Adapter-side health tracking.
//!
//! Adapters record the outcome of every transport call here. An adapter turns
//! unhealthy once its transport failed `unhealthy_after` calls in a row and
//! recovers on the next acknowledged call.

use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};

/// Consecutive transport failures before an adapter reports unhealthy.
pub const DEFAULT_UNHEALTHY_AFTER: u32 = 3;

/// Health of a transport as seen by its adapter.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HealthStatus {
    /// No call observed yet.
    Unknown,
    /// Last call succeeded.
    Healthy,
    /// Failing, but below the unhealthy threshold.
    Degraded,
    Unhealthy,
}

impl HealthStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            HealthStatus::Unknown => "UNKNOWN",
            HealthStatus::Healthy => "HEALTHY",
            HealthStatus::Degraded => "DEGRADED",
            HealthStatus::Unhealthy => "UNHEALTHY",
        }
    }
}

/// Lock-free failure streak shared by all callers of one adapter.
pub struct TransportHealth {
    unhealthy_after: u32,
    observed: AtomicBool,
    consecutive_failures: AtomicU32,
}

impl TransportHealth {
    /// `unhealthy_after` is clamped to at least one failure.
    pub fn new(unhealthy_after: u32) -> Self {
        Self {
            unhealthy_after: unhealthy_after.max(1),
            observed: AtomicBool::new(false),
            consecutive_failures: AtomicU32::new(0),
        }
    }

    pub fn record_success(&self) {
        self.observed.store(true, Ordering::Relaxed);
        self.consecutive_failures.store(0, Ordering::Relaxed);
    }

    pub fn record_failure(&self) {
        self.observed.store(true, Ordering::Relaxed);
        self.consecutive_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub fn status(&self) -> HealthStatus {
        if !self.observed.load(Ordering::Relaxed) {
            return HealthStatus::Unknown;
        }
        match self.consecutive_failures() {
            0 => HealthStatus::Healthy,
            n if n < self.unhealthy_after => HealthStatus::Degraded,
            _ => HealthStatus::Unhealthy,
        }
    }

    /// Unknown and degraded transports still accept traffic.
    pub fn is_healthy(&self) -> bool {
        self.status() != HealthStatus::Unhealthy
    }

    pub fn consecutive_failures(&self) -> u32 {
        self.consecutive_failures.load(Ordering::Relaxed)
    }

    pub fn unhealthy_after(&self) -> u32 {
        self.unhealthy_after
    }
}

impl Default for TransportHealth {
    fn default() -> Self {
        Self::new(DEFAULT_UNHEALTHY_AFTER)
    }
}

impl std::fmt::Debug for TransportHealth {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TransportHealth")
            .field("status", &self.status())
            .field("consecutive_failures", &self.consecutive_failures())
            .field("unhealthy_after", &self.unhealthy_after)
            .finish()
    }
}
