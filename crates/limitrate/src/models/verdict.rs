//! Admission verdicts and the per-window observations behind them.

use crate::models::policy::WindowKind;
use serde::Serialize;

/// Why a request was blocked.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum BlockReason {
    RateExceeded,
    CostExceeded,
    /// Counter store was unreachable and the limiter is configured
    /// fail-closed.
    StoreUnavailable,
}

impl BlockReason {
    pub fn as_str(self) -> &'static str {
        match self {
            BlockReason::RateExceeded => "rate_exceeded",
            BlockReason::CostExceeded => "cost_exceeded",
            BlockReason::StoreUnavailable => "store_unavailable",
        }
    }
}

/// Terminal admission decision for one request.
#[derive(Debug, Clone, PartialEq)]
pub enum Verdict {
    /// Admit normally.
    Allow,
    /// Admit normally; an over-budget event was emitted.
    AllowLogged,
    /// Admit after the given delay in milliseconds.
    Delayed(u64),
    /// Deny. `retry_after` is the seconds until the tightest exceeded
    /// window resets.
    Blocked {
        reason: BlockReason,
        retry_after: u64,
    },
}

impl Verdict {
    pub fn is_admitted(&self) -> bool {
        !matches!(self, Verdict::Blocked { .. })
    }
}

/// Which budget axis a window observation belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CounterAxis {
    Rate,
    Cost,
}

/// One window's counter state as seen during admission.
///
/// Rate observations carry whole counts in `current`/`limit`; cost
/// observations carry accumulated monetary units.
#[derive(Debug, Clone, PartialEq)]
pub struct WindowObservation {
    pub axis: CounterAxis,
    pub window: WindowKind,
    pub current: f64,
    pub limit: f64,
    pub remaining: f64,
    pub reset_in: u64,
    pub exceeded: bool,
}

/// Advisory header values for admitted requests, taken from the rate
/// window with the least headroom.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RateHeaders {
    pub limit: u64,
    pub remaining: u64,
    pub reset_in: u64,
}

/// The limiter engine's full answer for one request: the verdict plus
/// every window observation gathered on the way.
#[derive(Debug, Clone)]
pub struct Admission {
    pub verdict: Verdict,
    pub observations: Vec<WindowObservation>,
    /// Present when a rate policy applied and at least one window was
    /// observed.
    pub headers: Option<RateHeaders>,
}

impl Admission {
    pub(crate) fn blocked(reason: BlockReason, retry_after: u64, observations: Vec<WindowObservation>) -> Self {
        Self {
            verdict: Verdict::Blocked { reason, retry_after },
            observations,
            headers: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn blocked_is_not_admitted() {
        let verdict = Verdict::Blocked {
            reason: BlockReason::RateExceeded,
            retry_after: 42,
        };
        assert!(!verdict.is_admitted());
        assert!(Verdict::Allow.is_admitted());
        assert!(Verdict::Delayed(500).is_admitted());
    }

    #[test]
    fn block_reason_labels_match_wire_vocabulary() {
        assert_eq!(BlockReason::RateExceeded.as_str(), "rate_exceeded");
        assert_eq!(BlockReason::CostExceeded.as_str(), "cost_exceeded");
    }
}
