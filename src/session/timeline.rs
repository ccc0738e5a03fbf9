//! Vsync period change timelines
//!
//! A refresh rate change requested through
//! [`set_active_config_with_constraints`](super::CompositionSession::set_active_config_with_constraints)
//! does not happen right away. The client is told when to present the frame that triggers
//! the change (the refresh time) and when the new period is guaranteed to be in effect
//! (the applied time). Both are aligned to vsync boundaries of the current period.

use std::collections::VecDeque;
use std::time::Duration;

use tracing::trace;

use crate::utils::Time;

/// When a requested vsync period change takes effect
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct VsyncPeriodChangeTimeline {
    /// From this time on the new vsync period is in effect
    pub new_vsync_applied_time: Time,
    /// Whether the client has to present a frame at `refresh_time` for the change to happen
    pub refresh_required: bool,
    /// When the client should present the frame triggering the change
    pub refresh_time: Time,
}

/// Constraints of a vsync period change
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct VsyncPeriodChangeConstraints {
    /// Earliest time the new period should be in effect
    pub desired_time: Time,
    /// Fail instead of switching with a visible glitch
    pub seamless_required: bool,
}

/// Estimates `(refresh_time, applied_time)` of a change to be in effect at `desired`
///
/// The display needs `vsyncs` vsyncs of `period` nanoseconds to apply a new rate. A
/// desired time in the past triggers the refresh right away, one closer than the settle
/// window one period earlier than that.
pub(crate) fn estimate(now: Time, period: i64, desired: Time, vsyncs: u32) -> (Time, Time) {
    let activate = period.saturating_mul(i64::from(vsyncs));
    let delta = desired - now;

    let refresh = if period <= 0 {
        now
    } else if delta < 0 {
        now + delta % period
    } else if delta < activate {
        now + (delta % period - period)
    } else {
        desired + -activate
    };
    (refresh, refresh + activate)
}

/// A refresh rate change that was promised to the client but not submitted yet
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct PendingRateChange {
    pub config: usize,
    pub refresh_time: Time,
    pub applied_time: Time,
}

impl PendingRateChange {
    pub fn is_ready(&self, now: Time) -> bool {
        !self.refresh_time.is_never() && now >= self.refresh_time
    }
}

#[derive(Debug, Clone, Copy)]
struct TransientPeriod {
    period: Duration,
    applied_time: Time,
}

/// Periods still in effect while submitted rate changes settle
///
/// Entries are dropped lazily, once their applied time passed.
#[derive(Debug, Default)]
pub(crate) struct TransientPeriods {
    fifo: VecDeque<TransientPeriod>,
}

impl TransientPeriods {
    pub fn push(&mut self, period: Duration, applied_time: Time) {
        self.fifo.push_back(TransientPeriod { period, applied_time });
    }

    /// The period in effect at `now`, if a change is still settling
    pub fn current(&mut self, now: Time) -> Option<Duration> {
        while let Some(front) = self.fifo.front() {
            if now >= front.applied_time {
                trace!(applied = ?front.applied_time, "Transient vsync period expired");
                self.fifo.pop_front();
            } else {
                return Some(front.period);
            }
        }
        None
    }

    pub fn clear(&mut self) {
        self.fifo.clear();
    }
}
