//! Event phases, triggers and the time schedule derived from them

use serde::{Deserialize, Serialize};

/// Relative tolerance used when comparing event times
pub const TIME_EPSILON: f64 = 1e-9;

/// Point in the step pipeline at which a callback runs
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Phase {
    /// Once, during initialisation, before the first adaptation pass
    Init,
    /// Before diffusion, with the step's start time
    BeforeStep,
    /// After diffusion, with the step's start time
    AfterStep,
    /// After time has advanced, read-only
    Output,
}

/// When a callback fires
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub enum Trigger {
    /// Every step
    EveryStep,
    /// Once, at the given time
    At(f64),
    /// Every `step` time units from `start`, optionally up to `end`
    Interval {
        /// First firing time
        start: f64,
        /// Spacing between firings
        step: f64,
        /// Last time at which the trigger may fire
        end: Option<f64>,
    },
}

impl Trigger {
    /// Every `step` from time zero
    pub fn every(step: f64) -> Self {
        Self::Interval {
            start: 0.0,
            step,
            end: None,
        }
    }

    /// Whether the trigger parameters make sense
    pub fn is_valid(&self) -> bool {
        match *self {
            Self::EveryStep => true,
            Self::At(t) => t.is_finite(),
            Self::Interval { start, step, end } => {
                start.is_finite()
                    && step > 0.0
                    && step.is_finite()
                    && end.map_or(true, |e| e.is_finite() && e >= start)
            }
        }
    }
}

fn approx_le(a: f64, b: f64) -> bool {
    a <= b + TIME_EPSILON * b.abs().max(1.0)
}

/// Firing state of one trigger
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Schedule {
    trigger: Trigger,
    next: Option<f64>,
}

impl Schedule {
    /// Schedule starting at `time`
    ///
    /// Interval times before `time` are skipped; an `At` time in the past
    /// never fires.
    pub fn new(trigger: Trigger, time: f64) -> Self {
        let next = match trigger {
            Trigger::EveryStep => None,
            Trigger::At(t) => approx_le(time, t).then_some(t),
            Trigger::Interval { start, step, end } => {
                let mut k = ((time - start) / step).ceil().max(0.0);
                if approx_le(time, start + (k - 1.0) * step) {
                    k -= 1.0;
                }
                let t = start + k.max(0.0) * step;
                end.map_or(true, |e| approx_le(t, e)).then_some(t)
            }
        };
        Self { trigger, next }
    }

    /// Trigger this schedule follows
    pub fn trigger(&self) -> Trigger {
        self.trigger
    }

    /// Next scheduled time, if the trigger is time-based and not exhausted
    pub fn next_time(&self) -> Option<f64> {
        self.next
    }

    /// Whether the trigger fires at `time`
    pub fn is_due(&self, time: f64) -> bool {
        match self.trigger {
            Trigger::EveryStep => true,
            _ => self.next.is_some_and(|t| approx_le(t, time)),
        }
    }

    /// Mark the trigger as fired at `time` and compute the next firing
    pub fn advance(&mut self, time: f64) {
        match self.trigger {
            Trigger::EveryStep => {}
            Trigger::At(_) => self.next = None,
            Trigger::Interval { step, end, .. } => {
                let mut next = self.next.unwrap_or(time);
                while approx_le(next, time) {
                    next += step;
                }
                self.next = end.map_or(true, |e| approx_le(next, e)).then_some(next);
            }
        }
    }
}

/// Step length that lands exactly on `target`
///
/// Splits the remaining interval into the fewest equal steps no longer than
/// `dt`. Returns `dt` unchanged when `target` is not ahead of `time`.
pub fn land_on(time: f64, target: f64, dt: f64) -> f64 {
    let remaining = target - time;
    if remaining <= TIME_EPSILON * target.abs().max(1.0) || dt <= 0.0 {
        return dt;
    }
    let steps = (remaining / dt * (1.0 - TIME_EPSILON)).ceil().max(1.0);
    remaining / steps
}
