//! Timers decide when a task fires next.
//!
//! A [`Timer`] produces the next fire instant for one task. Returning `None`
//! means the timer is done and will never fire again. [`Timer::reschedule`]
//! installs a one-shot override: the next call to [`Timer::next`] returns
//! approximately now + delay, and the call after that reverts to the timer's
//! natural cadence (or to done, for [`Once`]).

use std::str::FromStr;
use std::time::Duration;

use chrono::{DateTime, TimeDelta, Utc};
use cron::Schedule;

use crate::errors::SchedulerError;

/// Source of fire instants for one task.
pub trait Timer: Send {
    /// The next fire instant, or `None` when no further fires will be
    /// produced.
    ///
    /// Instants in the past are legal; the scheduler clamps them to "now" at
    /// fire time rather than dropping them.
    fn next(&mut self) -> Option<DateTime<Utc>>;

    /// Override the next [`Timer::next`] to return approximately
    /// now + `delay`. Re-arms a previously done [`Once`]. Consumed by exactly
    /// one `next` call.
    fn reschedule(&mut self, delay: Duration);
}

fn after_now(d: Duration) -> DateTime<Utc> {
    let delta = TimeDelta::from_std(d).unwrap_or(TimeDelta::MAX);
    Utc::now()
        .checked_add_signed(delta)
        .unwrap_or(DateTime::<Utc>::MAX_UTC)
}

/// Fires once, after a delay measured from the first [`Timer::next`] call.
#[derive(Debug, Clone)]
pub struct Once {
    delay: Duration,
    done: bool,
}

impl Once {
    /// A timer that fires once, `delay` after it is first inquired.
    /// A zero delay fires as soon as the scheduler looks.
    pub fn new(delay: Duration) -> Self {
        Self { delay, done: false }
    }

    /// A timer that fires once at the absolute instant `at`.
    /// If `at` is already past at construction time, the timer never fires.
    pub fn at(at: DateTime<Utc>) -> Self {
        match (at - Utc::now()).to_std() {
            Ok(remaining) => Self::new(remaining),
            Err(_) => Self {
                delay: Duration::ZERO,
                done: true,
            },
        }
    }
}

impl Timer for Once {
    fn next(&mut self) -> Option<DateTime<Utc>> {
        if self.done {
            return None;
        }
        self.done = true;
        Some(after_now(self.delay))
    }

    fn reschedule(&mut self, d: Duration) {
        self.delay = d;
        self.done = false;
    }
}

/// Fires at a fixed interval.
///
/// Each fire is computed from the wall clock at inquiry time, not from the
/// previous fire, so a late fire does not cause a compensating early next
/// fire and jitter never accumulates into drift.
#[derive(Debug, Clone)]
pub struct Fixed {
    period: Duration,
    override_delay: Option<Duration>,
}

impl Fixed {
    /// A timer that fires every `period`.
    pub fn new(period: Duration) -> Self {
        Self {
            period,
            override_delay: None,
        }
    }
}

impl Timer for Fixed {
    fn next(&mut self) -> Option<DateTime<Utc>> {
        if let Some(d) = self.override_delay.take() {
            return Some(after_now(d));
        }
        Some(after_now(self.period))
    }

    fn reschedule(&mut self, d: Duration) {
        self.override_delay = Some(d);
    }
}

/// Fires according to a cron expression.
#[derive(Debug, Clone)]
pub struct Cron {
    schedule: Schedule,
    override_delay: Option<Duration>,
}

impl Cron {
    /// Parse `expression` and return a cron timer.
    ///
    /// Standard 5-field expressions (min hour dom month dow) are accepted and
    /// fire at second zero; 6- and 7-field forms with an explicit seconds
    /// (and optional year) column pass through unchanged. Anything the parser
    /// rejects fails construction.
    pub fn new(expression: &str) -> Result<Self, SchedulerError> {
        let full = if expression.split_whitespace().count() == 5 {
            format!("0 {expression}")
        } else {
            expression.to_string()
        };
        Ok(Self {
            schedule: Schedule::from_str(&full)?,
            override_delay: None,
        })
    }
}

impl Timer for Cron {
    fn next(&mut self) -> Option<DateTime<Utc>> {
        if let Some(d) = self.override_delay.take() {
            return Some(after_now(d));
        }
        self.schedule.after(&Utc::now()).next()
    }

    fn reschedule(&mut self, d: Duration) {
        self.override_delay = Some(d);
    }
}
