use crate::alert::{AlertSink, Severity};
use crate::clock::Clock;
use crate::error::CaptureError;
use chrono::{Datelike, NaiveDateTime, NaiveTime, Timelike, Weekday};
use std::fmt;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::str::FromStr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

const TICK: Duration = Duration::from_secs(1);

/// Longest gap between ticks that is scanned for skipped triggers
const MAX_MISSED_SCAN_MINUTES: i64 = 24 * 60;

/// Set of weekdays, bit 0 = Monday
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Weekdays(u8);

impl Weekdays {
    pub const ALL: Weekdays = Weekdays(0b0111_1111);

    pub fn empty() -> Self {
        Weekdays(0)
    }

    pub fn with(self, day: Weekday) -> Self {
        Weekdays(self.0 | (1 << day.num_days_from_monday()))
    }

    pub fn contains(&self, day: Weekday) -> bool {
        self.0 & (1 << day.num_days_from_monday()) != 0
    }

    pub fn is_empty(&self) -> bool {
        self.0 == 0
    }
}

impl FromIterator<Weekday> for Weekdays {
    fn from_iter<I: IntoIterator<Item = Weekday>>(iter: I) -> Self {
        iter.into_iter().fold(Weekdays::empty(), Weekdays::with)
    }
}

impl fmt::Display for Weekdays {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if *self == Weekdays::ALL {
            return f.write_str("every day");
        }
        let days: Vec<String> = std::iter::successors(Some(Weekday::Mon), |day| Some(day.succ()))
            .take(7)
            .filter(|day| self.contains(*day))
            .map(|day| day.to_string())
            .collect();
        f.write_str(&days.join(","))
    }
}

/// Time of day (minute precision) plus the weekdays it applies to
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Trigger {
    pub hour: u32,
    pub minute: u32,
    pub days: Weekdays,
}

impl Trigger {
    pub fn new(hour: u32, minute: u32, days: Weekdays) -> Result<Self, CaptureError> {
        if hour > 23 || minute > 59 {
            return Err(CaptureError::Config(format!(
                "invalid trigger time {:02}:{:02}",
                hour, minute
            )));
        }
        if days.is_empty() {
            return Err(CaptureError::Config(format!(
                "trigger {:02}:{:02} has no weekdays",
                hour, minute
            )));
        }
        Ok(Self { hour, minute, days })
    }

    pub fn daily(hour: u32, minute: u32) -> Result<Self, CaptureError> {
        Self::new(hour, minute, Weekdays::ALL)
    }

    pub fn matches(&self, at: NaiveDateTime) -> bool {
        at.hour() == self.hour && at.minute() == self.minute && self.days.contains(at.weekday())
    }

    /// First minute strictly after `after` at which this trigger fires
    pub fn next_after(&self, after: NaiveDateTime) -> Option<NaiveDateTime> {
        let time = NaiveTime::from_hms_opt(self.hour, self.minute, 0)?;
        (0..=7)
            .filter_map(|days| after.date().checked_add_days(chrono::Days::new(days)))
            .map(|date| date.and_time(time))
            .find(|candidate| *candidate > after && self.days.contains(candidate.weekday()))
    }
}

impl FromStr for Trigger {
    type Err = CaptureError;

    /// Parses `"HH:MM"` as a daily trigger
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let time = NaiveTime::parse_from_str(s.trim(), "%H:%M")
            .map_err(|e| CaptureError::Config(format!("invalid trigger time {:?}: {}", s, e)))?;
        Self::daily(time.hour(), time.minute())
    }
}

impl fmt::Display for Trigger {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:02}:{:02} ({})", self.hour, self.minute, self.days)
    }
}

/// Work run when a trigger fires
pub trait Routine {
    fn invoke(&mut self) -> anyhow::Result<()>;
}

impl<F> Routine for F
where
    F: FnMut() -> anyhow::Result<()>,
{
    fn invoke(&mut self) -> anyhow::Result<()> {
        self()
    }
}

struct Entry<'a> {
    trigger: Trigger,
    routine: Box<dyn Routine + 'a>,
    last_fired: Option<NaiveDateTime>,
}

/// Registered triggers and the minute each one last fired in.
///
/// Identical triggers stay separate entries and each one fires. A minute
/// that comes round again after the clock steps back does not refire.
pub struct SchedulerContext<'a> {
    entries: Vec<Entry<'a>>,
    minute: Option<NaiveDateTime>,
    alerts: Arc<dyn AlertSink>,
}

impl<'a> SchedulerContext<'a> {
    pub fn new(alerts: Arc<dyn AlertSink>) -> Self {
        Self {
            entries: Vec::new(),
            minute: None,
            alerts,
        }
    }

    pub fn register(&mut self, trigger: Trigger, routine: impl Routine + 'a) {
        tracing::debug!("Registered trigger {}", trigger);
        self.entries.push(Entry {
            trigger,
            routine: Box::new(routine),
            last_fired: None,
        });
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Run every routine whose trigger matches `now` and has not fired this
    /// minute. Routines run one after another on the calling thread.
    /// Returns how many fired.
    pub fn tick(&mut self, now: NaiveDateTime) -> usize {
        let minute = truncate_to_minute(now);
        if let Some(previous) = self.minute.filter(|previous| *previous != minute) {
            if minute < previous {
                tracing::warn!("Clock moved back from {} to {}", previous, minute);
            } else {
                self.warn_missed(previous, minute);
            }
        }
        self.minute = Some(minute);

        let mut fired = 0;
        for entry in &mut self.entries {
            if entry.last_fired == Some(minute) || !entry.trigger.matches(now) {
                continue;
            }
            entry.last_fired = Some(minute);
            fired += 1;

            tracing::info!("Trigger {} fired", entry.trigger);
            match catch_unwind(AssertUnwindSafe(|| entry.routine.invoke())) {
                Ok(Ok(())) => {}
                Ok(Err(e)) => {
                    let message = format!("Routine for trigger {} failed: {:#}", entry.trigger, e);
                    self.alerts.alert(&message, Severity::Error);
                }
                Err(panic) => {
                    let message = format!(
                        "Routine for trigger {} panicked: {}",
                        entry.trigger,
                        panic_message(panic.as_ref())
                    );
                    self.alerts.alert(&message, Severity::Critical);
                }
            }
        }
        fired
    }

    /// Log triggers whose whole minute passed between two ticks; returns
    /// how many firings were skipped
    fn warn_missed(&self, previous: NaiveDateTime, current: NaiveDateTime) -> usize {
        let gap = (current - previous).num_minutes();
        if gap <= 1 || gap > MAX_MISSED_SCAN_MINUTES {
            return 0;
        }
        let mut missed = 0;
        for step in 1..gap {
            let skipped = previous + chrono::TimeDelta::minutes(step);
            for entry in self.entries.iter().filter(|e| e.trigger.matches(skipped)) {
                tracing::warn!(
                    "Trigger {} skipped at {} while a previous routine was running",
                    entry.trigger,
                    skipped
                );
                missed += 1;
            }
        }
        missed
    }
}

fn truncate_to_minute(at: NaiveDateTime) -> NaiveDateTime {
    at.with_second(0)
        .and_then(|t| t.with_nanosecond(0))
        .unwrap_or(at)
}

fn panic_message(panic: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

/// Drive `ctx` at one tick per second until `shutdown` is set.
///
/// The flag is only read between ticks, so a routine in progress always
/// runs to completion.
pub fn run(ctx: &mut SchedulerContext<'_>, clock: &dyn Clock, shutdown: &AtomicBool) {
    tracing::info!("Scheduler started with {} jobs", ctx.len());

    while !shutdown.load(Ordering::SeqCst) {
        ctx.tick(clock.now());

        // Align the next tick to the start of the next wall-clock second
        let subsec = clock.now().nanosecond().min(999_999_999);
        clock.sleep(TICK - Duration::from_nanos(u64::from(subsec)));
    }

    tracing::info!("Scheduler stopped");
}
