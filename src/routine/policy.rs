use crate::error::CaptureError;
use serde::Deserialize;
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimeUnit {
    Millis,
    Seconds,
    Minutes,
    Hours,
}

impl TimeUnit {
    fn suffix(&self) -> &'static str {
        match self {
            TimeUnit::Millis => "ms",
            TimeUnit::Seconds => "s",
            TimeUnit::Minutes => "m",
            TimeUnit::Hours => "h",
        }
    }
}

/// A duration that remembers the unit it was written in (`"3m"`, `"50s"`).
///
/// The unit matters when a photo interval is derived from a target count:
/// the result is floored to the same unit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(try_from = "String")]
pub struct Span {
    value: u64,
    unit: TimeUnit,
}

impl Span {
    pub const fn seconds(value: u64) -> Self {
        Self {
            value,
            unit: TimeUnit::Seconds,
        }
    }

    pub const fn minutes(value: u64) -> Self {
        Self {
            value,
            unit: TimeUnit::Minutes,
        }
    }

    pub const fn millis(value: u64) -> Self {
        Self {
            value,
            unit: TimeUnit::Millis,
        }
    }

    pub fn unit(&self) -> TimeUnit {
        self.unit
    }

    pub fn is_zero(&self) -> bool {
        self.value == 0
    }

    pub fn as_duration(&self) -> Duration {
        match self.unit {
            TimeUnit::Millis => Duration::from_millis(self.value),
            TimeUnit::Seconds => Duration::from_secs(self.value),
            TimeUnit::Minutes => Duration::from_secs(self.value.saturating_mul(60)),
            TimeUnit::Hours => Duration::from_secs(self.value.saturating_mul(3600)),
        }
    }
}

impl FromStr for Span {
    type Err = CaptureError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        let split = s
            .find(|c: char| !c.is_ascii_digit())
            .ok_or_else(|| CaptureError::Config(format!("duration {:?} has no unit (ms, s, m, h)", s)))?;
        let (digits, suffix) = s.split_at(split);

        let value = digits
            .parse()
            .map_err(|_| CaptureError::Config(format!("invalid duration {:?}", s)))?;
        let unit = match suffix.trim() {
            "ms" => TimeUnit::Millis,
            "s" => TimeUnit::Seconds,
            "m" | "min" => TimeUnit::Minutes,
            "h" => TimeUnit::Hours,
            other => {
                return Err(CaptureError::Config(format!(
                    "unknown duration unit {:?} in {:?}",
                    other, s
                )))
            }
        };

        Ok(Self { value, unit })
    }
}

impl TryFrom<String> for Span {
    type Error = CaptureError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl fmt::Display for Span {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}{}", self.value, self.unit.suffix())
    }
}

/// How often stills are taken during a run
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(untagged)]
pub enum Cadence {
    /// Fixed interval; the run stops at its deadline
    Interval { every: Span },
    /// Spread `target_count` stills evenly across the run.
    /// With `stop_at_target` the run also ends once the count is reached.
    TargetCount {
        target_count: u32,
        #[serde(default)]
        stop_at_target: bool,
    },
}

impl Cadence {
    /// Time between stills for a run lasting `duration`.
    ///
    /// A derived interval is `duration / (count + 1)` floored to whole
    /// minutes when the duration was given in minutes or hours, otherwise
    /// to whole seconds. It never drops below one second.
    pub fn interval(&self, duration: Span) -> Duration {
        match self {
            Cadence::Interval { every } => every.as_duration(),
            Cadence::TargetCount { target_count, .. } => {
                let divisor = u64::from(*target_count) + 1;
                let total = duration.as_duration().as_secs();

                if matches!(duration.unit(), TimeUnit::Minutes | TimeUnit::Hours) {
                    let minutes = total / 60 / divisor;
                    if minutes > 0 {
                        return Duration::from_secs(minutes * 60);
                    }
                }

                Duration::from_secs((total / divisor).max(1))
            }
        }
    }

    /// Photo count that ends the run early, if any
    pub fn stop_count(&self) -> Option<u32> {
        match self {
            Cadence::TargetCount {
                target_count,
                stop_at_target: true,
            } => Some(*target_count),
            _ => None,
        }
    }
}

impl fmt::Display for Cadence {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Cadence::Interval { every } => write!(f, "every {}", every),
            Cadence::TargetCount {
                target_count,
                stop_at_target,
            } => {
                write!(f, "{} photos", target_count)?;
                if *stop_at_target {
                    f.write_str(" (hard stop)")?;
                }
                Ok(())
            }
        }
    }
}

/// Pause applied after a failed frame read
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Backoff {
    /// Retry at the normal frame cadence
    #[default]
    None,
    Fixed(Span),
}

/// Bounded in-place retry of frame reads on the same connection
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
    /// Consecutive read failures that end the run
    pub max_attempts: u32,
    pub backoff: Backoff,
    /// Re-check liveness every this many consecutive failures
    pub probe_after: Option<u32>,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 10,
            backoff: Backoff::None,
            probe_after: None,
        }
    }
}

impl RetryPolicy {
    pub fn exhausted(&self, consecutive_failures: u32) -> bool {
        consecutive_failures >= self.max_attempts
    }

    pub fn should_probe(&self, consecutive_failures: u32) -> bool {
        match self.probe_after {
            Some(n) if n > 0 => consecutive_failures > 0 && consecutive_failures % n == 0,
            _ => false,
        }
    }

    /// Sleep before the next read, given whether the last one failed
    pub fn pause(&self, last_failed: bool, frame_interval: Duration) -> Duration {
        match (last_failed, self.backoff) {
            (true, Backoff::Fixed(delay)) => delay.as_duration(),
            _ => frame_interval,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_spans() {
        assert_eq!("3m".parse::<Span>().unwrap().as_duration(), Duration::from_secs(180));
        assert_eq!("50s".parse::<Span>().unwrap().as_duration(), Duration::from_secs(50));
        assert_eq!("100ms".parse::<Span>().unwrap().as_duration(), Duration::from_millis(100));
        assert_eq!("2h".parse::<Span>().unwrap().as_duration(), Duration::from_secs(7200));
        assert!("50".parse::<Span>().is_err());
        assert!("5d".parse::<Span>().is_err());
        assert!("m".parse::<Span>().is_err());
    }

    #[test]
    fn derived_interval_floors_to_minutes() {
        let cadence = Cadence::TargetCount {
            target_count: 5,
            stop_at_target: false,
        };
        assert_eq!(cadence.interval(Span::minutes(60)), Duration::from_secs(600));
        // 50 / 6 = 8.33 minutes
        assert_eq!(cadence.interval(Span::minutes(50)), Duration::from_secs(480));
    }

    #[test]
    fn derived_interval_drops_to_seconds_when_minutes_floor_to_zero() {
        let cadence = Cadence::TargetCount {
            target_count: 10,
            stop_at_target: true,
        };
        // 180s / 11 = 16.36s
        assert_eq!(cadence.interval(Span::minutes(3)), Duration::from_secs(16));
        assert_eq!(cadence.stop_count(), Some(10));
    }

    #[test]
    fn derived_interval_in_seconds_never_zero() {
        let cadence = Cadence::TargetCount {
            target_count: 100,
            stop_at_target: false,
        };
        assert_eq!(cadence.interval(Span::seconds(90)), Duration::from_secs(1));
        assert_eq!(cadence.stop_count(), None);
    }

    #[test]
    fn direct_interval() {
        let cadence = Cadence::Interval {
            every: Span::seconds(20),
        };
        assert_eq!(cadence.interval(Span::minutes(1)), Duration::from_secs(20));
        assert_eq!(cadence.stop_count(), None);
    }

    #[test]
    fn retry_policy_probes_on_multiples() {
        let policy = RetryPolicy {
            max_attempts: 10,
            backoff: Backoff::Fixed(Span::millis(500)),
            probe_after: Some(3),
        };
        assert!(!policy.should_probe(0));
        assert!(!policy.should_probe(2));
        assert!(policy.should_probe(3));
        assert!(policy.should_probe(6));
        assert!(policy.exhausted(10));
        assert!(!policy.exhausted(9));
        assert_eq!(
            policy.pause(true, Duration::from_millis(100)),
            Duration::from_millis(500)
        );
        assert_eq!(
            policy.pause(false, Duration::from_millis(100)),
            Duration::from_millis(100)
        );
    }
}
