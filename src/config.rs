use crate::alert::Severity;
use crate::capture::CameraAddress;
use crate::routine::{Cadence, RoutineConfig};
use crate::scheduler::{Trigger, Weekdays};
use anyhow::{bail, Context, Result};
use chrono::{NaiveTime, Timelike, Weekday};
use serde::Deserialize;
use std::path::{Path, PathBuf};

pub const DEFAULT_CONFIG_PATH: &str = "towercam.toml";

/// Top-level config (towercam.toml)
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Base of the `year/month/day` output tree
    pub data_dir: PathBuf,
    /// Device index (`"0"`) or stream URL (`"rtsp://host:554/main"`)
    pub camera: String,
    pub routine: RoutineConfig,
    pub logging: LoggingConfig,
    pub alerts: AlertConfig,
    pub schedule: Vec<ScheduleEntry>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("./data"),
            camera: "0".to_string(),
            routine: RoutineConfig::default(),
            logging: LoggingConfig::default(),
            alerts: AlertConfig::default(),
            schedule: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Log file; disabled when unset
    pub file: Option<PathBuf>,
    /// Also log to the console
    pub verbose: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            file: Some(PathBuf::from("./capture_log.log")),
            verbose: true,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct AlertConfig {
    /// Append-only alert file; alerts only go to the log when unset
    pub file: Option<PathBuf>,
    pub min_severity: Severity,
}

impl Default for AlertConfig {
    fn default() -> Self {
        Self {
            file: None,
            min_severity: Severity::Error,
        }
    }
}

/// One `[[schedule]]` table
#[derive(Debug, Clone, Deserialize)]
pub struct ScheduleEntry {
    /// `"HH:MM"`, local time
    pub at: String,
    /// Three-letter weekday names; every day when omitted
    #[serde(default)]
    pub days: Vec<String>,
}

impl ScheduleEntry {
    pub fn trigger(&self) -> Result<Trigger> {
        let time = NaiveTime::parse_from_str(self.at.trim(), "%H:%M")
            .with_context(|| format!("invalid schedule time {:?}", self.at))?;

        let days = if self.days.is_empty() {
            Weekdays::ALL
        } else {
            self.days
                .iter()
                .map(|day| {
                    day.parse::<Weekday>()
                        .map_err(|_| anyhow::anyhow!("unknown weekday {:?}", day))
                })
                .collect::<Result<Weekdays>>()?
        };

        Ok(Trigger::new(time.hour(), time.minute(), days)?)
    }
}

impl Config {
    /// Read and validate a config file
    pub fn load(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file {}", path.display()))?;
        let config = Self::parse(&text)
            .with_context(|| format!("Invalid config file {}", path.display()))?;
        Ok(config)
    }

    pub fn parse(text: &str) -> Result<Self> {
        let mut config: Config = toml::from_str(text)?;
        config.routine.output_dir = config.data_dir.clone();
        config.validate()?;
        Ok(config)
    }

    pub fn set_data_dir(&mut self, data_dir: PathBuf) {
        self.routine.output_dir = data_dir.clone();
        self.data_dir = data_dir;
    }

    pub fn camera_address(&self) -> CameraAddress {
        match self.camera.parse() {
            Ok(address) => address,
            Err(never) => match never {},
        }
    }

    pub fn triggers(&self) -> Result<Vec<Trigger>> {
        self.schedule.iter().map(ScheduleEntry::trigger).collect()
    }

    fn validate(&self) -> Result<()> {
        let routine = &self.routine;
        if routine.duration.is_zero() {
            bail!("routine.duration must be greater than zero");
        }
        if routine.frame_interval.is_zero() {
            bail!("routine.frame_interval must be greater than zero");
        }
        if routine.retry.max_attempts == 0 {
            bail!("routine.retry.max_attempts must be at least 1");
        }
        if let Cadence::Interval { every } = &routine.cadence {
            if every.is_zero() {
                bail!("routine.cadence.every must be greater than zero");
            }
        }
        if routine.video.fps == 0 {
            bail!("routine.video.fps must be at least 1");
        }
        if self.camera.trim().is_empty() {
            bail!("camera must not be empty");
        }
        self.triggers()?;
        Ok(())
    }

    /// Multi-line summary of the effective settings, logged at startup
    pub fn summary(&self, jobs: usize) -> String {
        let mut out = String::from("script variables:");
        out.push_str(&format!("\n\tcamera = \"{}\"", self.camera));
        out.push_str(&format!("\n\tdata_dir = \"{}\"", self.data_dir.display()));
        out.push_str(&format!("\n\tlive_duration = {}", self.routine.duration));
        out.push_str(&format!("\n\tcadence = {}", self.routine.cadence));
        out.push_str(&format!(
            "\n\tmax_failures = {}",
            self.routine.retry.max_attempts
        ));
        out.push_str(&format!("\n\tfeatures = {:?}", self.routine.features));
        if let Some(file) = &self.logging.file {
            out.push_str(&format!("\n\tlog_path = \"{}\"", file.display()));
        }
        if let Some(file) = &self.alerts.file {
            out.push_str(&format!("\n\talert_path = \"{}\"", file.display()));
        }
        out.push_str(&format!("\n\tnum_of_scheduled_jobs = {}", jobs));
        out
    }
}
