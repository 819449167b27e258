mod policy;

pub use policy::{Backoff, Cadence, RetryPolicy, Span};

use crate::alert::{AlertSink, Severity};
use crate::capture::{CameraSession, CameraSource};
use crate::clock::{offset, Clock};
use crate::output::{ensure_daily_path, hour_bucket, ArtifactNames, VideoBackend, VideoSink};
use chrono::{NaiveDateTime, Timelike};
use serde::Deserialize;
use std::fmt;
use std::path::PathBuf;
use std::time::Duration;

/// What a capture run records
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Features {
    #[default]
    PhotosOnly,
    PhotosAndVideo,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct VideoSettings {
    /// File extension, which also selects ffmpeg's muxer
    pub container: String,
    pub fps: u32,
}

impl Default for VideoSettings {
    fn default() -> Self {
        Self {
            container: "mp4".to_string(),
            fps: 10,
        }
    }
}

/// Immutable parameters for one capture run
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct RoutineConfig {
    /// How long the camera stays live
    pub duration: Span,
    pub cadence: Cadence,
    pub retry: RetryPolicy,
    /// Pause between frame reads
    pub frame_interval: Span,
    pub features: Features,
    pub video: VideoSettings,
    /// Root of the date-partitioned output tree; set from the top-level config
    #[serde(skip)]
    pub output_dir: PathBuf,
}

impl Default for RoutineConfig {
    fn default() -> Self {
        Self {
            duration: Span::minutes(3),
            cadence: Cadence::Interval {
                every: Span::seconds(50),
            },
            retry: RetryPolicy::default(),
            frame_interval: Span::millis(100),
            features: Features::PhotosOnly,
            video: VideoSettings::default(),
            output_dir: PathBuf::from("./data"),
        }
    }
}

/// Why a capture run ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TerminalReason {
    /// Output directory could not be created or written
    DirectoryError,
    /// Camera failed to open or was not live after opening
    CameraUnavailable,
    /// Consecutive read failures reached the retry limit
    TooManyFailures,
    /// A liveness probe after repeated failures found the link dead
    ConnectionLost,
    /// Hard deadline reached
    DurationElapsed,
    /// Photo target reached before the deadline
    TargetReached,
}

impl TerminalReason {
    /// Reasons that mean capture was cut short by a fault
    pub fn is_failure(&self) -> bool {
        matches!(
            self,
            TerminalReason::DirectoryError
                | TerminalReason::CameraUnavailable
                | TerminalReason::TooManyFailures
                | TerminalReason::ConnectionLost
        )
    }
}

impl fmt::Display for TerminalReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            TerminalReason::DirectoryError => "output directory error",
            TerminalReason::CameraUnavailable => "camera unavailable",
            TerminalReason::TooManyFailures => "too many failed frame reads",
            TerminalReason::ConnectionLost => "camera connection lost",
            TerminalReason::DurationElapsed => "duration elapsed",
            TerminalReason::TargetReached => "photo target reached",
        };
        f.write_str(s)
    }
}

/// Terminal report of one capture run
#[derive(Debug, Clone)]
pub struct RunSummary {
    pub photos_saved: u32,
    pub failures: u32,
    pub reason: TerminalReason,
    /// Hour bucket label, e.g. `2pm`
    pub block: String,
    pub started: NaiveDateTime,
    pub finished: NaiveDateTime,
    pub directory: Option<PathBuf>,
}

impl RunSummary {
    pub fn any_saved(&self) -> bool {
        self.photos_saved > 0
    }

    pub fn severity(&self) -> Severity {
        if !self.any_saved() || self.reason.is_failure() {
            Severity::Error
        } else if self.failures > 0 {
            Severity::Warning
        } else {
            Severity::Info
        }
    }
}

impl fmt::Display for RunSummary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "captured {} images during {} block ({} failed reads, {})",
            self.photos_saved, self.block, self.failures, self.reason
        )
    }
}

/// Per-run mutable state, discarded when the run concludes
struct CaptureState {
    photos: u32,
    failures: u32,
    consecutive_failures: u32,
    next_photo_due: NaiveDateTime,
    deadline: NaiveDateTime,
    directory: Option<PathBuf>,
    video: Option<Box<dyn VideoSink>>,
}

/// One bounded capture run against a single camera connection.
///
/// `run` always returns a [`RunSummary`] and always releases the camera,
/// whichever way the run ends.
pub struct CaptureRoutine<'a> {
    config: &'a RoutineConfig,
    clock: &'a dyn Clock,
    alerts: &'a dyn AlertSink,
    video: &'a dyn VideoBackend,
}

impl<'a> CaptureRoutine<'a> {
    pub fn new(
        config: &'a RoutineConfig,
        clock: &'a dyn Clock,
        alerts: &'a dyn AlertSink,
        video: &'a dyn VideoBackend,
    ) -> Self {
        Self {
            config,
            clock,
            alerts,
            video,
        }
    }

    pub fn run(&self, source: Box<dyn CameraSource>) -> RunSummary {
        tracing::info!("Starting capture routine");

        let started = self.clock.now();
        let interval = self.photo_interval();
        let mut state = CaptureState {
            photos: 0,
            failures: 0,
            consecutive_failures: 0,
            next_photo_due: offset(started, interval),
            deadline: offset(started, self.config.duration.as_duration()),
            directory: None,
            video: None,
        };

        // The session owns the camera from here; drop releases it on any path
        let mut session = CameraSession::new(source);
        let reason = self.execute(&mut session, &mut state, started, interval);

        if let Some(mut video) = state.video.take() {
            if let Err(e) = video.finish() {
                tracing::warn!("{}", e);
            }
        }
        session.release();

        let summary = RunSummary {
            photos_saved: state.photos,
            failures: state.failures,
            reason,
            block: hour_bucket(started.hour()),
            started,
            finished: self.clock.now(),
            directory: state.directory,
        };
        self.report(&summary);
        tracing::info!("Capture routine has concluded");
        summary
    }

    fn photo_interval(&self) -> Duration {
        self.config.cadence.interval(self.config.duration)
    }

    fn execute(
        &self,
        session: &mut CameraSession,
        state: &mut CaptureState,
        started: NaiveDateTime,
        interval: Duration,
    ) -> TerminalReason {
        let directory = match ensure_daily_path(&self.config.output_dir, started) {
            Ok(directory) => directory,
            Err(e) => {
                tracing::error!("{}", e);
                return TerminalReason::DirectoryError;
            }
        };
        tracing::info!("Current file directory set as {:?}", directory);
        let names = ArtifactNames::new(&directory, started);
        state.directory = Some(directory);

        if let Err(e) = session.open() {
            tracing::error!("{}, exiting routine", e);
            return TerminalReason::CameraUnavailable;
        }
        if !session.is_live() {
            tracing::error!("Camera not open, cannot extract feed, exiting routine");
            return TerminalReason::CameraUnavailable;
        }

        if self.config.features == Features::PhotosAndVideo {
            state.video = self.open_video(session, &names);
        }

        let frame_interval = self.config.frame_interval.as_duration();
        loop {
            let tick_start = self.clock.now();
            let last_failed = match session.read_frame() {
                Ok(frame) => {
                    state.consecutive_failures = 0;

                    if let Some(video) = state.video.as_mut() {
                        if let Err(e) = video.write_frame(&frame) {
                            tracing::warn!("{}, continuing with photos only", e);
                            state.video = None;
                        }
                    }

                    let now = self.clock.now();
                    if now >= state.next_photo_due {
                        let path = names.snapshot(state.photos + 1);
                        if let Err(e) = frame.save(&path) {
                            tracing::error!("Failed to save snapshot {}: {}", path.display(), e);
                            return TerminalReason::DirectoryError;
                        }
                        tracing::info!("Snapshot taken, saved as {:?}", path);
                        state.photos += 1;

                        // Skip ahead instead of bursting after a long stall
                        let next = offset(state.next_photo_due, interval);
                        state.next_photo_due = if next > now { next } else { offset(now, interval) };
                    }
                    false
                }
                Err(e) => {
                    state.failures += 1;
                    state.consecutive_failures += 1;
                    let message = format!(
                        "Failed to grab frame from camera feed ({} of {} allowed): {}",
                        state.consecutive_failures, self.config.retry.max_attempts, e
                    );
                    self.alerts.alert(&message, Severity::Warning);
                    true
                }
            };

            if let Some(reason) = self.stop_condition(session, state) {
                tracing::info!("Stop condition met ({}), concluding capture routine", reason);
                return reason;
            }

            // A read that blocked already used part of the pause
            let pause = self.config.retry.pause(last_failed, frame_interval);
            let elapsed = (self.clock.now() - tick_start).to_std().unwrap_or_default();
            self.clock.sleep(pause.saturating_sub(elapsed));
        }
    }

    fn open_video(
        &self,
        session: &CameraSession,
        names: &ArtifactNames,
    ) -> Option<Box<dyn VideoSink>> {
        let (width, height) = session.resolution()?;
        let path = names.video(&self.config.video.container);
        match self
            .video
            .create(&path, width, height, self.config.video.fps)
        {
            Ok(sink) => Some(sink),
            Err(e) => {
                tracing::warn!("{}, recording photos only", e);
                None
            }
        }
    }

    /// First matching stop condition. Failures are checked before the
    /// deadline, so a camera dying at the deadline is reported as a failure.
    fn stop_condition(&self, session: &CameraSession, state: &CaptureState) -> Option<TerminalReason> {
        let retry = &self.config.retry;

        if retry.exhausted(state.consecutive_failures) {
            tracing::error!("Exceeded maximum number of failures to grab frame");
            return Some(TerminalReason::TooManyFailures);
        }

        if retry.should_probe(state.consecutive_failures) && !session.is_live() {
            tracing::error!(
                "Camera link dead after {} failed reads",
                state.consecutive_failures
            );
            return Some(TerminalReason::ConnectionLost);
        }

        if self.clock.now() >= state.deadline {
            return Some(TerminalReason::DurationElapsed);
        }

        match self.config.cadence.stop_count() {
            Some(target) if state.photos >= target => Some(TerminalReason::TargetReached),
            _ => None,
        }
    }

    fn report(&self, summary: &RunSummary) {
        let severity = summary.severity();
        let message = format!("Capture routine {}", summary);
        if severity >= Severity::Warning {
            self.alerts.alert(&message, severity);
        } else {
            tracing::info!("{}", message);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::alert::recording::RecordingSink;
    use crate::capture::fake::FakeCamera;
    use crate::clock::manual::{at, ManualClock};
    use crate::error::{CaptureError, Result};
    use chrono::TimeDelta;
    use image::RgbImage;
    use std::cell::RefCell;
    use std::path::Path;
    use std::rc::Rc;

    #[derive(Default)]
    struct VideoLog {
        frames: u32,
        finished: u32,
        fail_after: Option<u32>,
    }

    struct FakeVideo(Rc<RefCell<VideoLog>>);

    impl VideoSink for FakeVideo {
        fn write_frame(&mut self, _frame: &RgbImage) -> Result<()> {
            let mut log = self.0.borrow_mut();
            if log.fail_after.map_or(false, |n| log.frames >= n) {
                return Err(CaptureError::Video("pipe closed".into()));
            }
            log.frames += 1;
            Ok(())
        }

        fn finish(&mut self) -> Result<()> {
            self.0.borrow_mut().finished += 1;
            Ok(())
        }
    }

    #[derive(Default)]
    struct FakeBackend {
        log: Rc<RefCell<VideoLog>>,
        created: RefCell<Vec<PathBuf>>,
    }

    impl VideoBackend for FakeBackend {
        fn create(&self, path: &Path, _w: u32, _h: u32, _fps: u32) -> Result<Box<dyn VideoSink>> {
            self.created.borrow_mut().push(path.to_path_buf());
            Ok(Box::new(FakeVideo(self.log.clone())))
        }
    }

    struct Harness {
        _dir: tempfile::TempDir,
        config: RoutineConfig,
        clock: Rc<ManualClock>,
        alerts: RecordingSink,
        video: FakeBackend,
    }

    impl Harness {
        fn new(duration: Span, cadence: Cadence) -> Self {
            let dir = tempfile::tempdir().unwrap();
            let config = RoutineConfig {
                duration,
                cadence,
                output_dir: dir.path().to_path_buf(),
                ..RoutineConfig::default()
            };
            Self {
                _dir: dir,
                config,
                clock: Rc::new(ManualClock::new(at(2024, 6, 3, 14, 0, 0))),
                alerts: RecordingSink::default(),
                video: FakeBackend::default(),
            }
        }

        fn run(&self, camera: FakeCamera) -> RunSummary {
            self.run_source(camera)
        }

        fn run_source(&self, source: impl CameraSource + 'static) -> RunSummary {
            CaptureRoutine::new(&self.config, &*self.clock, &self.alerts, &self.video)
                .run(Box::new(source))
        }
    }

    /// Camera whose reads block for `read_cost` of clock time
    struct SlowCamera {
        inner: FakeCamera,
        clock: Rc<ManualClock>,
        read_cost: Duration,
    }

    impl CameraSource for SlowCamera {
        fn open(&mut self) -> Result<()> {
            self.inner.open()
        }

        fn is_live(&self) -> bool {
            self.inner.is_live()
        }

        fn read_frame(&mut self) -> Result<RgbImage> {
            self.clock.advance(self.read_cost);
            self.inner.read_frame()
        }

        fn release(&mut self) {
            self.inner.release()
        }

        fn resolution(&self) -> Option<(u32, u32)> {
            self.inner.resolution()
        }
    }

    fn every(secs: u64) -> Cadence {
        Cadence::Interval {
            every: Span::seconds(secs),
        }
    }

    #[test]
    fn healthy_run_saves_one_still_per_interval() {
        let h = Harness::new(Span::seconds(60), every(20));
        let camera = FakeCamera::healthy();
        let probe = camera.probe.clone();

        let summary = h.run(camera);

        assert_eq!(summary.reason, TerminalReason::DurationElapsed);
        assert_eq!(summary.photos_saved, 3);
        assert_eq!(summary.failures, 0);
        assert_eq!(summary.severity(), Severity::Info);
        assert_eq!(probe.releases.get(), 1);

        let dir = summary.directory.unwrap();
        assert_eq!(dir, h.config.output_dir.join("2024").join("6").join("3"));
        for n in 1..=3 {
            assert!(dir.join(format!("2024_06_03_2pm_snapshot_{}.png", n)).is_file());
        }
        assert!(!dir.join("2024_06_03_2pm_snapshot_4.png").exists());
        assert!(h.alerts.alerts.lock().unwrap().is_empty());
    }

    #[test]
    fn read_time_counts_against_frame_interval() {
        let h = Harness::new(Span::seconds(1), every(1));
        let camera = FakeCamera::healthy();
        let probe = camera.probe.clone();

        let summary = h.run_source(SlowCamera {
            inner: camera,
            clock: h.clock.clone(),
            read_cost: Duration::from_millis(60),
        });

        // Reads start every 100ms: 0.0s, 0.1s, ..., 1.0s
        assert_eq!(summary.reason, TerminalReason::DurationElapsed);
        assert_eq!(probe.reads.get(), 11);
        assert_eq!(summary.finished, at(2024, 6, 3, 14, 0, 1) + TimeDelta::milliseconds(60));
    }

    #[test]
    fn still_count_tracks_duration_over_cadence() {
        for (duration, cadence) in [(60, 7), (90, 50), (180, 50), (45, 45), (30, 60)] {
            let h = Harness::new(Span::seconds(duration), every(cadence));
            let summary = h.run(FakeCamera::healthy());
            let expected = (duration / cadence) as i64;
            let saved = i64::from(summary.photos_saved);
            assert!(
                (saved - expected).abs() <= 1,
                "{}s / {}s saved {}",
                duration,
                cadence,
                saved
            );
        }
    }

    #[test]
    fn failing_camera_stops_after_exactly_threshold_failures() {
        for threshold in [1, 2, 5, 13] {
            let mut h = Harness::new(Span::minutes(3), every(20));
            h.config.retry.max_attempts = threshold;
            let camera = FakeCamera::failing();
            let probe = camera.probe.clone();

            let summary = h.run(camera);

            assert_eq!(summary.reason, TerminalReason::TooManyFailures);
            assert_eq!(summary.failures, threshold);
            assert_eq!(probe.reads.get(), threshold);
            assert_eq!(probe.releases.get(), 1);
        }
    }

    #[test]
    fn all_reads_failing_reports_error() {
        let mut h = Harness::new(Span::minutes(3), every(20));
        h.config.retry.max_attempts = 5;

        let summary = h.run(FakeCamera::failing());

        assert_eq!(summary.reason, TerminalReason::TooManyFailures);
        assert_eq!(summary.photos_saved, 0);
        assert!(!summary.any_saved());
        assert_eq!(summary.failures, 5);

        let severities = h.alerts.severities();
        assert_eq!(severities.len(), 6);
        assert!(severities[..5].iter().all(|s| *s == Severity::Warning));
        let (message, severity) = h.alerts.last().unwrap();
        assert_eq!(severity, Severity::Error);
        assert!(message.contains("captured 0 images"));
    }

    #[test]
    fn success_resets_consecutive_failures() {
        let mut h = Harness::new(Span::seconds(2), every(1));
        h.config.retry.max_attempts = 3;
        let camera = FakeCamera::healthy().with_script(&[false, false, true, false, false, true]);

        let summary = h.run(camera);

        assert_eq!(summary.reason, TerminalReason::DurationElapsed);
        assert_eq!(summary.failures, 4);
        assert!(summary.any_saved());
        assert_eq!(summary.severity(), Severity::Warning);
        assert_eq!(h.alerts.last().unwrap().1, Severity::Warning);
    }

    #[test]
    fn failure_at_deadline_is_reported_as_failure() {
        let mut h = Harness::new(Span::seconds(1), every(1));
        h.config.retry.max_attempts = 1;
        h.config.frame_interval = Span::millis(500);
        // reads at 0.0s and 0.5s succeed, the read at 1.0s fails
        let camera = FakeCamera::healthy().with_script(&[true, true, false]);

        let summary = h.run(camera);

        assert_eq!(summary.reason, TerminalReason::TooManyFailures);
        assert_eq!(summary.finished, at(2024, 6, 3, 14, 0, 1));
    }

    #[test]
    fn camera_not_live_never_captures() {
        let h = Harness::new(Span::minutes(3), every(20));
        let mut camera = FakeCamera::healthy();
        camera.live = false;
        let probe = camera.probe.clone();

        let summary = h.run(camera);

        assert_eq!(summary.reason, TerminalReason::CameraUnavailable);
        assert_eq!(probe.opens.get(), 1);
        assert_eq!(probe.reads.get(), 0);
        assert_eq!(probe.releases.get(), 1);
        assert_eq!(h.alerts.last().unwrap().1, Severity::Error);
    }

    #[test]
    fn camera_open_error_is_unavailable() {
        let h = Harness::new(Span::minutes(3), every(20));
        let mut camera = FakeCamera::healthy();
        camera.open_ok = false;
        let probe = camera.probe.clone();

        let summary = h.run(camera);

        assert_eq!(summary.reason, TerminalReason::CameraUnavailable);
        assert_eq!(probe.reads.get(), 0);
        assert_eq!(probe.releases.get(), 1);
    }

    #[test]
    fn directory_error_releases_unopened_camera() {
        let mut h = Harness::new(Span::minutes(3), every(20));
        let blocker = h.config.output_dir.join("blocker");
        std::fs::write(&blocker, b"file").unwrap();
        h.config.output_dir = blocker;
        let camera = FakeCamera::healthy();
        let probe = camera.probe.clone();

        let summary = h.run(camera);

        assert_eq!(summary.reason, TerminalReason::DirectoryError);
        assert!(summary.directory.is_none());
        assert_eq!(probe.opens.get(), 0);
        assert_eq!(probe.releases.get(), 1);
        assert_eq!(h.alerts.last().unwrap().1, Severity::Error);
    }

    #[test]
    fn target_count_stops_early() {
        let h = Harness::new(
            Span::minutes(3),
            Cadence::TargetCount {
                target_count: 4,
                stop_at_target: true,
            },
        );
        let camera = FakeCamera::healthy();
        let probe = camera.probe.clone();

        let summary = h.run(camera);

        assert_eq!(summary.reason, TerminalReason::TargetReached);
        assert_eq!(summary.photos_saved, 4);
        // 180s / 5 = 36s per still
        assert_eq!(summary.finished, at(2024, 6, 3, 14, 2, 24));
        assert_eq!(probe.releases.get(), 1);
    }

    #[test]
    fn target_count_without_hard_stop_runs_to_deadline() {
        let h = Harness::new(
            Span::minutes(3),
            Cadence::TargetCount {
                target_count: 4,
                stop_at_target: false,
            },
        );

        let summary = h.run(FakeCamera::healthy());

        assert_eq!(summary.reason, TerminalReason::DurationElapsed);
        assert_eq!(summary.photos_saved, 5);
    }

    #[test]
    fn dead_link_detected_by_probe() {
        let mut h = Harness::new(Span::minutes(3), every(20));
        h.config.retry = RetryPolicy {
            max_attempts: 10,
            backoff: Backoff::Fixed(Span::seconds(1)),
            probe_after: Some(3),
        };
        let mut camera = FakeCamera::failing();
        camera.dies_after_reads = Some(2);
        let probe = camera.probe.clone();

        let summary = h.run(camera);

        assert_eq!(summary.reason, TerminalReason::ConnectionLost);
        assert_eq!(summary.failures, 3);
        assert_eq!(probe.releases.get(), 1);
        // two backoff pauses between the three failed reads
        assert_eq!(summary.finished, at(2024, 6, 3, 14, 0, 2));
    }

    #[test]
    fn video_records_every_good_frame() {
        let mut h = Harness::new(Span::seconds(1), every(1));
        h.config.features = Features::PhotosAndVideo;
        h.config.frame_interval = Span::millis(250);
        let camera = FakeCamera::healthy().with_script(&[true, false, true, true, true]);

        let summary = h.run(camera);

        assert_eq!(summary.reason, TerminalReason::DurationElapsed);
        let log = h.video.log.borrow();
        assert_eq!(log.frames, 4);
        assert_eq!(log.finished, 1);
        let created = h.video.created.borrow();
        assert_eq!(created.len(), 1);
        assert!(created[0].ends_with("2024_06_03_2pm_video.mp4"));
    }

    #[test]
    fn video_failure_keeps_photos_going() {
        let mut h = Harness::new(Span::seconds(60), every(20));
        h.config.features = Features::PhotosAndVideo;
        h.video.log.borrow_mut().fail_after = Some(2);

        let summary = h.run(FakeCamera::healthy());

        assert_eq!(summary.reason, TerminalReason::DurationElapsed);
        assert_eq!(summary.photos_saved, 3);
        assert_eq!(h.video.log.borrow().frames, 2);
    }

    #[test]
    fn photos_only_never_opens_video() {
        let h = Harness::new(Span::seconds(60), every(20));
        h.run(FakeCamera::healthy());
        assert!(h.video.created.borrow().is_empty());
    }
}
