use crate::alert::AlertSink;
use crate::capture::{CameraAddress, CameraSource};
use crate::clock::Clock;
use crate::config::Config;
use crate::output::VideoBackend;
use crate::routine::{CaptureRoutine, RoutineConfig, RunSummary};
use crate::scheduler::{Routine, SchedulerContext};
use anyhow::Result;
use std::sync::Arc;

/// Builds an unopened camera source for an address
pub type Connector<'a> = dyn Fn(&CameraAddress) -> Box<dyn CameraSource> + 'a;

/// Collaborators shared by every capture run
#[derive(Clone, Copy)]
pub struct CaptureDeps<'a> {
    pub clock: &'a dyn Clock,
    pub alerts: &'a dyn AlertSink,
    pub video: &'a dyn VideoBackend,
    pub connect: &'a Connector<'a>,
}

/// Scheduler job that runs one capture routine per firing
pub struct CaptureJob<'a> {
    config: &'a RoutineConfig,
    address: &'a CameraAddress,
    deps: CaptureDeps<'a>,
}

impl<'a> CaptureJob<'a> {
    pub fn new(config: &'a RoutineConfig, address: &'a CameraAddress, deps: CaptureDeps<'a>) -> Self {
        Self {
            config,
            address,
            deps,
        }
    }

    pub fn run_once(&self) -> RunSummary {
        let source = (self.deps.connect)(self.address);
        CaptureRoutine::new(self.config, self.deps.clock, self.deps.alerts, self.deps.video).run(source)
    }
}

impl Routine for CaptureJob<'_> {
    fn invoke(&mut self) -> Result<()> {
        let summary = self.run_once();
        tracing::debug!(
            photos = summary.photos_saved,
            failures = summary.failures,
            reason = %summary.reason,
            "Capture job finished"
        );
        Ok(())
    }
}

/// One capture job per configured trigger, in configuration order
pub fn build_scheduler<'a>(
    config: &'a Config,
    address: &'a CameraAddress,
    alerts: Arc<dyn AlertSink>,
    deps: CaptureDeps<'a>,
) -> Result<SchedulerContext<'a>> {
    let mut ctx = SchedulerContext::new(alerts);
    for trigger in config.triggers()? {
        ctx.register(trigger, CaptureJob::new(&config.routine, address, deps));
    }
    Ok(ctx)
}
