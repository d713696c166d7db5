//! Run-to-completion driver
//!
//! The controller reports per-step failures and leaves the policy to its caller.
//! [`SweepRunner`] is that caller for unattended runs: it steps until `done()`, tolerates
//! isolated write/read failures, and gives up after a run of consecutive ones.

use crate::error::{ErrorKind, SweepResult};
use crate::sink::SampleSink;
use crate::sweep::controller::SweepController;
use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tracing::{error, info, warn};

/// Default number of back-to-back failed steps tolerated.
pub const DEFAULT_MAX_CONSECUTIVE_FAILURES: u32 = 3;

/// Outcome of one run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunSummary {
    /// Steps taken, failed ones included
    pub steps: u64,
    /// Steps whose write or read failed
    pub failures: u64,
    /// Stopped after too many consecutive failures
    pub aborted: bool,
    /// Stopped by the stop signal
    pub cancelled: bool,
}

impl RunSummary {
    /// Whether the sweep reached its stop value.
    pub fn completed(&self) -> bool {
        !self.aborted && !self.cancelled
    }
}

/// Steps a controller until it is done.
#[derive(Debug)]
pub struct SweepRunner {
    max_consecutive_failures: u32,
    stop: Option<watch::Receiver<bool>>,
}

impl Default for SweepRunner {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_CONSECUTIVE_FAILURES)
    }
}

impl SweepRunner {
    /// Runner that aborts after `max_consecutive_failures` failed steps in a row.
    pub fn new(max_consecutive_failures: u32) -> Self {
        Self {
            max_consecutive_failures: max_consecutive_failures.max(1),
            stop: None,
        }
    }

    /// Stop between steps once `stop` turns `true`.
    pub fn with_stop_signal(mut self, stop: watch::Receiver<bool>) -> Self {
        self.stop = Some(stop);
        self
    }

    fn stop_requested(&self) -> bool {
        self.stop.as_ref().map(|rx| *rx.borrow()).unwrap_or(false)
    }

    /// Step until `done()`, an abort, or a stop request.
    ///
    /// # Errors
    /// `NotConnected` and `Sink` end the run immediately; step-level write/read
    /// failures are counted instead.
    pub async fn run(
        &self,
        controller: &mut SweepController,
        sink: &mut dyn SampleSink,
    ) -> SweepResult<RunSummary> {
        let mut summary = RunSummary::default();
        let mut consecutive = 0u32;

        info!(
            estimated_steps = controller.estimated_steps(),
            max_consecutive_failures = self.max_consecutive_failures,
            "sweep run started"
        );

        while !controller.done() {
            if self.stop_requested() {
                warn!(steps = summary.steps, "sweep run cancelled");
                summary.cancelled = true;
                break;
            }

            match controller.step_and_acquire(sink).await {
                Ok(_) => {
                    summary.steps += 1;
                    consecutive = 0;
                }
                Err(e) if matches!(e.kind(), ErrorKind::WriteFailed | ErrorKind::ReadFailed) => {
                    summary.steps += 1;
                    summary.failures += 1;
                    consecutive += 1;
                    if consecutive >= self.max_consecutive_failures {
                        error!(
                            step = controller.state().step_number,
                            consecutive,
                            "aborting sweep after consecutive failures"
                        );
                        summary.aborted = true;
                        break;
                    }
                }
                Err(e) => {
                    error!(error = %e, "sweep run stopped");
                    return Err(e);
                }
            }
        }

        info!(
            steps = summary.steps,
            failures = summary.failures,
            aborted = summary.aborted,
            cancelled = summary.cancelled,
            "sweep run finished"
        );
        Ok(summary)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hardware::mock::{DeviceModel, SimulatedBench};
    use crate::sink::MemorySink;
    use crate::sweep::config::{OperatingMode, SweepConfiguration};

    fn controller(bench: &SimulatedBench) -> SweepController {
        let config = SweepConfiguration {
            start: 0.0,
            stop: 1.0,
            coarse_step: 0.1,
            fine_step: 0.05,
            window: 0.0,
            mode: OperatingMode::Test,
            ..Default::default()
        };
        SweepController::new(Box::new(bench.source()), Box::new(bench.meter()), config).unwrap()
    }

    #[tokio::test(start_paused = true)]
    async fn runs_to_completion() {
        let bench = SimulatedBench::new(DeviceModel::Linear { gain: 1.0 });
        let mut ctl = controller(&bench);
        let mut sink = MemorySink::new();

        let summary = SweepRunner::default().run(&mut ctl, &mut sink).await.unwrap();
        assert!(summary.completed());
        assert_eq!(summary.steps, 12);
        assert_eq!(summary.failures, 0);
        assert!(ctl.done());
    }

    #[tokio::test(start_paused = true)]
    async fn isolated_failure_is_tolerated() {
        let bench = SimulatedBench::new(DeviceModel::Linear { gain: 1.0 });
        bench.fail_read_on(4);
        let mut ctl = controller(&bench);
        let mut sink = MemorySink::new();

        let summary = SweepRunner::new(2).run(&mut ctl, &mut sink).await.unwrap();
        assert!(summary.completed());
        assert_eq!(summary.failures, 1);
        assert_eq!(sink.samples().iter().filter(|s| !s.is_valid()).count(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn aborts_after_consecutive_failures() {
        let bench = SimulatedBench::new(DeviceModel::Linear { gain: 1.0 });
        // Step 3 fails its write; step 4 fails the third read.
        bench.fail_write_on(3);
        bench.fail_read_on(3);
        let mut ctl = controller(&bench);
        let mut sink = MemorySink::new();

        let summary = SweepRunner::new(2).run(&mut ctl, &mut sink).await.unwrap();
        assert!(summary.aborted);
        assert_eq!(summary.steps, 4);
        assert_eq!(summary.failures, 2);
        assert!(!ctl.done());
    }

    #[tokio::test(start_paused = true)]
    async fn disconnected_meter_ends_run_with_error() {
        let bench = SimulatedBench::new(DeviceModel::Linear { gain: 1.0 });
        let mut ctl = controller(&bench);
        let mut sink = MemorySink::new();
        ctl.step_and_acquire(&mut sink).await.unwrap();
        bench.disconnect_meter();

        let err = SweepRunner::new(1).run(&mut ctl, &mut sink).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::NotConnected);
    }

    #[tokio::test(start_paused = true)]
    async fn stop_signal_cancels_between_steps() {
        let bench = SimulatedBench::new(DeviceModel::Linear { gain: 1.0 });
        let mut ctl = controller(&bench);
        let mut sink = MemorySink::new();
        let (tx, rx) = watch::channel(false);
        tx.send(true).unwrap();

        let summary = SweepRunner::default()
            .with_stop_signal(rx)
            .run(&mut ctl, &mut sink)
            .await
            .unwrap();
        assert!(summary.cancelled);
        assert_eq!(summary.steps, 0);
    }
}
