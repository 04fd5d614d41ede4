//! Protocol runner.
//!
//! Executes a [`Protocol`] as a background task against either the physical
//! device or the simulator. The task is the only caller of the device during
//! a run; the handle methods only flip signals.
//!
//! # Suspension
//!
//! Waits count down in slices of `tick`, so a pause, cancel or device fault
//! is noticed within one tick. Ask steps block until [`ProtocolRunner::acknowledge`]
//! with no timeout. A pause taken during a wait resumes from the remaining time.
//!
//! # Exit paths
//!
//! A cancelled or faulted run always ends with the safety action (zero every
//! set point, close every valve) before the final state is published. After a
//! device fault the runner falls back to simulation until
//! [`ProtocolRunner::set_simulation`] selects the device again.
//!
//! # Example
//!
//! ```rust,ignore
//! let runner = ProtocolRunner::new(Some(controller), simulator, &config.runner);
//! let mut events = runner.subscribe();
//! runner.start(Protocol::load("demos/protocol.toml")?)?;
//! while let Ok(event) = events.recv().await {
//!     if let RunnerEvent::Finished(summary) = event {
//!         println!("{}", summary.state);
//!         break;
//!     }
//! }
//! ```

use super::interpreter::{interpret, Step};
use super::protocol::{next_after_loop, Expansion, Instruction, Protocol};
use super::state::{RunSummary, RunnerState};
use crate::config::RunnerConfig;
use crate::error::{AppResult, Ppc1Error};
use crate::hardware::device::Ppc1Device;
use crate::hardware::simulated::SimulatedPpc1;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, watch, Notify};
use tokio::task::JoinHandle;
use tokio::time::sleep;
use tracing::{debug, info, info_span, warn, Instrument};
use uuid::Uuid;

/// Progress of the current run.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct RunProgress {
    /// 0..=100, never decreasing within a run.
    pub percent: f64,
    /// Wait time elapsed so far.
    pub elapsed: Duration,
    /// Time left in the current wait step.
    pub remaining_step: Duration,
    /// Wait time left in the protocol.
    pub remaining_total: Duration,
}

/// Notifications published while a protocol runs.
#[derive(Debug, Clone)]
pub enum RunnerEvent {
    StateChanged(RunnerState),
    StepStarted {
        index: usize,
        instruction: Instruction,
    },
    Progress(RunProgress),
    /// An ask step is waiting for [`ProtocolRunner::acknowledge`].
    Ask { index: usize, text: String },
    Status(String),
    /// The device refused a step; the run continued.
    CommandRejected { index: usize, reason: String },
    Fault(String),
    Finished(RunSummary),
}

struct Reporter {
    state: watch::Sender<RunnerState>,
    events: broadcast::Sender<RunnerEvent>,
}

impl Reporter {
    fn state(&self) -> RunnerState {
        *self.state.borrow()
    }

    /// Publish `to`. Only the run task and `start` call this.
    fn transition(&self, to: RunnerState) {
        let changed = self.state.send_if_modified(|state| {
            if *state == to {
                return false;
            }
            *state = to;
            true
        });
        if changed {
            debug!(state = %to, "Runner state changed");
            self.emit(RunnerEvent::StateChanged(to));
        }
    }

    fn emit(&self, event: RunnerEvent) {
        // No subscribers is not an error.
        let _ = self.events.send(event);
    }
}

#[derive(Default)]
struct RunSignals {
    pause: AtomicBool,
    cancel: AtomicBool,
    /// Set by the first acknowledge of the pending ask.
    acked: AtomicBool,
    ack: Notify,
}

struct ActiveRun {
    signals: Arc<RunSignals>,
    handle: JoinHandle<RunSummary>,
}

enum Interrupt {
    Cancelled,
    Faulted(String),
}

/// Runs protocols on the physical device or the simulator.
pub struct ProtocolRunner {
    physical: Option<Arc<dyn Ppc1Device>>,
    simulator: Arc<SimulatedPpc1>,
    simulation: Arc<AtomicBool>,
    tick: Duration,
    reporter: Arc<Reporter>,
    active: std::sync::Mutex<Option<ActiveRun>>,
}

impl ProtocolRunner {
    /// Without a physical device the runner is locked to simulation.
    pub fn new(
        physical: Option<Arc<dyn Ppc1Device>>,
        simulator: Arc<SimulatedPpc1>,
        config: &RunnerConfig,
    ) -> Self {
        let simulation = config.simulation || physical.is_none();
        let (events, _) = broadcast::channel(config.event_capacity.max(1));
        Self {
            physical,
            simulator,
            simulation: Arc::new(AtomicBool::new(simulation)),
            tick: config.tick().max(Duration::from_millis(1)),
            reporter: Arc::new(Reporter {
                state: watch::Sender::new(RunnerState::Idle),
                events,
            }),
            active: std::sync::Mutex::new(None),
        }
    }

    pub fn state(&self) -> RunnerState {
        self.reporter.state()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<RunnerEvent> {
        self.reporter.events.subscribe()
    }

    pub fn subscribe_state(&self) -> watch::Receiver<RunnerState> {
        self.reporter.state.subscribe()
    }

    pub fn is_simulation(&self) -> bool {
        self.simulation.load(Ordering::SeqCst)
    }

    /// Switch between simulation and the physical device between runs.
    pub fn set_simulation(&self, enabled: bool) -> AppResult<()> {
        let state = self.state();
        if !state.can_start() {
            return Err(Ppc1Error::InvalidState(format!(
                "cannot change simulation mode while {state}"
            )));
        }
        if !enabled && self.physical.is_none() {
            return Err(Ppc1Error::InvalidState(
                "no physical device attached".into(),
            ));
        }
        self.simulation.store(enabled, Ordering::SeqCst);
        info!(simulation = enabled, "Runner mode changed");
        Ok(())
    }

    /// Validate `protocol` and start executing it. Returns the run id.
    pub fn start(&self, protocol: Protocol) -> AppResult<Uuid> {
        let state = self.state();
        if !state.can_start() {
            return Err(Ppc1Error::InvalidState(format!(
                "cannot start a protocol while {state}"
            )));
        }
        protocol.validate()?;
        let expansion = protocol.expand()?;

        let simulation = self.is_simulation();
        let device: Arc<dyn Ppc1Device> = match (&self.physical, simulation) {
            (Some(physical), false) => Arc::clone(physical),
            _ => Arc::clone(&self.simulator) as Arc<dyn Ppc1Device>,
        };

        let signals = Arc::new(RunSignals::default());
        let summary = RunSummary::new(protocol.name.clone(), simulation);
        let run_id = summary.run_id;
        let span = info_span!("protocol", run_id = %run_id, name = %protocol.name);

        let execution = Execution {
            device,
            protocol,
            expansion,
            simulation,
            mode: Arc::clone(&self.simulation),
            tick: self.tick,
            signals: Arc::clone(&signals),
            reporter: Arc::clone(&self.reporter),
            summary,
            elapsed_wait: Duration::ZERO,
            percent: 0.0,
        };

        self.reporter.transition(RunnerState::Running);
        let handle = tokio::spawn(execution.run().instrument(span));
        if let Ok(mut guard) = self.active.lock() {
            *guard = Some(ActiveRun { signals, handle });
        }
        Ok(run_id)
    }

    fn signals(&self) -> Option<Arc<RunSignals>> {
        let guard = self.active.lock().ok()?;
        guard.as_ref().map(|run| Arc::clone(&run.signals))
    }

    /// Request a pause. The run task parks and reports `Paused` at its next
    /// checkpoint; a pending ask step is still answered first.
    pub fn pause(&self) -> AppResult<()> {
        let signals = self.signals().ok_or_else(|| self.refuse("pause"))?;
        if !self.state().can_pause() || signals.pause.swap(true, Ordering::SeqCst) {
            return Err(self.refuse("pause"));
        }
        info!("Protocol pause requested");
        Ok(())
    }

    /// Withdraw a pause request. Waits continue with their remaining time.
    pub fn resume(&self) -> AppResult<()> {
        let signals = self.signals().ok_or_else(|| self.refuse("resume"))?;
        if !self.state().can_cancel() || !signals.pause.swap(false, Ordering::SeqCst) {
            return Err(self.refuse("resume"));
        }
        info!("Protocol resumed");
        Ok(())
    }

    /// Release the pending ask step.
    pub fn acknowledge(&self) -> AppResult<()> {
        let signals = self.signals().ok_or_else(|| self.refuse("acknowledge"))?;
        if self.state() != RunnerState::AwaitingAck || signals.acked.swap(true, Ordering::SeqCst)
        {
            return Err(self.refuse("acknowledge"));
        }
        signals.ack.notify_one();
        Ok(())
    }

    /// Request cancellation. The run ends within one tick.
    pub fn cancel(&self) -> AppResult<()> {
        let state = self.state();
        let signals = self.signals().ok_or_else(|| self.refuse("cancel"))?;
        if !state.can_cancel() {
            return Err(self.refuse("cancel"));
        }
        signals.cancel.store(true, Ordering::SeqCst);
        info!(from = %state, "Protocol cancel requested");
        Ok(())
    }

    /// Wait for the current run to finish.
    pub async fn join(&self) -> Option<RunSummary> {
        let run = self.active.lock().ok().and_then(|mut guard| guard.take())?;
        match run.handle.await {
            Ok(summary) => Some(summary),
            Err(e) => {
                warn!(error = %e, "Protocol task ended abnormally");
                None
            }
        }
    }

    /// Cancel if running and wait for the task.
    pub async fn stop(&self) -> Option<RunSummary> {
        if self.state().can_cancel() {
            if let Err(e) = self.cancel() {
                debug!(error = %e, "Cancel during stop");
            }
        }
        self.join().await
    }

    fn refuse(&self, action: &str) -> Ppc1Error {
        Ppc1Error::InvalidState(format!("cannot {action} while {}", self.state()))
    }
}

/// State owned by the run task.
struct Execution {
    device: Arc<dyn Ppc1Device>,
    protocol: Protocol,
    expansion: Expansion,
    simulation: bool,
    /// Runner-wide mode flag, flipped to simulation after a device fault.
    mode: Arc<AtomicBool>,
    tick: Duration,
    signals: Arc<RunSignals>,
    reporter: Arc<Reporter>,
    summary: RunSummary,
    elapsed_wait: Duration,
    percent: f64,
}

impl Execution {
    async fn run(mut self) -> RunSummary {
        info!(
            steps = self.expansion.steps,
            wait = ?self.expansion.wait,
            simulation = self.simulation,
            "Protocol started"
        );
        self.report_progress(Duration::ZERO, false);

        let (state, error) = match self.execute().await {
            Ok(()) => {
                self.report_progress(Duration::ZERO, true);
                (RunnerState::Completed, None)
            }
            Err(Interrupt::Cancelled) => {
                self.safety_action().await;
                (RunnerState::Cancelled, None)
            }
            Err(Interrupt::Faulted(reason)) => {
                warn!(reason = %reason, "Protocol aborted by device fault");
                self.reporter.emit(RunnerEvent::Fault(reason.clone()));
                self.safety_action().await;
                if !self.simulation {
                    self.mode.store(true, Ordering::SeqCst);
                    warn!("Runner switched to simulation after device fault");
                }
                (RunnerState::Faulted, Some(reason))
            }
        };

        self.summary.finish(state, error);
        info!(
            state = %state,
            steps = self.summary.steps_executed,
            rejected = self.summary.steps_rejected,
            "Protocol finished"
        );
        self.reporter.transition(state);
        self.reporter
            .emit(RunnerEvent::Finished(self.summary.clone()));
        self.summary
    }

    async fn execute(&mut self) -> Result<(), Interrupt> {
        let mut counters: HashMap<usize, u32> = HashMap::new();
        let mut pc = 0;

        while let Some(command) = self.protocol.commands().get(pc).cloned() {
            let index = pc;
            self.checkpoint().await?;
            self.reporter.emit(RunnerEvent::StepStarted {
                index,
                instruction: command.instruction.clone(),
            });
            if let Some(message) = &command.message {
                self.reporter.emit(RunnerEvent::Status(message.clone()));
            }
            debug!(index, step = %command.instruction, "Executing");

            pc = match interpret(self.device.as_ref(), &command.instruction).await {
                Ok(step) => self.follow(step, index, &mut counters).await?,
                Err(e) if e.is_validation() => {
                    warn!(index, error = %e, "Step rejected, continuing");
                    self.summary.steps_rejected += 1;
                    self.reporter.emit(RunnerEvent::CommandRejected {
                        index,
                        reason: e.to_string(),
                    });
                    index + 1
                }
                Err(e) => {
                    return Err(Interrupt::Faulted(format!(
                        "step {} ({}) failed: {e}",
                        index, command.instruction
                    )))
                }
            };
            self.summary.steps_executed += 1;
            self.report_progress(Duration::ZERO, false);
        }
        Ok(())
    }

    /// Carry out a control step and return the next position.
    async fn follow(
        &mut self,
        step: Step,
        index: usize,
        counters: &mut HashMap<usize, u32>,
    ) -> Result<usize, Interrupt> {
        match step {
            Step::Continue => {}
            Step::Wait(duration) => self.wait(duration).await?,
            Step::AwaitAck(text) => self.await_ack(index, text).await?,
            Step::Status(text) => {
                info!(text = %text, "Protocol status");
                self.reporter.emit(RunnerEvent::Status(text));
            }
            Step::Loop { start, count } => {
                return Ok(next_after_loop(counters, index, start, count));
            }
            Step::WaitSync if self.simulation => debug!("Sync input assumed high in simulation"),
            Step::WaitSync => self.wait_sync().await?,
        }
        Ok(index + 1)
    }

    fn check_interrupts(&self) -> Result<(), Interrupt> {
        if self.signals.cancel.load(Ordering::SeqCst) {
            return Err(Interrupt::Cancelled);
        }
        if let Some(fault) = self.device.fault() {
            return Err(Interrupt::Faulted(fault.to_string()));
        }
        Ok(())
    }

    /// Honour cancel, fault and pause before the next slice of work.
    async fn checkpoint(&self) -> Result<(), Interrupt> {
        self.check_interrupts()?;
        if self.signals.pause.load(Ordering::SeqCst) {
            self.reporter.transition(RunnerState::Paused);
            info!("Protocol paused");
            while self.signals.pause.load(Ordering::SeqCst) {
                sleep(self.tick).await;
                self.check_interrupts()?;
            }
            self.reporter.transition(RunnerState::Running);
        }
        Ok(())
    }

    async fn wait(&mut self, duration: Duration) -> Result<(), Interrupt> {
        let mut remaining = duration;
        self.report_progress(remaining, false);
        while !remaining.is_zero() {
            self.checkpoint().await?;
            let slice = remaining.min(self.tick);
            sleep(slice).await;
            remaining -= slice;
            self.elapsed_wait += slice;
            self.report_progress(remaining, false);
        }
        Ok(())
    }

    async fn await_ack(&mut self, index: usize, text: String) -> Result<(), Interrupt> {
        self.checkpoint().await?;
        self.signals.acked.store(false, Ordering::SeqCst);
        self.reporter.transition(RunnerState::AwaitingAck);
        info!(index, text = %text, "Waiting for operator");
        self.reporter.emit(RunnerEvent::Ask { index, text });
        loop {
            tokio::select! {
                _ = self.signals.ack.notified() => break,
                _ = sleep(self.tick) => self.check_interrupts()?,
            }
        }
        self.check_interrupts()?;
        self.reporter.transition(RunnerState::Running);
        Ok(())
    }

    async fn wait_sync(&self) -> Result<(), Interrupt> {
        info!("Waiting for sync input");
        while !self.device.sync_input().await {
            sleep(self.tick).await;
            self.checkpoint().await?;
        }
        Ok(())
    }

    fn report_progress(&mut self, remaining_step: Duration, done: bool) {
        let total = self.expansion.wait;
        let raw = if done {
            100.0
        } else if !total.is_zero() {
            100.0 * self.elapsed_wait.as_secs_f64() / total.as_secs_f64()
        } else if self.expansion.steps > 0 {
            100.0 * self.summary.steps_executed as f64 / self.expansion.steps as f64
        } else {
            100.0
        };
        self.percent = self.percent.max(raw.min(100.0));
        self.reporter.emit(RunnerEvent::Progress(RunProgress {
            percent: self.percent,
            elapsed: self.elapsed_wait,
            remaining_step,
            remaining_total: total.saturating_sub(self.elapsed_wait),
        }));
    }

    async fn safety_action(&self) {
        match self.device.pumping_off().await {
            Ok(()) => info!("Safety action applied: set points zeroed, valves closed"),
            Err(e) => warn!(error = %e, "Safety action incomplete"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hardware::telemetry::Channel;
    use tracing_test::traced_test;

    fn runner() -> (ProtocolRunner, Arc<SimulatedPpc1>) {
        let simulator = Arc::new(SimulatedPpc1::default());
        let runner = ProtocolRunner::new(None, Arc::clone(&simulator), &RunnerConfig::default());
        (runner, simulator)
    }

    #[tokio::test]
    async fn without_physical_device_simulation_is_forced() {
        let (runner, _) = runner();
        assert!(runner.is_simulation());
        assert!(runner.set_simulation(false).is_err());
    }

    #[tokio::test]
    async fn controls_are_refused_when_idle() {
        let (runner, _) = runner();
        assert!(runner.pause().is_err());
        assert!(runner.resume().is_err());
        assert!(runner.acknowledge().is_err());
        assert!(runner.cancel().is_err());
        assert!(runner.join().await.is_none());
    }

    #[tokio::test]
    async fn runs_instant_protocol_to_completion() {
        let (runner, simulator) = runner();
        let protocol = Protocol::from_instructions(
            "instant",
            [
                Instruction::SetChannel {
                    channel: Channel::D,
                    value: 50.0,
                },
                Instruction::StatusMessage {
                    text: "done".into(),
                },
            ],
        );
        runner.start(protocol).unwrap();
        let summary = runner.join().await.unwrap();

        assert_eq!(summary.state, RunnerState::Completed);
        assert_eq!(summary.steps_executed, 2);
        assert_eq!(runner.state(), RunnerState::Completed);
        assert_eq!(simulator.setpoints().await.get(Channel::D), 50.0);
    }

    #[tokio::test]
    #[traced_test]
    async fn rejected_step_is_logged_and_skipped() {
        let (runner, simulator) = runner();
        let protocol = Protocol::from_instructions(
            "rejected",
            [
                Instruction::SetChannel {
                    channel: Channel::A,
                    value: 20.0,
                },
                Instruction::PumpsOff,
            ],
        );
        runner.start(protocol).unwrap();
        let summary = runner.join().await.unwrap();

        assert_eq!(summary.state, RunnerState::Completed);
        assert_eq!(summary.steps_rejected, 1);
        assert_eq!(simulator.journal().await.len(), 5);
        assert!(logs_contain("Step rejected, continuing"));
    }

    #[tokio::test]
    async fn invalid_protocol_does_not_start() {
        let (runner, _) = runner();
        let protocol = Protocol::from_instructions(
            "bad",
            [Instruction::Loop { start: 3, count: 1 }],
        );
        assert!(runner.start(protocol).is_err());
        assert_eq!(runner.state(), RunnerState::Idle);
    }
}
