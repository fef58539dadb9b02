//! Per-run lifecycle controller.
//!
//! Drives one run from submission to its terminal state: picks the backend,
//! walks the state machine, enforces the timeout, reacts to cancellation,
//! records output, and hands the finished record to the notifier. The
//! record and the event channel are updated under the same lock, so every
//! subscriber sees a consistent prefix of the run's history.

use crate::backend::{ExecutionBackend, LocalBackend, ProcessExit, RemoteBackend};
use crate::notify::Dispatcher;
use crate::ssh::SshManager;
use chrono::Utc;
use futures_util::stream::Stream;
use simrun_core::{
    Config, FailureReason, OutputLine, Outcome, RecordLimits, RunDescriptor, RunEvent, RunId,
    RunRecord, RunState, RunSummary, Target,
};
use std::collections::VecDeque;
use std::sync::{Arc, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::time::Duration;
use tokio::sync::{broadcast, watch};
use tokio::time::{timeout, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Live events buffered per run before slow subscribers start lagging.
const EVENT_BUFFER: usize = 1024;

#[derive(Debug, Clone, Copy)]
pub struct RunLimits {
    pub record: RecordLimits,
    pub io_capture_timeout: Duration,
    pub heartbeat: Duration,
}

impl RunLimits {
    pub fn from_config(config: &Config) -> Self {
        Self {
            record: config.record_limits(),
            io_capture_timeout: config.io_capture_timeout(),
            heartbeat: config.heartbeat_interval(),
        }
    }
}

/// Everything a run needs to execute, shared by all runs.
#[derive(Debug)]
pub struct ExecutionContext {
    pub local: LocalBackend,
    pub remote: RemoteBackend,
    pub dispatcher: Dispatcher,
    pub limits: RunLimits,
}

impl ExecutionContext {
    pub fn new(config: &Config, ssh: Arc<SshManager>, dispatcher: Dispatcher) -> Self {
        let grace = config.cancel_grace();
        Self {
            local: LocalBackend::new(grace),
            remote: RemoteBackend::new(ssh, grace),
            dispatcher,
            limits: RunLimits::from_config(config),
        }
    }

    pub fn backend_for<'a>(&'a self, target: &'a Target) -> ExecutionBackend<'a> {
        match target {
            Target::Local => ExecutionBackend::Local(&self.local),
            Target::Remote(remote) => ExecutionBackend::Remote(&self.remote, remote),
        }
    }
}

/// Result of a cancel request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CancelOutcome {
    /// Termination was requested; the run will end `Cancelled` unless it
    /// completes on its own first.
    Requested,
    /// The run had already reached this terminal state.
    AlreadyCompleted(RunState),
}

/// Why the controller asked a process to stop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum StopCause {
    Cancelled,
    TimedOut,
}

#[derive(Debug)]
pub struct RunController {
    id: RunId,
    descriptor: RunDescriptor,
    record: RwLock<RunRecord>,
    events: broadcast::Sender<RunEvent>,
    cancel: CancellationToken,
    finished: watch::Sender<bool>,
}

impl RunController {
    pub fn new(id: RunId, descriptor: RunDescriptor, limits: RecordLimits) -> Self {
        let record = RunRecord::new(id.clone(), descriptor.clone(), limits, Utc::now());
        let (events, _) = broadcast::channel(EVENT_BUFFER);
        let (finished, _) = watch::channel(false);
        Self {
            id,
            descriptor,
            record: RwLock::new(record),
            events,
            cancel: CancellationToken::new(),
            finished,
        }
    }

    pub fn id(&self) -> &RunId {
        &self.id
    }

    fn read(&self) -> RwLockReadGuard<'_, RunRecord> {
        self.record.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> RwLockWriteGuard<'_, RunRecord> {
        self.record.write().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn snapshot(&self) -> RunRecord {
        self.read().clone()
    }

    pub fn summary(&self) -> RunSummary {
        self.read().summary()
    }

    pub fn state(&self) -> RunState {
        self.read().state
    }

    /// Ask the run to stop. Idempotent; a no-op once the run is terminal.
    pub fn request_cancel(&self) -> CancelOutcome {
        // Decided under the write lock so a concurrent terminal commit is
        // either fully before or fully after this request.
        let record = self.write();
        if record.is_terminal() {
            return CancelOutcome::AlreadyCompleted(record.state);
        }
        if !self.cancel.is_cancelled() {
            info!(run_id = %self.id, state = %record.state, "cancellation requested");
            self.cancel.cancel();
        }
        CancelOutcome::Requested
    }

    /// Lazy, finite event sequence: the buffered output tail and the current
    /// state, then live events up to and including the terminal state.
    pub fn subscribe(self: &Arc<Self>) -> Subscription {
        // Snapshot and receiver are taken under the read lock; publishers hold
        // the write lock, so nothing falls between them.
        let record = self.read();
        let mut backlog: VecDeque<RunEvent> = record
            .output_tail
            .iter()
            .map(|line| RunEvent::Output {
                run_id: self.id.clone(),
                line: line.clone(),
            })
            .collect();
        backlog.push_back(state_event(&record));
        let live = (!record.is_terminal()).then(|| self.events.subscribe());
        Subscription {
            backlog,
            live,
            done: false,
            source: Arc::clone(self),
            history_floor: record.history.len().saturating_sub(1),
            delivered: Vec::new(),
        }
    }

    /// Wait until the run is terminal and its notifications have been sent.
    pub async fn wait(&self) -> RunRecord {
        let mut finished = self.finished.subscribe();
        if finished.wait_for(|done| *done).await.is_err() {
            debug!(run_id = %self.id, "controller dropped while waiting");
        }
        self.snapshot()
    }

    pub fn is_finished(&self) -> bool {
        *self.finished.borrow()
    }

    /// Drive the run to completion. Spawned once per run by the registry.
    pub async fn run(self: Arc<Self>, ctx: Arc<ExecutionContext>) {
        let outcome = self.execute(&ctx).await;
        if self.commit(outcome) {
            let record = self.snapshot();
            info!(
                run_id = %self.id,
                state = %record.state,
                exit_code = ?record.exit_code,
                cause = ?record.failure_reason.as_ref().map(FailureReason::describe),
                "run finished"
            );
            let warnings = ctx.dispatcher.dispatch(&record).await;
            if !warnings.is_empty() {
                self.write().warnings.extend(warnings);
            }
        }
        self.finished.send_replace(true);
    }

    async fn execute(&self, ctx: &ExecutionContext) -> Outcome {
        if self.cancel.is_cancelled() {
            info!(run_id = %self.id, "run cancelled before start");
            return Outcome::Cancelled;
        }

        let backend = ctx.backend_for(&self.descriptor.target);
        if backend.connects_first() {
            self.advance(RunState::Connecting);
        }

        let started = tokio::select! {
            biased;
            () = self.cancel.cancelled() => {
                info!(run_id = %self.id, "run cancelled before the process started");
                return Outcome::Cancelled;
            }
            result = backend.start(&self.descriptor) => result,
        };
        let mut process = match started {
            Ok(process) => process,
            Err(err) => {
                warn!(run_id = %self.id, error = %err, "run could not be started");
                return Outcome::Errored {
                    reason: err.failure_reason(),
                };
            }
        };

        self.advance(RunState::Running);
        debug!(run_id = %self.id, pid = ?process.pid(), "process started");

        let started_at = Instant::now();
        let deadline = self.descriptor.timeout().map(|t| started_at + t);
        let mut output = process.take_output();
        let terminate = process.terminator();
        let exit = process.wait();
        tokio::pin!(exit);

        let mut stop: Option<StopCause> = None;
        let exit = loop {
            tokio::select! {
                biased;
                exit = &mut exit => break exit,
                () = self.cancel.cancelled(), if stop.is_none() => {
                    info!(run_id = %self.id, "terminating process for cancellation");
                    stop = Some(StopCause::Cancelled);
                    terminate.cancel();
                }
                () = sleep_until(deadline), if stop.is_none() => {
                    warn!(
                        run_id = %self.id,
                        timeout_ms = self.descriptor.timeout_ms,
                        "run exceeded its time limit; terminating process"
                    );
                    stop = Some(StopCause::TimedOut);
                    terminate.cancel();
                }
                line = next_line(&mut output) => match line {
                    Some(line) => self.record_output(line),
                    None => output = None,
                },
                () = tokio::time::sleep(ctx.limits.heartbeat) => {
                    info!(
                        run_id = %self.id,
                        elapsed_sec = started_at.elapsed().as_secs(),
                        "run still running"
                    );
                }
            }
        };

        // Pipes normally close with the process; a lingering grandchild can
        // hold them open, so draining is bounded.
        if let Some(mut stream) = output {
            let drain = async {
                while let Some(line) = stream.next().await {
                    self.record_output(line);
                }
            };
            if timeout(ctx.limits.io_capture_timeout, drain).await.is_err() {
                warn!(run_id = %self.id, "output capture timed out after process exit");
            }
        }

        self.outcome_for(exit, stop)
    }

    fn outcome_for(&self, exit: ProcessExit, stop: Option<StopCause>) -> Outcome {
        match (exit, stop) {
            (ProcessExit::Exited(0), _) => Outcome::Succeeded,
            (ProcessExit::Exited(code), _) => Outcome::Failed {
                exit_code: code,
                reason: FailureReason::ExitCode { code },
            },
            (ProcessExit::Terminated { code, .. }, Some(StopCause::TimedOut)) => Outcome::Failed {
                exit_code: code,
                reason: FailureReason::Timeout {
                    limit_ms: self.descriptor.timeout_ms.unwrap_or_default(),
                },
            },
            (ProcessExit::Terminated { forced, .. }, _) => {
                if forced {
                    warn!(run_id = %self.id, "process did not stop within the grace period; killed");
                }
                Outcome::Cancelled
            }
            (ProcessExit::Lost(message), _) => Outcome::Errored {
                reason: FailureReason::Transport { message },
            },
        }
    }

    /// Non-terminal transition, published to subscribers.
    fn advance(&self, next: RunState) -> bool {
        let mut record = self.write();
        let from = record.state;
        match record.transition(next, Utc::now()) {
            Ok(()) => {
                info!(run_id = %self.id, from = %from, to = %next, "run state changed");
                // No receivers is fine.
                let _ = self.events.send(state_event(&record));
                true
            }
            Err(err) => {
                warn!(run_id = %self.id, error = %err, "rejected state transition");
                false
            }
        }
    }

    /// Commit the terminal outcome. Returns false if one was already committed.
    fn commit(&self, outcome: Outcome) -> bool {
        let mut record = self.write();
        let from = record.state;
        let to = outcome.state();
        match record.finish(outcome, Utc::now()) {
            Ok(()) => {
                info!(run_id = %self.id, from = %from, to = %to, "run state changed");
                let _ = self.events.send(state_event(&record));
                true
            }
            Err(err) => {
                warn!(run_id = %self.id, error = %err, "rejected terminal state");
                false
            }
        }
    }

    fn record_output(&self, line: OutputLine) {
        let mut record = self.write();
        if record.push_output(line.clone()) {
            debug!(run_id = %self.id, line = %line.text, "error marker matched");
        }
        let _ = self.events.send(RunEvent::Output {
            run_id: self.id.clone(),
            line,
        });
    }
}

fn state_event(record: &RunRecord) -> RunEvent {
    RunEvent::StateChanged {
        run_id: record.id.clone(),
        state: record.state,
        at: record.history.last().map_or_else(Utc::now, |t| t.at),
        exit_code: record.exit_code,
        reason: record.failure_reason.clone(),
    }
}

async fn next_line(output: &mut Option<crate::backend::OutputStream>) -> Option<OutputLine> {
    match output {
        Some(stream) => stream.next().await,
        None => std::future::pending().await,
    }
}

async fn sleep_until(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}

/// A run's event sequence. Ends after the terminal state event.
///
/// Output lines can be lost when the subscriber falls behind the live
/// buffer; state changes lost that way are rebuilt from the run history.
#[derive(Debug)]
pub struct Subscription {
    backlog: VecDeque<RunEvent>,
    live: Option<broadcast::Receiver<RunEvent>>,
    done: bool,
    source: Arc<RunController>,
    /// History index of the state this subscription started at.
    history_floor: usize,
    /// States already yielded. A run never enters a state twice.
    delivered: Vec<RunState>,
}

impl Subscription {
    pub async fn next(&mut self) -> Option<RunEvent> {
        loop {
            if self.done {
                return None;
            }
            if let Some(event) = self.backlog.pop_front() {
                if let Some(event) = self.deliver(event) {
                    return Some(event);
                }
                continue;
            }
            let Some(live) = self.live.as_mut() else {
                self.done = true;
                return None;
            };
            match live.recv().await {
                Ok(event) => {
                    if let Some(event) = self.deliver(event) {
                        return Some(event);
                    }
                }
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    debug!(run_id = %self.source.id, skipped, "subscriber lagged behind run events");
                    self.recover_states();
                }
                Err(broadcast::error::RecvError::Closed) => {
                    self.done = true;
                    return None;
                }
            }
        }
    }

    /// Drops state events already yielded and marks the end of the sequence.
    fn deliver(&mut self, event: RunEvent) -> Option<RunEvent> {
        if let Some(state) = event.state() {
            if self.delivered.contains(&state) {
                return None;
            }
            self.delivered.push(state);
            self.done = state.is_terminal();
        }
        Some(event)
    }

    /// Queue the non-terminal states that were dropped from the live buffer.
    /// The terminal event is the last one published, so it is never dropped.
    fn recover_states(&mut self) {
        let record = self.source.read();
        for transition in record.history.iter().skip(self.history_floor) {
            if transition.state.is_terminal() || self.delivered.contains(&transition.state) {
                continue;
            }
            self.backlog.push_back(RunEvent::StateChanged {
                run_id: self.source.id.clone(),
                state: transition.state,
                at: transition.at,
                exit_code: None,
                reason: None,
            });
        }
    }

    pub fn into_stream(self) -> impl Stream<Item = RunEvent> + Send {
        futures_util::stream::unfold(self, |mut sub| async move {
            sub.next().await.map(|event| (event, sub))
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use simrun_core::ExecutableSpec;

    #[test]
    fn subscription_after_terminal_replays_and_ends() {
        let descriptor = RunDescriptor::local(ExecutableSpec::new("echo", ["hi"]), "/tmp");
        let controller = Arc::new(RunController::new(RunId::new(), descriptor, RecordLimits::default()));
        controller.advance(RunState::Running);
        controller.record_output(OutputLine::stdout("hi"));
        assert!(controller.commit(Outcome::Succeeded));
        assert!(!controller.commit(Outcome::Cancelled));

        let rt = tokio::runtime::Builder::new_current_thread().build().unwrap();
        let events = rt.block_on(async {
            let mut sub = controller.subscribe();
            let mut events = Vec::new();
            while let Some(event) = sub.next().await {
                events.push(event);
            }
            events
        });
        assert_eq!(events.len(), 2);
        assert_eq!(events[0].kind(), "output");
        assert_eq!(events[1].state(), Some(RunState::Succeeded));
    }

    #[tokio::test]
    async fn lagging_subscriber_still_sees_every_state() {
        let descriptor = RunDescriptor::local(ExecutableSpec::new("yes", ["spam"]), "/tmp");
        let controller = Arc::new(RunController::new(RunId::new(), descriptor, RecordLimits::default()));
        let mut sub = controller.subscribe();

        controller.advance(RunState::Running);
        for n in 0..EVENT_BUFFER * 2 {
            controller.record_output(OutputLine::stdout(format!("line {n}")));
        }
        assert!(controller.commit(Outcome::Succeeded));

        let mut states = Vec::new();
        let mut lines = 0;
        while let Some(event) = sub.next().await {
            match event.state() {
                Some(state) => states.push(state),
                None => lines += 1,
            }
        }
        assert_eq!(states, vec![RunState::Pending, RunState::Running, RunState::Succeeded]);
        assert!(lines > 0 && lines < EVENT_BUFFER * 2);
    }

    #[test]
    fn cancel_racing_commit_is_consistent() {
        for _ in 0..100 {
            let descriptor = RunDescriptor::local(ExecutableSpec::new("echo", ["hi"]), "/tmp");
            let controller = Arc::new(RunController::new(RunId::new(), descriptor, RecordLimits::default()));
            controller.advance(RunState::Running);

            let committer = {
                let controller = Arc::clone(&controller);
                std::thread::spawn(move || controller.commit(Outcome::Succeeded))
            };
            let early = controller.request_cancel();
            assert!(committer.join().unwrap());

            // Requested only if the token was set before the commit.
            match early {
                CancelOutcome::Requested => assert!(controller.cancel.is_cancelled()),
                CancelOutcome::AlreadyCompleted(state) => {
                    assert_eq!(state, RunState::Succeeded);
                    assert!(!controller.cancel.is_cancelled());
                }
            }
            assert_eq!(
                controller.request_cancel(),
                CancelOutcome::AlreadyCompleted(RunState::Succeeded)
            );
        }
    }

    #[test]
    fn late_cancel_reports_completion() {
        let descriptor = RunDescriptor::local(ExecutableSpec::new("echo", ["hi"]), "/tmp");
        let controller = RunController::new(RunId::new(), descriptor, RecordLimits::default());
        assert_eq!(controller.request_cancel(), CancelOutcome::Requested);
        assert_eq!(controller.request_cancel(), CancelOutcome::Requested);
        controller.commit(Outcome::Cancelled);
        assert_eq!(
            controller.request_cancel(),
            CancelOutcome::AlreadyCompleted(RunState::Cancelled)
        );
    }

    #[test]
    fn timeout_outcome_keeps_exit_status() {
        let descriptor = RunDescriptor::local(ExecutableSpec::new("sleep", ["10"]), "/tmp")
            .with_timeout(Duration::from_millis(100));
        let controller = RunController::new(RunId::new(), descriptor, RecordLimits::default());
        let outcome = controller.outcome_for(
            ProcessExit::Terminated {
                code: 143,
                forced: false,
            },
            Some(StopCause::TimedOut),
        );
        assert_eq!(
            outcome,
            Outcome::Failed {
                exit_code: 143,
                reason: FailureReason::Timeout { limit_ms: 100 }
            }
        );
        assert_eq!(
            controller.outcome_for(ProcessExit::Exited(0), Some(StopCause::Cancelled)),
            Outcome::Succeeded
        );
        assert_eq!(
            controller.outcome_for(
                ProcessExit::Terminated { code: 137, forced: true },
                Some(StopCause::Cancelled)
            ),
            Outcome::Cancelled
        );
    }
}
