use crate::config::PipelineRunnerConfig;
use crate::error::EngineError;
use crate::pipeline::{DownstreamLink, PipelineReplicaId, SharedPipelineReplica, Supervisor};
use std::sync::{Arc, Condvar, Mutex};
use std::thread::{Builder, JoinHandle};
use std::time::Duration;
use tracing::{error, info, warn};

/// Externally observable state of a pipeline replica runner.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum RunnerStatus {
    Initial,
    Running,
    Paused,
    Completed,
}

impl RunnerStatus {
    fn name(&self) -> &'static str {
        match self {
            RunnerStatus::Initial => "initial",
            RunnerStatus::Running => "running",
            RunnerStatus::Paused => "paused",
            RunnerStatus::Completed => "completed",
        }
    }
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
enum CommandKind {
    Pause,
    Resume,
    Stop,
}

impl CommandKind {
    fn name(&self) -> &'static str {
        match self {
            CommandKind::Pause => "pause",
            CommandKind::Resume => "resume",
            CommandKind::Stop => "stop",
        }
    }
}

#[derive(Debug, Default)]
struct FutureInner {
    completed: bool,
    error: Option<EngineError>,
}

#[derive(Debug, Default)]
struct FutureState {
    inner: Mutex<FutureInner>,
    cv: Condvar,
}

/// Completion handle of a runner command. Completes successfully once the
/// runner acted on the command, or exceptionally if the command became
/// invalid (e.g. the runner completed first).
#[derive(Clone, Debug, Default)]
pub struct CommandFuture(Arc<FutureState>);

impl CommandFuture {
    fn new() -> Self {
        Self::default()
    }

    /// An already-completed future, for no-op commands.
    fn ready() -> Self {
        let future = Self::new();
        future.complete(Ok(()));
        future
    }

    fn complete(&self, result: Result<(), EngineError>) {
        let mut inner = self.0.inner.lock().unwrap();
        if inner.completed {
            return;
        }
        inner.completed = true;
        inner.error = result.err();
        self.0.cv.notify_all();
    }

    /// Blocks until the command completes. The error, if any, is handed to
    /// the first waiter.
    pub fn wait(&self) -> Result<(), EngineError> {
        let mut inner = self.0.inner.lock().unwrap();
        while !inner.completed {
            inner = self.0.cv.wait(inner).unwrap();
        }
        match inner.error.take() {
            Some(error) => Err(error),
            None => Ok(()),
        }
    }
}

#[derive(Debug)]
struct RunnerState {
    status: RunnerStatus,
    /// Single command slot: one command in flight at a time. Conflicting
    /// commands fail the caller's request instead of queuing.
    command: Option<(CommandKind, CommandFuture)>,
}

#[derive(Debug)]
struct RunnerShared {
    state: Mutex<RunnerState>,
    cv: Condvar,
}

/// Control-side handle to a pipeline replica runner.
#[derive(Clone, Debug)]
pub struct RunnerHandle {
    replica: PipelineReplicaId,
    shared: Arc<RunnerShared>,
}

impl RunnerHandle {
    pub fn status(&self) -> RunnerStatus {
        self.shared.state.lock().unwrap().status
    }

    pub fn pause(&self) -> Result<CommandFuture, EngineError> {
        let mut state = self.shared.state.lock().unwrap();
        match state.status {
            RunnerStatus::Paused => {
                info!(replica = %self.replica, "already paused, completing pause immediately");
                Ok(CommandFuture::ready())
            }
            RunnerStatus::Running => match &state.command {
                Some((CommandKind::Pause, future)) => {
                    info!(replica = %self.replica, "joining pending pause command");
                    Ok(future.clone())
                }
                Some((pending, _)) => Err(EngineError::CommandConflict {
                    replica: self.replica.to_string(),
                    requested: "pause",
                    pending: pending.name(),
                }),
                None => {
                    let future = CommandFuture::new();
                    state.command = Some((CommandKind::Pause, future.clone()));
                    Ok(future)
                }
            },
            status => Err(EngineError::IllegalCommand {
                replica: self.replica.to_string(),
                requested: "pause",
                status: status.name(),
            }),
        }
    }

    pub fn resume(&self) -> Result<CommandFuture, EngineError> {
        let mut state = self.shared.state.lock().unwrap();
        match state.status {
            RunnerStatus::Running => {
                info!(replica = %self.replica, "already running, completing resume immediately");
                Ok(CommandFuture::ready())
            }
            RunnerStatus::Paused => match &state.command {
                Some((CommandKind::Resume, future)) => {
                    let future = future.clone();
                    self.shared.cv.notify_all();
                    Ok(future)
                }
                Some((pending, _)) => Err(EngineError::CommandConflict {
                    replica: self.replica.to_string(),
                    requested: "resume",
                    pending: pending.name(),
                }),
                None => {
                    let future = CommandFuture::new();
                    state.command = Some((CommandKind::Resume, future.clone()));
                    self.shared.cv.notify_all();
                    Ok(future)
                }
            },
            status => Err(EngineError::IllegalCommand {
                replica: self.replica.to_string(),
                requested: "resume",
                status: status.name(),
            }),
        }
    }

    pub fn stop(&self) -> Result<CommandFuture, EngineError> {
        let mut state = self.shared.state.lock().unwrap();
        match state.status {
            RunnerStatus::Running | RunnerStatus::Paused => match state.command.take() {
                None => {
                    let future = CommandFuture::new();
                    state.command = Some((CommandKind::Stop, future.clone()));
                    self.shared.cv.notify_all();
                    Ok(future)
                }
                Some((CommandKind::Pause | CommandKind::Resume, future)) => {
                    // The pending command is upgraded; its future completes
                    // when the stop does.
                    info!(replica = %self.replica, "overwriting pending command with stop");
                    state.command = Some((CommandKind::Stop, future.clone()));
                    self.shared.cv.notify_all();
                    Ok(future)
                }
                Some((CommandKind::Stop, future)) => {
                    state.command = Some((CommandKind::Stop, future));
                    Err(EngineError::CommandConflict {
                        replica: self.replica.to_string(),
                        requested: "stop",
                        pending: "stop",
                    })
                }
            },
            RunnerStatus::Completed => Ok(CommandFuture::ready()),
            RunnerStatus::Initial => Err(EngineError::IllegalCommand {
                replica: self.replica.to_string(),
                requested: "stop",
                status: "initial",
            }),
        }
    }
}

/// The thread loop driving one pipeline replica: observes commands, invokes
/// the pipeline, forwards output downstream, and reacts to completion.
pub struct PipelineReplicaRunner {
    id: PipelineReplicaId,
    pipeline: SharedPipelineReplica,
    downstream: DownstreamLink,
    supervisor: Arc<dyn Supervisor>,
    shared: Arc<RunnerShared>,
    wait_timeout: Duration,
    downstream_active: bool,
    completed_notified: bool,
}

impl PipelineReplicaRunner {
    pub fn new(
        pipeline: SharedPipelineReplica,
        downstream: DownstreamLink,
        supervisor: Arc<dyn Supervisor>,
        config: &PipelineRunnerConfig,
    ) -> (Self, RunnerHandle) {
        let id = pipeline.lock().expect("replica lock").id().clone();
        let shared = Arc::new(RunnerShared {
            state: Mutex::new(RunnerState {
                status: RunnerStatus::Initial,
                command: None,
            }),
            cv: Condvar::new(),
        });
        let handle = RunnerHandle {
            replica: id.clone(),
            shared: Arc::clone(&shared),
        };
        let runner = Self {
            id,
            pipeline,
            downstream,
            supervisor,
            shared,
            wait_timeout: config.wait_timeout(),
            downstream_active: true,
            completed_notified: false,
        };
        (runner, handle)
    }

    /// Runs the loop on a dedicated named thread.
    pub fn spawn(self) -> std::io::Result<JoinHandle<()>> {
        let name = self.id.thread_name();
        Builder::new().name(name).spawn(move || self.run())
    }

    pub fn run(mut self) {
        let replica_id = self.id.clone();
        {
            let mut state = self.shared.state.lock().unwrap();
            assert_eq!(
                state.status,
                RunnerStatus::Initial,
                "{replica_id}: runner started twice"
            );
            state.status = RunnerStatus::Running;
        }
        info!(replica = %replica_id, "runner started");

        match self.run_loop(&replica_id) {
            Ok(()) => info!(replica = %replica_id, "completed the run"),
            Err(cause) => {
                error!(replica = %replica_id, %cause, "run terminated abnormally");
                self.supervisor.notify_replica_failed(&replica_id, &cause);
                let mut state = self.shared.state.lock().unwrap();
                state.status = RunnerStatus::Completed;
                if let Some((kind, future)) = state.command.take() {
                    future.complete(Err(EngineError::AbnormalTermination {
                        replica: replica_id.to_string(),
                        reason: format!("{} aborted by runner failure", kind.name()),
                    }));
                }
            }
        }
    }

    fn run_loop(&mut self, replica_id: &PipelineReplicaId) -> Result<(), EngineError> {
        loop {
            match self.check_status() {
                RunnerStatus::Paused => {
                    // The replica lock is free while paused, so the control
                    // thread may restructure the region.
                    self.downstream.await_pending()?;
                    let state = self.shared.state.lock().unwrap();
                    if state.status == RunnerStatus::Paused && state.command.is_none() {
                        let _ = self.shared.cv.wait_timeout(state, self.wait_timeout).unwrap();
                    }
                }
                RunnerStatus::Completed => {
                    // Stop command noticed: final forced drain-and-flush so
                    // no buffered tuple remains.
                    info!(replica = %replica_id, "stop command noticed");
                    loop {
                        let output = {
                            let mut pipeline = self.pipeline.lock().expect("replica lock");
                            pipeline.begin_completion();
                            if pipeline.is_completed() {
                                break;
                            }
                            pipeline.invoke()?
                        };
                        if let Some(output) = output {
                            self.forward(output)?;
                        }
                    }
                    self.complete_run(replica_id, true);
                    return Ok(());
                }
                RunnerStatus::Running => {
                    let (output, completed, tail_completed) = {
                        let mut pipeline = self.pipeline.lock().expect("replica lock");
                        if let Some(upstream) = self.supervisor.upstream_context(
                            replica_id,
                            pipeline.operator(0).upstream_version(),
                        ) {
                            pipeline.refresh_upstream(&upstream);
                        }
                        let output = pipeline.invoke()?;
                        (output, pipeline.is_completed(), pipeline.tail_completed())
                    };
                    if let Some(output) = output {
                        self.forward(output)?;
                    }
                    if completed {
                        self.complete_run(replica_id, false);
                        return Ok(());
                    }
                    if self.downstream_active && tail_completed {
                        self.stop_downstream(replica_id)?;
                    }
                }
                RunnerStatus::Initial => unreachable!("runner loop before start"),
            }
        }
    }

    /// Applies a pending command, completing its future, and returns the
    /// effective status for this iteration.
    fn check_status(&self) -> RunnerStatus {
        let mut state = self.shared.state.lock().unwrap();
        let Some((kind, future)) = state.command.clone() else {
            return state.status;
        };
        match kind {
            CommandKind::Stop => {
                // The command is completed when the run actually stops.
                RunnerStatus::Completed
            }
            CommandKind::Pause => {
                if state.status == RunnerStatus::Running {
                    info!("pausing");
                    future.complete(Ok(()));
                    state.command = None;
                    state.status = RunnerStatus::Paused;
                } else {
                    warn!(status = state.status.name(), "dropping pause command");
                    future.complete(Err(EngineError::IllegalCommand {
                        replica: self.id.to_string(),
                        requested: "pause",
                        status: state.status.name(),
                    }));
                    state.command = None;
                }
                state.status
            }
            CommandKind::Resume => {
                if state.status == RunnerStatus::Paused {
                    info!("resuming");
                    future.complete(Ok(()));
                    state.command = None;
                    state.status = RunnerStatus::Running;
                } else {
                    warn!(status = state.status.name(), "dropping resume command");
                    future.complete(Err(EngineError::IllegalCommand {
                        replica: self.id.to_string(),
                        requested: "resume",
                        status: state.status.name(),
                    }));
                    state.command = None;
                }
                state.status
            }
        }
    }

    fn forward(&mut self, output: sluice_api::TupleBatch) -> Result<(), EngineError> {
        self.downstream.forward(output)
    }

    /// Stops producing downstream output after the pipeline's tail
    /// completed: flush, notify the supervisor once, and substitute the
    /// fail-fast link state for any late send attempt.
    fn stop_downstream(&mut self, replica_id: &PipelineReplicaId) -> Result<(), EngineError> {
        info!(replica = %replica_id, "stopping downstream sender");
        self.downstream.shutdown()?;
        self.supervisor.notify_stopped_sending_downstream(replica_id);
        self.downstream_active = false;
        Ok(())
    }

    fn complete_run(&mut self, replica_id: &PipelineReplicaId, stopped_by_command: bool) {
        if let Err(cause) = self.downstream.shutdown() {
            warn!(replica = %replica_id, %cause, "downstream flush failed while completing");
        }

        if !stopped_by_command {
            debug_assert!(
                !self.completed_notified,
                "{replica_id}: duplicate completion notification"
            );
            if !self.completed_notified {
                self.supervisor.notify_replica_completed(replica_id);
                self.completed_notified = true;
            }
        }

        let mut state = self.shared.state.lock().unwrap();
        state.status = RunnerStatus::Completed;
        if let Some((kind, future)) = state.command.take() {
            match kind {
                CommandKind::Stop => future.complete(Ok(())),
                CommandKind::Pause | CommandKind::Resume => {
                    future.complete(Err(EngineError::IllegalCommand {
                        replica: replica_id.to_string(),
                        requested: kind.name(),
                        status: "completed",
                    }))
                }
            }
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn handle(status: RunnerStatus) -> RunnerHandle {
        RunnerHandle {
            replica: PipelineReplicaId::new(crate::pipeline::PipelineId::new(1, 0), 0),
            shared: Arc::new(RunnerShared {
                state: Mutex::new(RunnerState {
                    status,
                    command: None,
                }),
                cv: Condvar::new(),
            }),
        }
    }

    #[test]
    fn commands_fail_before_start() {
        let handle = handle(RunnerStatus::Initial);
        assert!(matches!(
            handle.pause(),
            Err(EngineError::IllegalCommand { .. })
        ));
        assert!(matches!(
            handle.resume(),
            Err(EngineError::IllegalCommand { .. })
        ));
        assert!(matches!(
            handle.stop(),
            Err(EngineError::IllegalCommand { .. })
        ));
    }

    #[test]
    fn pause_while_paused_is_noop_success() {
        let handle = handle(RunnerStatus::Paused);
        handle.pause().unwrap().wait().unwrap();
    }

    #[test]
    fn conflicting_commands_fail_the_caller() {
        let handle = handle(RunnerStatus::Running);
        let _stop = handle.stop().unwrap();
        assert!(matches!(
            handle.pause(),
            Err(EngineError::CommandConflict { .. })
        ));
        assert!(matches!(
            handle.stop(),
            Err(EngineError::CommandConflict { .. })
        ));
    }

    #[test]
    fn stop_upgrades_pending_pause() {
        let handle = handle(RunnerStatus::Running);
        let pause_future = handle.pause().unwrap();
        let stop_future = handle.stop().unwrap();
        // Both callers wait on the same completion.
        stop_future.complete(Ok(()));
        pause_future.wait().unwrap();
    }

    #[test]
    fn stop_after_completion_is_noop_success() {
        let handle = handle(RunnerStatus::Completed);
        handle.stop().unwrap().wait().unwrap();
    }

    #[test]
    fn pause_and_resume_fail_after_completion() {
        let handle = handle(RunnerStatus::Completed);
        assert!(matches!(
            handle.pause(),
            Err(EngineError::IllegalCommand { .. })
        ));
        assert!(matches!(
            handle.resume(),
            Err(EngineError::IllegalCommand { .. })
        ));
    }
}
