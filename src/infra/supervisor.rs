use crate::domain::{
    DEFAULT_SNAPSHOT_INTERVAL, LineBuffer, OutputStream, ProgressSnapshot, RateEstimator, Session,
    SessionEvent, SessionFailure, SessionId, SessionOutcome, SessionReport, SessionSpec,
    SessionState, SnapshotThrottle, format_duration, parse_progress,
};
use crate::infra::AuditLog;
use std::io::{self, Read};
use std::process::{Child, Command, ExitStatus, Stdio};
use std::sync::mpsc::{Receiver, RecvTimeoutError, Sender, channel};
use std::sync::{Arc, Mutex, PoisonError};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};
use thiserror::Error;
use tracing::{debug, info, warn};

pub const DEFAULT_CANCEL_GRACE: Duration = Duration::from_secs(3);

const READ_CHUNK_BYTES: usize = 16_384;
const EXIT_POLL_INTERVAL: Duration = Duration::from_millis(100);
// How long output pipes may stay open after the direct child has exited (a grandchild can hold
// them) before the session is finalized anyway.
const PIPE_DRAIN_GRACE: Duration = Duration::from_secs(2);
const ENV_TAG: &str = "ENV";

#[derive(Clone, Debug)]
pub struct SupervisorConfig {
    pub audit_log: Option<AuditLog>,
    pub cancel_grace: Duration,
    pub snapshot_interval: Duration,
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        Self {
            audit_log: None,
            cancel_grace: DEFAULT_CANCEL_GRACE,
            snapshot_interval: DEFAULT_SNAPSHOT_INTERVAL,
        }
    }
}

#[derive(Debug, Error)]
pub enum SupervisorError {
    #[error("a {tag} session is already {state}; cancel it first")]
    Busy { tag: String, state: &'static str },
}

enum WorkerMsg {
    Line(OutputStream, String),
    Closed(OutputStream),
    Cancel,
}

struct ActiveRun {
    session: Session,
    control: Sender<WorkerMsg>,
}

type ActiveSlot = Arc<Mutex<Option<ActiveRun>>>;

/// Runs at most one external process at a time and reports everything it does as
/// [`SessionEvent`]s on `events`.
///
/// Each session gets its own worker thread, which is the only writer of that session's progress
/// state and audit records. Events are converted with `E::from`, so callers can merge them into a
/// wider message type.
pub struct ProcessSupervisor<E> {
    config: SupervisorConfig,
    events: Sender<E>,
    active: ActiveSlot,
    worker: Option<JoinHandle<()>>,
}

impl<E> ProcessSupervisor<E>
where
    E: From<SessionEvent> + Send + 'static,
{
    pub fn new(config: SupervisorConfig, events: Sender<E>) -> Self {
        Self {
            config,
            events,
            active: Arc::new(Mutex::new(None)),
            worker: None,
        }
    }

    /// Starts `spec` unless a session is already active.
    ///
    /// Spawning happens on the worker thread; a program that cannot be started is reported as a
    /// `Failed` state change, not as an error here.
    pub fn start(&mut self, spec: SessionSpec) -> Result<Session, SupervisorError> {
        let mut slot = self.active.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(run) = slot.as_ref() {
            return Err(SupervisorError::Busy {
                tag: run.session.tag.clone(),
                state: run.session.state.label(),
            });
        }

        // The previous worker has already released the slot and is at most delivering its final
        // event.
        if let Some(handle) = self.worker.take() {
            let _ = handle.join();
        }

        let session = Session {
            id: SessionId::new(),
            tag: spec.tag.clone(),
            state: SessionState::Starting,
            started_at: Instant::now(),
        };
        let (control_tx, control_rx) = channel::<WorkerMsg>();
        *slot = Some(ActiveRun {
            session: session.clone(),
            control: control_tx.clone(),
        });
        emit(
            &self.events,
            SessionEvent::StateChanged {
                session: session.id,
                tag: session.tag.clone(),
                state: SessionState::Starting,
                report: None,
            },
        );
        drop(slot);

        let worker = Worker {
            spec,
            session: session.clone(),
            config: self.config.clone(),
            events: self.events.clone(),
            active: Arc::clone(&self.active),
            control_tx,
            control_rx,
        };
        let spawned = std::thread::Builder::new()
            .name(format!("session-{}", session.id.short()))
            .spawn(move || worker.run());
        match spawned {
            Ok(handle) => self.worker = Some(handle),
            Err(error) => {
                warn!(session = %session.id, %error, "failed to start session worker");
                release_slot(&self.active, session.id);
                let outcome = SessionOutcome::Failed(SessionFailure::SpawnFailed {
                    message: format!("failed to start worker thread: {error}"),
                });
                emit(
                    &self.events,
                    SessionEvent::StateChanged {
                        session: session.id,
                        tag: session.tag.clone(),
                        state: outcome.state(),
                        report: Some(SessionReport {
                            outcome,
                            elapsed: session.started_at.elapsed(),
                            last_progress: None,
                        }),
                    },
                );
            }
        }
        Ok(session)
    }

    /// Requests termination of `id`. Returns `false` (and does nothing) when `id` is not the
    /// active session, including when it has already reached a terminal state.
    pub fn cancel(&self, id: SessionId) -> bool {
        let slot = self.active.lock().unwrap_or_else(PoisonError::into_inner);
        match slot.as_ref() {
            Some(run) if run.session.id == id => run.control.send(WorkerMsg::Cancel).is_ok(),
            _ => false,
        }
    }

    pub fn cancel_active(&self) -> bool {
        let slot = self.active.lock().unwrap_or_else(PoisonError::into_inner);
        match slot.as_ref() {
            Some(run) => run.control.send(WorkerMsg::Cancel).is_ok(),
            None => false,
        }
    }

    pub fn active_session(&self) -> Option<Session> {
        let slot = self.active.lock().unwrap_or_else(PoisonError::into_inner);
        slot.as_ref().map(|run| run.session.clone())
    }

    pub fn is_busy(&self) -> bool {
        self.active_session().is_some()
    }

    /// Cancels the active session, if any, and waits for its worker to finish.
    pub fn shutdown(&mut self) {
        self.cancel_active();
        if let Some(handle) = self.worker.take() {
            let _ = handle.join();
        }
    }
}

impl<E> Drop for ProcessSupervisor<E> {
    fn drop(&mut self) {
        {
            let slot = self.active.lock().unwrap_or_else(PoisonError::into_inner);
            if let Some(run) = slot.as_ref() {
                let _ = run.control.send(WorkerMsg::Cancel);
            }
        }
        if let Some(handle) = self.worker.take() {
            let _ = handle.join();
        }
    }
}

fn emit<E: From<SessionEvent>>(events: &Sender<E>, event: SessionEvent) {
    let _ = events.send(E::from(event));
}

fn release_slot(active: &ActiveSlot, id: SessionId) {
    let mut slot = active.lock().unwrap_or_else(PoisonError::into_inner);
    if slot.as_ref().is_some_and(|run| run.session.id == id) {
        *slot = None;
    }
}

struct Worker<E> {
    spec: SessionSpec,
    session: Session,
    config: SupervisorConfig,
    events: Sender<E>,
    active: ActiveSlot,
    control_tx: Sender<WorkerMsg>,
    control_rx: Receiver<WorkerMsg>,
}

impl<E: From<SessionEvent>> Worker<E> {
    fn run(self) {
        let Worker {
            spec,
            session,
            config,
            events,
            active,
            control_tx,
            control_rx,
        } = self;
        let mut run = RunState::new(&spec, &session, &config, &events);

        run.audit_as(ENV_TAG, &describe_launch(&spec));
        let mut command = build_command(&spec);
        let mut child = match command.spawn() {
            Ok(child) => child,
            Err(error) => {
                warn!(session = %session.id, tag = %spec.tag, %error, "failed to spawn process");
                let outcome = SessionOutcome::Failed(SessionFailure::SpawnFailed {
                    message: format!("{}: {error}", spec.program.display()),
                });
                run.finish(outcome, &active);
                return;
            }
        };
        info!(
            session = %session.id,
            tag = %spec.tag,
            pid = child.id(),
            program = %spec.program.display(),
            "session started"
        );
        run.audit(&format!(
            "started pid={} {}",
            child.id(),
            command_line(&spec)
        ));
        run.estimator.reset(Instant::now());
        run.set_state(SessionState::Running, &active);

        let mut open_streams = 0;
        if let Some(stdout) = child.stdout.take() {
            spawn_reader(stdout, OutputStream::Stdout, control_tx.clone());
            open_streams += 1;
        }
        if let Some(stderr) = child.stderr.take() {
            spawn_reader(stderr, OutputStream::Stderr, control_tx.clone());
            open_streams += 1;
        }
        drop(control_tx);

        let mut kill_at: Option<Instant> = None;
        let mut exit: Option<(ExitStatus, Instant)> = None;
        loop {
            match control_rx.recv_timeout(EXIT_POLL_INTERVAL) {
                Ok(WorkerMsg::Line(stream, line)) => run.handle_line(stream, &line),
                Ok(WorkerMsg::Closed(stream)) => {
                    debug!(session = %session.id, stream = stream.label(), "output closed");
                    open_streams -= 1;
                }
                Ok(WorkerMsg::Cancel) => {
                    if !run.cancel_requested {
                        run.cancel_requested = true;
                        info!(session = %session.id, tag = %spec.tag, "cancel requested");
                        request_termination(&mut child);
                        kill_at = Some(Instant::now() + config.cancel_grace);
                    }
                }
                Err(RecvTimeoutError::Timeout) => {}
                Err(RecvTimeoutError::Disconnected) => break,
            }

            let now = Instant::now();
            if kill_at.is_some_and(|deadline| now >= deadline) {
                warn!(session = %session.id, "process ignored termination; killing");
                force_kill(&mut child);
                kill_at = None;
            }
            if exit.is_none() {
                match child.try_wait() {
                    Ok(Some(status)) => exit = Some((status, now)),
                    Ok(None) => continue,
                    Err(error) => {
                        warn!(session = %session.id, %error, "failed to poll process");
                        break;
                    }
                }
            }
            // Exited: finish once output is drained, or after the grace if a grandchild holds it.
            let Some((_, exited_at)) = exit else {
                continue;
            };
            if open_streams == 0 {
                break;
            }
            if kill_at.is_none() && now.saturating_duration_since(exited_at) >= PIPE_DRAIN_GRACE {
                warn!(session = %session.id, "output still open after exit; finalizing");
                break;
            }
        }

        run.set_state(SessionState::Finishing, &active);
        let status = match exit {
            Some((status, _)) => Ok(status),
            None => child.wait(),
        };
        let outcome = match status {
            _ if run.cancel_requested => SessionOutcome::Cancelled,
            Ok(status) if status.success() => SessionOutcome::Completed,
            Ok(status) => SessionOutcome::Failed(exit_failure(status)),
            Err(error) => {
                warn!(session = %session.id, %error, "failed to wait for process");
                SessionOutcome::Failed(SessionFailure::Exited {
                    code: None,
                    signal: None,
                })
            }
        };
        run.finish(outcome, &active);
    }
}

/// Per-session progress and audit state, owned by the worker thread.
struct RunState<'a, E> {
    spec: &'a SessionSpec,
    session: &'a Session,
    events: &'a Sender<E>,
    audit_log: Option<&'a AuditLog>,
    audit_warned: bool,
    estimator: RateEstimator,
    throttle: SnapshotThrottle,
    last_total: u64,
    last_episode: Option<u64>,
    cancel_requested: bool,
}

impl<'a, E: From<SessionEvent>> RunState<'a, E> {
    fn new(
        spec: &'a SessionSpec,
        session: &'a Session,
        config: &'a SupervisorConfig,
        events: &'a Sender<E>,
    ) -> Self {
        Self {
            spec,
            session,
            events,
            audit_log: config.audit_log.as_ref(),
            audit_warned: false,
            estimator: RateEstimator::new(session.started_at),
            throttle: SnapshotThrottle::new(config.snapshot_interval),
            last_total: spec.expected_total.unwrap_or(0),
            last_episode: None,
            cancel_requested: false,
        }
    }

    fn emit(&self, event: SessionEvent) {
        emit(self.events, event);
    }

    fn audit(&mut self, message: &str) {
        let spec = self.spec;
        self.audit_as(&spec.tag, message);
    }

    fn audit_as(&mut self, tag: &str, message: &str) {
        let Some(log) = self.audit_log else {
            return;
        };
        let Err(error) = log.append(tag, message) else {
            return;
        };
        if self.audit_warned {
            return;
        }
        self.audit_warned = true;
        warn!(session = %self.session.id, %error, "audit log write failed");
        self.emit(SessionEvent::Warning {
            session: self.session.id,
            message: format!("audit log disabled for this session: {error}"),
        });
    }

    fn set_state(&self, state: SessionState, active: &ActiveSlot) {
        {
            let mut slot = active.lock().unwrap_or_else(PoisonError::into_inner);
            if let Some(run) = slot.as_mut() {
                if run.session.id == self.session.id {
                    run.session.state = state;
                }
            }
        }
        self.emit(SessionEvent::StateChanged {
            session: self.session.id,
            tag: self.session.tag.clone(),
            state,
            report: None,
        });
    }

    fn handle_line(&mut self, stream: OutputStream, line: &str) {
        let line = line.trim();
        if line.is_empty() {
            return;
        }
        self.audit(line);

        let Some(reading) = parse_progress(line, self.last_total) else {
            if !self.spec.suppress_raw_log {
                self.emit(SessionEvent::LogLine {
                    session: self.session.id,
                    stream,
                    line: line.to_string(),
                });
            }
            return;
        };

        let now = Instant::now();
        if reading.total > 0 {
            self.last_total = reading.total;
        }
        self.last_episode = Some(reading.current);
        self.estimator.record_sample(reading.current, now);
        let snapshot =
            ProgressSnapshot::capture(reading.current, reading.total, &self.estimator, now);
        if self.throttle.admit(now, snapshot.is_complete()) {
            self.emit(SessionEvent::Progress {
                session: self.session.id,
                snapshot,
            });
        }
    }

    fn final_snapshot(&self) -> Option<ProgressSnapshot> {
        let current = self.last_episode?;
        let total = self.last_total;
        let current = if total > 0 { current.min(total) } else { current };
        Some(ProgressSnapshot {
            current,
            total,
            rate: self.estimator.current_rate(),
            elapsed: self.estimator.elapsed(Instant::now()),
            eta: None,
        })
    }

    fn finish(mut self, outcome: SessionOutcome, active: &ActiveSlot) {
        let elapsed = self.session.started_at.elapsed();
        let last_progress = self.final_snapshot();
        if let Some(snapshot) = &last_progress {
            self.emit(SessionEvent::Progress {
                session: self.session.id,
                snapshot: snapshot.clone(),
            });
        }

        let summary = match &outcome {
            SessionOutcome::Completed => {
                format!("finished: exit code 0, elapsed {}", format_duration(elapsed))
            }
            SessionOutcome::Cancelled => {
                format!("cancelled by user, elapsed {}", format_duration(elapsed))
            }
            SessionOutcome::Failed(SessionFailure::SpawnFailed { message }) => {
                format!("failed to start: {message}")
            }
            SessionOutcome::Failed(SessionFailure::Exited { .. }) => format!(
                "failed: exit code {}, elapsed {}",
                outcome.exit_code(),
                format_duration(elapsed)
            ),
        };
        self.audit(&summary);
        info!(
            session = %self.session.id,
            tag = %self.session.tag,
            exit_code = outcome.exit_code(),
            "session {}",
            outcome.state().label()
        );

        // Free the slot first so a listener reacting to the terminal event can start the next run.
        release_slot(active, self.session.id);
        self.emit(SessionEvent::StateChanged {
            session: self.session.id,
            tag: self.session.tag.clone(),
            state: outcome.state(),
            report: Some(SessionReport {
                outcome,
                elapsed,
                last_progress,
            }),
        });
    }
}

fn build_command(spec: &SessionSpec) -> Command {
    let mut command = Command::new(&spec.program);
    command
        .args(&spec.args)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped());
    if let Some(dir) = &spec.working_dir {
        command.current_dir(dir);
    }
    for (key, value) in spec.env.resolve(|key| std::env::var_os(key)) {
        command.env(key, value);
    }
    #[cfg(unix)]
    {
        use std::os::unix::process::CommandExt;
        command.process_group(0);
    }
    command
}

fn command_line(spec: &SessionSpec) -> String {
    let mut line = spec.program.display().to_string();
    for arg in &spec.args {
        line.push(' ');
        line.push_str(arg);
    }
    line
}

fn describe_launch(spec: &SessionSpec) -> String {
    let cwd = spec
        .working_dir
        .as_ref()
        .map(|dir| dir.display().to_string())
        .unwrap_or_else(|| ".".to_string());
    let mut text = format!(
        "exe={} cwd={cwd} args={}",
        spec.program.display(),
        spec.args.join(" ")
    );
    if !spec.env.is_empty() {
        text.push(' ');
        text.push_str(&spec.env.describe());
    }
    text
}

fn spawn_reader<R>(reader: R, stream: OutputStream, tx: Sender<WorkerMsg>)
where
    R: Read + Send + 'static,
{
    std::thread::spawn(move || pump_stream(reader, stream, tx));
}

fn pump_stream<R: Read>(mut reader: R, stream: OutputStream, tx: Sender<WorkerMsg>) {
    let mut buf = vec![0u8; READ_CHUNK_BYTES];
    let mut lines = LineBuffer::new();
    loop {
        let n = match reader.read(&mut buf) {
            Ok(0) => break,
            Ok(n) => n,
            Err(error) if error.kind() == io::ErrorKind::Interrupted => continue,
            Err(_) => break,
        };
        for line in lines.feed(&buf[..n]) {
            if tx.send(WorkerMsg::Line(stream, line)).is_err() {
                return;
            }
        }
    }
    if let Some(rest) = lines.flush() {
        let _ = tx.send(WorkerMsg::Line(stream, rest));
    }
    let _ = tx.send(WorkerMsg::Closed(stream));
}

#[cfg(unix)]
fn signal_group(child: &Child, signal: libc::c_int) -> io::Result<()> {
    let pgid = child.id() as libc::pid_t;
    let rc = unsafe { libc::kill(-pgid, signal) };
    if rc == 0 {
        Ok(())
    } else {
        Err(io::Error::last_os_error())
    }
}

#[cfg(unix)]
fn request_termination(child: &mut Child) {
    if let Err(error) = signal_group(child, libc::SIGTERM) {
        debug!(%error, "SIGTERM to process group failed");
        let _ = child.kill();
    }
}

#[cfg(unix)]
fn force_kill(child: &mut Child) {
    if let Err(error) = signal_group(child, libc::SIGKILL) {
        debug!(%error, "SIGKILL to process group failed");
        let _ = child.kill();
    }
}

#[cfg(not(unix))]
fn request_termination(child: &mut Child) {
    let _ = child.kill();
}

#[cfg(not(unix))]
fn force_kill(child: &mut Child) {
    let _ = child.kill();
}

fn exit_failure(status: ExitStatus) -> SessionFailure {
    #[cfg(unix)]
    let signal = {
        use std::os::unix::process::ExitStatusExt;
        status.signal()
    };
    #[cfg(not(unix))]
    let signal = None;
    SessionFailure::Exited {
        code: status.code(),
        signal,
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use std::fs;

    const EVENT_TIMEOUT: Duration = Duration::from_secs(15);

    fn shell(tag: &str, script: &str) -> SessionSpec {
        SessionSpec::new(tag, "/bin/sh").arg("-c").arg(script)
    }

    fn supervisor(
        config: SupervisorConfig,
    ) -> (ProcessSupervisor<SessionEvent>, Receiver<SessionEvent>) {
        let (tx, rx) = channel();
        (ProcessSupervisor::new(config, tx), rx)
    }

    fn collect_until_terminal(rx: &Receiver<SessionEvent>) -> Vec<SessionEvent> {
        let mut events = Vec::new();
        loop {
            let event = rx.recv_timeout(EVENT_TIMEOUT).expect("event before timeout");
            let terminal = event.terminal_report().is_some();
            events.push(event);
            if terminal {
                return events;
            }
        }
    }

    fn terminal_outcome(events: &[SessionEvent]) -> SessionOutcome {
        events
            .iter()
            .find_map(|event| event.terminal_report())
            .map(|(_, report)| report.outcome.clone())
            .expect("terminal event")
    }

    fn states(events: &[SessionEvent]) -> Vec<SessionState> {
        events
            .iter()
            .filter_map(|event| match event {
                SessionEvent::StateChanged { state, .. } => Some(*state),
                _ => None,
            })
            .collect()
    }

    #[test]
    fn reports_progress_and_completes() {
        let (mut supervisor, rx) = supervisor(SupervisorConfig::default());
        supervisor
            .start(shell("TRAIN", "echo ep=1; sleep 0.4; echo ep=2; exit 0").expected_total(2))
            .expect("start");
        let events = collect_until_terminal(&rx);

        assert_eq!(
            states(&events),
            vec![
                SessionState::Starting,
                SessionState::Running,
                SessionState::Finishing,
                SessionState::Completed,
            ]
        );
        let currents = events
            .iter()
            .filter_map(|event| match event {
                SessionEvent::Progress { snapshot, .. } => Some(snapshot.current),
                _ => None,
            })
            .collect::<Vec<_>>();
        assert_eq!(currents.first(), Some(&1));
        assert_eq!(currents.last(), Some(&2));

        let completed = events
            .iter()
            .filter_map(|event| event.terminal_report())
            .collect::<Vec<_>>();
        assert_eq!(completed.len(), 1);
        let report = completed[0].1;
        assert_eq!(report.outcome, SessionOutcome::Completed);
        let last = report.last_progress.as_ref().expect("final snapshot");
        assert_eq!((last.current, last.total), (2, 2));
        assert_eq!(last.eta, None);
        assert!(!supervisor.is_busy());
    }

    #[test]
    fn rejects_second_start_without_touching_the_active_session() {
        let (mut supervisor, rx) = supervisor(SupervisorConfig::default());
        let first = supervisor
            .start(shell("TRAIN", "sleep 5"))
            .expect("first start");
        let error = supervisor
            .start(shell("EVAL", "exit 0"))
            .expect_err("second start should be rejected");
        assert!(matches!(error, SupervisorError::Busy { ref tag, .. } if tag == "TRAIN"));

        let active = supervisor.active_session().expect("still active");
        assert_eq!(active.id, first.id);
        assert!(active.state.is_active());

        assert!(supervisor.cancel(first.id));
        let events = collect_until_terminal(&rx);
        assert_eq!(terminal_outcome(&events), SessionOutcome::Cancelled);
        assert!(events.iter().all(|event| !matches!(
            event,
            SessionEvent::StateChanged { tag, .. } if tag == "EVAL"
        )));
    }

    #[test]
    fn cancel_after_terminal_is_a_noop() {
        let (mut supervisor, rx) = supervisor(SupervisorConfig::default());
        let session = supervisor.start(shell("TRAIN", "exit 0")).expect("start");
        let events = collect_until_terminal(&rx);
        assert_eq!(terminal_outcome(&events), SessionOutcome::Completed);

        assert!(!supervisor.cancel(session.id));
        assert!(rx.recv_timeout(Duration::from_millis(200)).is_err());
    }

    #[test]
    fn nonzero_exit_is_a_failure_with_its_code() {
        let (mut supervisor, rx) = supervisor(SupervisorConfig::default());
        supervisor
            .start(shell("TRAIN", "echo boom; exit 3"))
            .expect("start");
        let events = collect_until_terminal(&rx);
        let outcome = terminal_outcome(&events);
        assert_eq!(
            outcome,
            SessionOutcome::Failed(SessionFailure::Exited {
                code: Some(3),
                signal: None
            })
        );
        assert_eq!(outcome.exit_code(), 3);
        assert!(events.iter().any(|event| matches!(
            event,
            SessionEvent::LogLine { line, stream: OutputStream::Stdout, .. } if line == "boom"
        )));
    }

    #[test]
    fn missing_program_fails_to_start() {
        let (mut supervisor, rx) = supervisor(SupervisorConfig::default());
        supervisor
            .start(SessionSpec::new("TRAIN", "/nonexistent/trainbox-missing-binary"))
            .expect("start is accepted");
        let events = collect_until_terminal(&rx);
        assert_eq!(
            states(&events),
            vec![SessionState::Starting, SessionState::Failed]
        );
        let outcome = terminal_outcome(&events);
        assert!(outcome.is_spawn_failure());
        assert_eq!(outcome.exit_code(), 127);
        assert!(!supervisor.is_busy());
    }

    #[test]
    fn cancel_escalates_to_kill_when_term_is_ignored() {
        let config = SupervisorConfig {
            cancel_grace: Duration::from_millis(300),
            ..SupervisorConfig::default()
        };
        let (mut supervisor, rx) = supervisor(config);
        let session = supervisor
            .start(shell(
                "SELFPLAY",
                "trap '' TERM; echo ready; while true; do sleep 0.1; done",
            ))
            .expect("start");

        loop {
            match rx.recv_timeout(EVENT_TIMEOUT).expect("event") {
                SessionEvent::LogLine { line, .. } if line == "ready" => break,
                _ => {}
            }
        }
        let started = Instant::now();
        assert!(supervisor.cancel(session.id));
        let events = collect_until_terminal(&rx);
        assert_eq!(terminal_outcome(&events), SessionOutcome::Cancelled);
        assert!(started.elapsed() < Duration::from_secs(10));
    }

    #[test]
    fn stderr_lines_are_attributed() {
        let (mut supervisor, rx) = supervisor(SupervisorConfig::default());
        supervisor
            .start(shell("EVAL", "echo oops 1>&2"))
            .expect("start");
        let events = collect_until_terminal(&rx);
        assert!(events.iter().any(|event| matches!(
            event,
            SessionEvent::LogLine { line, stream: OutputStream::Stderr, .. } if line == "oops"
        )));
    }

    #[test]
    fn suppressed_raw_log_still_reports_progress() {
        let (mut supervisor, rx) = supervisor(SupervisorConfig::default());
        supervisor
            .start(shell("TRAIN", "echo noise; echo 1/1").suppress_raw_log(true))
            .expect("start");
        let events = collect_until_terminal(&rx);
        assert!(
            !events
                .iter()
                .any(|event| matches!(event, SessionEvent::LogLine { .. }))
        );
        assert!(
            events
                .iter()
                .any(|event| matches!(event, SessionEvent::Progress { .. }))
        );
    }

    #[test]
    fn snapshots_keep_output_order() {
        let (mut supervisor, rx) = supervisor(SupervisorConfig::default());
        supervisor
            .start(shell(
                "TRAIN",
                "i=1; while [ $i -le 40 ]; do echo \"ep=$i/40\"; i=$((i+1)); done",
            ))
            .expect("start");
        let events = collect_until_terminal(&rx);
        let currents = events
            .iter()
            .filter_map(|event| match event {
                SessionEvent::Progress { snapshot, .. } => Some(snapshot.current),
                _ => None,
            })
            .collect::<Vec<_>>();
        assert!(currents.windows(2).all(|pair| pair[0] <= pair[1]));
        assert_eq!(currents.last(), Some(&40));
        assert!(currents.contains(&40));
    }

    #[test]
    fn writes_audit_records() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("LOGS_FOR_AGENTS.md");
        let config = SupervisorConfig {
            audit_log: Some(AuditLog::new(&path)),
            ..SupervisorConfig::default()
        };
        let (mut supervisor, rx) = supervisor(config);
        supervisor
            .start(shell("EVAL", "echo hello").env("FORCE_GREEDY", "1"))
            .expect("start");
        collect_until_terminal(&rx);

        let text = fs::read_to_string(&path).expect("audit log");
        let lines = text.lines().collect::<Vec<_>>();
        assert!(lines[0].contains("| [GUI][ENV] exe=/bin/sh"));
        assert!(lines[0].ends_with("FORCE_GREEDY=1"));
        assert!(lines.iter().any(|line| line.ends_with("| [GUI][EVAL] hello")));
        assert!(
            lines
                .last()
                .is_some_and(|line| line.contains("[GUI][EVAL] finished: exit code 0"))
        );
    }

    #[test]
    fn audit_failure_warns_once_and_still_completes() {
        let dir = tempfile::tempdir().expect("tempdir");
        let config = SupervisorConfig {
            audit_log: Some(AuditLog::new(dir.path().join("missing").join("log.md"))),
            ..SupervisorConfig::default()
        };
        let (mut supervisor, rx) = supervisor(config);
        supervisor
            .start(shell("TRAIN", "echo one; echo two; exit 0"))
            .expect("start");
        let events = collect_until_terminal(&rx);

        let warnings = events
            .iter()
            .filter(|event| matches!(event, SessionEvent::Warning { .. }))
            .count();
        assert_eq!(warnings, 1);
        assert_eq!(terminal_outcome(&events), SessionOutcome::Completed);
    }

    #[test]
    fn next_start_is_accepted_once_terminal_is_observed() {
        let (mut supervisor, rx) = supervisor(SupervisorConfig::default());
        supervisor.start(shell("TRAIN", "exit 0")).expect("first");
        collect_until_terminal(&rx);
        supervisor.start(shell("TRAIN", "exit 0")).expect("second");
        let events = collect_until_terminal(&rx);
        assert_eq!(terminal_outcome(&events), SessionOutcome::Completed);
    }

    #[test]
    fn cancel_reaches_a_script_that_closed_its_output() {
        let (mut supervisor, rx) = supervisor(SupervisorConfig::default());
        let session = supervisor
            .start(shell("TRAIN", "echo ep=1; exec >/dev/null 2>&1; sleep 30"))
            .expect("start");

        while !matches!(
            rx.recv_timeout(EVENT_TIMEOUT).expect("event"),
            SessionEvent::Progress { .. }
        ) {}
        std::thread::sleep(Duration::from_millis(500));
        let active = supervisor.active_session().expect("still active");
        assert_eq!(active.state, SessionState::Running);

        let started = Instant::now();
        assert!(supervisor.cancel(session.id));
        let events = collect_until_terminal(&rx);
        assert_eq!(terminal_outcome(&events), SessionOutcome::Cancelled);
        assert!(started.elapsed() < Duration::from_secs(10));
        assert!(!supervisor.is_busy());
    }

    #[test]
    fn burst_of_progress_is_throttled_but_completion_is_not() {
        let config = SupervisorConfig {
            snapshot_interval: Duration::from_secs(60),
            ..SupervisorConfig::default()
        };
        let (mut supervisor, rx) = supervisor(config);
        supervisor
            .start(shell(
                "TRAIN",
                "i=1; while [ $i -le 40 ]; do echo \"ep=$i/40\"; i=$((i+1)); done",
            ))
            .expect("start");
        let events = collect_until_terminal(&rx);
        let currents = events
            .iter()
            .filter_map(|event| match event {
                SessionEvent::Progress { snapshot, .. } => Some(snapshot.current),
                _ => None,
            })
            .collect::<Vec<_>>();

        assert!(currents.len() < 40, "got {} snapshots", currents.len());
        assert_eq!(currents.first(), Some(&1));
        assert!(currents.contains(&40));
        // First admitted, forced 40/40, final snapshot.
        assert!(currents.len() <= 3);
    }

    #[test]
    fn lines_are_trimmed_before_logging_and_parsing() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("LOGS_FOR_AGENTS.md");
        let config = SupervisorConfig {
            audit_log: Some(AuditLog::new(&path)),
            ..SupervisorConfig::default()
        };
        let (mut supervisor, rx) = supervisor(config);
        supervisor
            .start(shell("EVAL", "echo '  hello  '; echo '   ep=3  '").expected_total(5))
            .expect("start");
        let events = collect_until_terminal(&rx);

        assert!(events.iter().any(|event| matches!(
            event,
            SessionEvent::LogLine { line, .. } if line == "hello"
        )));
        assert!(events.iter().any(|event| matches!(
            event,
            SessionEvent::Progress { snapshot, .. } if snapshot.current == 3 && snapshot.total == 5
        )));
        let text = fs::read_to_string(&path).expect("audit log");
        assert!(text.lines().any(|line| line.ends_with("| [GUI][EVAL] hello")));
        assert!(text.lines().any(|line| line.ends_with("| [GUI][EVAL] ep=3")));
    }
}
