use crate::domain::{EnvOverrides, ProgressSnapshot};
use std::fmt;
use std::path::PathBuf;
use std::time::{Duration, Instant};
use uuid::Uuid;

/// Reported in place of an exit code when the process never started.
pub const SPAWN_FAILURE_EXIT_CODE: i32 = 127;
/// Reported in place of an exit code when the user cancelled the session.
pub const CANCELLED_EXIT_CODE: i32 = 130;

#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub struct SessionId(Uuid);

impl SessionId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    /// First eight hex digits, enough to tell sessions apart in a log.
    pub fn short(&self) -> String {
        self.0.simple().to_string().chars().take(8).collect()
    }
}

impl Default for SessionId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum SessionState {
    Idle,
    Starting,
    Running,
    Finishing,
    Completed,
    Failed,
    Cancelled,
}

impl SessionState {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }

    pub fn is_active(self) -> bool {
        matches!(self, Self::Starting | Self::Running | Self::Finishing)
    }

    pub fn label(self) -> &'static str {
        match self {
            Self::Idle => "idle",
            Self::Starting => "starting",
            Self::Running => "running",
            Self::Finishing => "finishing",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
        }
    }
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum OutputStream {
    Stdout,
    Stderr,
}

impl OutputStream {
    pub fn label(self) -> &'static str {
        match self {
            Self::Stdout => "stdout",
            Self::Stderr => "stderr",
        }
    }
}

/// Everything needed to launch one external script.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct SessionSpec {
    pub tag: String,
    pub program: PathBuf,
    pub args: Vec<String>,
    pub working_dir: Option<PathBuf>,
    pub env: EnvOverrides,
    /// Used as the total when output reports `ep=<n>` without one.
    pub expected_total: Option<u64>,
    /// Stops non-progress lines from being forwarded as `LogLine` events. The audit log still
    /// receives every line.
    pub suppress_raw_log: bool,
}

impl SessionSpec {
    pub fn new(tag: impl Into<String>, program: impl Into<PathBuf>) -> Self {
        Self {
            tag: tag.into(),
            program: program.into(),
            args: Vec::new(),
            working_dir: None,
            env: EnvOverrides::new(),
            expected_total: None,
            suppress_raw_log: false,
        }
    }

    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    pub fn working_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.working_dir = Some(dir.into());
        self
    }

    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.set(key, value);
        self
    }

    pub fn expected_total(mut self, total: u64) -> Self {
        self.expected_total = Some(total);
        self
    }

    pub fn suppress_raw_log(mut self, suppress: bool) -> Self {
        self.suppress_raw_log = suppress;
        self
    }
}

/// One supervised run. The supervisor owns the live copy; callers get clones.
#[derive(Clone, Debug)]
pub struct Session {
    pub id: SessionId,
    pub tag: String,
    pub state: SessionState,
    pub started_at: Instant,
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub enum SessionFailure {
    /// The executable could not be started at all.
    SpawnFailed { message: String },
    /// The process ran and exited unsuccessfully. `code` is `None` when it died from a signal.
    Exited { code: Option<i32>, signal: Option<i32> },
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub enum SessionOutcome {
    Completed,
    Failed(SessionFailure),
    Cancelled,
}

impl SessionOutcome {
    pub fn state(&self) -> SessionState {
        match self {
            Self::Completed => SessionState::Completed,
            Self::Failed(_) => SessionState::Failed,
            Self::Cancelled => SessionState::Cancelled,
        }
    }

    pub fn is_spawn_failure(&self) -> bool {
        matches!(self, Self::Failed(SessionFailure::SpawnFailed { .. }))
    }

    /// Exit code to hand back to whoever launched us.
    pub fn exit_code(&self) -> i32 {
        match self {
            Self::Completed => 0,
            Self::Cancelled => CANCELLED_EXIT_CODE,
            Self::Failed(SessionFailure::SpawnFailed { .. }) => SPAWN_FAILURE_EXIT_CODE,
            Self::Failed(SessionFailure::Exited { code, signal }) => match (code, signal) {
                (Some(code), _) => *code,
                (None, Some(signal)) => 128 + signal,
                (None, None) => 1,
            },
        }
    }

    /// User-facing status text; distinguishes "could not start" from "ran and failed".
    pub fn status_text(&self, tag: &str) -> String {
        match self {
            Self::Completed => format!("{tag} completed."),
            Self::Cancelled => format!("{tag} cancelled by user."),
            Self::Failed(SessionFailure::SpawnFailed { message }) => format!(
                "{tag} could not start: {message}. Check the executable path and environment."
            ),
            Self::Failed(SessionFailure::Exited { code: Some(code), .. }) => {
                format!("{tag} failed with exit code {code}. Check the log above.")
            }
            Self::Failed(SessionFailure::Exited { signal: Some(signal), .. }) => {
                format!("{tag} was killed by signal {signal}. Check the log above.")
            }
            Self::Failed(SessionFailure::Exited { .. }) => {
                format!("{tag} failed. Check the log above.")
            }
        }
    }
}

/// Attached to the terminal state change of a session.
#[derive(Clone, Debug, PartialEq)]
pub struct SessionReport {
    pub outcome: SessionOutcome,
    pub elapsed: Duration,
    pub last_progress: Option<ProgressSnapshot>,
}

/// Everything the presentation layer can observe, delivered in order through one channel.
#[derive(Clone, Debug, PartialEq)]
pub enum SessionEvent {
    /// Run `run` of `of` is about to start.
    RunScheduled { run: u32, of: u32 },
    StateChanged {
        session: SessionId,
        tag: String,
        state: SessionState,
        report: Option<SessionReport>,
    },
    Progress {
        session: SessionId,
        snapshot: ProgressSnapshot,
    },
    LogLine {
        session: SessionId,
        stream: OutputStream,
        line: String,
    },
    /// Non-fatal problem, e.g. the audit log could not be written. Sent at most once per kind
    /// per session.
    Warning { session: SessionId, message: String },
    /// No further runs will start for the current request.
    BatchFinished {
        completed: u32,
        requested: u32,
        last_outcome: Option<SessionOutcome>,
    },
}

impl SessionEvent {
    pub fn terminal_report(&self) -> Option<(SessionId, &SessionReport)> {
        match self {
            Self::StateChanged {
                session,
                state,
                report: Some(report),
                ..
            } if state.is_terminal() => Some((*session, report)),
            _ => None,
        }
    }
}
