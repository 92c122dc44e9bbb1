use crate::app::{ControllerError, SessionController};
use crate::domain::{
    EnvOverrides, EvalRequest, OutputStream, ParseEnvAssignmentError, ProgressSnapshot,
    SessionEvent, SessionOutcome, SessionSpec, SessionState, TrainMode, TrainRequest,
};
use crate::infra::Settings;
use std::io::{self, IsTerminal, Write};
use std::path::{Path, PathBuf};
use std::sync::mpsc::{RecvTimeoutError, channel};
use std::time::Duration;
use thiserror::Error;
use tracing::info;

const INTERRUPT_POLL: Duration = Duration::from_millis(200);

#[derive(Clone, Debug, Eq, PartialEq)]
pub enum CliInvocation {
    PrintHelp,
    PrintVersion,
    Run(RunRequest),
}

#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub enum OutputMode {
    #[default]
    Console,
    Json,
    Tui,
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct RunRequest {
    pub target: RunTarget,
    pub output: OutputMode,
    pub quiet: bool,
    pub repeat: Option<u32>,
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub enum RunTarget {
    Train {
        mode: TrainMode,
        games: Option<u64>,
        mission: Option<String>,
        speed: bool,
        resume: Option<PathBuf>,
        opponent: Option<PathBuf>,
        env: EnvOverrides,
    },
    Eval {
        model: PathBuf,
        games: Option<u64>,
        mission: Option<String>,
    },
    Custom {
        tag: String,
        program: PathBuf,
        args: Vec<String>,
        total: Option<u64>,
        cwd: Option<PathBuf>,
        env: EnvOverrides,
    },
}

#[derive(Debug, Error)]
pub enum CliParseError {
    #[error("missing subcommand (expected train, eval or run)")]
    MissingSubcommand,

    #[error("unknown subcommand: {0}")]
    UnknownSubcommand(String),

    #[error("unknown flag: {0}")]
    UnknownFlag(String),

    #[error("missing value for flag: {0}")]
    MissingFlagValue(String),

    #[error("missing required flag: {0}")]
    MissingRequiredFlag(String),

    #[error("invalid value for {flag}: {value}")]
    InvalidFlagValue { flag: String, value: String },

    #[error("unexpected argument: {0}")]
    UnexpectedArgument(String),

    #[error("missing program to run (use `run -- PROGRAM [ARGS...]`)")]
    MissingProgram,

    #[error("--json and --tui cannot be combined")]
    ConflictingOutput,

    #[error(transparent)]
    InvalidEnv(#[from] ParseEnvAssignmentError),
}

#[derive(Debug, Error)]
pub enum CliRunError {
    #[error(transparent)]
    Controller(#[from] ControllerError),

    #[error("failed to write output: {0}")]
    Output(#[from] io::Error),
}

struct GlobalFlags {
    output: Option<OutputMode>,
    quiet: bool,
}

impl GlobalFlags {
    fn new() -> Self {
        Self {
            output: None,
            quiet: false,
        }
    }

    /// Consumes `arg` when it is a global flag.
    fn accept(&mut self, arg: &str) -> Result<bool, CliParseError> {
        let mode = match arg {
            "--json" => OutputMode::Json,
            "--tui" => OutputMode::Tui,
            "--quiet" | "-q" => {
                self.quiet = true;
                return Ok(true);
            }
            _ => return Ok(false),
        };
        if self.output.is_some_and(|current| current != mode) {
            return Err(CliParseError::ConflictingOutput);
        }
        self.output = Some(mode);
        Ok(true)
    }
}

pub fn parse_invocation(args: &[String]) -> Result<CliInvocation, CliParseError> {
    let before_separator = args.iter().take_while(|arg| arg.as_str() != "--");
    for arg in before_separator {
        match arg.as_str() {
            "--help" | "-h" => return Ok(CliInvocation::PrintHelp),
            "--version" | "-V" => return Ok(CliInvocation::PrintVersion),
            _ => {}
        }
    }

    let mut globals = GlobalFlags::new();
    let mut iter = args.iter().skip(1).peekable();
    while let Some(arg) = iter.peek() {
        if !globals.accept(arg)? {
            break;
        }
        let _ = iter.next();
    }

    let Some(subcommand) = iter.next() else {
        return Err(CliParseError::MissingSubcommand);
    };

    let mut repeat: Option<u32> = None;
    let target = match subcommand.as_str() {
        "train" => {
            let mut mode = TrainMode::Standard;
            let mut games: Option<u64> = None;
            let mut mission: Option<String> = None;
            let mut speed = false;
            let mut resume: Option<PathBuf> = None;
            let mut opponent: Option<PathBuf> = None;
            let mut env = EnvOverrides::new();

            let mut args = iter;
            while let Some(arg) = args.next() {
                if globals.accept(arg)? {
                    continue;
                }
                match arg.as_str() {
                    "--mode" | "-m" => {
                        let value = flag_value(&mut args, "--mode")?;
                        mode = TrainMode::parse(value).ok_or_else(|| {
                            CliParseError::InvalidFlagValue {
                                flag: "--mode".to_string(),
                                value: value.to_string(),
                            }
                        })?;
                    }
                    "--games" | "-n" => {
                        games = Some(parse_count_flag("--games", flag_value(&mut args, "--games")?)?);
                    }
                    "--repeat" | "-r" => {
                        repeat = Some(parse_repeat_flag(flag_value(&mut args, "--repeat")?)?);
                    }
                    "--mission" => {
                        mission = Some(flag_value(&mut args, "--mission")?.to_string());
                    }
                    "--speed" => {
                        speed = true;
                    }
                    "--resume" => {
                        resume = Some(PathBuf::from(flag_value(&mut args, "--resume")?));
                    }
                    "--opponent" => {
                        opponent = Some(PathBuf::from(flag_value(&mut args, "--opponent")?));
                    }
                    "--env" | "-e" => {
                        let (key, value) =
                            EnvOverrides::parse_assignment(flag_value(&mut args, "--env")?)?;
                        env.set(key, value);
                    }
                    _ if arg.starts_with('-') => {
                        return Err(CliParseError::UnknownFlag(arg.to_string()));
                    }
                    _ => {
                        return Err(CliParseError::UnexpectedArgument(arg.to_string()));
                    }
                }
            }

            RunTarget::Train {
                mode,
                games,
                mission,
                speed,
                resume,
                opponent,
                env,
            }
        }
        "eval" => {
            let mut model: Option<PathBuf> = None;
            let mut games: Option<u64> = None;
            let mut mission: Option<String> = None;

            let mut args = iter;
            while let Some(arg) = args.next() {
                if globals.accept(arg)? {
                    continue;
                }
                match arg.as_str() {
                    "--model" => {
                        model = Some(PathBuf::from(flag_value(&mut args, "--model")?));
                    }
                    "--games" | "-n" => {
                        games = Some(parse_count_flag("--games", flag_value(&mut args, "--games")?)?);
                    }
                    "--mission" => {
                        mission = Some(flag_value(&mut args, "--mission")?.to_string());
                    }
                    _ if arg.starts_with('-') => {
                        return Err(CliParseError::UnknownFlag(arg.to_string()));
                    }
                    _ => {
                        if model.is_some() {
                            return Err(CliParseError::UnexpectedArgument(arg.to_string()));
                        }
                        model = Some(PathBuf::from(arg));
                    }
                }
            }

            let Some(model) = model else {
                return Err(CliParseError::MissingRequiredFlag("--model".to_string()));
            };
            RunTarget::Eval {
                model,
                games,
                mission,
            }
        }
        "run" => {
            let mut tag = "RUN".to_string();
            let mut total: Option<u64> = None;
            let mut cwd: Option<PathBuf> = None;
            let mut env = EnvOverrides::new();
            let mut command: Vec<String> = Vec::new();

            let mut args = iter;
            while let Some(arg) = args.next() {
                if globals.accept(arg)? {
                    continue;
                }
                match arg.as_str() {
                    "--tag" | "-t" => {
                        tag = flag_value(&mut args, "--tag")?.trim().to_ascii_uppercase();
                    }
                    "--total" => {
                        total = Some(parse_count_flag("--total", flag_value(&mut args, "--total")?)?);
                    }
                    "--repeat" | "-r" => {
                        repeat = Some(parse_repeat_flag(flag_value(&mut args, "--repeat")?)?);
                    }
                    "--cwd" | "-C" => {
                        cwd = Some(PathBuf::from(flag_value(&mut args, "--cwd")?));
                    }
                    "--env" | "-e" => {
                        let (key, value) =
                            EnvOverrides::parse_assignment(flag_value(&mut args, "--env")?)?;
                        env.set(key, value);
                    }
                    "--" => {
                        command.extend(args.by_ref().cloned());
                        break;
                    }
                    _ if arg.starts_with('-') => {
                        return Err(CliParseError::UnknownFlag(arg.to_string()));
                    }
                    _ => {
                        command.push(arg.to_string());
                        command.extend(args.by_ref().cloned());
                        break;
                    }
                }
            }

            if tag.is_empty() {
                return Err(CliParseError::InvalidFlagValue {
                    flag: "--tag".to_string(),
                    value: String::new(),
                });
            }
            let mut command = command.into_iter();
            let Some(program) = command.next() else {
                return Err(CliParseError::MissingProgram);
            };
            RunTarget::Custom {
                tag,
                program: PathBuf::from(program),
                args: command.collect(),
                total,
                cwd,
                env,
            }
        }
        other => return Err(CliParseError::UnknownSubcommand(other.to_string())),
    };

    Ok(CliInvocation::Run(RunRequest {
        target,
        output: globals.output.unwrap_or_default(),
        quiet: globals.quiet,
        repeat,
    }))
}

fn flag_value<'a, I>(args: &mut I, flag: &str) -> Result<&'a str, CliParseError>
where
    I: Iterator<Item = &'a String>,
{
    args.next()
        .map(String::as_str)
        .ok_or_else(|| CliParseError::MissingFlagValue(flag.to_string()))
}

fn parse_count_flag(flag: &str, value: &str) -> Result<u64, CliParseError> {
    value
        .parse::<u64>()
        .ok()
        .filter(|count| *count > 0)
        .ok_or_else(|| CliParseError::InvalidFlagValue {
            flag: flag.to_string(),
            value: value.to_string(),
        })
}

fn parse_repeat_flag(value: &str) -> Result<u32, CliParseError> {
    value
        .parse::<u32>()
        .ok()
        .filter(|count| *count > 0)
        .ok_or_else(|| CliParseError::InvalidFlagValue {
            flag: "--repeat".to_string(),
            value: value.to_string(),
        })
}

impl RunRequest {
    /// Resolves the request into a launchable spec and the number of sequential runs.
    pub fn build(&self, settings: &Settings, cwd: &Path) -> (SessionSpec, u32) {
        let context = settings.launch_context(cwd);
        let (spec, default_runs) = match &self.target {
            RunTarget::Train {
                mode,
                games,
                mission,
                speed,
                resume,
                opponent,
                env,
            } => {
                let mut request = TrainRequest::new(*mode);
                if let Some(games) = games {
                    request.games = *games;
                }
                request.mission = mission.clone().or_else(|| settings.mission.clone());
                request.logging = settings.train_logging();
                request.logging.speed_mode |= *speed;
                request.resume_checkpoint = resume.clone();
                request.fixed_opponent = opponent.clone();
                request.extra_env = env.clone();
                (request.build(&context), mode.default_runs())
            }
            RunTarget::Eval {
                model,
                games,
                mission,
            } => {
                let mut request = EvalRequest::new(model.clone());
                if let Some(games) = games {
                    request.games = *games;
                }
                request.mission = mission.clone().or_else(|| settings.mission.clone());
                (request.build(&context), 1)
            }
            RunTarget::Custom {
                tag,
                program,
                args,
                total,
                cwd: working_dir,
                env,
            } => {
                let mut spec = SessionSpec::new(tag.clone(), program.clone()).args(args.clone());
                spec.working_dir = working_dir.clone();
                spec.env = env.clone();
                spec.expected_total = *total;
                (spec, 1)
            }
        };
        let spec = spec.suppress_raw_log(self.quiet);
        (spec, self.repeat.unwrap_or(default_runs))
    }
}

/// Plain-text rendering of session events for a terminal or a pipe.
pub struct ConsoleRenderer {
    interactive: bool,
    progress_open: bool,
    last_printed: Option<(u64, Option<u8>)>,
    tag: String,
}

impl ConsoleRenderer {
    pub fn new(interactive: bool) -> Self {
        Self {
            interactive,
            progress_open: false,
            last_printed: None,
            tag: String::new(),
        }
    }

    pub fn render(&mut self, out: &mut impl Write, event: &SessionEvent) -> io::Result<()> {
        match event {
            SessionEvent::Progress { snapshot, .. } => return self.render_progress(out, snapshot),
            SessionEvent::StateChanged {
                state: SessionState::Finishing,
                ..
            } => return Ok(()),
            _ => {}
        }

        self.close_progress(out)?;
        match event {
            SessionEvent::RunScheduled { run, of } => {
                if *of > 1 {
                    writeln!(out, "==> run {run}/{of}")?;
                }
            }
            SessionEvent::StateChanged {
                tag, state, report, ..
            } => {
                self.tag = tag.clone();
                match report {
                    Some(report) => {
                        if let Some(snapshot) = &report.last_progress {
                            writeln!(out, "[{tag}] {} {}", snapshot.label(), snapshot.stats_line())?;
                        }
                        writeln!(out, "{}", report.outcome.status_text(tag))?;
                    }
                    None => writeln!(out, "[{tag}] {}", state.label())?,
                }
                self.last_printed = None;
            }
            SessionEvent::LogLine {
                stream, line, ..
            } => match stream {
                OutputStream::Stdout => writeln!(out, "{line}")?,
                OutputStream::Stderr => writeln!(out, "[stderr] {line}")?,
            },
            SessionEvent::Warning { message, .. } => writeln!(out, "warning: {message}")?,
            SessionEvent::BatchFinished {
                completed,
                requested,
                ..
            } => {
                if *requested > 1 {
                    writeln!(out, "{completed}/{requested} runs completed")?;
                }
            }
            SessionEvent::Progress { .. } => {}
        }
        out.flush()
    }

    fn render_progress(
        &mut self,
        out: &mut impl Write,
        snapshot: &ProgressSnapshot,
    ) -> io::Result<()> {
        let mut line = format!("{}  {}", snapshot.label(), snapshot.stats_line());
        if !self.tag.is_empty() {
            line = format!("[{}] {line}", self.tag);
        }
        if self.interactive {
            write!(out, "\r\x1b[2K{line}")?;
            self.progress_open = true;
            return out.flush();
        }

        // Piped output gets one line per visible change, not one per snapshot.
        let key = (snapshot.current, snapshot.percent());
        let changed = match (self.last_printed, snapshot.percent()) {
            (None, _) => true,
            (Some((_, last_percent)), Some(_)) => last_percent != key.1,
            (Some((last_current, _)), None) => last_current != key.0,
        };
        if changed {
            self.last_printed = Some(key);
            writeln!(out, "{line}")?;
        }
        out.flush()
    }

    fn close_progress(&mut self, out: &mut impl Write) -> io::Result<()> {
        if self.progress_open {
            self.progress_open = false;
            writeln!(out)?;
        }
        Ok(())
    }
}

pub fn json_event(event: &SessionEvent) -> serde_json::Value {
    match event {
        SessionEvent::RunScheduled { run, of } => serde_json::json!({
            "event": "run_scheduled",
            "run": run,
            "of": of,
        }),
        SessionEvent::StateChanged {
            session,
            tag,
            state,
            report,
        } => {
            let mut value = serde_json::json!({
                "event": "state",
                "session": session.to_string(),
                "tag": tag,
                "state": state.label(),
            });
            if let Some(report) = report {
                value["exit_code"] = serde_json::json!(report.outcome.exit_code());
                value["status"] = serde_json::json!(report.outcome.status_text(tag));
                value["elapsed_secs"] = serde_json::json!(report.elapsed.as_secs_f64());
                value["spawn_failed"] = serde_json::json!(report.outcome.is_spawn_failure());
                if let Some(snapshot) = &report.last_progress {
                    value["last_progress"] = snapshot_json(snapshot);
                }
            }
            value
        }
        SessionEvent::Progress { session, snapshot } => {
            let mut value = snapshot_json(snapshot);
            value["event"] = serde_json::json!("progress");
            value["session"] = serde_json::json!(session.to_string());
            value
        }
        SessionEvent::LogLine {
            session,
            stream,
            line,
        } => serde_json::json!({
            "event": "log",
            "session": session.to_string(),
            "stream": stream.label(),
            "line": line,
        }),
        SessionEvent::Warning { session, message } => serde_json::json!({
            "event": "warning",
            "session": session.to_string(),
            "message": message,
        }),
        SessionEvent::BatchFinished {
            completed,
            requested,
            last_outcome,
        } => serde_json::json!({
            "event": "batch_finished",
            "completed": completed,
            "requested": requested,
            "exit_code": last_outcome.as_ref().map(SessionOutcome::exit_code),
        }),
    }
}

fn snapshot_json(snapshot: &ProgressSnapshot) -> serde_json::Value {
    serde_json::json!({
        "current": snapshot.current,
        "total": snapshot.total,
        "percent": snapshot.percent(),
        "rate": snapshot.rate,
        "elapsed_secs": snapshot.elapsed.as_secs_f64(),
        "eta_secs": snapshot.eta.map(|eta| eta.as_secs_f64()),
    })
}

/// Runs the request in console or JSON mode and returns the process exit code.
pub fn run(
    spec: SessionSpec,
    times: u32,
    output: OutputMode,
    settings: &Settings,
    cwd: &Path,
) -> Result<i32, CliRunError> {
    let (tx, rx) = channel::<SessionEvent>();
    let mut controller = SessionController::new(settings.supervisor_config(cwd), tx);
    info!(tag = %spec.tag, times, "starting console run");
    if times == 1 {
        controller.run_once(spec)?;
    } else {
        controller.run_repeated(spec, times)?;
    }
    interrupt::install();

    let stdout = io::stdout();
    let mut renderer = ConsoleRenderer::new(stdout.is_terminal());
    let mut exit_code = 0;
    let mut cancel_sent = false;
    loop {
        match rx.recv_timeout(INTERRUPT_POLL) {
            Ok(event) => {
                let mut out = stdout.lock();
                match output {
                    OutputMode::Json => writeln!(out, "{}", json_event(&event))?,
                    OutputMode::Console | OutputMode::Tui => renderer.render(&mut out, &event)?,
                }
                if let SessionEvent::BatchFinished { last_outcome, .. } = &event {
                    exit_code = last_outcome
                        .as_ref()
                        .map(SessionOutcome::exit_code)
                        .unwrap_or(0);
                    break;
                }
            }
            Err(RecvTimeoutError::Timeout) => {}
            Err(RecvTimeoutError::Disconnected) => break,
        }
        if !cancel_sent && interrupt::requested() {
            cancel_sent = true;
            let target = controller
                .active_session()
                .map(|session| format!(" {}", session.tag))
                .unwrap_or_default();
            let _ = writeln!(io::stderr(), "\ninterrupted; cancelling{target}...");
            controller.cancel();
        }
    }
    controller.shutdown();
    Ok(exit_code)
}

#[cfg(unix)]
mod interrupt {
    use std::sync::atomic::{AtomicBool, Ordering};

    static REQUESTED: AtomicBool = AtomicBool::new(false);

    extern "C" fn on_sigint(_signal: libc::c_int) {
        REQUESTED.store(true, Ordering::SeqCst);
    }

    /// Routes SIGINT to a flag so the loop can cancel the process group instead of orphaning it.
    pub fn install() {
        let handler = on_sigint as extern "C" fn(libc::c_int);
        unsafe {
            libc::signal(libc::SIGINT, handler as libc::sighandler_t);
        }
    }

    pub fn requested() -> bool {
        REQUESTED.load(Ordering::SeqCst)
    }
}

#[cfg(not(unix))]
mod interrupt {
    pub fn install() {}

    pub fn requested() -> bool {
        false
    }
}
