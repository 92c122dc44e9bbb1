mod app;
mod cli;
mod domain;
mod infra;
mod ui;

use crate::app::{AppCommand, AppEvent, AppModel, SessionController};
use crate::cli::{CliInvocation, OutputMode};
use crate::domain::{CANCELLED_EXIT_CODE, SessionEvent, SessionSpec};
use crate::infra::{LoadSettingsError, ResolveSettingsPathError, Settings};
use crossterm::event::{self, Event, KeyEventKind};
use crossterm::{ExecutableCommand, execute};
use crossterm::terminal::{
    EnterAlternateScreen, LeaveAlternateScreen, disable_raw_mode, enable_raw_mode,
};
use ratatui::Terminal;
use ratatui::backend::CrosstermBackend;
use std::fs::OpenOptions;
use std::io::{self, Stdout, Write};
use std::path::Path;
use std::sync::Mutex;
use std::sync::mpsc::{Receiver, channel};
use std::time::Duration;
use thiserror::Error;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

const LOG_FILE_ENV: &str = "TRAINBOX_LOG_FILE";

#[derive(Debug, Error)]
enum MainError {
    #[error(transparent)]
    App(#[from] crate::app::AppError),

    #[error(transparent)]
    Cli(#[from] crate::cli::CliRunError),

    #[error(transparent)]
    SettingsPath(#[from] ResolveSettingsPathError),

    #[error(transparent)]
    Settings(#[from] LoadSettingsError),

    #[error("failed to read the current directory: {0}")]
    CurrentDir(#[source] io::Error),
}

fn main() {
    match run_main() {
        Ok(code) => std::process::exit(code),
        Err(error) => {
            let mut err = io::stderr().lock();
            let _ = writeln!(err, "{error}");
            std::process::exit(1);
        }
    }
}

fn run_main() -> Result<i32, MainError> {
    let args = std::env::args().collect::<Vec<_>>();
    let invocation = match crate::cli::parse_invocation(&args) {
        Ok(invocation) => invocation,
        Err(error) => {
            let mut err = io::stderr().lock();
            let _ = writeln!(err, "{error}");
            let _ = writeln!(err);
            print_help();
            std::process::exit(2);
        }
    };

    let request = match invocation {
        CliInvocation::PrintHelp => {
            print_help();
            return Ok(0);
        }
        CliInvocation::PrintVersion => {
            let mut out = io::stdout().lock();
            let _ = writeln!(out, "{}", env!("CARGO_PKG_VERSION"));
            return Ok(0);
        }
        CliInvocation::Run(request) => request,
    };

    init_tracing(request.output);

    let settings_path = crate::infra::resolve_settings_path()?;
    let settings =
        crate::infra::load_settings(&settings_path)?.with_env_overrides(|key| std::env::var_os(key));
    info!(path = %settings_path.display(), "settings loaded");

    let cwd = std::env::current_dir().map_err(MainError::CurrentDir)?;
    let (spec, times) = request.build(&settings, &cwd);

    match request.output {
        OutputMode::Tui => Ok(run_tui(spec, times, &settings, &cwd)?),
        OutputMode::Console | OutputMode::Json => {
            Ok(crate::cli::run(spec, times, request.output, &settings, &cwd)?)
        }
    }
}

/// Console modes log to stderr. The dashboard owns the terminal, so it only logs to a file.
fn init_tracing(output: OutputMode) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"));
    match output {
        OutputMode::Tui => {
            let Some(path) = std::env::var_os(LOG_FILE_ENV) else {
                return;
            };
            let Ok(file) = OpenOptions::new().create(true).append(true).open(&path) else {
                return;
            };
            let _ = tracing_subscriber::fmt()
                .with_env_filter(filter)
                .with_ansi(false)
                .with_writer(Mutex::new(file))
                .try_init();
        }
        OutputMode::Console | OutputMode::Json => {
            let _ = tracing_subscriber::fmt()
                .with_env_filter(filter)
                .with_writer(io::stderr)
                .try_init();
        }
    }
}

fn print_help() {
    let text = format!(
        "{name} - supervise training and evaluation runs\n\nUSAGE:\n  {name} [--tui|--json] [--quiet] train [--mode standard|8x|selfplay] [--games N] [--repeat N]\n        [--mission NAME] [--speed] [--resume CKPT] [--opponent CKPT] [--env KEY=VALUE]...\n  {name} [--tui|--json] [--quiet] eval --model PATH [--games N] [--mission NAME]\n  {name} [--tui|--json] [--quiet] run [--tag TAG] [--total N] [--repeat N] [--cwd DIR]\n        [--env KEY=VALUE]... [--] PROGRAM [ARGS...]\n  {name} --help | --version\n\nOUTPUT:\n  (default)      Progress and log lines as text; Ctrl+C cancels the run\n  --json         One JSON object per event on stdout\n  --tui          Dashboard with progress gauge and log (c cancel, q quit)\n  --quiet, -q    Do not forward raw script output (progress is still shown)\n\nTRAIN FLAGS:\n  --mode MODE    standard (default), 8x (8 parallel envs, 8 runs) or selfplay\n  --games N      Episodes per run (default: 100)\n  --repeat N     Sequential runs; stops at the first failure\n  --speed        Disable per-episode training logs\n\nEVAL FLAGS:\n  --model PATH   Checkpoint to evaluate (positional PATH also accepted)\n  --games N      Games to play (default: 50)\n\nEXIT CODE:\n  The script's exit code; 127 when it could not start, 130 when cancelled.\n\nENV:\n  TRAINBOX_SETTINGS    Settings file (default: <config dir>/trainbox/settings.json)\n  TRAINBOX_REPO_ROOT   Training checkout (default: nearest parent with train.py or train.sh)\n  TRAINBOX_PYTHON      Python interpreter (default: python3)\n  TRAINBOX_AUDIT_LOG   Audit log file (default: LOGS_FOR_AGENTS.md)\n  TRAINBOX_LOG_FILE    Diagnostic log file in --tui mode\n  RUST_LOG             Diagnostic log filter (default: warn)\n",
        name = env!("CARGO_PKG_NAME")
    );
    let mut out = io::stdout().lock();
    let _ = write!(out, "{text}");
}

fn run_tui(
    spec: SessionSpec,
    times: u32,
    settings: &Settings,
    cwd: &Path,
) -> Result<i32, crate::app::AppError> {
    let (tx, rx) = channel::<SessionEvent>();
    let mut controller = SessionController::new(settings.supervisor_config(cwd), tx);
    let mut model = AppModel::new(format!("{} starting", spec.tag));
    controller.run_repeated(spec, times)?;

    let mut terminal = setup_terminal()?;
    let result = run(&mut terminal, &mut model, &controller, &rx);
    restore_terminal(&mut terminal)?;
    controller.shutdown();
    result?;

    Ok(model
        .batch
        .as_ref()
        .map(|batch| batch.exit_code())
        .unwrap_or(CANCELLED_EXIT_CODE))
}

fn setup_terminal() -> Result<Terminal<CrosstermBackend<Stdout>>, app::AppError> {
    enable_raw_mode()?;
    let mut stdout = io::stdout();
    stdout.execute(EnterAlternateScreen)?;
    let backend = CrosstermBackend::new(stdout);
    Ok(Terminal::new(backend)?)
}

fn restore_terminal(
    terminal: &mut Terminal<CrosstermBackend<Stdout>>,
) -> Result<(), app::AppError> {
    disable_raw_mode()?;
    execute!(terminal.backend_mut(), LeaveAlternateScreen)?;
    terminal.show_cursor()?;
    Ok(())
}

fn run(
    terminal: &mut Terminal<CrosstermBackend<Stdout>>,
    model: &mut AppModel,
    controller: &SessionController,
    events: &Receiver<SessionEvent>,
) -> Result<(), app::AppError> {
    loop {
        let backlog = app::drain_session_events(model, events, app::MAX_EVENTS_PER_FRAME);

        terminal.draw(|frame| ui::render(frame, model))?;

        let timeout = if backlog {
            Duration::ZERO
        } else {
            Duration::from_millis(200)
        };
        if event::poll(timeout)? {
            match event::read()? {
                Event::Key(key) => {
                    if key.kind == KeyEventKind::Release {
                        continue;
                    }
                    let (next, command) = app::update(model.clone(), AppEvent::Key(key));
                    *model = next;
                    match command {
                        AppCommand::None => {}
                        AppCommand::Cancel => {
                            if !controller.cancel() {
                                warn!("cancel requested with no active session");
                            }
                        }
                        AppCommand::Quit => {
                            if controller.is_busy() {
                                info!("quit requested; cancelling the active request");
                            }
                            return Ok(());
                        }
                    }
                }
                _ => {}
            }
        }
    }
}
