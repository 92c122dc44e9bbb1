mod controller;

use crate::domain::{
    EvalSummary, OutputStream, ProgressSnapshot, SessionEvent, SessionOutcome, SessionState,
    parse_eval_summary,
};
use crossterm::event::{KeyCode, KeyEvent, KeyEventKind, KeyModifiers};
use std::collections::VecDeque;
use std::sync::mpsc::Receiver;
use thiserror::Error;

pub use controller::{ControllerError, SessionController};

pub const MAX_LOG_LINES: usize = 2_000;
pub const MAX_EVENTS_PER_FRAME: usize = 256;

#[derive(Debug, Error)]
pub enum AppError {
    #[error("terminal I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Controller(#[from] ControllerError),
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum LogLevel {
    Output,
    Stderr,
    Info,
    Warning,
    Error,
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct LogEntry {
    pub level: LogLevel,
    pub text: String,
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct BatchResult {
    pub completed: u32,
    pub requested: u32,
    pub last_outcome: Option<SessionOutcome>,
}

impl BatchResult {
    pub fn exit_code(&self) -> i32 {
        self.last_outcome
            .as_ref()
            .map(SessionOutcome::exit_code)
            .unwrap_or(0)
    }
}

/// Everything the dashboard shows. Built only from `SessionEvent`s, in delivery order.
#[derive(Clone, Debug)]
pub struct AppModel {
    pub tag: Option<String>,
    pub state: SessionState,
    pub status: String,
    pub progress: Option<ProgressSnapshot>,
    pub run: Option<(u32, u32)>,
    pub log: VecDeque<LogEntry>,
    pub log_scroll: usize,
    pub eval_summary: Option<EvalSummary>,
    pub batch: Option<BatchResult>,
    pub help_open: bool,
}

impl AppModel {
    pub fn new(status: impl Into<String>) -> Self {
        Self {
            tag: None,
            state: SessionState::Idle,
            status: status.into(),
            progress: None,
            run: None,
            log: VecDeque::new(),
            log_scroll: 0,
            eval_summary: None,
            batch: None,
            help_open: false,
        }
    }

    pub fn is_settled(&self) -> bool {
        self.batch.is_some()
    }

    pub fn push_log(&mut self, level: LogLevel, text: impl Into<String>) {
        self.log.push_back(LogEntry {
            level,
            text: text.into(),
        });
        while self.log.len() > MAX_LOG_LINES {
            self.log.pop_front();
        }
    }

    pub fn apply_session_event(&mut self, event: SessionEvent) {
        match event {
            SessionEvent::RunScheduled { run, of } => {
                self.run = Some((run, of));
                self.batch = None;
                self.progress = None;
                if run == 1 {
                    self.eval_summary = None;
                }
                if of > 1 {
                    self.push_log(LogLevel::Info, format!("[GUI] run {run}/{of}"));
                }
            }
            SessionEvent::StateChanged {
                tag, state, report, ..
            } => {
                self.state = state;
                match report {
                    Some(report) => {
                        self.status = report.outcome.status_text(&tag);
                        let level = match report.outcome {
                            SessionOutcome::Failed(_) => LogLevel::Error,
                            SessionOutcome::Cancelled => LogLevel::Warning,
                            SessionOutcome::Completed => LogLevel::Info,
                        };
                        let text = format!("[GUI][{tag}] {}", self.status);
                        self.push_log(level, text);
                        if report.last_progress.is_some() {
                            self.progress = report.last_progress;
                        }
                    }
                    None => {
                        self.status = match state {
                            SessionState::Starting => format!("{tag} starting..."),
                            SessionState::Running => format!("{tag} running"),
                            SessionState::Finishing => format!("{tag} finishing..."),
                            other => format!("{tag} {}", other.label()),
                        };
                    }
                }
                self.tag = Some(tag);
            }
            SessionEvent::Progress { snapshot, .. } => {
                self.progress = Some(snapshot);
            }
            SessionEvent::LogLine { stream, line, .. } => {
                if let Some(summary) = parse_eval_summary(&line) {
                    self.eval_summary = Some(summary);
                }
                let level = match stream {
                    OutputStream::Stdout => LogLevel::Output,
                    OutputStream::Stderr => LogLevel::Stderr,
                };
                self.push_log(level, line);
            }
            SessionEvent::Warning { message, .. } => {
                self.push_log(LogLevel::Warning, format!("[GUI] {message}"));
            }
            SessionEvent::BatchFinished {
                completed,
                requested,
                last_outcome,
            } => {
                if requested > 1 {
                    self.push_log(
                        LogLevel::Info,
                        format!("[GUI] {completed}/{requested} runs completed"),
                    );
                }
                self.batch = Some(BatchResult {
                    completed,
                    requested,
                    last_outcome,
                });
            }
        }
    }
}

/// Folds queued session events into `model` in place, at most `limit` of them. Returns `true` when
/// the limit was hit and more events may be waiting.
pub fn drain_session_events(
    model: &mut AppModel,
    events: &Receiver<SessionEvent>,
    limit: usize,
) -> bool {
    for _ in 0..limit {
        match events.try_recv() {
            Ok(event) => model.apply_session_event(event),
            Err(_) => return false,
        }
    }
    true
}

#[derive(Clone, Debug)]
pub enum AppEvent {
    Key(KeyEvent),
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum AppCommand {
    None,
    Cancel,
    Quit,
}

pub fn update(model: AppModel, event: AppEvent) -> (AppModel, AppCommand) {
    match event {
        AppEvent::Key(key) => update_on_key(model, key),
    }
}

fn update_on_key(model: AppModel, key: KeyEvent) -> (AppModel, AppCommand) {
    let mut model = model;
    if key.kind == KeyEventKind::Release {
        return (model, AppCommand::None);
    }

    if key.modifiers.contains(KeyModifiers::CONTROL) && key.code == KeyCode::Char('c') {
        return (model, AppCommand::Quit);
    }

    if model.help_open {
        if matches!(key.code, KeyCode::Esc | KeyCode::Char('?') | KeyCode::Char('q')) {
            model.help_open = false;
        }
        return (model, AppCommand::None);
    }

    match key.code {
        KeyCode::Char('q') | KeyCode::Esc => (model, AppCommand::Quit),
        KeyCode::Char('c') if model.state.is_active() => (model, AppCommand::Cancel),
        KeyCode::Char('?') => {
            model.help_open = true;
            (model, AppCommand::None)
        }
        KeyCode::Up | KeyCode::Char('k') => {
            let max = model.log.len().saturating_sub(1);
            model.log_scroll = (model.log_scroll + 1).min(max);
            (model, AppCommand::None)
        }
        KeyCode::Down | KeyCode::Char('j') => {
            model.log_scroll = model.log_scroll.saturating_sub(1);
            (model, AppCommand::None)
        }
        KeyCode::PageUp => {
            let max = model.log.len().saturating_sub(1);
            model.log_scroll = (model.log_scroll + 10).min(max);
            (model, AppCommand::None)
        }
        KeyCode::PageDown => {
            model.log_scroll = model.log_scroll.saturating_sub(10);
            (model, AppCommand::None)
        }
        KeyCode::End => {
            model.log_scroll = 0;
            (model, AppCommand::None)
        }
        _ => (model, AppCommand::None),
    }
}
