use crate::domain::{Session, SessionEvent, SessionOutcome, SessionSpec};
use crate::infra::{ProcessSupervisor, SupervisorConfig, SupervisorError};
use std::sync::mpsc::{Receiver, Sender, channel};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::thread::JoinHandle;
use thiserror::Error;
use tracing::{debug, info, warn};

#[derive(Debug, Error)]
pub enum ControllerError {
    #[error(transparent)]
    Supervisor(#[from] SupervisorError),

    #[error("a {tag} request is still running ({completed}/{requested} runs done)")]
    Busy {
        tag: String,
        completed: u32,
        requested: u32,
    },

    #[error("repeat count must be at least 1")]
    ZeroRepeat,
}

enum RelayMsg {
    Session(SessionEvent),
    Stop,
}

impl From<SessionEvent> for RelayMsg {
    fn from(event: SessionEvent) -> Self {
        Self::Session(event)
    }
}

struct RepeatPlan {
    spec: SessionSpec,
    requested: u32,
    started: u32,
    completed: u32,
    cancel_requested: bool,
}

struct Shared {
    supervisor: ProcessSupervisor<RelayMsg>,
    plan: Option<RepeatPlan>,
}

/// Caller-facing entry point: runs a spec once or several times in a row and forwards every
/// event, in order, to one channel.
///
/// Supervisor events pass through a relay thread, which is also where the next run of a repeat
/// request is started, so the receiver never has to drive sequencing itself.
pub struct SessionController {
    shared: Arc<Mutex<Shared>>,
    relay_tx: Sender<RelayMsg>,
    relay: Option<JoinHandle<()>>,
}

impl SessionController {
    pub fn new(config: SupervisorConfig, events: Sender<SessionEvent>) -> Self {
        let (relay_tx, relay_rx) = channel::<RelayMsg>();
        let shared = Arc::new(Mutex::new(Shared {
            supervisor: ProcessSupervisor::new(config, relay_tx.clone()),
            plan: None,
        }));
        let relay_shared = Arc::clone(&shared);
        let relay = std::thread::spawn(move || relay_loop(relay_rx, relay_shared, events));
        Self {
            shared,
            relay_tx,
            relay: Some(relay),
        }
    }

    pub fn run_once(&self, spec: SessionSpec) -> Result<Session, ControllerError> {
        self.run_repeated(spec, 1)
    }

    /// Runs `spec` up to `times` times back to back. A run that fails or is cancelled ends the
    /// request; nothing is retried.
    pub fn run_repeated(&self, spec: SessionSpec, times: u32) -> Result<Session, ControllerError> {
        if times == 0 {
            return Err(ControllerError::ZeroRepeat);
        }
        let mut shared = lock(&self.shared);
        if let Some(plan) = &shared.plan {
            return Err(ControllerError::Busy {
                tag: plan.spec.tag.clone(),
                completed: plan.completed,
                requested: plan.requested,
            });
        }
        if let Some(active) = shared.supervisor.active_session() {
            return Err(SupervisorError::Busy {
                tag: active.tag,
                state: active.state.label(),
            }
            .into());
        }

        info!(tag = %spec.tag, times, "run requested");
        let _ = self
            .relay_tx
            .send(RelayMsg::Session(SessionEvent::RunScheduled { run: 1, of: times }));
        shared.plan = Some(RepeatPlan {
            spec: spec.clone(),
            requested: times,
            started: 1,
            completed: 0,
            cancel_requested: false,
        });
        match shared.supervisor.start(spec) {
            Ok(session) => Ok(session),
            Err(error) => {
                shared.plan = None;
                Err(error.into())
            }
        }
    }

    /// Stops the current request: the active run is terminated and no further runs start.
    /// Returns `false` when nothing was running.
    pub fn cancel(&self) -> bool {
        let mut shared = lock(&self.shared);
        let planned = match shared.plan.as_mut() {
            Some(plan) => {
                plan.cancel_requested = true;
                true
            }
            None => false,
        };
        let cancelled = shared.supervisor.cancel_active();
        planned || cancelled
    }

    pub fn is_busy(&self) -> bool {
        let shared = lock(&self.shared);
        shared.plan.is_some() || shared.supervisor.is_busy()
    }

    pub fn active_session(&self) -> Option<Session> {
        lock(&self.shared).supervisor.active_session()
    }

    /// Cancels whatever is running, waits for it to settle and stops the relay. Every event
    /// produced before shutdown is still delivered.
    pub fn shutdown(&mut self) {
        let Some(relay) = self.relay.take() else {
            return;
        };
        {
            let mut shared = lock(&self.shared);
            if let Some(plan) = shared.plan.as_mut() {
                plan.cancel_requested = true;
            }
            shared.supervisor.shutdown();
        }
        let _ = self.relay_tx.send(RelayMsg::Stop);
        let _ = relay.join();
    }
}

impl Drop for SessionController {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn lock(shared: &Mutex<Shared>) -> MutexGuard<'_, Shared> {
    shared.lock().unwrap_or_else(PoisonError::into_inner)
}

fn relay_loop(rx: Receiver<RelayMsg>, shared: Arc<Mutex<Shared>>, ui: Sender<SessionEvent>) {
    for msg in rx {
        let event = match msg {
            RelayMsg::Session(event) => event,
            RelayMsg::Stop => break,
        };
        let outcome = event
            .terminal_report()
            .map(|(_, report)| report.outcome.clone());
        let _ = ui.send(event);
        if let Some(outcome) = outcome {
            advance_plan(&shared, outcome, &ui);
        }
    }
    debug!("relay stopped");
}

fn advance_plan(shared: &Mutex<Shared>, outcome: SessionOutcome, ui: &Sender<SessionEvent>) {
    let mut shared = lock(shared);
    let Shared { supervisor, plan } = &mut *shared;
    let Some(current) = plan.as_mut() else {
        return;
    };

    if outcome == SessionOutcome::Completed {
        current.completed += 1;
    }
    let continue_plan = outcome == SessionOutcome::Completed
        && !current.cancel_requested
        && current.started < current.requested;
    if continue_plan {
        current.started += 1;
        let _ = ui.send(SessionEvent::RunScheduled {
            run: current.started,
            of: current.requested,
        });
        match supervisor.start(current.spec.clone()) {
            Ok(session) => {
                debug!(session = %session.id, run = current.started, "next run started");
                return;
            }
            Err(error) => warn!(%error, "could not start next run"),
        }
    }

    if let Some(finished) = plan.take() {
        info!(
            tag = %finished.spec.tag,
            completed = finished.completed,
            requested = finished.requested,
            "request finished"
        );
        let _ = ui.send(SessionEvent::BatchFinished {
            completed: finished.completed,
            requested: finished.requested,
            last_outcome: Some(outcome),
        });
    }
}
