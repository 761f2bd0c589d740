//! Eight-phase init/shutdown coordinator.
//!
//! Generalizes the teacher's `tokio::select!`-driven `AgentDaemon::run`
//! interval loop (`agent/daemon.rs`) into a fixed ordered phase sequence
//! with per-step criticality and verification, plus the matching
//! coordinated shutdown drain.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tracing::{error, info, warn};

use crate::error::InitError;

type StepFuture = Pin<Box<dyn Future<Output = Result<(), String>> + Send>>;
type StepHandler = Arc<dyn Fn() -> StepFuture + Send + Sync>;
type Verifier = Arc<dyn Fn() -> bool + Send + Sync>;

/// The eight fixed phases executed in order (spec §4.10).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Phase {
    Infrastructure,
    Database,
    Memory,
    Identity,
    Security,
    Services,
    Components,
    Verification,
}

impl std::fmt::Display for Phase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Phase::Infrastructure => "infrastructure",
            Phase::Database => "database",
            Phase::Memory => "memory",
            Phase::Identity => "identity",
            Phase::Security => "security",
            Phase::Services => "services",
            Phase::Components => "components",
            Phase::Verification => "verification",
        };
        write!(f, "{s}")
    }
}

impl Phase {
    pub const ORDER: [Phase; 8] = [
        Phase::Infrastructure,
        Phase::Database,
        Phase::Memory,
        Phase::Identity,
        Phase::Security,
        Phase::Services,
        Phase::Components,
        Phase::Verification,
    ];
}

struct Step {
    name: String,
    critical: bool,
    handler: StepHandler,
    verifier: Option<Verifier>,
}

/// Coordinates startup through the fixed phase order and shutdown as a
/// deterministic drain.
pub struct InitCoordinator {
    steps: Vec<(Phase, Step)>,
    step_timeout: Duration,
    verify_timeout: Duration,
    shutdown_tx: watch::Sender<bool>,
    shutdown_rx: watch::Receiver<bool>,
}

impl InitCoordinator {
    pub fn new(step_timeout: Duration, verify_timeout: Duration) -> Self {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        Self {
            steps: Vec::new(),
            step_timeout,
            verify_timeout,
            shutdown_tx,
            shutdown_rx,
        }
    }

    pub fn shutdown_receiver(&self) -> watch::Receiver<bool> {
        self.shutdown_rx.clone()
    }

    /// Register a named step in `phase`. `critical` steps abort the phase
    /// on failure; non-critical steps log and continue.
    pub fn register_step<F, Fut>(&mut self, phase: Phase, name: impl Into<String>, critical: bool, handler: F)
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<(), String>> + Send + 'static,
    {
        self.steps.push((
            phase,
            Step {
                name: name.into(),
                critical,
                handler: Arc::new(move || Box::pin(handler())),
                verifier: None,
            },
        ));
    }

    pub fn register_verifier<V>(&mut self, phase: Phase, name: &str, verifier: V)
    where
        V: Fn() -> bool + Send + Sync + 'static,
    {
        if let Some((_, step)) = self.steps.iter_mut().find(|(p, s)| *p == phase && s.name == name) {
            step.verifier = Some(Arc::new(verifier));
        }
    }

    /// Run every phase in order. Returns on the first critical-step
    /// failure or verification failure.
    pub async fn run(&self) -> Result<(), InitError> {
        for phase in Phase::ORDER {
            info!(phase = %phase, "entering init phase");
            for (step_phase, step) in &self.steps {
                if *step_phase != phase {
                    continue;
                }
                let outcome = tokio::time::timeout(self.step_timeout, (step.handler)()).await;
                match outcome {
                    Ok(Ok(())) => {
                        if let Some(verifier) = &step.verifier {
                            let verified = tokio::time::timeout(self.verify_timeout, async { verifier() }).await;
                            match verified {
                                Ok(true) => {}
                                Ok(false) => {
                                    return Err(InitError::VerificationFailed {
                                        step: step.name.clone(),
                                        message: "verifier returned false".to_string(),
                                    });
                                }
                                Err(_) => {
                                    return Err(InitError::StepTimeout {
                                        phase: phase.to_string(),
                                        step: step.name.clone(),
                                        timeout_secs: self.verify_timeout.as_secs_f64(),
                                    });
                                }
                            }
                        }
                        info!(phase = %phase, step = %step.name, "step complete");
                    }
                    Ok(Err(message)) if step.critical => {
                        error!(phase = %phase, step = %step.name, %message, "critical step failed");
                        return Err(InitError::CriticalStepFailed {
                            phase: phase.to_string(),
                            step: step.name.clone(),
                            message,
                        });
                    }
                    Ok(Err(message)) => {
                        warn!(phase = %phase, step = %step.name, %message, "non-critical step failed, continuing");
                    }
                    Err(_) if step.critical => {
                        return Err(InitError::StepTimeout {
                            phase: phase.to_string(),
                            step: step.name.clone(),
                            timeout_secs: self.step_timeout.as_secs_f64(),
                        });
                    }
                    Err(_) => {
                        warn!(phase = %phase, step = %step.name, "non-critical step timed out, continuing");
                    }
                }
            }
        }
        Ok(())
    }

    /// Coordinated drain: broadcast shutdown, then wait up to `grace`
    /// before the caller should invoke the emergency kill path.
    pub async fn shutdown(&self, grace: Duration) {
        info!("broadcasting shutdown signal");
        let _ = self.shutdown_tx.send(true);
        tokio::time::sleep(grace).await;
    }

    /// Emergency process termination (spec §4.10 step 5): used only after
    /// the grace window elapses and the runtime has not exited cleanly.
    pub fn emergency_kill() {
        error!("grace window elapsed; forcing process termination");
        // SAFETY: libc::_exit bypasses destructors, matching the spec's
        // "OS-level process-kill path" semantics for a last-resort exit.
        unsafe { libc::_exit(1) };
    }
}
