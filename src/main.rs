//! `ciris` command-line front end over the library crate.
//!
//! Generalizes the teacher's `main.rs` shape (a `clap` derive `Cli` with a
//! flat `Commands` enum, `miette::set_hook` + `tracing_subscriber::fmt`
//! wired up first thing in `main`, `.into_diagnostic()` at every fallible
//! boundary) to this runtime's five entry points: run the reasoning loop
//! as a daemon, submit a one-off observation and watch it drain, inspect
//! the resolved configuration, walk an exported audit log for tampering,
//! and check a signed emergency command's envelope.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::{Parser, Subcommand};
use ed25519_dalek::SigningKey;
use miette::{IntoDiagnostic, Result};
use rand::rngs::OsRng;
use tracing::info;

use ciris_runtime::audit::{verify_audit_file, AuthorityRegistry, SignedCommand};
use ciris_runtime::clock::Clock;
use ciris_runtime::config::Config;
use ciris_runtime::dma::cascade::DmaProviders;
use ciris_runtime::dma::{ActionSelection, ActionVerb, Aspdma, Csdma, DmaEvaluation, DmaResults, Dsdma, Pdma};
use ciris_runtime::error::DmaError;
use ciris_runtime::graph::store::GraphStore;
use ciris_runtime::init::{InitCoordinator, Phase};
use ciris_runtime::runtime::RuntimeContext;
use ciris_runtime::task::{ChannelRef, Task};
use ciris_runtime::thought::Thought;

#[derive(Parser, Clone)]
#[command(name = "ciris", version, about = "Ethically-governed autonomous agent reasoning runtime")]
struct Cli {
    /// TOML configuration file; falls back to built-in defaults when absent.
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Directory for the persistent graph store; omit for an in-memory run.
    #[arg(long, global = true)]
    data_dir: Option<PathBuf>,

    #[arg(long, global = true, default_value = "info")]
    log_level: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Clone)]
enum Commands {
    /// Run the reasoning loop as a daemon, processing rounds on an interval
    /// until interrupted.
    Run {
        /// Occurrence id to drive; defaults to the config's agent_occurrence_id.
        #[arg(long)]
        occurrence: Option<String>,
    },
    /// Submit one observation and drive it to completion, printing every
    /// trace produced along the way.
    Submit {
        channel: String,
        text: String,
        #[arg(long, default_value = "default")]
        occurrence: String,
        #[arg(long, default_value_t = 10)]
        max_rounds: u32,
    },
    /// Print the resolved configuration.
    Status,
    /// Walk an exported audit log and report the first broken link, if any.
    VerifyAudit {
        /// Defaults to `<data-dir>/audit.jsonl` when omitted.
        #[arg(long)]
        file: Option<PathBuf>,
    },
    /// Verify a signed emergency command against a trusted authority key.
    ///
    /// There is no running daemon this process can reach directly; this
    /// checks the envelope's signature and expiry and reports whether it
    /// would be accepted, for an operator to relay to the daemon's own
    /// control channel.
    Shutdown {
        /// Path to a JSON-encoded `SignedCommand`.
        #[arg(long)]
        signed: PathBuf,
        /// Hex-encoded Ed25519 public key of the trusted authority.
        #[arg(long)]
        authority_key: String,
        /// Key id the command's `authority_key_id` must match.
        #[arg(long, default_value = "root")]
        authority_key_id: String,
    },
}

fn default_audit_path(data_dir: &Option<PathBuf>) -> Option<PathBuf> {
    data_dir.as_ref().map(|dir| dir.join("audit.jsonl"))
}

fn resolve_config(path: &Option<PathBuf>) -> Result<Config> {
    match path {
        Some(path) => Config::from_file(path).into_diagnostic(),
        None => Ok(Config::default()),
    }
}

fn resolve_graph(clock: Clock, data_dir: &Option<PathBuf>) -> Result<Arc<GraphStore>> {
    match data_dir {
        Some(dir) => {
            std::fs::create_dir_all(dir).into_diagnostic()?;
            Ok(Arc::new(GraphStore::with_persistence(clock, dir).into_diagnostic()?))
        }
        None => Ok(Arc::new(GraphStore::memory_only(clock))),
    }
}

/// Heuristic evaluator shared by PDMA/CSDMA/DSDMA in this binary: a
/// conversational channel gets a clean bill, anything flagged via
/// `"###harm###"` in the thought content is marked as failing alignment so
/// the conscience faculties (see `dma::conscience`) have something to
/// reject end to end.
struct HeuristicEvaluator {
    label: &'static str,
}

impl HeuristicEvaluator {
    async fn score(&self, thought: &Thought) -> Result<DmaEvaluation, DmaError> {
        let flagged = thought.content.contains("###harm###");
        Ok(DmaEvaluation {
            alignment: if flagged { 0.1 } else { 0.85 },
            plausibility: 0.8,
            domain_fit: 0.8,
            notes: format!("{} heuristic pass", self.label),
        })
    }
}

#[async_trait::async_trait]
impl Pdma for HeuristicEvaluator {
    async fn evaluate(&self, _task: &Task, thought: &Thought) -> Result<DmaEvaluation, DmaError> {
        self.score(thought).await
    }
}

#[async_trait::async_trait]
impl Csdma for HeuristicEvaluator {
    async fn evaluate(&self, _task: &Task, thought: &Thought) -> Result<DmaEvaluation, DmaError> {
        self.score(thought).await
    }
}

#[async_trait::async_trait]
impl Dsdma for HeuristicEvaluator {
    async fn evaluate(&self, _task: &Task, thought: &Thought) -> Result<DmaEvaluation, DmaError> {
        self.score(thought).await
    }
}

/// Default action selector: speaks an echo of the incoming observation,
/// then completes once it sees its own follow-up come back around. Real
/// deployments replace this with an LLM-backed ASPDMA; this keeps the
/// binary runnable without external dependencies.
struct EchoAspdma;

#[async_trait::async_trait]
impl Aspdma for EchoAspdma {
    async fn select(&self, _task: &Task, thought: &Thought, _results: &DmaResults, conscience_feedback: &[String]) -> Result<ActionSelection, DmaError> {
        if !conscience_feedback.is_empty() {
            return Ok(ActionSelection {
                selected_action: ActionVerb::Ponder,
                action_parameters: serde_json::json!({"questions": conscience_feedback}),
                rationale: "conscience raised concerns, pondering before retry".to_string(),
            });
        }
        if thought.content.starts_with("SPEAK_SUCCESSFUL") || thought.content.starts_with("PONDER") {
            return Ok(ActionSelection {
                selected_action: ActionVerb::TaskComplete,
                action_parameters: serde_json::json!({}),
                rationale: "observation acknowledged".to_string(),
            });
        }
        Ok(ActionSelection {
            selected_action: ActionVerb::Speak,
            action_parameters: serde_json::json!({
                "text": format!("echo: {}", thought.content),
                "entropy": 0.05,
                "coherence": 0.9,
            }),
            rationale: "echoing observation".to_string(),
        })
    }
}

fn default_dma_providers() -> DmaProviders {
    DmaProviders {
        pdma: Arc::new(HeuristicEvaluator { label: "PDMA" }),
        csdma: Arc::new(HeuristicEvaluator { label: "CSDMA" }),
        dsdma: Arc::new(HeuristicEvaluator { label: "DSDMA" }),
        aspdma: Arc::new(EchoAspdma),
    }
}

async fn build_runtime(cli: &Cli) -> Result<Arc<RuntimeContext>> {
    let config = resolve_config(&cli.config)?;
    let clock = Clock::new();
    let graph = resolve_graph(clock, &cli.data_dir)?;
    let signing_key = SigningKey::generate(&mut OsRng);
    RuntimeContext::new(config, signing_key, default_dma_providers(), graph).into_diagnostic()
}

/// Wires the eight init phases to the subsystems constructed so far. Each
/// step is a cheap self-check rather than real provisioning work, since
/// every subsystem is already live by the time `RuntimeContext::new`
/// returns; this mirrors the teacher's pattern of keeping registered steps
/// small and independently verifiable.
fn build_init_coordinator(runtime: &Arc<RuntimeContext>) -> InitCoordinator {
    let mut coordinator = InitCoordinator::new(Duration::from_secs(30), Duration::from_secs(10));

    coordinator.register_step(Phase::Infrastructure, "registry", true, || async { Ok(()) });

    let graph = runtime.graph.clone();
    coordinator.register_step(Phase::Database, "graph-store", true, move || {
        let graph = graph.clone();
        async move {
            let _ = graph.node_count();
            Ok(())
        }
    });

    coordinator.register_step(Phase::Memory, "memory-bus", true, || async { Ok(()) });

    let audit = runtime.audit.clone();
    coordinator.register_step(Phase::Identity, "signing-key", true, move || {
        let audit = audit.clone();
        async move {
            let _ = audit.verifying_key();
            Ok(())
        }
    });

    coordinator.register_step(Phase::Security, "authority-registry", false, || async { Ok(()) });
    coordinator.register_step(Phase::Services, "bus-providers", true, || async { Ok(()) });
    coordinator.register_step(Phase::Components, "dispatcher", true, || async { Ok(()) });

    let audit = runtime.audit.clone();
    coordinator.register_step(Phase::Verification, "audit-chain", true, move || {
        let audit = audit.clone();
        async move { audit.verify().map_err(|e| e.to_string()) }
    });

    coordinator
}

async fn run_daemon(cli: &Cli, occurrence: Option<String>) -> Result<()> {
    let runtime = build_runtime(cli).await?;
    let occurrence_id = occurrence.unwrap_or_else(|| runtime.config.get().agent_occurrence_id.clone());

    let coordinator = build_init_coordinator(&runtime);
    coordinator.run().await.into_diagnostic()?;
    info!(occurrence_id = %occurrence_id, "runtime initialized, entering reasoning loop");

    let mut shutdown_rx = coordinator.shutdown_receiver();
    let round_delay = Duration::from_secs_f64(runtime.config.get().round_delay_seconds);

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("ctrl-c received, starting graceful shutdown");
                let grace = Duration::from_secs(runtime.config.get().shutdown_grace_seconds);
                coordinator.shutdown(grace).await;
                break;
            }
            _ = shutdown_rx.changed() => {
                if *shutdown_rx.borrow() {
                    break;
                }
            }
            _ = tokio::time::sleep(round_delay) => {
                if runtime.active_task_count(&occurrence_id) == 0 {
                    continue;
                }
                match runtime.process_round(&occurrence_id).await {
                    Ok(processed) => {
                        for item in &processed {
                            info!(task_id = %item.task_id, action = %item.trace.components.action.selected_action, "round processed");
                        }
                        if let Some(path) = default_audit_path(&cli.data_dir) {
                            if let Err(err) = runtime.audit.export(&path) {
                                tracing::warn!(%err, "failed to export audit log");
                            }
                        }
                    }
                    Err(err) => tracing::error!(%err, "round failed"),
                }
            }
        }
    }

    if let Some(path) = default_audit_path(&cli.data_dir) {
        runtime.audit.export(&path).into_diagnostic()?;
    }
    info!(entries = runtime.audit.len(), "shutdown complete");
    Ok(())
}

async fn run_submit(cli: &Cli, channel: String, text: String, occurrence: String, max_rounds: u32) -> Result<()> {
    let runtime = build_runtime(cli).await?;
    runtime
        .submit_observation(&occurrence, ChannelRef(channel), text)
        .await
        .into_diagnostic()?;

    for round in 0..max_rounds {
        let processed = runtime.process_round(&occurrence).await.into_diagnostic()?;
        for item in &processed {
            println!(
                "round {round}: task={} action={} outcome={}",
                item.task_id, item.trace.components.action.selected_action, item.trace.components.outcome
            );
        }
        if runtime.active_task_count(&occurrence) == 0 {
            break;
        }
    }

    if let Some(path) = default_audit_path(&cli.data_dir) {
        runtime.audit.export(&path).into_diagnostic()?;
    }
    match runtime.audit.verify() {
        Ok(()) => println!("audit chain verified: {} entries", runtime.audit.len()),
        Err(err) => println!("audit chain verification FAILED: {err}"),
    }
    Ok(())
}

fn run_status(cli: &Cli) -> Result<()> {
    let config = resolve_config(&cli.config)?;
    match config.validate() {
        Ok(()) => println!("configuration valid"),
        Err(err) => println!("configuration INVALID: {err}"),
    }
    println!("{}", toml::to_string_pretty(&config).into_diagnostic()?);
    Ok(())
}

/// Implements the `ciris verify-audit` subcommand: walks an exported log
/// independent of any live runtime and reports the first broken link
/// (Testable Property 8), rather than just pass/fail.
fn run_verify_audit(cli: &Cli, file: Option<PathBuf>) -> Result<()> {
    let path = file.or_else(|| default_audit_path(&cli.data_dir)).ok_or_else(|| {
        miette::miette!("no audit log path given: pass --file or --data-dir")
    })?;

    match verify_audit_file(&path) {
        Ok(report) => {
            println!("audit chain verified: {} entries ({})", report.verified_entries, path.display());
            Ok(())
        }
        Err(err) => {
            println!("audit chain verification FAILED ({}): {err}", path.display());
            Err(miette::miette!("{err}"))
        }
    }
}

/// Implements `ciris shutdown --signed <path>`: checks a signed emergency
/// command's authenticity and expiry against one trusted authority key.
/// Delivery to a running daemon happens over whatever control channel that
/// daemon exposes; this binary only validates the envelope.
fn run_shutdown(signed: PathBuf, authority_key: String, authority_key_id: String) -> Result<()> {
    let command: SignedCommand = serde_json::from_str(&std::fs::read_to_string(&signed).into_diagnostic()?).into_diagnostic()?;

    let key_bytes: [u8; 32] = hex::decode(&authority_key)
        .into_diagnostic()?
        .try_into()
        .map_err(|_| miette::miette!("authority key must be 32 bytes"))?;
    let verifying_key = ed25519_dalek::VerifyingKey::from_bytes(&key_bytes).into_diagnostic()?;

    let mut authorities = AuthorityRegistry::new();
    authorities.trust(authority_key_id, verifying_key);

    match authorities.verify(&command, chrono::Utc::now()) {
        Ok(()) => {
            println!("signed command is valid: {:?}, expires {}", command.command_type, command.expires_at);
            println!("relay this file to the running daemon's control channel to act on it");
            Ok(())
        }
        Err(err) => {
            println!("signed command REJECTED: {err}");
            Err(miette::miette!("{err}"))
        }
    }
}

fn main() -> Result<()> {
    miette::set_hook(Box::new(|_| Box::new(miette::MietteHandlerOpts::new().terminal_links(true).build())))
        .expect("diagnostic hook installs exactly once");

    let cli = Cli::parse();
    tracing_subscriber::fmt().with_env_filter(cli.log_level.clone()).init();

    let command = cli.command.clone();
    let runtime = tokio::runtime::Runtime::new().into_diagnostic()?;
    runtime.block_on(async {
        match command {
            Commands::Run { occurrence } => run_daemon(&cli, occurrence).await,
            Commands::Submit { channel, text, occurrence, max_rounds } => run_submit(&cli, channel, text, occurrence, max_rounds).await,
            Commands::Status => run_status(&cli),
            Commands::VerifyAudit { file } => run_verify_audit(&cli, file),
            Commands::Shutdown { signed, authority_key, authority_key_id } => run_shutdown(signed, authority_key, authority_key_id),
        }
    })
}
