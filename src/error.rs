//! Rich diagnostic error types for the CIRIS reasoning runtime.
//!
//! Each subsystem defines its own error type with miette `#[diagnostic]` derives,
//! providing error codes, help text, and source chains so operators know exactly
//! what went wrong and how to fix it. All subsystem errors are unified under
//! [`CirisError`].

use miette::Diagnostic;
use thiserror::Error;

/// Top-level error type for the CIRIS runtime.
///
/// Each variant wraps a subsystem-specific error, preserving the full diagnostic
/// chain (error codes, help text) through to the caller.
#[derive(Debug, Error, Diagnostic)]
pub enum CirisError {
    #[error(transparent)]
    #[diagnostic(transparent)]
    Graph(#[from] GraphError),

    #[error(transparent)]
    #[diagnostic(transparent)]
    Registry(#[from] RegistryError),

    #[error(transparent)]
    #[diagnostic(transparent)]
    Bus(#[from] BusError),

    #[error(transparent)]
    #[diagnostic(transparent)]
    Dma(#[from] DmaError),

    #[error(transparent)]
    #[diagnostic(transparent)]
    Conscience(#[from] ConscienceError),

    #[error(transparent)]
    #[diagnostic(transparent)]
    Dispatch(#[from] DispatchError),

    #[error(transparent)]
    #[diagnostic(transparent)]
    StateMachine(#[from] StateMachineError),

    #[error(transparent)]
    #[diagnostic(transparent)]
    Audit(#[from] AuditError),

    #[error(transparent)]
    #[diagnostic(transparent)]
    Init(#[from] InitError),

    #[error(transparent)]
    #[diagnostic(transparent)]
    Config(#[from] ConfigError),
}

/// Crate-wide result alias.
pub type CirisResult<T> = std::result::Result<T, CirisError>;

// ---------------------------------------------------------------------------
// Graph errors
// ---------------------------------------------------------------------------

#[derive(Debug, Error, Diagnostic)]
pub enum GraphError {
    #[error("node not found: {node_id}")]
    #[diagnostic(
        code(ciris::graph::node_not_found),
        help("Verify the node_id is correct, or that the node has not been consolidated away.")
    )]
    NodeNotFound { node_id: String },

    #[error("duplicate node id: {node_id}")]
    #[diagnostic(
        code(ciris::graph::duplicate_node),
        help("Node IDs must be unique. Use a fresh ID from the clock/ID generator.")
    )]
    DuplicateNode { node_id: String },

    #[error("edge endpoint missing: {endpoint} (edge {source_id} -> {target})")]
    #[diagnostic(
        code(ciris::graph::missing_endpoint),
        help("Both source and target nodes must exist before linking them. Put the node first.")
    )]
    MissingEndpoint {
        endpoint: String,
        source_id: String,
        target: String,
    },

    #[error("duplicate edge: {source_id} -> {target} ({edge_type})")]
    #[diagnostic(
        code(ciris::graph::duplicate_edge),
        help("An edge of this type already exists between these nodes; link() is not additive for duplicates.")
    )]
    DuplicateEdge {
        source_id: String,
        target: String,
        edge_type: String,
    },

    #[error("schema violation for node_type {node_type}: {message}")]
    #[diagnostic(
        code(ciris::graph::schema_violation),
        help("Attributes must match the typed schema registered for this node_type.")
    )]
    SchemaViolation { node_type: String, message: String },

    #[error("scope transition from {from:?} to {to:?} requires authority approval")]
    #[diagnostic(
        code(ciris::graph::scope_requires_authority),
        help("Escalate via the wisdom bus before widening a node's scope.")
    )]
    ScopeRequiresAuthority { from: String, to: String },

    #[error("optimistic version conflict on node {node_id}: expected {expected}, found {found}")]
    #[diagnostic(
        code(ciris::graph::version_conflict),
        help("Another writer updated this node concurrently. Re-read and retry.")
    )]
    VersionConflict {
        node_id: String,
        expected: u64,
        found: u64,
    },

    #[error("store I/O error: {message}")]
    #[diagnostic(code(ciris::graph::io), help("Check the data directory permissions and disk space."))]
    Io { message: String },

    #[error("serialization error: {message}")]
    #[diagnostic(code(ciris::graph::serde), help("The stored attribute schema may have changed between versions."))]
    Serialization { message: String },
}

// ---------------------------------------------------------------------------
// Service registry errors
// ---------------------------------------------------------------------------

#[derive(Debug, Error, Diagnostic)]
pub enum RegistryError {
    #[error("no provider registered for service kind {kind}")]
    #[diagnostic(
        code(ciris::registry::no_provider),
        help("Register at least one provider for this service kind before calling get()/broadcast().")
    )]
    NoProvider { kind: String },

    #[error("no healthy provider for service kind {kind} (all circuits open)")]
    #[diagnostic(
        code(ciris::registry::all_open),
        help("All registered providers have open circuit breakers. Wait for the cool-down window or register a fallback.")
    )]
    AllCircuitsOpen { kind: String },

    #[error("provider not found: {provider_id}")]
    #[diagnostic(code(ciris::registry::unknown_provider), help("unregister() was called with an unknown provider_id."))]
    UnknownProvider { provider_id: String },
}

// ---------------------------------------------------------------------------
// Bus errors
// ---------------------------------------------------------------------------

#[derive(Debug, Error, Diagnostic)]
pub enum BusError {
    #[error(transparent)]
    #[diagnostic(transparent)]
    Registry(#[from] RegistryError),

    #[error("operation on {kind} bus timed out after {timeout_secs}s")]
    #[diagnostic(
        code(ciris::bus::timeout),
        help("The selected provider did not respond within the configured timeout. This counts toward the circuit breaker.")
    )]
    Timeout { kind: String, timeout_secs: f64 },

    #[error("provider {provider_id} rejected the request: {message}")]
    #[diagnostic(code(ciris::bus::provider_error), help("Inspect the provider-specific message for details."))]
    ProviderError { provider_id: String, message: String },

    #[error("all providers for {kind} exhausted after fallback")]
    #[diagnostic(
        code(ciris::bus::exhausted),
        help("Every healthy provider was tried and failed. Register more providers or investigate upstream failures.")
    )]
    Exhausted { kind: String },
}

// ---------------------------------------------------------------------------
// DMA cascade errors
// ---------------------------------------------------------------------------

#[derive(Debug, Error, Diagnostic)]
pub enum DmaError {
    #[error("{dma} timed out after {timeout_secs}s")]
    #[diagnostic(
        code(ciris::dma::timeout),
        help("Timeouts count toward DMA_RETRY_LIMIT; once exhausted the thought auto-defers.")
    )]
    Timeout { dma: String, timeout_secs: f64 },

    #[error("{dma} exceeded retry limit ({limit})")]
    #[diagnostic(
        code(ciris::dma::retry_limit),
        help("The thought has been force-deferred. Increase DMA_RETRY_LIMIT or investigate the failing DMA provider.")
    )]
    RetryLimitExceeded { dma: String, limit: u32 },

    #[error("ASPDMA produced malformed output: {message}")]
    #[diagnostic(
        code(ciris::dma::malformed_aspdma),
        help("Malformed ASPDMA output is treated as a retryable DMA failure, not a conscience violation.")
    )]
    MalformedOutput { message: String },
}

// ---------------------------------------------------------------------------
// Conscience errors
// ---------------------------------------------------------------------------

#[derive(Debug, Error, Diagnostic)]
pub enum ConscienceError {
    #[error("conscience faculty '{faculty}' failed: {reason}")]
    #[diagnostic(
        code(ciris::conscience::violation),
        help("This is a normal signal, not a bug — it drives a recursive ASPDMA re-invocation.")
    )]
    Violation { faculty: String, reason: String },

    #[error("thought depth {depth} >= max depth {max_depth}")]
    #[diagnostic(
        code(ciris::conscience::depth_exceeded),
        help("Depth-exceeded thoughts are force-overridden to DEFER and are never retried.")
    )]
    DepthExceeded { depth: u32, max_depth: u32 },

    #[error("conscience retry limit ({limit}) exhausted for thought {thought_id}")]
    #[diagnostic(
        code(ciris::conscience::retry_exhausted),
        help("The thought DEFERs after exhausting conscience_retry_limit recursive ASPDMA attempts.")
    )]
    RetryExhausted { thought_id: String, limit: u32 },
}

// ---------------------------------------------------------------------------
// Dispatch errors
// ---------------------------------------------------------------------------

#[derive(Debug, Error, Diagnostic)]
pub enum DispatchError {
    #[error("no handler registered for action verb {verb}")]
    #[diagnostic(code(ciris::dispatch::no_handler), help("Every one of the 10 action verbs must have a registered handler."))]
    NoHandler { verb: String },

    #[error("handler for {verb} failed: {message}")]
    #[diagnostic(
        code(ciris::dispatch::handler_failed),
        help("The handler's side effects were rolled back where possible; the thought is marked deferred.")
    )]
    HandlerFailed { verb: String, message: String },

    #[error("validation error: {message}")]
    #[diagnostic(code(ciris::dispatch::validation), help("The selected action's parameters failed validation; the thought is rejected."))]
    Validation { message: String },

    #[error("authority required: {reason}")]
    #[diagnostic(
        code(ciris::dispatch::authority_required),
        help("A DEFER was emitted to the wisdom bus; processing resumes once the authority resolves it.")
    )]
    AuthorityRequired { reason: String },
}

// ---------------------------------------------------------------------------
// State machine errors
// ---------------------------------------------------------------------------

#[derive(Debug, Error, Diagnostic)]
pub enum StateMachineError {
    #[error("illegal transition: {from} -> {to}")]
    #[diagnostic(
        code(ciris::state::illegal_transition),
        help("Check the allowed transition graph (WAKEUP -> WORK -> {{PLAY, SOLITUDE, DREAM}} -> ... -> SHUTDOWN).")
    )]
    IllegalTransition { from: String, to: String },

    #[error("cannot enter DREAM while {active_tasks} task(s) are active")]
    #[diagnostic(
        code(ciris::state::dream_blocked),
        help("Drain or defer active tasks before entering the DREAM state.")
    )]
    DreamBlocked { active_tasks: usize },
}

// ---------------------------------------------------------------------------
// Audit chain errors
// ---------------------------------------------------------------------------

#[derive(Debug, Error, Diagnostic)]
pub enum AuditError {
    #[error("signature verification failed at sequence {seq}")]
    #[diagnostic(
        code(ciris::audit::bad_signature),
        help("This record's signature does not match its payload. The chain is compromised from this point forward.")
    )]
    BadSignature { seq: u64 },

    #[error("chain link broken at sequence {seq}: expected prev_hash {expected}, found {found}")]
    #[diagnostic(
        code(ciris::audit::broken_link),
        help("A record was tampered with or deleted. Treat the chain as compromised from this sequence onward.")
    )]
    BrokenLink {
        seq: u64,
        expected: String,
        found: String,
    },

    #[error("signed command expired at {expires_at}")]
    #[diagnostic(code(ciris::audit::expired_command), help("Request a freshly signed command; expired commands are rejected without logging."))]
    ExpiredCommand { expires_at: String },

    #[error("signed command key '{key_id}' is not a known authority")]
    #[diagnostic(code(ciris::audit::unknown_authority), help("Only commands signed by a preloaded authority key are accepted."))]
    UnknownAuthority { key_id: String },

    #[error("failed to read or write audit log at {path}: {message}")]
    #[diagnostic(code(ciris::audit::log_io), help("Check that the data directory is writable and the audit log file is not held open elsewhere."))]
    LogIo { path: String, message: String },

    #[error("audit log at {path} is malformed: {message}")]
    #[diagnostic(code(ciris::audit::log_corrupt), help("The log's header or an entry line did not parse. It may have been truncated or hand-edited."))]
    LogCorrupt { path: String, message: String },
}

// ---------------------------------------------------------------------------
// Init / shutdown coordinator errors
// ---------------------------------------------------------------------------

#[derive(Debug, Error, Diagnostic)]
pub enum InitError {
    #[error("critical step '{step}' in phase '{phase}' failed: {message}")]
    #[diagnostic(
        code(ciris::init::critical_step_failed),
        help("Critical steps abort their phase on failure. Fix the underlying cause and restart.")
    )]
    CriticalStepFailed {
        phase: String,
        step: String,
        message: String,
    },

    #[error("step '{step}' in phase '{phase}' timed out after {timeout_secs}s")]
    #[diagnostic(code(ciris::init::step_timeout), help("Increase the step timeout or investigate why the step is slow."))]
    StepTimeout {
        phase: String,
        step: String,
        timeout_secs: f64,
    },

    #[error("verifier for step '{step}' failed: {message}")]
    #[diagnostic(code(ciris::init::verification_failed), help("The step's async handler succeeded but its verifier rejected the result."))]
    VerificationFailed { step: String, message: String },
}

// ---------------------------------------------------------------------------
// Configuration errors
// ---------------------------------------------------------------------------

#[derive(Debug, Error, Diagnostic)]
pub enum ConfigError {
    #[error("invalid configuration: {message}")]
    #[diagnostic(
        code(ciris::config::invalid),
        help("Configuration errors are fatal at startup and abort initialization.")
    )]
    Invalid { message: String },

    #[error("failed to parse config file {path}: {message}")]
    #[diagnostic(code(ciris::config::parse), help("Check the TOML syntax and option names against the documented schema."))]
    Parse { path: String, message: String },
}
