//! # ciris-runtime
//!
//! An ethically-governed autonomous agent reasoning runtime: a service
//! registry/bus fabric, a cognitive state machine, a DMA-cascade +
//! conscience thought-processing pipeline, a ten-action dispatcher, a
//! typed graph memory substrate, and an init/shutdown coordinator.
//!
//! ## Architecture
//!
//! - **Clock & ids** (`clock`): monotonic tick source and typed id generation.
//! - **Graph memory** (`graph`): typed nodes/edges, in-memory index with an
//!   optional `redb` persistence tier.
//! - **Service registry + buses** (`registry`, `bus`): six typed message
//!   buses (memory, LLM, wisdom, tool, communication, runtime-control) over
//!   a provider registry with per-provider circuit breakers.
//! - **Task/thought queue** (`queue`, `task`, `thought`): per-occurrence
//!   pending/active task tracking feeding the reasoning loop.
//! - **DMA cascade + conscience** (`dma`): PDMA/CSDMA/DSDMA evaluation
//!   feeding a recursive ASPDMA/conscience action-selection loop.
//! - **Dispatcher** (`dispatch`): the ten action-verb handlers.
//! - **Cognitive state machine** (`state_machine`) and **incident
//!   analysis** (`incident`): WAKEUP/WORK/PLAY/SOLITUDE/DREAM/SHUTDOWN and
//!   the dream-cycle pattern analysis run within it.
//! - **Audit chain** (`audit`): signed, hash-linked trace records plus
//!   signed emergency commands.
//! - **Init/shutdown coordinator** (`init`) and **telemetry** (`telemetry`):
//!   eight-phase startup/drain and pull-model metrics aggregation.
//! - **Runtime context** (`runtime`): the process-wide facade wiring every
//!   subsystem together and driving the per-occurrence processing loop.
//!
//! ## Library usage
//!
//! ```no_run
//! use ciris_runtime::config::Config;
//! use ciris_runtime::runtime::RuntimeContext;
//! use ciris_runtime::task::ChannelRef;
//! use ciris_runtime::dma::cascade::DmaProviders;
//! use ciris_runtime::graph::store::GraphStore;
//! use ciris_runtime::clock::Clock;
//! use ed25519_dalek::SigningKey;
//! use rand::rngs::OsRng;
//! use std::sync::Arc;
//!
//! # async fn run(dma: DmaProviders) -> Result<(), Box<dyn std::error::Error>> {
//! let config = Config::default();
//! let clock = Clock::new();
//! let graph = Arc::new(GraphStore::memory_only(clock));
//! let signing_key = SigningKey::generate(&mut OsRng);
//! let runtime = RuntimeContext::new(config, signing_key, dma, graph)?;
//! runtime.submit_observation("occ-1", ChannelRef("cli:stdin".into()), "hello").await?;
//! runtime.process_round("occ-1").await?;
//! # Ok(())
//! # }
//! ```

pub mod audit;
pub mod bus;
pub mod clock;
pub mod config;
pub mod dispatch;
pub mod dma;
pub mod error;
pub mod graph;
pub mod incident;
pub mod init;
pub mod queue;
pub mod registry;
pub mod runtime;
pub mod state_machine;
pub mod task;
pub mod telemetry;
pub mod thought;
