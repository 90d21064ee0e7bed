//! # edgelm
//!
//! On-device large-language-model inference runtime.
//!
//! Takes a tokenized prompt and drives a multi-stage pipeline — token
//! embedding, rotary position embedding, attention-mask construction,
//! transformer decode, KV-cache update — across independently compiled
//! subgraphs, producing generated tokens one at a time.
//!
//! ## Architecture
//!
//! - **Assets** ([`asset`]): memory-mapped model bundles (a zip container of
//!   sub-model files plus metadata) with zero-copy entry access.
//!
//! - **Tokenizer** ([`tokenizer`]): BPE text ↔ token-id conversion with
//!   byte fallback, including the incomplete-sequence signal streaming
//!   decode depends on.
//!
//! - **Buffers** ([`buffer`]): tensor buffers with aliasing duplicate
//!   semantics — the mechanism that lets one subgraph's output be the next
//!   subgraph's input without copies.
//!
//! - **Graphs** ([`graph`]): the compiled-subgraph seam; a backend plugs in
//!   by implementing `GraphCompiler` and `CompiledGraph`.
//!
//! - **Executor** ([`executor`]): owns the compiled models, the KV-cache
//!   tensors, and the aliased buffer web; drives prefill (chunked work
//!   groups, deferred last token) and decode (greedy argmax) step by step.
//!
//! - **Session** ([`session`]): sequences prefill and decode over an
//!   executor plus tokenizer, streaming text chunks to an observer; an actor
//!   wrapper runs a session on a dedicated thread.
//!
//! - **I/O** ([`io`]): response containers and the benchmark recorder.
//!
//! ## Quick start
//!
//! ```rust,no_run
//! use std::path::Path;
//!
//! use edgelm::asset::{AssetBundle, ModelResources};
//! use edgelm::executor::{ExecutorSettings, NpuExecutor};
//! use edgelm::graph::{Accelerator, Environment, EnvironmentOptions};
//! use edgelm::session::{Session, SessionConfig};
//! use edgelm::tokenizer::BpeTokenizer;
//!
//! # fn run(compiler: &dyn edgelm::graph::GraphCompiler) -> edgelm::Result<()> {
//! let bundle = AssetBundle::create("assistant-3b", Path::new("/models/assistant-3b.task"))?;
//! let resources = ModelResources::new(&bundle);
//! let tokenizer = BpeTokenizer::from_bundle(&resources)?;
//!
//! let env = Environment::new(EnvironmentOptions::default());
//! let settings = ExecutorSettings::new(Accelerator::Npu);
//! let executor = NpuExecutor::create(settings, &resources, compiler, env)?;
//!
//! let mut session = Session::create(
//!     Box::new(executor),
//!     Box::new(tokenizer),
//!     SessionConfig::default(),
//! )?;
//! session.run_prefill("What is the tallest mountain on Earth?")?;
//! let responses = session.run_decode()?;
//! println!("{responses}");
//! # Ok(())
//! # }
//! ```

pub mod asset;
pub mod buffer;
pub mod error;
pub mod executor;
pub mod graph;
pub mod io;
pub mod session;
pub mod tokenizer;

pub use error::{EdgeLmError, Result};
pub use executor::{LlmExecutor, NpuExecutor};
pub use session::Session;

/// Crate version.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
