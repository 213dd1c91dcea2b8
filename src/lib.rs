//! diskaio - asynchronous disk IO engine
//!
//! diskaio submits positioned reads and writes to the Linux kernel without
//! blocking on the IO itself and hands finished requests back in batches,
//! either through a blocking wait or through a descriptor that can be
//! registered with an external poll/epoll loop.
//!
//! # Architecture
//!
//! - **Ops**: caller-owned request records with an idle/pending/completed lifecycle
//! - **Engines**: kernel AIO and a synchronous fallback behind one trait
//! - **Config**: TOML `[engine]` section with command-line overrides
//! - **Driver**: a queue-filling read loop with latency statistics and fixture checks

#[cfg(not(target_os = "linux"))]
compile_error!("diskaio requires Linux kernel AIO and eventfd");

pub mod config;
pub mod engine;
pub mod error;
pub mod stats;
pub mod util;
pub mod worker;

// Re-export commonly used types
pub use config::EngineConfig;
pub use engine::libaio::AsyncIo;
pub use engine::op::{Completion, Op, OpKind, OpState};
pub use engine::sync::SyncIo;
pub use engine::{open_engine, AioEngine, Backend, PollMode};
pub use error::{AioError, Result};
