//! # batchq
//!
//! A durable, crash-recoverable work queue on SQLite.
//!
//! Tasks are enqueued once into a [`storage::Store`], leased in batches by
//! a pool of workers ([`pool::run_pool`]), executed by a
//! [`runner::TaskRunner`] inside a per-worker scratch directory, and their
//! results recorded. Payloads are stored as tagged JSON through the
//! [`codec`] layer, which also resolves forward references between
//! sibling objects.

pub mod codec;
pub mod command;
pub mod config;
pub mod error;
pub mod model;
pub mod observer;
pub mod pool;
pub mod runner;
pub mod storage;
pub mod telemetry;
pub mod workdir;
