//! Core engine of memlog, an in-memory event-sourced store.
//!
//! - [`log`] - The append-only event log and its configuration (`EventLog`)
//! - [`repository`] - Typed CRUD over one namespace (`Repository`)
//! - [`crud`] - The resource contract implemented by repositories (`Crud`)
//! - [`cursor`] - Finite iteration over `find_all` results (`Cursor`)
//! - [`tx`] - Nested one-phase-commit transactions (`TxManager`, `TxGuard`)
//! - [`subscription`] - Event delivery to callbacks and streams
//! - [`meta`] - Request metadata carried by a `Context`
//! - [`entity`] - Entity IDs: extraction, presence and generation
//! - [`event`] - Event payloads and stored events
//! - [`context`] - Cancellation, deadlines, metadata and transactions
//!
//! # Example
//!
//! ```
//! use memlog_core::{context::Context, log::EventLog, tx::TxManager};
//!
//! # tokio::runtime::Builder::new_current_thread().build().unwrap().block_on(async {
//! let log = EventLog::new();
//! let ctx = Context::background();
//! let tx = log.begin_tx(&ctx).await.unwrap();
//! assert_eq!(log.lookup_tx(&tx).map(|info| info.depth), Some(0));
//! log.commit_tx(&tx).await.unwrap();
//! # });
//! ```
//!
//! Most users should depend on the `memlog` crate, which re-exports these
//! types together with `#[derive(Entity)]`.

pub mod context;
pub mod crud;
pub mod cursor;
pub mod entity;
pub mod error;
pub mod event;
pub mod log;
pub mod meta;
pub mod repository;
pub mod subscription;
pub mod tx;



pub use error::{BoxError, Error, ErrorKind, HandlerFailure, Result};
