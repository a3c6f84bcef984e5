//! # ingress-sync
//!
//! Reconciliation engine: transactions over the proxy configuration, the
//! translation passes, and the cycle that ties them to the proxy supervisor.
//!
//! Build a [`Reconciler`] (usually with [`Reconciler::from_config`]), feed it
//! [`ingress_core::SyncEvent`]s with [`Reconciler::apply`], and call
//! [`Reconciler::cycle`] once per drained batch.

pub mod backend;
pub mod document;
pub mod error;
pub mod maps;
pub mod passes;
pub mod reconcile;
pub mod status;
pub mod transaction;
pub mod translate;
pub mod writer;

pub use backend::{ConfigBackend, FileBackend, TransactionId};
pub use document::{ConfigDocument, Section};
pub use error::SyncError;
pub use passes::{Decision, PassContext, PassOutcome, Passes, StatusPublisher};
pub use reconcile::{CycleReport, Reconciler};
pub use status::{FileStatusPublisher, IngressStatus};
pub use transaction::{TransactionGuard, TransactionManager};
pub use translate::Translator;
pub use writer::WriteResult;
