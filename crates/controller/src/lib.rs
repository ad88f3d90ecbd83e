//! Steward controller: a level-triggered reconciliation loop.
//!
//! Notifications from an [`EventSource`](steward_core::EventSource) are
//! turned into keys on a [`WorkQueue`](steward_queue::WorkQueue) by the
//! [`EventTranslator`]; workers pull keys and hand them to a [`Reconciler`],
//! which re-reads the cache and converges the object. The [`Controller`]
//! waits for the cache to sync before any key is processed and shuts the
//! queue down on cancellation.

#![forbid(unsafe_code)]

mod config;
mod controller;
mod reconcile;
mod translator;
mod worker;

pub use config::ControllerConfig;
pub use controller::{Controller, ControllerError, Phase};
pub use reconcile::{Action, CronTabReconciler, ReconcileError, ReconcileOutcome, Reconciler};
pub use translator::EventTranslator;

pub use tokio_util::sync::CancellationToken;
