//! Admission control for in-flight batches.
//!
//! The controller is a bounded semaphore over batches:
//! - `acquire()` waits for a free slot and hands out an `AdmissionPermit`
//! - `AdmissionPermit::release()` frees the slot exactly once
//! - dropping an unreleased permit frees the slot (and logs, it means a path forgot)
//!
//! Completions are posted to a single-writer channel; the `Reconciler` drains
//! it, records batch metrics and releases the permit.

mod completion;
mod controller;

pub use completion::{BatchCompletion, CompletionSender, Reconciler};
pub use controller::{AdmissionController, AdmissionError, AdmissionPermit, AdmissionSnapshot};
