//! Warden: sandbox kernels for untrusted guest scripts.
//!
//! A [`kernel::SandboxKernel`] owns one isolated script context, exposes host
//! functionality to it only through installed capability modules, captures
//! guest output in a bounded cache and serializes every execution behind a
//! fair guard. The [`supervisor::KernelSupervisor`] plays the Core: it
//! accounts resources, builds and retires kernels and replaces poisoned ones.
//!
//! See `DESIGN.md` for the architecture notes.

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod capabilities;
pub mod config;
pub mod engine;
pub mod kernel;
pub mod ledger;
pub mod link;
pub mod logging;
pub mod supervisor;
pub mod types;
pub mod vmdb;
