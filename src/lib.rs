//! plz: a parallel, content-cached build system core.
//!
//! # Overview
//!
//! plz turns a set of root build labels into completed artifacts. Packages are
//! parsed on demand, each parse discovers targets whose dependencies name
//! packages that may not be parsed yet, and the scheduler drives the growing
//! graph to quiescence across a pool of worker threads. Builds are gated by a
//! content-addressed artifact cache; a build that misses every cache runs its
//! command, hashes its outputs and stores them back.
//!
//! # Core pieces
//!
//! - [`cmap`]: sharded awaitable map, the rendezvous primitive the rest of
//!   the system uses to wait on pending productions (targets, packages)
//! - [`label`]: canonical target identifiers and build inputs
//! - [`graph`]: packages, targets, dependency edges, the target state machine
//! - [`state`]: the per-invocation coordination object (queues, counters,
//!   results channel)
//! - [`parse`]: the bridge to the build-file interpreter, including deferred
//!   `subinclude` handling
//! - [`sched`]: the worker pool driving parse/build/test queues to quiescence
//! - [`build`]: the per-target build pipeline and output hashing
//! - [`exec`]: the command-runner seam (subprocess spawning with timeouts)
//! - [`cache`]: the cache multiplexer (directory, remote, composite)
//! - [`remote`]: the replicated content-addressed filesystem cluster
//! - [`config`]: declarative configuration
//!
//! # Guarantees
//!
//! - A target never starts building before every dependency has built.
//! - Target states only move forward; concurrent duplicate triggers are
//!   no-ops and never re-enqueue work.
//! - A post-build callback finishes before any dependent can observe the
//!   target as built.
//! - The scheduler exits only when all queues are empty and no unit of work
//!   is in flight; failed units still reconcile the pending counter.

#![deny(unsafe_code)]
#![warn(missing_docs)]
#![allow(clippy::module_inception)]

pub mod build;
pub mod cache;
pub mod cmap;
pub mod config;
pub mod exec;
pub mod graph;
pub mod label;
pub mod parse;
pub mod remote;
pub mod results;
pub mod sched;
pub mod state;
pub mod util;

pub use config::Config;
pub use graph::{BuildGraph, BuildTarget, Package, TargetState};
pub use label::{BuildInput, BuildLabel};
pub use results::{BuildError, BuildResult, BuildSummary};
pub use state::BuildState;
