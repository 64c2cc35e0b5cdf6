//! Action pipeline for kubedr recipes
//!
//! A [`Stage`] validates and sets up a list of actions, runs all of them
//! against one shared worker, and always cleans up after them.

#![deny(missing_docs)]

pub mod actions;
pub mod stage;

pub use stage::{Action, CleanupAction, Stage, StageOptions, WORKER_ACTION};
