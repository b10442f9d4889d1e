//! hostmon agent library crate.
//!
//! Schedules metric checks for any number of requesters across a set of
//! plugins, each plugin limited to its own concurrency capacity.

pub mod config;
pub mod error;
pub mod logging;
pub mod plugins;
pub mod scheduler;

pub use error::{Error, Result};
