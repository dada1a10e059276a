//! Moves a GPU between the host and a passthrough VM.
//!
//! [`dispatch::Dispatcher`] turns a hook invocation into a run of either the
//! [`release::ReleaseController`] or the [`reclaim::ReclaimController`]. Everything those touch
//! outside the process goes through the traits collected in [`host::Host`].

#[macro_use] extern crate log;
#[macro_use] extern crate serde_derive;

pub mod bus;
pub mod clock;
pub mod console;
pub mod detect;
pub mod diagnostics;
pub mod dispatch;
pub mod error;
pub mod host;
pub mod install;
pub mod module;
pub mod reaper;
pub mod reclaim;
pub mod release;
pub mod retry;
pub mod session;

#[cfg(test)]
mod testing;

pub use crate::error::{Error, Result};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Outcome {
    Completed,
    AlreadyInState,
    /// The VM is not configured for passthrough.
    Skipped,
}
