//! Per-connection relay pipeline.
//!
//! A session runs three stages on their own tasks: the reader pulls client
//! frames and forwards audio, the relay publishes audio to the backend, and
//! the listener waits for replies. A supervisor writes replies back to the
//! client and ends the session on the first error, on shutdown, or after a
//! stretch of inactivity; teardown then returns every borrowed resource.

pub mod control;
pub mod pipeline;
pub mod state;

pub(crate) mod stages;

pub use pipeline::{Session, SessionSettings};
pub use state::{ControlEvent, SessionState, Transition};
