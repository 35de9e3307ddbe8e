//! Core types and utilities for the sso-relay gateway.
//!
//! This crate provides the identifier types, the clock abstraction, and the
//! shared `Result` alias used by the coordination core and the server.

pub mod clock;
pub mod error;
pub mod id;

pub use clock::{Clock, ManualClock, SystemClock};
pub use error::Result;
pub use id::{CorrelationId, ParseIdError, SessionId, StateId};
