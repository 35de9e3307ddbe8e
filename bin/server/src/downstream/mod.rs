//! Downstream application collaborators.
//!
//! - [`AccountRepository`] provisions users straight into the downstream database
//! - [`DownstreamClient`] logs them in and captures the session cookie
//! - [`FormOnlyLogin`] leaves the login to the browser

pub mod accounts;
pub mod client;

pub use accounts::AccountRepository;
pub use client::{DownstreamClient, FormOnlyLogin};
