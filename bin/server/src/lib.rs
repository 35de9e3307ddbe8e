//! sso-relay web server.
//!
//! This crate wires the callback coordination core to HTTP: OIDC login and
//! callback routes, the downstream account and login collaborators, and the
//! browser hand-off into the downstream application.

pub mod app;
pub mod auth;
pub mod config;
pub mod downstream;
pub mod error;
pub mod handoff;
