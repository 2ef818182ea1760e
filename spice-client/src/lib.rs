//! # spice-client: command-line SPICE client
//!
//! Loads a TOML configuration, builds a session on `spice-core` with
//! an inputs channel registered, and reports session events until it
//! is interrupted.

pub mod config;
pub mod inputs;
