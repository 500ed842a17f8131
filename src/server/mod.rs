//! Cof Protocol - Server Library
//!
//! Listening endpoint that accepts client sessions.

#[allow(clippy::module_inception)]
mod server;

pub use server::*;
