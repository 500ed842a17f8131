//! Cof Protocol - Client Library
//!
//! Client endpoint and `cof://` remote addresses.

#[allow(clippy::module_inception)]
mod client;
mod remote;

pub use client::*;
pub use remote::*;
