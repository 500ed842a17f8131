//! Core types shared by every layer.
//!
//! Protocol constants, the error taxonomy and endpoint configuration.

pub mod constants;
mod config;
mod error;

pub use config::{TransportConfig, TransportConfigBuilder};
pub use constants::*;
pub use error::{CofError, DecodeError};
