//! a2pc: compensating distributed transactions for a sharded SQL proxy
//!
//! This crate wires the workspace into the `a2pctm` service:
//! - `config`: the TOML configuration file
//! - `Service`: backends, coordinator stores, HTTP frontend and the
//!   rollback and cleanup workers of one coordinator process

pub mod config;
mod error;
mod service;

pub use config::Config;
pub use error::{Error, Result};
pub use service::Service;
