//! Configuration for the Nebula session server.
//!
//! Settings persist to disk as RON files. Supports CLI overrides via clap,
//! and forward/backward compatible serialization.

mod cli;
mod config;
mod error;

pub use cli::CliArgs;
pub use config::{Config, LogConfig, MIN_RECV_CEILING, NetworkConfig, SessionSettings};
pub use error::ConfigError;
