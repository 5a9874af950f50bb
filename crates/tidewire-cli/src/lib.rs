//! Tidewire CLI library
//!
//! Command-line front end for the tidewire transport: a listening `serve`
//! mode, a one-shot `send`, and an `echo-check` round trip against a server
//! started with `--echo`.

pub mod app;
pub mod cli;
pub mod commands;
pub mod config;
pub mod error;

pub use app::TidewireApp;
pub use cli::{Cli, Commands};
pub use config::AppConfig;
pub use error::{CliError, Result};
