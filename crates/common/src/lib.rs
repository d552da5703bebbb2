//! kwrun common library
//!
//! Suite model, run configuration, errors and database access shared by the
//! engine and the CLI.

pub mod config;
pub mod db;
pub mod error;
pub mod model;
pub mod redact;

pub use config::{BrowserConfig, DatabaseConfig, HttpConfig, RunConfig};
pub use db::{QueryBackend, Row, SqliteQuery};
pub use error::{Error, Result};
pub use model::*;
pub use redact::{redact, redact_text, redact_value};

/// kwrun version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
