//! Observability: structured logging and the per-session span

pub mod logging;

pub use logging::{init_default_logging, init_logging, parse_level, LogFormat};
