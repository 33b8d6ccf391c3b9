//! Observability: structured logging and span macros

pub mod logging;

pub use logging::{init_default_logging, init_logging, LogFormat, LogSettings};

// Span macros for structured logging
pub use logging::{connection_span, negotiation_span};
