//! Upstream client module
//!
//! Everything that speaks to the CodeWhisperer-style upstream: binary
//! event-stream parsing, tool-call fragment aggregation, the credential/token
//! pool and the HTTP provider.

pub mod aggregator;
pub mod auth;
pub mod errors;
pub mod model;
pub mod parser;
pub mod provider;
pub mod token_pool;
