//! Event-stream parser
//!
//! Parsing support for the binary event-stream protocol spoken by the
//! upstream response endpoint.

pub mod crc;
pub mod decoder;
pub mod error;
pub mod frame;
pub mod header;
pub mod ring;
