//! Data Transfer Objects
//!
//! Documents exchanged with resource scripts. Every request is written to the
//! script's stdin as a single JSON document and every response is read back
//! from its stdout.

pub mod script;
