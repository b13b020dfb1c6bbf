//! Core types and error handling shared across the engine.

pub mod error;

pub use error::KeySpaceError;
