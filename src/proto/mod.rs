//! Wire protocol support.
//!
//! The store speaks a line-based serialization protocol over TCP. This
//! module holds the frame model, an incremental decoder, an encoder and
//! the crate-wide error type.

/// Frame encoding and decoding.
pub mod codec;
/// Error and result types used across the crate.
pub mod error;
/// Protocol frame definitions.
pub mod frame;
