//! Protocol frame types.

mod types;

pub use types::Frame;
