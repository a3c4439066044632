//! Streaming export formats over a key prefix (§4.H).

pub mod encoder;

pub use encoder::{StreamEncoder, StreamFormat, StreamOptions};
