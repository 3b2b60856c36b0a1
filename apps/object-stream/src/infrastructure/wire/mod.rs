//! Wire decoding for read-stream responses.

mod buffer;
mod decoder;

pub use buffer::BufferSlice;
pub use decoder::{DecodedResponse, RangeData, WireError, decode_read_response};
