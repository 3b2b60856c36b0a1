//! Raw Response Codec
//!
//! A tonic codec that encodes requests with prost but hands responses back
//! undecoded, as views into the HTTP/2 frames they arrived in. Read
//! responses are then parsed by [`decode_read_response`] without copying
//! object content.
//!
//! [`decode_read_response`]: crate::infrastructure::wire::decode_read_response

use std::marker::PhantomData;

use bytes::Buf;
use tonic::Status;
use tonic::codec::{Codec, DecodeBuf, Decoder, EncodeBuf, Encoder};

use crate::infrastructure::wire::BufferSlice;

/// Codec for calls whose responses are decoded by the caller.
#[derive(Debug)]
pub struct RawResponseCodec<T> {
    _request: PhantomData<fn(T)>,
}

impl<T> Default for RawResponseCodec<T> {
    fn default() -> Self {
        Self {
            _request: PhantomData,
        }
    }
}

impl<T> Codec for RawResponseCodec<T>
where
    T: prost::Message + Send + 'static,
{
    type Encode = T;
    type Decode = BufferSlice;
    type Encoder = MessageEncoder<T>;
    type Decoder = RawDecoder;

    fn encoder(&mut self) -> Self::Encoder {
        MessageEncoder {
            _request: PhantomData,
        }
    }

    fn decoder(&mut self) -> Self::Decoder {
        RawDecoder
    }
}

/// Prost encoder for request messages.
#[derive(Debug)]
pub struct MessageEncoder<T> {
    _request: PhantomData<fn(T)>,
}

impl<T: prost::Message> Encoder for MessageEncoder<T> {
    type Item = T;
    type Error = Status;

    fn encode(&mut self, item: T, buf: &mut EncodeBuf<'_>) -> Result<(), Status> {
        item.encode(buf)
            .map_err(|e| Status::internal(format!("failed to encode request: {e}")))
    }
}

/// Splits one length-delimited message off the frame buffer without
/// copying it.
#[derive(Debug, Default)]
pub struct RawDecoder;

impl Decoder for RawDecoder {
    type Item = BufferSlice;
    type Error = Status;

    fn decode(&mut self, buf: &mut DecodeBuf<'_>) -> Result<Option<BufferSlice>, Status> {
        let mut message = BufferSlice::new();
        while buf.has_remaining() {
            let n = buf.chunk().len();
            message.push(buf.copy_to_bytes(n));
        }
        Ok(Some(message))
    }
}
