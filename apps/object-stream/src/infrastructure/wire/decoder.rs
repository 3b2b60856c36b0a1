//! Read Response Decoder
//!
//! Decodes `BidiReadObjectResponse` messages straight from the received
//! buffers. Object content comes back as views into those buffers; only
//! the small submessages (metadata, handles, ranges) are copied and handed
//! to prost.

use bytes::{Buf, Bytes};
use prost::Message;
use prost::encoding::{WireType, decode_key, decode_varint};

use super::buffer::{BufferSlice, Cursor};
use crate::infrastructure::grpc::proto::{BidiReadHandle, Object, ReadRange};

// BidiReadObjectResponse
const RESPONSE_METADATA: u32 = 4;
const RESPONSE_OBJECT_DATA_RANGES: u32 = 6;
const RESPONSE_READ_HANDLE: u32 = 7;

// ObjectRangeData
const RANGE_CHECKSUMMED_DATA: u32 = 1;
const RANGE_READ_RANGE: u32 = 2;
const RANGE_END: u32 = 3;

// ChecksummedData
const DATA_CONTENT: u32 = 1;
const DATA_CRC32C: u32 = 2;

/// Errors raised while decoding a response message.
#[derive(Debug, Clone, thiserror::Error)]
pub enum WireError {
    /// A field claimed more bytes than the message holds.
    #[error("truncated message: need {needed} bytes, {available} available")]
    Truncated {
        /// Bytes required.
        needed: usize,
        /// Bytes left in the message.
        available: usize,
    },

    /// A nested field ran past the end of its parent.
    #[error("field {tag} overran its enclosing message")]
    Overrun {
        /// Tag of the enclosing field.
        tag: u32,
    },

    /// Groups are not used by the storage API.
    #[error("unsupported wire type {wire_type:?} for field {tag}")]
    UnsupportedWireType {
        /// Field tag.
        tag: u32,
        /// Wire type found.
        wire_type: WireType,
    },

    /// Length prefix does not fit in `usize`.
    #[error("field length {0} is too large")]
    LengthOverflow(u64),

    /// prost rejected a varint, key, or submessage.
    #[error("invalid protobuf encoding: {0}")]
    Prost(#[from] prost::DecodeError),
}

/// Content for one range carried by a response.
#[derive(Debug, Clone, Default)]
pub struct RangeData {
    /// Range identity and the absolute offset of this chunk.
    pub read_range: ReadRange,
    /// Whether this is the final chunk of the range.
    pub range_end: bool,
    /// Server-computed CRC32C of `content`, when sent.
    pub crc32c: Option<u32>,
    /// Views into the received buffers.
    pub content: BufferSlice,
}

impl RangeData {
    /// Whether `content` matches the server checksum. Chunks without a
    /// checksum always match.
    #[must_use]
    pub fn checksum_matches(&self) -> bool {
        self.crc32c.is_none_or(|want| want == self.content.crc32c())
    }
}

/// A decoded `BidiReadObjectResponse`.
#[derive(Debug, Clone, Default)]
pub struct DecodedResponse {
    /// Object metadata, normally only on the first response.
    pub metadata: Option<Object>,
    /// Latest read handle.
    pub read_handle: Option<BidiReadHandle>,
    /// Range data in message order.
    pub ranges: Vec<RangeData>,
}

/// Decode one `BidiReadObjectResponse` without copying object content.
///
/// # Errors
///
/// Returns [`WireError`] if the message is truncated, uses a group wire
/// type, or contains a submessage prost cannot decode.
pub fn decode_read_response(message: &BufferSlice) -> Result<DecodedResponse, WireError> {
    let mut cur = message.cursor();
    let mut out = DecodedResponse::default();

    while cur.has_remaining() {
        let (tag, wire_type) = decode_key(&mut cur)?;
        match (tag, wire_type) {
            (RESPONSE_OBJECT_DATA_RANGES, WireType::LengthDelimited) => {
                let len = length_prefix(&mut cur)?;
                out.ranges.push(decode_range_data(&mut cur, len)?);
            }
            (RESPONSE_METADATA, WireType::LengthDelimited) => {
                let len = length_prefix(&mut cur)?;
                let bytes = cur.take_bytes(len)?;
                merge_into(&mut out.metadata, bytes)?;
            }
            (RESPONSE_READ_HANDLE, WireType::LengthDelimited) => {
                let len = length_prefix(&mut cur)?;
                let bytes = cur.take_bytes(len)?;
                merge_into(&mut out.read_handle, bytes)?;
            }
            _ => skip_field(&mut cur, tag, wire_type)?,
        }
    }

    Ok(out)
}

fn decode_range_data(cur: &mut Cursor<'_>, len: usize) -> Result<RangeData, WireError> {
    let end = cur.remaining() - len;
    let mut data = RangeData::default();

    while cur.remaining() > end {
        let (tag, wire_type) = decode_key(cur)?;
        match (tag, wire_type) {
            (RANGE_CHECKSUMMED_DATA, WireType::LengthDelimited) => {
                let len = length_prefix(cur)?;
                decode_checksummed_data(cur, len, &mut data)?;
            }
            (RANGE_READ_RANGE, WireType::LengthDelimited) => {
                let len = length_prefix(cur)?;
                let bytes = cur.take_bytes(len)?;
                data.read_range.merge(bytes)?;
            }
            (RANGE_END, WireType::Varint) => {
                data.range_end = decode_varint(cur)? != 0;
            }
            _ => skip_field(cur, tag, wire_type)?,
        }
    }

    if cur.remaining() < end {
        return Err(WireError::Overrun {
            tag: RESPONSE_OBJECT_DATA_RANGES,
        });
    }
    Ok(data)
}

fn decode_checksummed_data(
    cur: &mut Cursor<'_>,
    len: usize,
    data: &mut RangeData,
) -> Result<(), WireError> {
    let end = cur.remaining() - len;

    while cur.remaining() > end {
        let (tag, wire_type) = decode_key(cur)?;
        match (tag, wire_type) {
            (DATA_CONTENT, WireType::LengthDelimited) => {
                let len = length_prefix(cur)?;
                data.content = cur.take_views(len)?;
            }
            (DATA_CRC32C, WireType::ThirtyTwoBit) => {
                if cur.remaining() < 4 {
                    return Err(WireError::Truncated {
                        needed: 4,
                        available: cur.remaining(),
                    });
                }
                data.crc32c = Some(cur.get_u32_le());
            }
            _ => skip_field(cur, tag, wire_type)?,
        }
    }

    if cur.remaining() < end {
        return Err(WireError::Overrun {
            tag: RANGE_CHECKSUMMED_DATA,
        });
    }
    Ok(())
}

fn merge_into<M: Message + Default>(slot: &mut Option<M>, bytes: Bytes) -> Result<(), WireError> {
    slot.get_or_insert_with(M::default).merge(bytes)?;
    Ok(())
}

fn length_prefix(cur: &mut Cursor<'_>) -> Result<usize, WireError> {
    let raw = decode_varint(cur)?;
    let len = usize::try_from(raw).map_err(|_| WireError::LengthOverflow(raw))?;
    if len > cur.remaining() {
        return Err(WireError::Truncated {
            needed: len,
            available: cur.remaining(),
        });
    }
    Ok(len)
}

fn skip_field(cur: &mut Cursor<'_>, tag: u32, wire_type: WireType) -> Result<(), WireError> {
    match wire_type {
        WireType::Varint => {
            decode_varint(cur)?;
            Ok(())
        }
        WireType::SixtyFourBit => cur.skip(8),
        WireType::ThirtyTwoBit => cur.skip(4),
        WireType::LengthDelimited => {
            let len = length_prefix(cur)?;
            cur.skip(len)
        }
        WireType::StartGroup | WireType::EndGroup => {
            Err(WireError::UnsupportedWireType { tag, wire_type })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::infrastructure::grpc::proto::{
        BidiReadObjectResponse, ChecksummedData, ObjectChecksums, ObjectRangeData,
    };
    use proptest::prelude::*;

    fn range_data(read_id: i64, offset: i64, content: &'static [u8], end: bool) -> ObjectRangeData {
        ObjectRangeData {
            checksummed_data: Some(ChecksummedData {
                content: Bytes::from_static(content),
                crc32c: Some(crc32c::crc32c(content)),
            }),
            read_range: Some(ReadRange {
                read_offset: offset,
                read_length: 0,
                read_id,
            }),
            range_end: end,
        }
    }

    fn sample_response() -> BidiReadObjectResponse {
        BidiReadObjectResponse {
            object_data_ranges: vec![
                range_data(1, 0, b"the quick brown fox", false),
                range_data(2, 100, b"jumps over", true),
            ],
            metadata: Some(Object {
                name: "obj".into(),
                bucket: "projects/_/buckets/b".into(),
                generation: 7,
                size: 1234,
                checksums: Some(ObjectChecksums {
                    crc32c: Some(42),
                    md5_hash: Bytes::new(),
                }),
                ..Object::default()
            }),
            read_handle: Some(BidiReadHandle {
                handle: Bytes::from_static(b"handle"),
            }),
        }
    }

    fn assert_matches_sample(decoded: &DecodedResponse) {
        let metadata = decoded.metadata.as_ref().unwrap();
        assert_eq!(metadata.name, "obj");
        assert_eq!(metadata.generation, 7);
        assert_eq!(metadata.size, 1234);
        assert_eq!(
            decoded.read_handle.as_ref().unwrap().handle,
            Bytes::from_static(b"handle")
        );
        assert_eq!(decoded.ranges.len(), 2);
        assert_eq!(decoded.ranges[0].read_range.read_id, 1);
        assert_eq!(&decoded.ranges[0].content.to_bytes()[..], b"the quick brown fox");
        assert!(!decoded.ranges[0].range_end);
        assert!(decoded.ranges[0].checksum_matches());
        assert_eq!(decoded.ranges[1].read_range.read_offset, 100);
        assert_eq!(&decoded.ranges[1].content.to_bytes()[..], b"jumps over");
        assert!(decoded.ranges[1].range_end);
    }

    #[test]
    fn decodes_single_buffer() {
        let encoded = Bytes::from(sample_response().encode_to_vec());
        let decoded = decode_read_response(&BufferSlice::from(encoded)).unwrap();
        assert_matches_sample(&decoded);
    }

    #[test]
    fn content_is_a_view_into_the_input() {
        let encoded = Bytes::from(sample_response().encode_to_vec());
        let decoded = decode_read_response(&BufferSlice::from(encoded.clone())).unwrap();
        let view = &decoded.ranges[0].content.buffers()[0];
        let base = encoded.as_ptr() as usize;
        let ptr = view.as_ptr() as usize;
        assert!(ptr >= base && ptr + view.len() <= base + encoded.len());
    }

    #[test]
    fn decodes_at_every_split_point() {
        let encoded = Bytes::from(sample_response().encode_to_vec());
        for split in 1..encoded.len() {
            let slice = BufferSlice::from(vec![encoded.slice(..split), encoded.slice(split..)]);
            let decoded = decode_read_response(&slice).unwrap();
            assert_matches_sample(&decoded);
        }
    }

    #[test]
    fn unknown_fields_are_skipped() {
        let mut encoded = sample_response().encode_to_vec();
        // field 99, varint
        encoded.extend_from_slice(&[0x98, 0x06, 0x01]);
        // field 100, length-delimited, 3 bytes
        encoded.extend_from_slice(&[0xa2, 0x06, 0x03, b'x', b'y', b'z']);
        // field 101, fixed64
        encoded.extend_from_slice(&[0xa9, 0x06, 0, 0, 0, 0, 0, 0, 0, 0]);
        let decoded = decode_read_response(&BufferSlice::from(Bytes::from(encoded))).unwrap();
        assert_matches_sample(&decoded);
    }

    #[test]
    fn group_wire_type_is_rejected() {
        // field 5, start group
        let encoded = Bytes::from_static(&[0x2b]);
        let err = decode_read_response(&BufferSlice::from(encoded)).unwrap_err();
        assert!(matches!(
            err,
            WireError::UnsupportedWireType {
                tag: 5,
                wire_type: WireType::StartGroup
            }
        ));
    }

    #[test]
    fn truncated_message_is_rejected() {
        let encoded = sample_response().encode_to_vec();
        let cut = Bytes::copy_from_slice(&encoded[..encoded.len() - 3]);
        assert!(decode_read_response(&BufferSlice::from(cut)).is_err());
    }

    #[test]
    fn checksum_mismatch_is_detected() {
        let mut response = sample_response();
        response.object_data_ranges[0]
            .checksummed_data
            .as_mut()
            .unwrap()
            .crc32c = Some(0xdead_beef);
        let encoded = Bytes::from(response.encode_to_vec());
        let decoded = decode_read_response(&BufferSlice::from(encoded)).unwrap();
        assert!(!decoded.ranges[0].checksum_matches());
        assert!(decoded.ranges[1].checksum_matches());
    }

    #[test]
    fn missing_checksum_matches() {
        let mut response = sample_response();
        response.object_data_ranges[0]
            .checksummed_data
            .as_mut()
            .unwrap()
            .crc32c = None;
        let encoded = Bytes::from(response.encode_to_vec());
        let decoded = decode_read_response(&BufferSlice::from(encoded)).unwrap();
        assert_eq!(decoded.ranges[0].crc32c, None);
        assert!(decoded.ranges[0].checksum_matches());
    }

    #[test]
    fn empty_message_decodes_to_nothing() {
        let decoded = decode_read_response(&BufferSlice::new()).unwrap();
        assert!(decoded.metadata.is_none());
        assert!(decoded.read_handle.is_none());
        assert!(decoded.ranges.is_empty());
    }

    proptest! {
        #[test]
        fn arbitrary_buffer_boundaries_decode_identically(
            sizes in proptest::collection::vec(1usize..16, 1..64)
        ) {
            let encoded = Bytes::from(sample_response().encode_to_vec());
            let mut slice = BufferSlice::new();
            let mut start = 0;
            for size in sizes.iter().cycle() {
                if start >= encoded.len() {
                    break;
                }
                let end = (start + size).min(encoded.len());
                slice.push(encoded.slice(start..end));
                start = end;
            }
            let decoded = decode_read_response(&slice).unwrap();
            prop_assert_eq!(decoded.ranges.len(), 2);
            prop_assert_eq!(
                decoded.ranges[0].content.to_bytes(),
                Bytes::from_static(b"the quick brown fox")
            );
            prop_assert!(decoded.ranges.iter().all(RangeData::checksum_matches));
        }
    }
}
