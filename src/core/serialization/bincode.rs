/*!
 * Binary Wire Frames with bincode
 *
 * Every request and reply travels as one frame:
 * `[1-byte version][4-byte little-endian length][bincode payload]`.
 */

use crate::core::limits::MAX_FRAME_LEN;
use bytes::{BufMut, Bytes, BytesMut};
use serde::{de::DeserializeOwned, Serialize};
use std::cell::RefCell;

// ============================================================================
// Configuration Constants
// ============================================================================

/// Buffer pool configuration
const POOL_BUFFER_SIZE: usize = 8192;

/// Format version for forward/backward compatibility
pub const FRAME_FORMAT_VERSION: u8 = 1;

/// Version byte plus length word
pub const FRAME_HEADER_LEN: usize = 5;

// ============================================================================
// Error Types
// ============================================================================

/// Result type for bincode operations
pub type BincodeResult<T> = Result<T, BincodeError>;

/// Binary serialization errors with rich context
#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum BincodeError {
    #[error("Serialization failed: {context}")]
    Serialization {
        context: &'static str,
        #[source]
        source: Box<bincode::ErrorKind>,
    },

    #[error("Deserialization failed: {context}")]
    Deserialization {
        context: &'static str,
        #[source]
        source: Box<bincode::ErrorKind>,
    },

    #[error("Buffer too small: expected {expected} bytes, got {actual} bytes")]
    BufferTooSmall { expected: usize, actual: usize },

    #[error("Invalid format version: expected {expected}, got {actual}")]
    InvalidVersion { expected: u8, actual: u8 },

    #[error("Frame of {len} bytes exceeds limit of {max} bytes")]
    FrameTooLarge { len: usize, max: usize },
}

// ============================================================================
// Thread-Local Buffer Pool
// ============================================================================

thread_local! {
    static BUFFER_POOL: RefCell<BytesMut> = RefCell::new(BytesMut::with_capacity(POOL_BUFFER_SIZE));
}

// ============================================================================
// Core Serialization Functions
// ============================================================================

#[inline]
pub fn to_vec<T: Serialize>(value: &T) -> BincodeResult<Vec<u8>> {
    bincode::serialize(value).map_err(|source| BincodeError::Serialization {
        context: "standard serialization",
        source,
    })
}

#[inline]
pub fn from_slice<T: DeserializeOwned>(bytes: &[u8]) -> BincodeResult<T> {
    bincode::deserialize(bytes).map_err(|source| BincodeError::Deserialization {
        context: "standard deserialization",
        source,
    })
}

// ============================================================================
// Frames
// ============================================================================

/// Encode a value as a complete frame
///
/// The frame is assembled in a thread-local buffer and split off, so
/// steady-state traffic does not allocate a fresh header buffer per frame.
pub fn encode_frame<T: Serialize>(value: &T) -> BincodeResult<Bytes> {
    let data = to_vec(value)?;
    if data.len() > MAX_FRAME_LEN {
        return Err(BincodeError::FrameTooLarge {
            len: data.len(),
            max: MAX_FRAME_LEN,
        });
    }

    Ok(BUFFER_POOL.with(|pool| {
        let mut buf = pool.borrow_mut();
        buf.clear();
        buf.reserve(FRAME_HEADER_LEN + data.len());
        buf.put_u8(FRAME_FORMAT_VERSION);
        buf.put_u32_le(data.len() as u32);
        buf.put_slice(&data);
        buf.split().freeze()
    }))
}

/// Validate a frame header and return the payload length
pub fn parse_header(header: &[u8]) -> BincodeResult<usize> {
    if header.len() < FRAME_HEADER_LEN {
        return Err(BincodeError::BufferTooSmall {
            expected: FRAME_HEADER_LEN,
            actual: header.len(),
        });
    }

    if header[0] != FRAME_FORMAT_VERSION {
        return Err(BincodeError::InvalidVersion {
            expected: FRAME_FORMAT_VERSION,
            actual: header[0],
        });
    }

    let len = u32::from_le_bytes([header[1], header[2], header[3], header[4]]) as usize;
    if len > MAX_FRAME_LEN {
        return Err(BincodeError::FrameTooLarge {
            len,
            max: MAX_FRAME_LEN,
        });
    }
    Ok(len)
}

/// Decode a complete frame held in memory
pub fn decode_frame<T: DeserializeOwned>(bytes: &[u8]) -> BincodeResult<T> {
    let len = parse_header(bytes)?;
    if bytes.len() < FRAME_HEADER_LEN + len {
        return Err(BincodeError::BufferTooSmall {
            expected: FRAME_HEADER_LEN + len,
            actual: bytes.len(),
        });
    }
    from_slice(&bytes[FRAME_HEADER_LEN..FRAME_HEADER_LEN + len])
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::{Deserialize, Serialize};

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    struct TestMessage {
        id: u64,
        data: Vec<u8>,
    }

    #[test]
    fn test_frame_layout() {
        let msg = TestMessage {
            id: 42,
            data: vec![1, 2, 3],
        };

        let frame = encode_frame(&msg).unwrap();
        assert_eq!(frame[0], FRAME_FORMAT_VERSION);
        let len = parse_header(&frame).unwrap();
        assert_eq!(frame.len(), FRAME_HEADER_LEN + len);

        let decoded: TestMessage = decode_frame(&frame).unwrap();
        assert_eq!(decoded, msg);
    }

    #[test]
    fn test_consecutive_frames_are_independent() {
        let a = encode_frame(&TestMessage { id: 1, data: vec![] }).unwrap();
        let b = encode_frame(&TestMessage { id: 2, data: vec![9; 100] }).unwrap();

        let a: TestMessage = decode_frame(&a).unwrap();
        let b: TestMessage = decode_frame(&b).unwrap();
        assert_eq!(a.id, 1);
        assert_eq!(b.data.len(), 100);
    }

    #[test]
    fn test_version_validation() {
        let mut frame = encode_frame(&TestMessage { id: 1, data: vec![] })
            .unwrap()
            .to_vec();
        frame[0] = 99;

        let result: BincodeResult<TestMessage> = decode_frame(&frame);
        assert!(matches!(result, Err(BincodeError::InvalidVersion { .. })));
    }

    #[test]
    fn test_header_errors() {
        assert!(matches!(
            parse_header(&[FRAME_FORMAT_VERSION, 0]),
            Err(BincodeError::BufferTooSmall { .. })
        ));

        let huge = ((MAX_FRAME_LEN + 1) as u32).to_le_bytes();
        let header = [FRAME_FORMAT_VERSION, huge[0], huge[1], huge[2], huge[3]];
        assert!(matches!(
            parse_header(&header),
            Err(BincodeError::FrameTooLarge { .. })
        ));

        let result: BincodeResult<TestMessage> =
            decode_frame(&[FRAME_FORMAT_VERSION, 100, 0, 0, 0, 1, 2]);
        assert!(matches!(result, Err(BincodeError::BufferTooSmall { .. })));
    }
}
