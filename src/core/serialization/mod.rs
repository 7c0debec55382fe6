/*!
 * Serialization Utilities
 *
 * Bincode frames for the agent transport.
 */

pub mod bincode;

pub use self::bincode::{decode_frame, encode_frame, parse_header, BincodeError, FRAME_HEADER_LEN};
