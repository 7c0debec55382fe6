/*!
 * Frame Transport
 *
 * Reads and writes whole frames over a stream, async for the main server
 * and blocking for helper servers and clients. A frame whose header is
 * valid but whose payload does not decode leaves the stream in sync; a bad
 * header does not.
 */

use crate::core::errors::{RpcErrno, ToRpcErrno};
use crate::core::serialization::bincode::{from_slice, BincodeError};
use crate::core::serialization::{encode_frame, parse_header, FRAME_HEADER_LEN};
use miette::Diagnostic;
use serde::{de::DeserializeOwned, Serialize};
use std::io::{ErrorKind, Read, Write};
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

pub type TransportResult<T> = Result<T, TransportError>;

#[derive(Error, Debug, Diagnostic)]
pub enum TransportError {
    #[error("Malformed frame: {0}")]
    #[diagnostic(code(transport::frame))]
    Frame(#[from] BincodeError),

    #[error("Payload does not decode: {0}")]
    #[diagnostic(code(transport::payload))]
    Payload(BincodeError),

    #[error("Connection closed by peer")]
    #[diagnostic(code(transport::closed))]
    Closed,

    #[error("Cannot listen on {path}: {reason}")]
    #[diagnostic(
        code(transport::bind),
        help("Check RPC_AGENT_SOCKET_DIR and remove stale agents using the same name.")
    )]
    Bind { path: String, reason: String },

    #[error("Server is already running")]
    #[diagnostic(code(transport::already_running))]
    AlreadyRunning,

    #[error("I/O error: {0}")]
    #[diagnostic(code(transport::io))]
    Io(#[from] std::io::Error),
}

impl ToRpcErrno for TransportError {
    fn rpc_errno(&self) -> RpcErrno {
        match self {
            TransportError::Frame(_) | TransportError::Payload(_) => RpcErrno::InvalidArg,
            TransportError::Closed => RpcErrno::ConnReset,
            TransportError::Bind { .. } => RpcErrno::AddrInUse,
            TransportError::AlreadyRunning => RpcErrno::Busy,
            TransportError::Io(e) => e.raw_os_error().map_or(RpcErrno::Io, RpcErrno::from_errno),
        }
    }
}

fn decode_payload<T: DeserializeOwned>(payload: &[u8]) -> TransportResult<T> {
    from_slice(payload).map_err(TransportError::Payload)
}

// ============================================================================
// Async
// ============================================================================

/// Read one frame; `Ok(None)` on a clean end of stream before a header
pub async fn read_message<R, T>(reader: &mut R) -> TransportResult<Option<T>>
where
    R: AsyncRead + Unpin,
    T: DeserializeOwned,
{
    let mut header = [0u8; FRAME_HEADER_LEN];
    match reader.read_exact(&mut header).await {
        Ok(_) => {}
        Err(e) if e.kind() == ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(e.into()),
    }
    let len = parse_header(&header)?;
    let mut payload = vec![0u8; len];
    reader.read_exact(&mut payload).await.map_err(|e| match e.kind() {
        ErrorKind::UnexpectedEof => TransportError::Closed,
        _ => e.into(),
    })?;
    decode_payload(&payload).map(Some)
}

pub async fn write_message<W, T>(writer: &mut W, value: &T) -> TransportResult<()>
where
    W: AsyncWrite + Unpin,
    T: Serialize,
{
    let frame = encode_frame(value)?;
    writer.write_all(&frame).await?;
    writer.flush().await?;
    Ok(())
}

// ============================================================================
// Blocking
// ============================================================================

/// Blocking counterpart of [`read_message`]
pub fn read_message_blocking<R: Read, T: DeserializeOwned>(reader: &mut R) -> TransportResult<Option<T>> {
    let mut header = [0u8; FRAME_HEADER_LEN];
    match reader.read_exact(&mut header) {
        Ok(()) => {}
        Err(e) if e.kind() == ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(e.into()),
    }
    let len = parse_header(&header)?;
    let mut payload = vec![0u8; len];
    reader.read_exact(&mut payload).map_err(|e| match e.kind() {
        ErrorKind::UnexpectedEof => TransportError::Closed,
        _ => e.into(),
    })?;
    decode_payload(&payload).map(Some)
}

pub fn write_message_blocking<W: Write, T: Serialize>(writer: &mut W, value: &T) -> TransportResult<()> {
    let frame = encode_frame(value)?;
    writer.write_all(&frame)?;
    writer.flush()?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rpc::{Reply, Request, RpcCall};
    use crate::core::serialization::bincode::FRAME_FORMAT_VERSION;
    use pretty_assertions::assert_eq;
    use std::io::Cursor;

    #[test]
    fn test_blocking_round_trip_and_eof() {
        let mut wire = Vec::new();
        let req = Request::sync(RpcCall::GetSizeof { type_name: "int".into() });
        write_message_blocking(&mut wire, &req).unwrap();

        let mut cursor = Cursor::new(wire);
        let back: Option<Request> = read_message_blocking(&mut cursor).unwrap();
        assert_eq!(back, Some(req));
        let end: Option<Request> = read_message_blocking(&mut cursor).unwrap();
        assert_eq!(end, None);
    }

    #[test]
    fn test_truncated_payload() {
        let mut wire = Vec::new();
        write_message_blocking(&mut wire, &Reply::default()).unwrap();
        wire.truncate(wire.len() - 1);
        let err = read_message_blocking::<_, Reply>(&mut Cursor::new(wire)).unwrap_err();
        assert!(matches!(err, TransportError::Closed));
    }

    #[test]
    fn test_undecodable_payload_is_reported() {
        let wire = vec![FRAME_FORMAT_VERSION, 1, 0, 0, 0, 0xFF];
        let err = read_message_blocking::<_, Request>(&mut Cursor::new(wire)).unwrap_err();
        assert!(matches!(err, TransportError::Payload(_)));
        assert_eq!(err.rpc_errno(), RpcErrno::InvalidArg);
    }

    #[tokio::test]
    async fn test_async_round_trip() {
        let (mut a, mut b) = tokio::io::duplex(1024);
        let req = Request::sync(RpcCall::GetPid);
        write_message(&mut a, &req).await.unwrap();
        drop(a);
        let back: Option<Request> = read_message(&mut b).await.unwrap();
        assert_eq!(back, Some(req));
        let end: Option<Request> = read_message(&mut b).await.unwrap();
        assert_eq!(end, None);
    }
}
