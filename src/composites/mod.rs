/*!
 * Composite Operations
 *
 * Long-running traffic helpers built on the primitive table and the
 * multiplexer: flooder, echoer, overfill, socket-to-file, recv-verify and
 * the simple sender / receiver pair.
 *
 * Every composite runs inside one RPC, owns its multiplexer state and
 * buffers, and releases them on every exit path. Time limits are checked
 * only between waits. A composite that fails still hands back the
 * counters it reached, see [`Interrupted`].
 */

mod echoer;
mod flooder;
mod overfill;
mod receive;
mod sender;
mod sock_to_file;

pub use echoer::{echoer, EchoerParams};
pub use flooder::{flooder, FlooderParams};
pub use overfill::{overfill_buffers, overfill_fd, OverfillParams};
pub use receive::{recv_verify, simple_receiver, wait_readable};
pub use sender::{simple_sender, SimpleSenderParams};
pub use sock_to_file::socket_to_file;

use crate::core::errors::{AgentError, Result, RpcErrno, ToRpcErrno};
use crate::core::types::Fd;
use miette::Diagnostic;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq, Diagnostic)]
pub enum CompositeError {
    #[error("Invalid parameters: {0}")]
    #[diagnostic(code(composite::invalid_params))]
    InvalidParams(String),

    #[error("Wrote {written} of {received} bytes received from fd {fd}")]
    #[diagnostic(
        code(composite::partial_write),
        help("The target file accepted fewer bytes than were read from the socket.")
    )]
    PartialWrite { fd: Fd, received: usize, written: usize },

    #[error("Data mismatch at byte {offset} after {received} bytes")]
    #[diagnostic(code(composite::pattern_mismatch))]
    PatternMismatch { offset: u64, received: u64 },

    #[error("Fd {fd} was reported writable but accepted no data")]
    #[diagnostic(code(composite::spurious_writable))]
    SpuriousWritable { fd: Fd },

    #[error("Wait returned {rc} but fd {fd} is not in the result")]
    #[diagnostic(code(composite::not_in_set))]
    NotInSet { fd: Fd, rc: usize },
}

impl ToRpcErrno for CompositeError {
    fn rpc_errno(&self) -> RpcErrno {
        match self {
            CompositeError::InvalidParams(_) => RpcErrno::InvalidArg,
            CompositeError::PartialWrite { .. } => RpcErrno::Io,
            CompositeError::PatternMismatch { .. } => RpcErrno::Corrupted,
            CompositeError::SpuriousWritable { .. } | CompositeError::NotInSet { .. } => {
                RpcErrno::Unknown
            }
        }
    }
}

/// A composite stopped by an error, with the counters it had reached
#[derive(Debug)]
pub struct Interrupted<T> {
    pub partial: T,
    pub source: AgentError,
}

impl<T> From<Interrupted<T>> for AgentError {
    fn from(err: Interrupted<T>) -> Self {
        err.source
    }
}

impl<T> ToRpcErrno for Interrupted<T> {
    fn rpc_errno(&self) -> RpcErrno {
        self.source.rpc_errno()
    }
}

pub type CompositeResult<T> = std::result::Result<T, Interrupted<T>>;

/// Run `body` over `counters`, keeping whatever it counted if it fails
pub(crate) fn with_counters<T>(mut counters: T, body: impl FnOnce(&mut T) -> Result<()>) -> CompositeResult<T> {
    match body(&mut counters) {
        Ok(()) => Ok(counters),
        Err(source) => Err(Interrupted {
            partial: counters,
            source,
        }),
    }
}

/// Per-fd byte counters, indexed like the fd lists of the request
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TrafficStats {
    pub tx: Vec<u64>,
    pub rx: Vec<u64>,
}

impl TrafficStats {
    pub fn new(tx_len: usize, rx_len: usize) -> Self {
        Self {
            tx: vec![0; tx_len],
            rx: vec![0; rx_len],
        }
    }

    pub fn total_tx(&self) -> u64 {
        self.tx.iter().sum()
    }

    pub fn total_rx(&self) -> u64 {
        self.rx.iter().sum()
    }
}

/// Errors a traffic loop ignores and retries on the next wait
#[inline]
pub(crate) fn is_retry(err: &AgentError) -> bool {
    err.rpc_errno().is_retry()
}

/// Uniform draw from an inclusive range
pub(crate) fn rand_range(min: u64, max: u64) -> u64 {
    use rand::Rng;
    if min >= max {
        return min;
    }
    rand::thread_rng().gen_range(min..=max)
}

/// Milliseconds left until `deadline`, clamped to what a wait accepts
pub(crate) fn ms_until(deadline: std::time::Instant) -> i32 {
    let left = deadline.saturating_duration_since(std::time::Instant::now());
    left.as_millis().min(i32::MAX as u128) as i32
}

pub(crate) fn secs(s: u32) -> Duration {
    Duration::from_secs(u64::from(s))
}

pub(crate) fn check_range(what: &str, min: u64, max: u64) -> std::result::Result<(), CompositeError> {
    if min > max {
        return Err(CompositeError::InvalidParams(format!(
            "{} range is empty: min {} > max {}",
            what, min, max
        )));
    }
    Ok(())
}
