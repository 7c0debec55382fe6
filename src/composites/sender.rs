/*!
 * Simple Sender
 * Send fixed-content chunks of random size with random pauses
 */

use super::{check_range, rand_range, secs, with_counters, CompositeError, CompositeResult};
use crate::core::errors::Result;
use crate::core::limits::{MAX_RPC_BUFFER_LEN, SIMPLE_SENDER_FILL_BYTE};
use crate::core::types::Fd;
use crate::symbols::Primitives;
use serde::{Deserialize, Serialize};
use std::time::{Duration, Instant};
use tracing::{debug, info};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SimpleSenderParams {
    pub sock: Fd,
    pub size_min: u32,
    pub size_max: u32,
    /// Draw the size once instead of before every send
    pub size_rnd_once: bool,
    pub delay_min_us: u64,
    pub delay_max_us: u64,
    /// Draw the delay once instead of before every send
    pub delay_rnd_once: bool,
    pub time2run_s: u32,
    pub ignore_err: bool,
}

/// On a send failure the count covers everything sent before it
pub fn simple_sender(prims: &Primitives, params: &SimpleSenderParams) -> CompositeResult<u64> {
    with_counters(0, |bytes| send_loop(prims, params, bytes))
}

fn send_loop(prims: &Primitives, params: &SimpleSenderParams, bytes: &mut u64) -> Result<()> {
    check_range("size", u64::from(params.size_min), u64::from(params.size_max))?;
    check_range("delay", params.delay_min_us, params.delay_max_us)?;
    if params.size_max as usize > MAX_RPC_BUFFER_LEN {
        return Err(CompositeError::InvalidParams(format!("size_max {} is too large", params.size_max)).into());
    }

    let buf = vec![SIMPLE_SENDER_FILL_BYTE; params.size_max as usize];
    let mut size = rand_range(u64::from(params.size_min), u64::from(params.size_max)) as usize;
    let mut delay = rand_range(params.delay_min_us, params.delay_max_us);
    let run = secs(params.time2run_s);
    let start = Instant::now();
    info!(sock = params.sock, time2run_s = params.time2run_s, "simple_sender started");

    while start.elapsed() <= run {
        if !params.size_rnd_once {
            size = rand_range(u64::from(params.size_min), u64::from(params.size_max)) as usize;
        }
        if !params.delay_rnd_once {
            delay = rand_range(params.delay_min_us, params.delay_max_us);
        }

        // A pause that would overrun the remaining time by more than a second ends the run
        let remaining = run.saturating_sub(start.elapsed());
        if Duration::from_micros(delay) > remaining + Duration::from_secs(1) {
            break;
        }
        std::thread::sleep(Duration::from_micros(delay));

        match prims.send(params.sock, &buf[..size], 0) {
            Ok(sent) => *bytes += sent as u64,
            Err(e) if params.ignore_err => debug!(sock = params.sock, error = %e, "send failed, ignored"),
            Err(e) => return Err(e),
        }
    }

    info!(sock = params.sock, bytes = *bytes, "simple_sender stopped");
    Ok(())
}
