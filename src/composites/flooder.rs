/*!
 * Flooder
 *
 * Sends on every writable sender and receives on every readable receiver
 * until the run time expires, then drains receivers until a wait comes
 * back without data or the drain deadline passes.
 */

use super::{
    check_range, is_retry, ms_until, rand_range, secs, with_counters, CompositeError, CompositeResult, TrafficStats,
};
use crate::core::errors::Result;
use crate::core::limits::{FLOODER_BUF_LEN, FLOODER_FILL_BYTE};
use crate::core::types::Fd;
use crate::iomux::{Flavor, IoEvents, Iomux};
use crate::symbols::Primitives;
use serde::{Deserialize, Serialize};
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FlooderParams {
    pub receivers: Vec<Fd>,
    pub senders: Vec<Fd>,
    pub size_min: u32,
    pub size_max: u32,
    pub delay_min_us: u64,
    pub delay_max_us: u64,
    pub time2run_s: u32,
    pub time2wait_ms: u32,
    pub iomux: Flavor,
    pub ignore_err: bool,
}

impl FlooderParams {
    fn validate(&self) -> std::result::Result<(), CompositeError> {
        check_range("size", u64::from(self.size_min), u64::from(self.size_max))?;
        check_range("delay", self.delay_min_us, self.delay_max_us)?;
        if self.size_max == 0 || self.size_max as usize > FLOODER_BUF_LEN {
            return Err(CompositeError::InvalidParams(format!(
                "size_max must be in 1..={}",
                FLOODER_BUF_LEN
            )));
        }
        Ok(())
    }
}

/// `fds` in first-seen order with repeats dropped
fn unique(fds: &[Fd]) -> Vec<Fd> {
    let mut out: Vec<Fd> = Vec::with_capacity(fds.len());
    for &fd in fds {
        if !out.contains(&fd) {
            out.push(fd);
        }
    }
    out
}

/// Counters are indexed like `senders` and `receivers`; a fd listed twice
/// is counted in its first slot.
pub fn flooder(prims: &Primitives, params: &FlooderParams) -> CompositeResult<TrafficStats> {
    let stats = TrafficStats::new(params.senders.len(), params.receivers.len());
    with_counters(stats, |stats| run(prims, params, stats))
}

fn run(prims: &Primitives, params: &FlooderParams, stats: &mut TrafficStats) -> Result<()> {
    params.validate()?;
    let senders = unique(&params.senders);
    let receivers = unique(&params.receivers);

    let mut mux = Iomux::create(prims, params.iomux)?;
    for &fd in &senders {
        mux.add(fd, IoEvents::OUT)?;
    }
    for &fd in &receivers {
        if senders.contains(&fd) {
            mux.modify(fd, IoEvents::IN | IoEvents::OUT)?;
        } else {
            mux.add(fd, IoEvents::IN)?;
        }
    }

    let snd_buf = vec![FLOODER_FILL_BYTE; params.size_max as usize];
    let mut rcv_buf = vec![0u8; FLOODER_BUF_LEN];

    let stop = Instant::now() + secs(params.time2run_s);
    let mut drain_deadline: Option<Instant> = None;
    info!(
        flavor = %params.iomux,
        senders = senders.len(),
        receivers = receivers.len(),
        time2run_s = params.time2run_s,
        "flooder started"
    );

    loop {
        let timeout = match drain_deadline {
            None => ms_until(stop),
            Some(deadline) => ms_until(deadline),
        };
        let (_, ret) = match mux.wait(timeout) {
            Ok(r) => r,
            Err(e) if is_retry(&e) => continue,
            Err(e) => {
                warn!(flavor = %params.iomux, error = %e, "flooder wait failed");
                return Err(e);
            }
        };

        let mut session_rx = false;
        for (fd, events) in mux.ready(&ret) {
            if drain_deadline.is_none() && events.is_writable() {
                let len = rand_range(u64::from(params.size_min), u64::from(params.size_max)) as usize;
                match prims.send(fd, &snd_buf[..len], libc::MSG_DONTWAIT) {
                    Ok(sent) => {
                        if let Some(i) = params.senders.iter().position(|s| *s == fd) {
                            stats.tx[i] += sent as u64;
                        }
                    }
                    Err(e) if is_retry(&e) => {}
                    Err(e) if params.ignore_err => debug!(fd, error = %e, "send failed, ignored"),
                    Err(e) => {
                        warn!(fd, error = %e, "flooder send failed");
                        return Err(e);
                    }
                }
                let delay = rand_range(params.delay_min_us, params.delay_max_us);
                if delay > 0 {
                    std::thread::sleep(Duration::from_micros(delay));
                }
            }

            if events.is_readable() {
                match prims.recv(fd, &mut rcv_buf, libc::MSG_DONTWAIT) {
                    Ok(0) => {}
                    Ok(received) => {
                        session_rx = true;
                        if let Some(i) = params.receivers.iter().position(|r| *r == fd) {
                            stats.rx[i] += received as u64;
                        }
                    }
                    Err(e) if is_retry(&e) => {}
                    Err(e) => {
                        warn!(fd, error = %e, "flooder recv failed");
                        return Err(e);
                    }
                }
            }
        }

        match drain_deadline {
            None if Instant::now() >= stop => {
                // Stop sending; receivers keep draining
                for &fd in &senders {
                    let events = if receivers.contains(&fd) {
                        IoEvents::IN
                    } else {
                        IoEvents::NONE
                    };
                    mux.modify(fd, events)?;
                }
                drain_deadline = Some(Instant::now() + Duration::from_millis(u64::from(params.time2wait_ms)));
                debug!("flooder run time expired, draining");
            }
            None => {}
            Some(deadline) => {
                if !session_rx || Instant::now() >= deadline {
                    break;
                }
            }
        }
    }

    info!(tx = stats.total_tx(), rx = stats.total_rx(), "flooder finished");
    Ok(())
}
