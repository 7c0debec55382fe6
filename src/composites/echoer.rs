/*!
 * Echoer
 *
 * Reads from every readable socket into that socket's FIFO and writes the
 * FIFO head back when the socket is writable. Write interest is only held
 * while a queue has data; a queue holding `ECHOER_QUEUE_MAX_BYTES` stops
 * reading until it drains. A socket whose peer has shut down is dropped
 * from the multiplexer once its queue is empty.
 */

use super::{is_retry, ms_until, secs, with_counters, CompositeResult, TrafficStats};
use crate::core::errors::Result;
use crate::core::limits::{ECHOER_DRAIN_WAIT_MS, ECHOER_QUEUE_MAX_BYTES, FLOODER_BUF_LEN};
use crate::core::types::Fd;
use crate::iomux::{Flavor, IoEvents, Iomux};
use crate::symbols::Primitives;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::time::Instant;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EchoerParams {
    pub sockets: Vec<Fd>,
    pub time2run_s: u32,
    pub iomux: Flavor,
}

#[derive(Default)]
struct EchoQueue {
    chunks: VecDeque<Vec<u8>>,
    /// Bytes of the head chunk already written
    head_off: usize,
    bytes: usize,
    interest: IoEvents,
    eof: bool,
    removed: bool,
}

impl EchoQueue {
    fn is_full(&self) -> bool {
        self.bytes >= ECHOER_QUEUE_MAX_BYTES
    }

    fn push(&mut self, chunk: Vec<u8>) {
        self.bytes += chunk.len();
        self.chunks.push_back(chunk);
    }

    /// Events this queue needs from the multiplexer
    fn wanted(&self) -> IoEvents {
        let mut events = IoEvents::NONE;
        if !self.eof && !self.is_full() {
            events.insert(IoEvents::IN);
        }
        if !self.chunks.is_empty() {
            events.insert(IoEvents::OUT);
        }
        events
    }

    /// Peer is gone and everything it sent has been echoed
    fn is_finished(&self) -> bool {
        self.eof && self.chunks.is_empty()
    }

    fn pending(&self) -> Option<&[u8]> {
        self.chunks.front().map(|c| &c[self.head_off..])
    }

    fn consume(&mut self, n: usize) {
        self.bytes -= n;
        self.head_off += n;
        if let Some(front) = self.chunks.front() {
            if self.head_off >= front.len() {
                self.chunks.pop_front();
                self.head_off = 0;
            }
        }
    }
}

pub fn echoer(prims: &Primitives, params: &EchoerParams) -> CompositeResult<TrafficStats> {
    let stats = TrafficStats::new(params.sockets.len(), params.sockets.len());
    with_counters(stats, |stats| run(prims, params, stats))
}

fn run(prims: &Primitives, params: &EchoerParams, stats: &mut TrafficStats) -> Result<()> {
    let mut mux = Iomux::create(prims, params.iomux)?;
    let mut queues: Vec<EchoQueue> = Vec::with_capacity(params.sockets.len());
    for &fd in &params.sockets {
        mux.add(fd, IoEvents::IN)?;
        queues.push(EchoQueue {
            interest: IoEvents::IN,
            ..EchoQueue::default()
        });
    }

    let mut buf = vec![0u8; FLOODER_BUF_LEN];
    let stop = Instant::now() + secs(params.time2run_s);
    let mut expired = false;
    info!(flavor = %params.iomux, sockets = params.sockets.len(), "echoer started");

    loop {
        let timeout = if expired { ECHOER_DRAIN_WAIT_MS } else { ms_until(stop) };
        let (_, ret) = match mux.wait(timeout) {
            Ok(r) => r,
            Err(e) if is_retry(&e) => continue,
            Err(e) => {
                warn!(flavor = %params.iomux, error = %e, "echoer wait failed");
                return Err(e);
            }
        };

        let mut session_rx = false;
        for (fd, events) in mux.ready(&ret) {
            let Some(i) = params.sockets.iter().position(|s| *s == fd) else {
                continue;
            };
            let queue = &mut queues[i];
            if queue.removed {
                continue;
            }

            if events.is_readable() && !queue.is_full() {
                match prims.read(fd, &mut buf) {
                    Ok(0) => queue.eof = true,
                    Ok(n) => {
                        queue.push(buf[..n].to_vec());
                        stats.rx[i] += n as u64;
                        session_rx = true;
                    }
                    Err(e) if is_retry(&e) => {}
                    Err(e) => {
                        warn!(fd, error = %e, "echoer read failed");
                        return Err(e);
                    }
                }
            }

            if events.is_writable() {
                if let Some(pending) = queue.pending() {
                    match prims.write(fd, pending) {
                        Ok(n) => {
                            queue.consume(n);
                            stats.tx[i] += n as u64;
                        }
                        Err(e) if is_retry(&e) => {}
                        Err(e) => {
                            warn!(fd, error = %e, "echoer write failed");
                            return Err(e);
                        }
                    }
                }
            }

            if queue.is_finished() {
                mux.remove(fd)?;
                queue.removed = true;
                debug!(fd, "peer shut down, echo complete");
                continue;
            }
            let wanted = queue.wanted();
            if wanted != queue.interest {
                queue.interest = wanted;
                mux.modify(fd, wanted)?;
                if queue.is_full() {
                    debug!(fd, queued = queue.bytes, "echoer queue full, reads paused");
                }
            }
        }

        if !expired && Instant::now() >= stop {
            expired = true;
            debug!("echoer run time expired, draining");
            continue;
        }
        if expired && !session_rx {
            break;
        }
    }

    info!(tx = stats.total_tx(), rx = stats.total_rx(), "echoer finished");
    Ok(())
}
