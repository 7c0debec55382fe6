/*!
 * Call Dispatcher
 *
 * Every call goes through the same phases: wait for its start time, let the
 * handler install checked buffers and invoke the primitive with errno
 * cleared, verify the checked buffers in LIFO order, and fill the reply
 * header. A corrupted buffer overrides whatever the primitive reported.
 */

use super::deferred::DeferredJobs;
use super::handler::{CallContext, RpcHandlerRegistry};
use super::types::{CallHeader, CallMode, CallOp, Reply, ReplyHeader, Request, RpcCall, RpcOutput};
use crate::core::errors::{AgentError, ErrorReport, RpcErrno, ToRpcErrno};
use crate::core::types::{JobId, TimestampMs};
use crate::monitoring::RpcSpan;
use crate::symbols::{resolver, Primitives, Resolver};
use nix::errno::Errno;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};
use tracing::{debug, warn};

fn now_ms() -> TimestampMs {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as TimestampMs)
        .unwrap_or(0)
}

/// Sleep until the requested wall-clock start time
fn wait_start(rpc: &'static str, start_ms: TimestampMs) {
    if start_ms == 0 {
        return;
    }
    let now = now_ms();
    if start_ms > now {
        std::thread::sleep(Duration::from_millis(start_ms - now));
    } else {
        warn!(rpc, late_ms = now - start_ms, "start time is already in the past");
    }
}

fn error_reply(err: &AgentError) -> Reply {
    let report = ErrorReport::from(err);
    Reply::error(report.errno, report.message)
}

/// Run one call synchronously on the current thread
pub fn execute(
    registry: &RpcHandlerRegistry,
    resolver: &'static Resolver,
    header: &CallHeader,
    call: &RpcCall,
    jobid: JobId,
) -> Reply {
    let rpc = call.name();
    wait_start(rpc, header.start_ms);

    let mut span = RpcSpan::new(rpc, jobid, header.use_libc);
    let reply = {
        let _entered = span.enter();
        let prims = Primitives::with_resolver(resolver, header.use_libc);
        let mut ctx = CallContext::new(&prims, jobid);

        let started = Instant::now();
        Errno::clear();
        let result = registry.dispatch(&mut ctx, call);
        let errno_after = Errno::last_raw();
        let duration = started.elapsed();

        let verified = ctx.checked_mut().verify();
        let returned = ctx.take_output();

        let (mut output, mut errno, mut message) = match result {
            None => (
                RpcOutput::Unit,
                RpcErrno::RpcNotSupported,
                Some(format!("no handler for {}", rpc)),
            ),
            Some(Ok(output)) => (output, RpcErrno::Ok, None),
            Some(Err(e)) => {
                debug!(rpc, error = %e, "call failed");
                let partial = ctx.take_partial().unwrap_or(RpcOutput::Unit);
                (partial, e.rpc_errno(), Some(e.to_string()))
            }
        };
        if let Some(buf) = returned {
            output.attach_buffer(buf);
        }
        if let Err(e) = verified {
            errno = RpcErrno::Corrupted;
            message = Some(e.to_string());
        }

        Reply {
            header: ReplyHeader {
                errno,
                errno_changed: errno_after != 0,
                duration_us: duration.as_micros() as u64,
                done: jobid,
                message,
            },
            output,
        }
    };
    span.record_result(reply.header.errno);
    reply
}

/// Entry point for decoded requests
pub struct Dispatcher {
    registry: RpcHandlerRegistry,
    jobs: DeferredJobs,
    resolver: &'static Resolver,
}

impl Dispatcher {
    pub fn new(registry: RpcHandlerRegistry) -> Self {
        Self::with_resolver(registry, resolver())
    }

    pub fn with_resolver(registry: RpcHandlerRegistry, resolver: &'static Resolver) -> Self {
        Self {
            registry,
            jobs: DeferredJobs::new(),
            resolver,
        }
    }

    #[inline]
    pub fn registry(&self) -> &RpcHandlerRegistry {
        &self.registry
    }

    #[inline]
    pub fn jobs(&self) -> &DeferredJobs {
        &self.jobs
    }

    /// Handle one request; every request gets a reply
    pub fn dispatch(&self, request: Request) -> Reply {
        let Request { header, call } = request;
        match header.op {
            CallOp::IsDone => match self.jobs.is_done(header.done) {
                Some(done) => Reply {
                    header: ReplyHeader {
                        done: header.done,
                        ..ReplyHeader::default()
                    },
                    output: RpcOutput::Bool(done),
                },
                None => Reply::error(RpcErrno::NoEntry, format!("no deferred call {}", header.done)),
            },
            CallOp::Cancel => {
                if self.jobs.cancel(header.done) {
                    Reply::default()
                } else {
                    Reply::error(RpcErrno::NoEntry, format!("no deferred call {}", header.done))
                }
            }
            CallOp::Call => match header.mode {
                CallMode::Sync => execute(&self.registry, self.resolver, &header, &call, 0),
                CallMode::FireAndForget => self.start_deferred(header, call),
                CallMode::Poll => match self.jobs.join(header.done) {
                    Ok(reply) => reply,
                    Err(e) => error_reply(&e),
                },
            },
        }
    }

    fn start_deferred(&self, header: CallHeader, call: RpcCall) -> Reply {
        let registry = self.registry.clone();
        let resolver = self.resolver;
        let rpc = call.name();
        match self
            .jobs
            .spawn(rpc, move |jobid| execute(&registry, resolver, &header, &call, jobid))
        {
            Ok(jobid) => Reply {
                header: ReplyHeader {
                    done: jobid,
                    ..ReplyHeader::default()
                },
                output: RpcOutput::Unit,
            },
            Err(e) => error_reply(&e),
        }
    }
}
