/*!
 * Composite Call Handler
 * Routes long-running traffic helpers to the composites module
 */

use crate::composites::{
    echoer, flooder, overfill_buffers, overfill_fd, recv_verify, simple_receiver, simple_sender, socket_to_file,
    wait_readable, CompositeResult, Interrupted,
};
use crate::core::errors::Result;
use crate::rpc::handler::{CallContext, RpcHandler};
use crate::rpc::types::{RpcCall, RpcOutput};

pub struct CompositeHandler;

/// Wrap a composite's counters; on failure they go back as the partial output
fn settle<T>(ctx: &mut CallContext<'_>, result: CompositeResult<T>, wrap: fn(T) -> RpcOutput) -> Result<RpcOutput> {
    match result {
        Ok(counters) => Ok(wrap(counters)),
        Err(Interrupted { partial, source }) => {
            ctx.set_partial(wrap(partial));
            Err(source)
        }
    }
}

impl RpcHandler for CompositeHandler {
    fn handle(&self, ctx: &mut CallContext<'_>, call: &RpcCall) -> Option<Result<RpcOutput>> {
        let prims = ctx.prims;
        let result = match call {
            RpcCall::Flooder(params) => settle(ctx, flooder(prims, params), RpcOutput::Traffic),
            RpcCall::Echoer(params) => settle(ctx, echoer(prims, params), RpcOutput::Traffic),
            RpcCall::OverfillBuffers(params) => settle(ctx, overfill_buffers(prims, params), RpcOutput::Count),
            RpcCall::OverfillFd { write_end } => settle(ctx, overfill_fd(prims, *write_end), RpcOutput::Count),
            RpcCall::SocketToFile { sock, path, timeout_s } => {
                settle(ctx, socket_to_file(prims, *sock, path, *timeout_s), RpcOutput::Count)
            }
            RpcCall::RecvVerify { sock, pattern } => {
                settle(ctx, recv_verify(prims, *sock, pattern.as_deref()), RpcOutput::Count)
            }
            RpcCall::SimpleSender(params) => settle(ctx, simple_sender(prims, params), RpcOutput::Count),
            RpcCall::SimpleReceiver { sock, time2run_s } => {
                settle(ctx, simple_receiver(prims, *sock, *time2run_s), RpcOutput::Count)
            }
            RpcCall::WaitReadable { sock, timeout_ms } => {
                wait_readable(prims, *sock, *timeout_ms).map(RpcOutput::Bool)
            }
            _ => return None,
        };
        Some(result)
    }

    fn name(&self) -> &'static str {
        "composite_handler"
    }
}
