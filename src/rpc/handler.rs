/*!
 * RPC Handler Trait
 * Defines the interface for call handlers and handler registration
 */

use super::types::{RpcCall, RpcOutput};
use crate::core::errors::Result;
use crate::core::guard::CheckedArgs;
use crate::core::types::JobId;
use crate::symbols::Primitives;
use std::ops::Range;
use std::sync::Arc;

/// Per-call state handed to a handler
pub struct CallContext<'a> {
    pub prims: &'a Primitives,
    pub jobid: JobId,
    checked: CheckedArgs,
    output_slot: Option<usize>,
    partial: Option<RpcOutput>,
}

impl<'a> CallContext<'a> {
    pub fn new(prims: &'a Primitives, jobid: JobId) -> Self {
        Self {
            prims,
            jobid,
            checked: CheckedArgs::new(),
            output_slot: None,
            partial: None,
        }
    }

    #[inline]
    pub fn use_libc(&self) -> bool {
        self.prims.use_libc()
    }

    /// Hand `data` to the callee, which may modify only `data[..len_visible]`
    ///
    /// The buffer is verified after the handler returns and then moved into
    /// the output record.
    pub fn install_output(&mut self, name: &str, data: Vec<u8>, len_visible: usize) -> usize {
        let slot = self.checked.install(name, data, len_visible);
        self.output_slot = Some(slot);
        slot
    }

    /// Register an input-only buffer; it is verified but not returned
    pub fn install_input(&mut self, name: &str, data: Vec<u8>, len_visible: usize) -> usize {
        self.checked.install(name, data, len_visible)
    }

    #[inline]
    pub fn buffer(&self, slot: usize) -> &[u8] {
        self.checked.buffer(slot)
    }

    #[inline]
    pub fn buffer_mut(&mut self, slot: usize) -> &mut [u8] {
        self.checked.buffer_mut(slot)
    }

    /// Visible parts of the buffers in `slots`
    pub fn buffers(&self, slots: Range<usize>) -> Vec<&[u8]> {
        self.checked.visible(slots)
    }

    pub fn buffers_mut(&mut self, slots: Range<usize>) -> Vec<&mut [u8]> {
        self.checked.visible_mut(slots)
    }

    pub(crate) fn checked_mut(&mut self) -> &mut CheckedArgs {
        &mut self.checked
    }

    pub(crate) fn take_output(&mut self) -> Option<Vec<u8>> {
        self.output_slot.take().map(|slot| self.checked.take(slot))
    }

    /// Output to reply with if the handler returns an error
    pub fn set_partial(&mut self, output: RpcOutput) {
        self.partial = Some(output);
    }

    pub(crate) fn take_partial(&mut self) -> Option<RpcOutput> {
        self.partial.take()
    }
}

/// Trait for handling a family of calls
/// Each category (process, io, memory, ...) implements this
pub trait RpcHandler: Send + Sync {
    /// Handle a call, or return None if it belongs to another handler
    fn handle(&self, ctx: &mut CallContext<'_>, call: &RpcCall) -> Option<Result<RpcOutput>>;

    /// Get the name of this handler (for logging/debugging)
    fn name(&self) -> &'static str;
}

/// Registry for call handlers
/// Dispatches calls to the first handler that claims them
#[derive(Clone)]
pub struct RpcHandlerRegistry {
    handlers: Arc<Vec<Arc<dyn RpcHandler>>>,
}

impl RpcHandlerRegistry {
    pub fn new() -> Self {
        Self {
            handlers: Arc::new(Vec::new()),
        }
    }

    pub fn register(mut self, handler: Arc<dyn RpcHandler>) -> Self {
        Arc::make_mut(&mut self.handlers).push(handler);
        self
    }

    /// Returns None if no handler claims this call
    pub fn dispatch(&self, ctx: &mut CallContext<'_>, call: &RpcCall) -> Option<Result<RpcOutput>> {
        for handler in self.handlers.iter() {
            if let Some(result) = handler.handle(ctx, call) {
                tracing::trace!(handler = handler.name(), rpc = call.name(), "call handled");
                return Some(result);
            }
        }
        None
    }

    pub fn handler_count(&self) -> usize {
        self.handlers.len()
    }
}

impl Default for RpcHandlerRegistry {
    fn default() -> Self {
        Self::new()
    }
}
