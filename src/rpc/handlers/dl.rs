/*!
 * Dynamic Library Handler
 * dlopen / dlsym / dlclose on behalf of the client
 */

use crate::core::errors::{AgentError, Result, RpcErrno};
use crate::core::handles::{global, HandleRegistry};
use crate::core::types::{Address, HandleId, HandleKind};
use crate::rpc::handler::{CallContext, RpcHandler};
use crate::rpc::types::{RpcCall, RpcOutput};
use libc::{c_int, c_void};
use parking_lot::Mutex;
use std::ffi::{CStr, CString};
use tracing::{debug, warn};

type NoArgFn = unsafe extern "C" fn() -> c_int;

/// Handler for dynamic-loader calls
pub struct DlHandler {
    handles: &'static HandleRegistry,
    /// Loader message captured by the last failing call
    last_error: Mutex<Option<String>>,
}

fn loader_message() -> Option<String> {
    // SAFETY: dlerror returns NULL or a thread-local NUL-terminated string
    let msg = unsafe { libc::dlerror() };
    (!msg.is_null()).then(|| unsafe { CStr::from_ptr(msg) }.to_string_lossy().into_owned())
}

fn c_name(what: &str, name: &str) -> Result<CString> {
    CString::new(name).map_err(|_| AgentError::invalid_arg(format!("{} contains NUL", what)))
}

impl DlHandler {
    pub fn new() -> Self {
        Self {
            handles: global(),
            last_error: Mutex::new(None),
        }
    }

    fn fail(&self, call: &str, fallback: String) -> AgentError {
        let msg = loader_message().unwrap_or(fallback);
        warn!(call, error = %msg, "dynamic loader call failed");
        *self.last_error.lock() = Some(msg.clone());
        AgentError::rpc(RpcErrno::NoEntry, msg)
    }

    fn dlopen(&self, name: Option<&str>, flags: i32) -> Result<RpcOutput> {
        let cname = name.map(|n| c_name("library name", n)).transpose()?;
        let ptr = cname.as_ref().map_or(std::ptr::null(), |c| c.as_ptr());
        // SAFETY: ptr is NULL or a valid C string for the duration of the call
        let handle = unsafe { libc::dlopen(ptr, flags) };
        if handle.is_null() {
            return Err(self.fail("dlopen", format!("cannot open {:?}", name)));
        }
        let id = self.handles.alloc(handle as Address, HandleKind::DlHandle)?;
        debug!(library = ?name, id, "library opened");
        Ok(RpcOutput::Handle(id))
    }

    fn dlsym(&self, handle: HandleId, symbol: &str) -> Result<Address> {
        // Handle 0 maps to the default search order
        let lib = self.handles.lookup(handle, HandleKind::DlHandle)? as *mut c_void;
        let csym = c_name("symbol", symbol)?;
        // SAFETY: lib is NULL (RTLD_DEFAULT) or a handle from dlopen
        let addr = unsafe { libc::dlsym(lib, csym.as_ptr()) };
        if addr.is_null() {
            return Err(self.fail("dlsym", format!("symbol {} not found", symbol)));
        }
        Ok(addr as Address)
    }

    fn dlsym_call(&self, handle: HandleId, symbol: &str) -> Result<RpcOutput> {
        let addr = self.dlsym(handle, symbol)?;
        // SAFETY: the client asserts that `symbol` is an `int (*)(void)`
        let f = unsafe { std::mem::transmute::<Address, NoArgFn>(addr) };
        let rc = unsafe { f() };
        debug!(symbol, rc, "symbol called");
        Ok(RpcOutput::Int(i64::from(rc)))
    }

    fn dlerror(&self) -> RpcOutput {
        let msg = self.last_error.lock().take().or_else(loader_message);
        RpcOutput::Text(msg.unwrap_or_default())
    }

    fn dlclose(&self, handle: HandleId) -> Result<RpcOutput> {
        if let Some(entry) = self.handles.free(handle, HandleKind::DlHandle)? {
            // SAFETY: DlHandle entries come from dlopen
            if unsafe { libc::dlclose(entry.addr as *mut c_void) } != 0 {
                return Err(self.fail("dlclose", format!("cannot close handle {}", handle)));
            }
        }
        Ok(RpcOutput::Unit)
    }
}

impl Default for DlHandler {
    fn default() -> Self {
        Self::new()
    }
}

impl RpcHandler for DlHandler {
    fn handle(&self, _ctx: &mut CallContext<'_>, call: &RpcCall) -> Option<Result<RpcOutput>> {
        match call {
            RpcCall::Dlopen { name, flags } => Some(self.dlopen(name.as_deref(), *flags)),
            RpcCall::Dlsym { handle, symbol } => Some(self.dlsym(*handle, symbol).map(RpcOutput::Address)),
            RpcCall::DlsymCall { handle, symbol } => Some(self.dlsym_call(*handle, symbol)),
            RpcCall::Dlerror => Some(Ok(self.dlerror())),
            RpcCall::Dlclose { handle } => Some(self.dlclose(*handle)),
            _ => None,
        }
    }

    fn name(&self) -> &'static str {
        "dl_handler"
    }
}
