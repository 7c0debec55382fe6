/*!
 * Symbol Resolver
 *
 * Maps `(use_libc, name)` to a callable address. Precedence: a built-in
 * fast path, then the agent image (use_libc) or the library under test,
 * then the static symbol table.
 */

use super::table::{static_table, SymbolTable};
use crate::core::errors::{RpcErrno, ToRpcErrno};
use crate::core::limits::{COVERAGE_CONNECTION_ENV, COVERAGE_INIT_SYMBOL, COVERAGE_PEER_ENV, DL_NAME_ENV};
use crate::core::types::Address;
use libc::{c_char, c_int, c_void};
use miette::Diagnostic;
use parking_lot::Mutex;
use std::ffi::{CStr, CString};
use std::sync::OnceLock;
use thiserror::Error;
use tracing::{debug, error, info, warn};

pub type ResolveResult<T> = Result<T, ResolveError>;

#[derive(Error, Debug, Clone, PartialEq, Eq, Diagnostic)]
pub enum ResolveError {
    #[error("Cannot resolve symbol {0}")]
    #[diagnostic(
        code(resolve::not_found),
        help("Neither the selected image nor the static symbol table exports this name.")
    )]
    NotFound(String),

    #[error("Library {current:?} is already installed, cannot switch to {requested:?}")]
    #[diagnostic(
        code(resolve::already_set),
        help("The library under test can be set once per agent lifetime.")
    )]
    AlreadySet { current: String, requested: String },

    #[error("Cannot load library {name:?}: {reason}")]
    #[diagnostic(code(resolve::load_failed))]
    LoadFailed { name: String, reason: String },

    #[error("Cannot export {0} into the environment")]
    #[diagnostic(code(resolve::no_space))]
    NoSpace(String),

    #[error("Invalid symbol or library name {0:?}")]
    #[diagnostic(code(resolve::invalid_name))]
    InvalidName(String),
}

impl ToRpcErrno for ResolveError {
    fn rpc_errno(&self) -> RpcErrno {
        match self {
            ResolveError::NotFound(_) | ResolveError::LoadFailed { .. } => RpcErrno::NoEntry,
            ResolveError::AlreadySet { .. } => RpcErrno::Exists,
            ResolveError::NoSpace(_) => RpcErrno::NoSpace,
            ResolveError::InvalidName(_) => RpcErrno::InvalidArg,
        }
    }
}

/// Installed library under test; an empty name stands for the agent image
#[derive(Debug)]
struct InstalledLibrary {
    name: String,
    handle: Address,
}

pub struct Resolver {
    /// Cached `dlopen(NULL)`, `None` when that failed
    own_image: OnceLock<Option<Address>>,
    library: OnceLock<InstalledLibrary>,
    install_lock: Mutex<()>,
    table: &'static SymbolTable,
}

fn last_dl_error() -> String {
    // SAFETY: dlerror returns NULL or a thread-local NUL-terminated string
    let msg = unsafe { libc::dlerror() };
    if msg.is_null() {
        "unknown dynamic loader error".to_string()
    } else {
        unsafe { CStr::from_ptr(msg) }.to_string_lossy().into_owned()
    }
}

fn dlopen_self() -> Option<Address> {
    // SAFETY: dlopen(NULL) only returns a handle to the running image
    let handle = unsafe { libc::dlopen(std::ptr::null(), libc::RTLD_LAZY) };
    (!handle.is_null()).then_some(handle as Address)
}

impl Resolver {
    pub fn new(table: &'static SymbolTable) -> Self {
        Self {
            own_image: OnceLock::new(),
            library: OnceLock::new(),
            install_lock: Mutex::new(()),
            table,
        }
    }

    /// Name of the installed library, `Some("")` for the agent image
    pub fn library_name(&self) -> Option<&str> {
        self.library.get().map(|lib| lib.name.as_str())
    }

    pub fn is_library_set(&self) -> bool {
        self.library.get().is_some()
    }

    pub fn table(&self) -> &'static SymbolTable {
        self.table
    }

    /// Install the library under test
    ///
    /// Setting the same name again is a no-op. `None` and `""` select the
    /// agent image.
    pub fn set_library(&self, name: Option<&str>) -> ResolveResult<()> {
        let requested = name.unwrap_or("");
        let _guard = self.install_lock.lock();

        if let Some(current) = self.library.get() {
            if current.name == requested {
                return Ok(());
            }
            error!(current = %current.name, requested, "library under test is already set");
            return Err(ResolveError::AlreadySet {
                current: current.name.clone(),
                requested: requested.to_string(),
            });
        }

        let c_name = CString::new(requested).map_err(|_| ResolveError::InvalidName(requested.to_string()))?;
        let handle = if requested.is_empty() {
            dlopen_self().ok_or_else(|| ResolveError::LoadFailed {
                name: requested.to_string(),
                reason: last_dl_error(),
            })?
        } else {
            // SAFETY: c_name is a valid NUL-terminated path
            let handle = unsafe { libc::dlopen(c_name.as_ptr(), libc::RTLD_LAZY) };
            if handle.is_null() {
                let reason = last_dl_error();
                error!(library = requested, %reason, "cannot load library under test");
                return Err(ResolveError::LoadFailed {
                    name: requested.to_string(),
                    reason,
                });
            }
            handle as Address
        };

        let env_key = CString::new(DL_NAME_ENV).map_err(|_| ResolveError::NoSpace(DL_NAME_ENV.into()))?;
        // SAFETY: both arguments are valid C strings; installation is serialized by install_lock
        if unsafe { libc::setenv(env_key.as_ptr(), c_name.as_ptr(), 1) } != 0 {
            error!(library = requested, "cannot export library name");
            if !requested.is_empty() {
                unsafe { libc::dlclose(handle as *mut c_void) };
            }
            return Err(ResolveError::NoSpace(DL_NAME_ENV.into()));
        }

        let _ = self.library.set(InstalledLibrary {
            name: requested.to_string(),
            handle,
        });
        info!(library = requested, "library under test installed");

        run_coverage_hook(handle);
        Ok(())
    }

    /// Resolve `name` to a callable address
    pub fn resolve(&self, use_libc: bool, name: &str) -> ResolveResult<Address> {
        if name == "getpid" {
            return Ok(libc::getpid as Address);
        }

        if !self.is_library_set() {
            let from_env = std::env::var(DL_NAME_ENV).ok();
            self.set_library(from_env.as_deref())?;
        }

        let handle = if use_libc {
            *self.own_image.get_or_init(dlopen_self)
        } else {
            self.library.get().map(|lib| lib.handle)
        };

        if let Some(handle) = handle {
            let c_name = CString::new(name).map_err(|_| ResolveError::InvalidName(name.to_string()))?;
            // SAFETY: handle came from dlopen and is never closed while installed
            let addr = unsafe { libc::dlsym(handle as *mut c_void, c_name.as_ptr()) };
            if !addr.is_null() {
                debug!(symbol = name, use_libc, "resolved dynamically");
                return Ok(addr as Address);
            }
        }

        self.table.lookup(name).ok_or_else(|| {
            error!(symbol = name, use_libc, "cannot resolve symbol");
            ResolveError::NotFound(name.to_string())
        })
    }
}

/// Call the coverage initializer if the library exports one and a
/// coverage connection has been configured. Failure is not fatal.
fn run_coverage_hook(handle: Address) {
    let Ok(connection) = std::env::var(COVERAGE_CONNECTION_ENV) else {
        return;
    };
    let Ok(symbol) = CString::new(COVERAGE_INIT_SYMBOL) else {
        return;
    };

    // SAFETY: handle is a live dlopen handle
    let addr = unsafe { libc::dlsym(handle as *mut c_void, symbol.as_ptr()) };
    if addr.is_null() {
        return;
    }

    let peer: c_int = std::env::var(COVERAGE_PEER_ENV)
        .ok()
        .and_then(|p| p.parse().ok())
        .unwrap_or(0);
    let Ok(connection) = CString::new(connection) else {
        warn!("coverage connection string contains NUL, hook skipped");
        return;
    };

    type CoverageInit = unsafe extern "C" fn(*const c_char, c_int);
    // SAFETY: the exported symbol follows the coverage runtime's signature
    let init: CoverageInit = unsafe { std::mem::transmute::<*mut c_void, CoverageInit>(addr) };
    unsafe { init(connection.as_ptr(), peer) };
    info!(peer, "coverage connection initialized");
}

/// Process-wide resolver shared by every server of this agent
pub fn resolver() -> &'static Resolver {
    static RESOLVER: OnceLock<Resolver> = OnceLock::new();
    RESOLVER.get_or_init(|| Resolver::new(static_table()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;

    fn fresh() -> Resolver {
        Resolver::new(Box::leak(Box::new(SymbolTable::with_agent_helpers())))
    }

    #[test]
    fn test_getpid_fast_path_needs_no_library() {
        let resolver = fresh();
        assert_eq!(resolver.resolve(false, "getpid"), Ok(libc::getpid as Address));
        assert!(!resolver.is_library_set());
    }

    #[test]
    #[serial]
    fn test_self_image_and_idempotent_set() {
        let resolver = fresh();
        resolver.set_library(Some("")).unwrap();
        resolver.set_library(None).unwrap();
        assert_eq!(resolver.library_name(), Some(""));

        let err = resolver.set_library(Some("libother.so")).unwrap_err();
        assert_eq!(err.rpc_errno(), RpcErrno::Exists);
    }

    #[test]
    #[serial]
    fn test_libc_and_table_fallback() {
        let resolver = fresh();
        resolver.set_library(None).unwrap();

        assert!(resolver.resolve(true, "write").is_ok());
        assert!(resolver.resolve(false, "ta_kill_death").is_ok());

        let err = resolver.resolve(true, "definitely_not_a_symbol_xyz").unwrap_err();
        assert_eq!(err.rpc_errno(), RpcErrno::NoEntry);
    }

    #[test]
    #[serial]
    fn test_load_failure_is_no_entry() {
        let resolver = fresh();
        let err = resolver.set_library(Some("/nonexistent/libnothing.so")).unwrap_err();
        assert!(matches!(err, ResolveError::LoadFailed { .. }));
        assert_eq!(err.rpc_errno(), RpcErrno::NoEntry);
        assert!(!resolver.is_library_set());
    }
}
