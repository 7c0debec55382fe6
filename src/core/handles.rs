/*!
 * Handle Registry
 * Opaque 32-bit identifiers for agent-owned heap objects
 */

use super::errors::{RpcErrno, ToRpcErrno};
use super::types::{Address, HandleId, HandleKind};
use ahash::HashMap;
use miette::Diagnostic;
use parking_lot::Mutex;
use std::marker::PhantomData;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, OnceLock};
use thiserror::Error;

// ============================================================================
// ID Generator
// ============================================================================

/// Generic ID generator interface
pub trait IdGenerator<T> {
    /// Generate next ID
    fn next(&self) -> T;

    /// Get current counter value (for debugging)
    fn current(&self) -> T;
}

/// Monotonic atomic counter; IDs are never handed out twice
pub struct AtomicGenerator<T> {
    counter: Arc<AtomicU64>,
    _marker: PhantomData<T>,
}

impl<T> AtomicGenerator<T> {
    #[inline]
    pub fn new(start: u64) -> Self {
        Self {
            counter: Arc::new(AtomicU64::new(start)),
            _marker: PhantomData,
        }
    }
}

impl<T> Clone for AtomicGenerator<T> {
    fn clone(&self) -> Self {
        Self {
            counter: Arc::clone(&self.counter),
            _marker: PhantomData,
        }
    }
}

impl IdGenerator<u32> for AtomicGenerator<u32> {
    #[inline]
    fn next(&self) -> u32 {
        self.counter.fetch_add(1, Ordering::SeqCst) as u32
    }

    #[inline]
    fn current(&self) -> u32 {
        self.counter.load(Ordering::Relaxed) as u32
    }
}

impl IdGenerator<u64> for AtomicGenerator<u64> {
    #[inline]
    fn next(&self) -> u64 {
        self.counter.fetch_add(1, Ordering::SeqCst)
    }

    #[inline]
    fn current(&self) -> u64 {
        self.counter.load(Ordering::Relaxed)
    }
}

// ============================================================================
// Registry
// ============================================================================

pub type HandleResult<T> = Result<T, HandleError>;

#[derive(Error, Debug, Clone, PartialEq, Eq, Diagnostic)]
pub enum HandleError {
    #[error("Unknown handle {0}")]
    #[diagnostic(
        code(handle::unknown),
        help("The handle was never allocated or has already been freed.")
    )]
    Unknown(HandleId),

    #[error("Handle {id} names a {actual}, expected {expected}")]
    #[diagnostic(code(handle::kind_mismatch))]
    KindMismatch {
        id: HandleId,
        expected: HandleKind,
        actual: HandleKind,
    },

    #[error("Handle space exhausted")]
    #[diagnostic(code(handle::exhausted))]
    Exhausted,
}

impl ToRpcErrno for HandleError {
    fn rpc_errno(&self) -> RpcErrno {
        match self {
            HandleError::Unknown(_) | HandleError::KindMismatch { .. } => RpcErrno::InvalidArg,
            HandleError::Exhausted => RpcErrno::NoMemory,
        }
    }
}

/// Registered object
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HandleEntry {
    pub addr: Address,
    pub kind: HandleKind,
    /// Byte size for buffers, 0 when unknown
    pub size: usize,
}

struct RegistryInner {
    by_id: HashMap<HandleId, HandleEntry>,
    by_addr: HashMap<Address, HandleId>,
}

/// Maps handle IDs to `(address, kind)`
///
/// A single mutex guards both directions of the mapping. ID 0 is never
/// allocated and always resolves to the null address.
pub struct HandleRegistry {
    inner: Mutex<RegistryInner>,
    ids: AtomicGenerator<u32>,
}

impl HandleRegistry {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(RegistryInner {
                by_id: HashMap::default(),
                by_addr: HashMap::default(),
            }),
            ids: AtomicGenerator::new(1),
        }
    }

    /// Register an object; the null address maps to handle 0
    pub fn alloc(&self, addr: Address, kind: HandleKind) -> HandleResult<HandleId> {
        self.alloc_sized(addr, kind, 0)
    }

    pub fn alloc_sized(&self, addr: Address, kind: HandleKind, size: usize) -> HandleResult<HandleId> {
        if addr == 0 {
            return Ok(0);
        }

        let mut inner = self.inner.lock();
        if inner.by_id.len() >= u32::MAX as usize {
            return Err(HandleError::Exhausted);
        }
        // The 32-bit id space wraps; 0 and live ids are skipped
        let id = loop {
            let id = self.ids.next();
            if id != 0 && !inner.by_id.contains_key(&id) {
                break id;
            }
        };
        inner.by_id.insert(id, HandleEntry { addr, kind, size });
        inner.by_addr.insert(addr, id);
        tracing::trace!(id, kind = %kind, addr = addr as u64, "handle allocated");
        Ok(id)
    }

    /// Resolve a handle; ID 0 yields the null address without error
    pub fn lookup(&self, id: HandleId, kind: HandleKind) -> HandleResult<Address> {
        self.entry(id, kind).map(|entry| entry.map_or(0, |e| e.addr))
    }

    /// Full entry for a handle, `None` for ID 0
    pub fn entry(&self, id: HandleId, kind: HandleKind) -> HandleResult<Option<HandleEntry>> {
        let inner = self.inner.lock();
        Self::checked(&inner, id, kind)
    }

    /// Run `f` over the entries of `keys` with the registry locked
    ///
    /// A concurrent `free` of any of the handles waits until `f` returns,
    /// so the named objects stay alive for the whole access.
    pub fn with_entries<R>(
        &self,
        keys: &[(HandleId, HandleKind)],
        f: impl FnOnce(&[Option<HandleEntry>]) -> R,
    ) -> HandleResult<R> {
        let inner = self.inner.lock();
        let entries = keys
            .iter()
            .map(|&(id, kind)| Self::checked(&inner, id, kind))
            .collect::<HandleResult<Vec<_>>>()?;
        Ok(f(&entries))
    }

    pub fn with_entry<R>(
        &self,
        id: HandleId,
        kind: HandleKind,
        f: impl FnOnce(Option<HandleEntry>) -> R,
    ) -> HandleResult<R> {
        self.with_entries(&[(id, kind)], |entries| f(entries[0]))
    }

    fn checked(inner: &RegistryInner, id: HandleId, kind: HandleKind) -> HandleResult<Option<HandleEntry>> {
        if id == 0 {
            return Ok(None);
        }
        let entry = inner.by_id.get(&id).copied().ok_or(HandleError::Unknown(id))?;
        if entry.kind != kind {
            return Err(HandleError::KindMismatch {
                id,
                expected: kind,
                actual: entry.kind,
            });
        }
        Ok(Some(entry))
    }

    /// Forget a handle and return what it named
    pub fn free(&self, id: HandleId, kind: HandleKind) -> HandleResult<Option<HandleEntry>> {
        if id == 0 {
            return Ok(None);
        }

        let mut inner = self.inner.lock();
        match inner.by_id.get(&id) {
            None => return Err(HandleError::Unknown(id)),
            Some(entry) if entry.kind != kind => {
                return Err(HandleError::KindMismatch {
                    id,
                    expected: kind,
                    actual: entry.kind,
                })
            }
            Some(_) => {}
        }

        let entry = inner.by_id.remove(&id);
        if let Some(entry) = entry {
            if inner.by_addr.get(&entry.addr) == Some(&id) {
                inner.by_addr.remove(&entry.addr);
            }
        }
        Ok(entry)
    }

    /// Handle currently naming `addr`, or 0 if none
    pub fn id_of(&self, addr: Address) -> HandleId {
        if addr == 0 {
            return 0;
        }
        self.inner.lock().by_addr.get(&addr).copied().unwrap_or(0)
    }

    pub fn len(&self) -> usize {
        self.inner.lock().by_id.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for HandleRegistry {
    fn default() -> Self {
        Self::new()
    }
}

/// Process-wide registry shared by all RPC servers of this agent
pub fn global() -> &'static HandleRegistry {
    static REGISTRY: OnceLock<HandleRegistry> = OnceLock::new();
    REGISTRY.get_or_init(HandleRegistry::new)
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_atomic_generator() {
        let gen = AtomicGenerator::<u32>::new(100);

        assert_eq!(gen.next(), 100);
        assert_eq!(gen.next(), 101);
        assert_eq!(gen.current(), 102);
    }

    #[test]
    fn test_handle_zero_is_null() {
        let registry = HandleRegistry::new();
        assert_eq!(registry.lookup(0, HandleKind::Buffer), Ok(0));
        assert_eq!(registry.alloc(0, HandleKind::Buffer), Ok(0));
        assert_eq!(registry.id_of(0), 0);
    }

    #[test]
    fn test_alloc_lookup_free() {
        let registry = HandleRegistry::new();
        let id = registry.alloc(0x1000, HandleKind::FdSet).unwrap();

        assert_ne!(id, 0);
        assert_eq!(registry.lookup(id, HandleKind::FdSet), Ok(0x1000));
        assert_eq!(registry.id_of(0x1000), id);

        registry.free(id, HandleKind::FdSet).unwrap();
        assert_eq!(
            registry.lookup(id, HandleKind::FdSet),
            Err(HandleError::Unknown(id))
        );
        assert_eq!(registry.id_of(0x1000), 0);
    }

    #[test]
    fn test_unknown_id_is_error() {
        let registry = HandleRegistry::new();
        assert!(registry.lookup(42, HandleKind::SigSet).is_err());
        assert!(registry.free(42, HandleKind::SigSet).is_err());
    }

    #[test]
    fn test_kind_mismatch() {
        let registry = HandleRegistry::new();
        let id = registry.alloc(0x2000, HandleKind::SigSet).unwrap();

        let err = registry.lookup(id, HandleKind::FdSet).unwrap_err();
        assert!(matches!(err, HandleError::KindMismatch { .. }));
        assert_eq!(err.rpc_errno(), RpcErrno::InvalidArg);
        // Mismatched free leaves the entry alone
        assert!(registry.free(id, HandleKind::FdSet).is_err());
        assert_eq!(registry.lookup(id, HandleKind::SigSet), Ok(0x2000));
    }

    #[test]
    fn test_realloc_same_pointer_gets_fresh_id() {
        let registry = HandleRegistry::new();
        let first = registry.alloc(0x3000, HandleKind::Buffer).unwrap();
        registry.free(first, HandleKind::Buffer).unwrap();
        let second = registry.alloc(0x3000, HandleKind::Buffer).unwrap();

        assert_ne!(first, second);
        assert_eq!(registry.lookup(second, HandleKind::Buffer), Ok(0x3000));
        assert!(registry.lookup(first, HandleKind::Buffer).is_err());
    }

    #[test]
    fn test_wrapped_ids_skip_zero_and_live_handles() {
        let mut registry = HandleRegistry::new();
        let a = registry.alloc(0x5000, HandleKind::Buffer).unwrap();
        let b = registry.alloc(0x5100, HandleKind::Buffer).unwrap();
        assert_eq!((a, b), (1, 2));

        registry.ids = AtomicGenerator::new(u64::from(u32::MAX));
        assert_eq!(registry.alloc(0x5200, HandleKind::Buffer), Ok(u32::MAX));
        // 0 is reserved and 1, 2 are still live
        assert_eq!(registry.alloc(0x5300, HandleKind::Buffer), Ok(3));

        assert_eq!(registry.lookup(a, HandleKind::Buffer), Ok(0x5000));
        assert_eq!(registry.lookup(b, HandleKind::Buffer), Ok(0x5100));
    }

    #[test]
    fn test_free_waits_for_entry_access() {
        use std::sync::atomic::AtomicBool;
        use std::time::Duration;

        let registry = Arc::new(HandleRegistry::new());
        let id = registry.alloc(0x4000, HandleKind::Buffer).unwrap();
        let done = Arc::new(AtomicBool::new(false));
        let (entered_tx, entered_rx) = std::sync::mpsc::channel();

        let reader = {
            let registry = Arc::clone(&registry);
            let done = Arc::clone(&done);
            std::thread::spawn(move || {
                registry
                    .with_entry(id, HandleKind::Buffer, |entry| {
                        entered_tx.send(()).unwrap();
                        std::thread::sleep(Duration::from_millis(50));
                        done.store(true, Ordering::SeqCst);
                        entry.map(|e| e.addr)
                    })
                    .unwrap()
            })
        };

        entered_rx.recv().unwrap();
        let freed = registry.free(id, HandleKind::Buffer).unwrap();
        assert!(done.load(Ordering::SeqCst));
        assert_eq!(freed.map(|e| e.addr), Some(0x4000));
        assert_eq!(reader.join().unwrap(), Some(0x4000));
    }

    #[derive(Debug, Clone)]
    enum Op {
        Alloc(Address),
        Free(usize),
        Lookup(usize),
    }

    fn op() -> impl Strategy<Value = Op> {
        prop_oneof![
            (1usize..1 << 20).prop_map(Op::Alloc),
            any::<usize>().prop_map(Op::Free),
            any::<usize>().prop_map(Op::Lookup),
        ]
    }

    proptest! {
        #[test]
        fn prop_alloc_lookup_free_sequence(ops in proptest::collection::vec(op(), 1..64)) {
            let registry = HandleRegistry::new();
            let mut live: Vec<(HandleId, Address)> = Vec::new();
            let mut freed: Vec<HandleId> = Vec::new();

            for op in ops {
                match op {
                    Op::Alloc(addr) => {
                        let id = registry.alloc(addr, HandleKind::Buffer).unwrap();
                        prop_assert_ne!(id, 0);
                        prop_assert!(live.iter().all(|(other, _)| *other != id));
                        prop_assert!(!freed.contains(&id));
                        live.push((id, addr));
                    }
                    Op::Free(pick) if !live.is_empty() => {
                        let (id, addr) = live.remove(pick % live.len());
                        let entry = registry.free(id, HandleKind::Buffer).unwrap();
                        prop_assert_eq!(entry.map(|e| e.addr), Some(addr));
                        freed.push(id);
                    }
                    Op::Lookup(pick) if !live.is_empty() => {
                        let (id, addr) = live[pick % live.len()];
                        prop_assert_eq!(registry.lookup(id, HandleKind::Buffer).unwrap(), addr);
                    }
                    _ => {}
                }
            }

            prop_assert_eq!(registry.len(), live.len());
            for id in freed {
                prop_assert_eq!(registry.lookup(id, HandleKind::Buffer), Err(HandleError::Unknown(id)));
            }
        }

        #[test]
        fn prop_lookup_returns_registered_address(addrs in proptest::collection::vec(1usize..usize::MAX, 1..32)) {
            let registry = HandleRegistry::new();
            let ids: Vec<_> = addrs
                .iter()
                .map(|&a| registry.alloc(a, HandleKind::Buffer).unwrap())
                .collect();
            for (id, addr) in ids.iter().zip(&addrs) {
                prop_assert_eq!(registry.lookup(*id, HandleKind::Buffer).unwrap(), *addr);
            }
        }
    }
}
