/*!
 * Multiplexer State
 *
 * One state per wait loop, owned by the RPC that created it. The epoll
 * descriptor is closed when the state is dropped; descriptors registered
 * with epoll must be removed by the caller before they are closed.
 */

use super::{Flavor, IoEvents, IomuxError};
use crate::core::errors::{AgentError, Result, RpcErrno};
use crate::core::limits::IOMUX_MAX_POLLED_FDS;
use crate::core::types::Fd;
use crate::symbols::Primitives;
use libc::{c_int, epoll_event, fd_set, pollfd, sigset_t, timespec, timeval};
use std::mem::MaybeUninit;
use tracing::{debug, error, trace};

fn empty_fd_set() -> fd_set {
    let mut set = MaybeUninit::<fd_set>::uninit();
    // SAFETY: FD_ZERO initializes every bit of the set
    unsafe {
        libc::FD_ZERO(set.as_mut_ptr());
        set.assume_init()
    }
}

fn timeval_from_ms(ms: i32) -> Option<timeval> {
    (ms >= 0).then(|| timeval {
        tv_sec: (ms / 1000) as libc::time_t,
        tv_usec: ((ms % 1000) * 1000) as libc::suseconds_t,
    })
}

fn timespec_from_ms(ms: i32) -> Option<timespec> {
    (ms >= 0).then(|| timespec {
        tv_sec: (ms / 1000) as libc::time_t,
        tv_nsec: ((ms % 1000) as libc::c_long) * 1_000_000,
    })
}

struct SelectState {
    read: fd_set,
    write: fd_set,
    except: fd_set,
    max_fd: Fd,
    fds: Vec<Fd>,
}

impl SelectState {
    fn new() -> Self {
        Self {
            read: empty_fd_set(),
            write: empty_fd_set(),
            except: empty_fd_set(),
            max_fd: -1,
            fds: Vec::with_capacity(IOMUX_MAX_POLLED_FDS),
        }
    }

    fn apply(&mut self, fd: Fd, events: IoEvents) {
        let (r, w, e) = events.to_select_sets();
        for (wanted, set) in [(r, &mut self.read), (w, &mut self.write), (e, &mut self.except)] {
            // SAFETY: fd was checked against FD_SETSIZE by the caller
            unsafe {
                if wanted {
                    libc::FD_SET(fd, set);
                } else {
                    libc::FD_CLR(fd, set);
                }
            }
        }
    }
}

enum State {
    Select(SelectState),
    Poll(Vec<pollfd>),
    Epoll { epfd: Fd, fds: Vec<Fd> },
    Closed,
}

/// Result of one wait, parallel to the state that produced it
pub enum IomuxReturn {
    Select { read: fd_set, write: fd_set, except: fd_set },
    Poll,
    Epoll { events: Vec<epoll_event>, n: usize },
}

/// Position inside an [`IomuxReturn`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Cursor(usize);

impl Cursor {
    pub const START: Cursor = Cursor(0);
}

/// Uniform readiness wait over any [`Flavor`]
pub struct Iomux<'p> {
    prims: &'p Primitives,
    flavor: Flavor,
    state: State,
    sigmask: Option<sigset_t>,
}

impl<'p> Iomux<'p> {
    pub fn create(prims: &'p Primitives, flavor: Flavor) -> Result<Self> {
        let state = if flavor.is_select() {
            State::Select(SelectState::new())
        } else if flavor.is_poll() {
            State::Poll(Vec::with_capacity(IOMUX_MAX_POLLED_FDS))
        } else {
            let epfd = prims.epoll_create(IOMUX_MAX_POLLED_FDS as c_int)?;
            debug!(epfd, "epoll instance created");
            State::Epoll {
                epfd,
                fds: Vec::with_capacity(IOMUX_MAX_POLLED_FDS),
            }
        };
        Ok(Self {
            prims,
            flavor,
            state,
            sigmask: None,
        })
    }

    #[inline]
    pub fn flavor(&self) -> Flavor {
        self.flavor
    }

    /// Mask swapped in for the duration of pselect, ppoll and epoll_pwait
    pub fn set_sigmask(&mut self, mask: Option<sigset_t>) {
        self.sigmask = mask;
    }

    /// Number of registered descriptors
    pub fn len(&self) -> usize {
        match &self.state {
            State::Select(s) => s.fds.len(),
            State::Poll(p) => p.len(),
            State::Epoll { fds, .. } => fds.len(),
            State::Closed => 0,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn full(&self, fd: Fd) -> AgentError {
        IomuxError::Full {
            fd,
            flavor: self.flavor,
            limit: IOMUX_MAX_POLLED_FDS,
        }
        .into()
    }

    pub fn add(&mut self, fd: Fd, events: IoEvents) -> Result<()> {
        trace!(fd, %events, flavor = %self.flavor, "iomux add");
        match &mut self.state {
            State::Select(s) => {
                if fd < 0 || fd as usize >= libc::FD_SETSIZE {
                    return Err(IomuxError::FdOutOfRange(fd).into());
                }
                if !s.fds.contains(&fd) {
                    if s.fds.len() >= IOMUX_MAX_POLLED_FDS {
                        return Err(self.full(fd));
                    }
                    s.fds.push(fd);
                }
                s.apply(fd, events);
                s.max_fd = s.max_fd.max(fd);
            }
            State::Poll(p) => {
                if p.iter().any(|pfd| pfd.fd == fd) {
                    return Err(IomuxError::AlreadyAdded(fd).into());
                }
                if p.len() >= IOMUX_MAX_POLLED_FDS {
                    return Err(self.full(fd));
                }
                p.push(pollfd {
                    fd,
                    events: events.to_poll(),
                    revents: 0,
                });
            }
            State::Epoll { epfd, fds } => {
                if fds.len() >= IOMUX_MAX_POLLED_FDS {
                    return Err(self.full(fd));
                }
                let mut ev = epoll_event {
                    events: events.to_epoll(),
                    u64: fd as u64,
                };
                self.prims.epoll_ctl(*epfd, libc::EPOLL_CTL_ADD, fd, &mut ev)?;
                fds.push(fd);
            }
            State::Closed => return Err(IomuxError::NotFound(fd).into()),
        }
        Ok(())
    }

    pub fn modify(&mut self, fd: Fd, events: IoEvents) -> Result<()> {
        trace!(fd, %events, flavor = %self.flavor, "iomux modify");
        match &mut self.state {
            State::Select(s) => {
                if !s.fds.contains(&fd) {
                    return Err(IomuxError::NotFound(fd).into());
                }
                s.apply(fd, events);
            }
            State::Poll(p) => match p.iter_mut().find(|pfd| pfd.fd == fd) {
                Some(pfd) => pfd.events = events.to_poll(),
                None => return Err(IomuxError::NotFound(fd).into()),
            },
            State::Epoll { epfd, .. } => {
                let mut ev = epoll_event {
                    events: events.to_epoll(),
                    u64: fd as u64,
                };
                self.prims.epoll_ctl(*epfd, libc::EPOLL_CTL_MOD, fd, &mut ev)?;
            }
            State::Closed => return Err(IomuxError::NotFound(fd).into()),
        }
        Ok(())
    }

    /// Stop watching `fd`; unknown descriptors are `no-entry`
    pub fn remove(&mut self, fd: Fd) -> Result<()> {
        trace!(fd, flavor = %self.flavor, "iomux remove");
        match &mut self.state {
            State::Select(s) => {
                let Some(pos) = s.fds.iter().position(|f| *f == fd) else {
                    return Err(IomuxError::NotFound(fd).into());
                };
                s.fds.remove(pos);
                s.apply(fd, IoEvents::NONE);
                s.max_fd = s.fds.iter().copied().max().unwrap_or(-1);
            }
            State::Poll(p) => {
                let Some(pos) = p.iter().position(|pfd| pfd.fd == fd) else {
                    return Err(IomuxError::NotFound(fd).into());
                };
                p.remove(pos);
            }
            State::Epoll { epfd, fds } => {
                let Some(pos) = fds.iter().position(|f| *f == fd) else {
                    return Err(IomuxError::NotFound(fd).into());
                };
                let mut ev = epoll_event { events: 0, u64: 0 };
                self.prims.epoll_ctl(*epfd, libc::EPOLL_CTL_DEL, fd, &mut ev)?;
                fds.remove(pos);
            }
            State::Closed => return Err(IomuxError::NotFound(fd).into()),
        }
        Ok(())
    }

    /// Block for at most `timeout_ms` (negative waits forever)
    ///
    /// Returns the count the underlying primitive reported. An interrupted
    /// wait surfaces as the `interrupted` error.
    pub fn wait(&mut self, timeout_ms: i32) -> Result<(usize, IomuxReturn)> {
        let prims = self.prims;
        let mask = self.sigmask.as_ref();
        match &mut self.state {
            State::Select(s) => {
                let mut read = s.read;
                let mut write = s.write;
                let mut except = s.except;
                let nfds = s.max_fd + 1;
                let rc = if self.flavor == Flavor::Select {
                    let mut tv = timeval_from_ms(timeout_ms);
                    prims.select(nfds, &mut read, &mut write, &mut except, tv.as_mut())?
                } else {
                    let ts = timespec_from_ms(timeout_ms);
                    prims.pselect(nfds, &mut read, &mut write, &mut except, ts.as_ref(), mask)?
                };
                Ok((rc as usize, IomuxReturn::Select { read, write, except }))
            }
            State::Poll(p) => {
                for pfd in p.iter_mut() {
                    pfd.revents = 0;
                }
                let rc = if self.flavor == Flavor::Poll {
                    prims.poll(p, timeout_ms)?
                } else {
                    let ts = timespec_from_ms(timeout_ms);
                    prims.ppoll(p, ts.as_ref(), mask)?
                };
                Ok((rc as usize, IomuxReturn::Poll))
            }
            State::Epoll { epfd, .. } => {
                let mut events = vec![epoll_event { events: 0, u64: 0 }; IOMUX_MAX_POLLED_FDS];
                let rc = if self.flavor == Flavor::Epoll {
                    prims.epoll_wait(*epfd, &mut events, timeout_ms)?
                } else {
                    prims.epoll_pwait(*epfd, &mut events, timeout_ms, mask)?
                };
                let n = rc as usize;
                Ok((n, IomuxReturn::Epoll { events, n }))
            }
            State::Closed => Err(AgentError::rpc(RpcErrno::BadFd, "multiplexer already closed")),
        }
    }

    /// Next descriptor with observed events at or after `cursor`
    ///
    /// A descriptor that is both readable and writable is reported once
    /// with both flags set.
    pub fn iterate(&self, ret: &IomuxReturn, cursor: Cursor) -> Option<(Fd, IoEvents, Cursor)> {
        let mut pos = cursor.0;
        match (&self.state, ret) {
            (State::Select(s), IomuxReturn::Select { read, write, except }) => {
                while let Some(&fd) = s.fds.get(pos) {
                    pos += 1;
                    // SAFETY: fd is inside FD_SETSIZE, checked on add
                    let (r, w, e) = unsafe {
                        (
                            libc::FD_ISSET(fd, read),
                            libc::FD_ISSET(fd, write),
                            libc::FD_ISSET(fd, except),
                        )
                    };
                    if r || w || e {
                        return Some((fd, IoEvents::from_select_sets(r, w, e), Cursor(pos)));
                    }
                }
                None
            }
            (State::Poll(p), IomuxReturn::Poll) => {
                while let Some(pfd) = p.get(pos) {
                    pos += 1;
                    if pfd.revents != 0 {
                        return Some((pfd.fd, IoEvents::from_poll(pfd.revents), Cursor(pos)));
                    }
                }
                None
            }
            (State::Epoll { .. }, IomuxReturn::Epoll { events, n }) => {
                let ev = events.get(pos).filter(|_| pos < *n)?;
                let (bits, data) = (ev.events, ev.u64);
                Some((data as Fd, IoEvents::from_epoll(bits), Cursor(pos + 1)))
            }
            _ => None,
        }
    }

    /// Every `(fd, events)` pair of one wait, in iteration order
    pub fn ready(&self, ret: &IomuxReturn) -> Vec<(Fd, IoEvents)> {
        let mut out = Vec::new();
        let mut cursor = Cursor::START;
        while let Some((fd, events, next)) = self.iterate(ret, cursor) {
            out.push((fd, events));
            cursor = next;
        }
        out
    }

    /// Whether exactly `fd_exp` was reported and it is writable
    ///
    /// `rc` is the count returned by [`Iomux::wait`]; zero means nothing
    /// became ready. Any other descriptor in the result is an error.
    pub fn fd_is_writable(&self, fd_exp: Fd, ret: &IomuxReturn, rc: usize) -> Result<bool> {
        if rc == 0 {
            return Ok(false);
        }
        let Some((fd, events, next)) = self.iterate(ret, Cursor::START) else {
            return Ok(false);
        };
        if fd != fd_exp {
            error!(flavor = %self.flavor, fd, fd_exp, "wait returned an unexpected fd");
            return Err(IomuxError::UnexpectedEvent { fd, flavor: self.flavor }.into());
        }
        if let Some((extra, _, _)) = self.iterate(ret, next) {
            error!(flavor = %self.flavor, fd = extra, "wait returned an extra event");
            return Err(IomuxError::UnexpectedEvent {
                fd: extra,
                flavor: self.flavor,
            }
            .into());
        }
        Ok(events.intersects(IoEvents::OUT))
    }

    /// Release the epoll descriptor, reporting a close failure
    pub fn close(mut self) -> Result<()> {
        self.release()
    }

    fn release(&mut self) -> Result<()> {
        match std::mem::replace(&mut self.state, State::Closed) {
            State::Epoll { epfd, .. } => self.prims.close(epfd),
            _ => Ok(()),
        }
    }
}

impl Drop for Iomux<'_> {
    fn drop(&mut self) {
        if let Err(e) = self.release() {
            error!(flavor = %self.flavor, error = %e, "failed to close multiplexer");
        }
    }
}
