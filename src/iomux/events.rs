/*!
 * Event Flags
 *
 * One event model for every multiplexer flavor, expressed in POLL* bits.
 *
 * Select folds conditions the way the kernel does: a readable descriptor
 * also reports hangup and error, a writable one also reports error. This
 * asymmetry is kept on purpose so that select and poll on the same
 * descriptor agree with what the kernel would say.
 */

use serde::{Deserialize, Serialize};
use std::fmt;
use std::ops::{BitAnd, BitOr, BitOrAssign, Not};

/// Requested or observed readiness, in POLL* bits
#[derive(Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub struct IoEvents(u16);

impl IoEvents {
    pub const NONE: IoEvents = IoEvents(0);
    pub const IN: IoEvents = IoEvents(libc::POLLIN as u16);
    pub const PRI: IoEvents = IoEvents(libc::POLLPRI as u16);
    pub const OUT: IoEvents = IoEvents(libc::POLLOUT as u16);
    pub const ERR: IoEvents = IoEvents(libc::POLLERR as u16);
    pub const HUP: IoEvents = IoEvents(libc::POLLHUP as u16);
    pub const NVAL: IoEvents = IoEvents(libc::POLLNVAL as u16);
    pub const RDNORM: IoEvents = IoEvents(libc::POLLRDNORM as u16);
    pub const RDBAND: IoEvents = IoEvents(libc::POLLRDBAND as u16);
    pub const WRNORM: IoEvents = IoEvents(libc::POLLWRNORM as u16);
    pub const WRBAND: IoEvents = IoEvents(libc::POLLWRBAND as u16);

    /// Conditions reported through select's read set
    pub const SELECT_READ: IoEvents =
        IoEvents(Self::RDNORM.0 | Self::RDBAND.0 | Self::IN.0 | Self::HUP.0 | Self::ERR.0);
    /// Conditions reported through select's write set
    pub const SELECT_WRITE: IoEvents = IoEvents(Self::WRBAND.0 | Self::WRNORM.0 | Self::OUT.0 | Self::ERR.0);
    /// Conditions reported through select's exception set
    pub const SELECT_EXCEPT: IoEvents = Self::PRI;

    const ALL: u16 = Self::IN.0
        | Self::PRI.0
        | Self::OUT.0
        | Self::ERR.0
        | Self::HUP.0
        | Self::NVAL.0
        | Self::RDNORM.0
        | Self::RDBAND.0
        | Self::WRNORM.0
        | Self::WRBAND.0;

    const NAMES: [(IoEvents, &'static str); 10] = [
        (Self::IN, "IN"),
        (Self::PRI, "PRI"),
        (Self::OUT, "OUT"),
        (Self::ERR, "ERR"),
        (Self::HUP, "HUP"),
        (Self::NVAL, "NVAL"),
        (Self::RDNORM, "RDNORM"),
        (Self::RDBAND, "RDBAND"),
        (Self::WRNORM, "WRNORM"),
        (Self::WRBAND, "WRBAND"),
    ];

    #[inline]
    pub const fn bits(self) -> u16 {
        self.0
    }

    #[inline]
    pub const fn from_bits_truncate(bits: u16) -> Self {
        IoEvents(bits & Self::ALL)
    }

    /// Build from a `pollfd.events` / `revents` value
    #[inline]
    pub const fn from_poll(bits: libc::c_short) -> Self {
        Self::from_bits_truncate(bits as u16)
    }

    #[inline]
    pub const fn to_poll(self) -> libc::c_short {
        self.0 as libc::c_short
    }

    #[inline]
    pub const fn is_empty(self) -> bool {
        self.0 == 0
    }

    #[inline]
    pub const fn contains(self, other: IoEvents) -> bool {
        self.0 & other.0 == other.0
    }

    #[inline]
    pub const fn intersects(self, other: IoEvents) -> bool {
        self.0 & other.0 != 0
    }

    #[inline]
    pub fn insert(&mut self, other: IoEvents) {
        self.0 |= other.0;
    }

    #[inline]
    pub fn remove(&mut self, other: IoEvents) {
        self.0 &= !other.0;
    }

    #[inline]
    pub const fn is_readable(self) -> bool {
        self.intersects(IoEvents(Self::IN.0 | Self::RDNORM.0 | Self::RDBAND.0))
    }

    #[inline]
    pub const fn is_writable(self) -> bool {
        self.intersects(IoEvents(Self::OUT.0 | Self::WRNORM.0 | Self::WRBAND.0))
    }

    #[inline]
    pub const fn is_hangup(self) -> bool {
        self.intersects(Self::HUP)
    }

    #[inline]
    pub const fn is_error(self) -> bool {
        self.intersects(IoEvents(Self::ERR.0 | Self::NVAL.0))
    }

    // ------------------------------------------------------------------
    // epoll
    // ------------------------------------------------------------------

    const EPOLL_MAP: [(IoEvents, libc::c_int); 9] = [
        (Self::IN, libc::EPOLLIN),
        (Self::PRI, libc::EPOLLPRI),
        (Self::OUT, libc::EPOLLOUT),
        (Self::ERR, libc::EPOLLERR),
        (Self::HUP, libc::EPOLLHUP),
        (Self::RDNORM, libc::EPOLLRDNORM),
        (Self::RDBAND, libc::EPOLLRDBAND),
        (Self::WRNORM, libc::EPOLLWRNORM),
        (Self::WRBAND, libc::EPOLLWRBAND),
    ];

    pub fn to_epoll(self) -> u32 {
        Self::EPOLL_MAP
            .iter()
            .filter(|(ev, _)| self.contains(*ev))
            .fold(0u32, |acc, (_, bit)| acc | *bit as u32)
    }

    pub fn from_epoll(bits: u32) -> Self {
        Self::EPOLL_MAP
            .iter()
            .filter(|(_, bit)| bits & *bit as u32 != 0)
            .fold(Self::NONE, |acc, (ev, _)| acc | *ev)
    }

    // ------------------------------------------------------------------
    // select
    // ------------------------------------------------------------------

    /// Which select sets a request lands in: `(read, write, except)`
    ///
    /// ERR is part of both the read and write sets. Requested alone it
    /// selects for reading; otherwise it does not add a set by itself.
    pub fn to_select_sets(self) -> (bool, bool, bool) {
        let mut events = self;
        if events.intersects(Self::ERR) {
            let others = IoEvents((Self::SELECT_READ.0 | Self::SELECT_WRITE.0) & !Self::ERR.0);
            if !events.intersects(others) {
                events.insert(Self::IN);
            }
            events.remove(Self::ERR);
        }
        (
            events.intersects(Self::SELECT_READ),
            events.intersects(Self::SELECT_WRITE),
            events.intersects(Self::SELECT_EXCEPT),
        )
    }

    /// Observed events for a descriptor found in the given select sets
    pub fn from_select_sets(read: bool, write: bool, except: bool) -> Self {
        let mut events = Self::NONE;
        if read {
            events.insert(Self::SELECT_READ);
        }
        if write {
            events.insert(Self::SELECT_WRITE);
        }
        if except {
            events.insert(Self::SELECT_EXCEPT);
        }
        events
    }
}

impl BitOr for IoEvents {
    type Output = IoEvents;
    #[inline]
    fn bitor(self, rhs: IoEvents) -> IoEvents {
        IoEvents(self.0 | rhs.0)
    }
}

impl BitOrAssign for IoEvents {
    #[inline]
    fn bitor_assign(&mut self, rhs: IoEvents) {
        self.0 |= rhs.0;
    }
}

impl BitAnd for IoEvents {
    type Output = IoEvents;
    #[inline]
    fn bitand(self, rhs: IoEvents) -> IoEvents {
        IoEvents(self.0 & rhs.0)
    }
}

impl Not for IoEvents {
    type Output = IoEvents;
    #[inline]
    fn not(self) -> IoEvents {
        IoEvents(!self.0 & Self::ALL)
    }
}

impl fmt::Debug for IoEvents {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(self, f)
    }
}

impl fmt::Display for IoEvents {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_empty() {
            return f.write_str("0");
        }
        let mut first = true;
        for (ev, name) in Self::NAMES {
            if self.contains(ev) {
                if !first {
                    f.write_str("|")?;
                }
                f.write_str(name)?;
                first = false;
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_select_read_folds_hangup_and_error() {
        let ev = IoEvents::from_select_sets(true, false, false);
        assert!(ev.is_readable());
        assert!(ev.is_hangup());
        assert!(ev.is_error());
        assert!(!ev.is_writable());
    }

    #[test]
    fn test_select_write_folds_error_only() {
        let ev = IoEvents::from_select_sets(false, true, false);
        assert!(ev.is_writable());
        assert!(ev.is_error());
        assert!(!ev.is_hangup());
    }

    #[test]
    fn test_err_alone_selects_read() {
        assert_eq!(IoEvents::ERR.to_select_sets(), (true, false, false));
        assert_eq!((IoEvents::ERR | IoEvents::OUT).to_select_sets(), (false, true, false));
        assert_eq!(IoEvents::PRI.to_select_sets(), (false, false, true));
        assert_eq!((IoEvents::IN | IoEvents::OUT).to_select_sets(), (true, true, false));
    }

    #[test]
    fn test_display() {
        assert_eq!((IoEvents::IN | IoEvents::HUP).to_string(), "IN|HUP");
        assert_eq!(IoEvents::NONE.to_string(), "0");
    }

    proptest! {
        #[test]
        fn prop_epoll_round_trip(bits in 0u16..0x400) {
            let ev = IoEvents::from_bits_truncate(bits) & !IoEvents::NVAL;
            prop_assert_eq!(IoEvents::from_epoll(ev.to_epoll()), ev);
        }

        #[test]
        fn prop_select_round_trip_on_folded_sets(r: bool, w: bool, e: bool) {
            let ev = IoEvents::from_select_sets(r, w, e);
            prop_assert_eq!(ev.to_select_sets(), (r, w, e));
        }
    }
}
