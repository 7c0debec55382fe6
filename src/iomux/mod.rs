/*!
 * I/O Multiplexer
 *
 * Uniform add / modify / wait / iterate / close over select, pselect,
 * poll, ppoll, epoll_wait and epoll_pwait.
 */

mod events;
mod mux;

pub use events::IoEvents;
pub use mux::{Cursor, Iomux, IomuxReturn};

use crate::core::errors::{RpcErrno, ToRpcErrno};
use crate::core::types::Fd;
use miette::Diagnostic;
use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

/// Underlying readiness primitive
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Flavor {
    Select,
    Pselect,
    Poll,
    Ppoll,
    Epoll,
    EpollPwait,
}

impl Flavor {
    pub const ALL: [Flavor; 6] = [
        Flavor::Select,
        Flavor::Pselect,
        Flavor::Poll,
        Flavor::Ppoll,
        Flavor::Epoll,
        Flavor::EpollPwait,
    ];

    pub const fn as_str(&self) -> &'static str {
        match self {
            Flavor::Select => "select",
            Flavor::Pselect => "pselect",
            Flavor::Poll => "poll",
            Flavor::Ppoll => "ppoll",
            Flavor::Epoll => "epoll",
            Flavor::EpollPwait => "epoll_pwait",
        }
    }

    #[inline]
    pub const fn is_select(&self) -> bool {
        matches!(self, Flavor::Select | Flavor::Pselect)
    }

    #[inline]
    pub const fn is_poll(&self) -> bool {
        matches!(self, Flavor::Poll | Flavor::Ppoll)
    }

    #[inline]
    pub const fn is_epoll(&self) -> bool {
        matches!(self, Flavor::Epoll | Flavor::EpollPwait)
    }
}

impl fmt::Display for Flavor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Error, Debug, Clone, PartialEq, Eq, Diagnostic)]
pub enum IomuxError {
    #[error("Cannot add fd {fd} to {flavor}: limit of {limit} descriptors reached")]
    #[diagnostic(code(iomux::full))]
    Full { fd: Fd, flavor: Flavor, limit: usize },

    #[error("Fd {0} is not registered")]
    #[diagnostic(code(iomux::not_found))]
    NotFound(Fd),

    #[error("Fd {0} is already registered")]
    #[diagnostic(code(iomux::already_added), help("Use modify to change the events of a registered fd."))]
    AlreadyAdded(Fd),

    #[error("Fd {0} cannot be used with select")]
    #[diagnostic(code(iomux::fd_out_of_range))]
    FdOutOfRange(Fd),

    #[error("{flavor} reported unexpected fd {fd}")]
    #[diagnostic(code(iomux::unexpected_event))]
    UnexpectedEvent { fd: Fd, flavor: Flavor },
}

impl ToRpcErrno for IomuxError {
    fn rpc_errno(&self) -> RpcErrno {
        match self {
            IomuxError::Full { .. } => RpcErrno::NoSpace,
            IomuxError::NotFound(_) => RpcErrno::NoEntry,
            IomuxError::AlreadyAdded(_) => RpcErrno::Exists,
            IomuxError::FdOutOfRange(_) => RpcErrno::InvalidArg,
            IomuxError::UnexpectedEvent { .. } => RpcErrno::Unknown,
        }
    }
}
