/*!
 * Core Module
 * Fundamental agent types, limits, error handling and scoped guards
 */

pub mod errors;
pub mod guard;
pub mod handles;
pub mod limits;
pub mod serialization;
pub mod sockaddr;
pub mod types;

// Re-export for convenience
pub use errors::*;
pub use guard::{CheckedArgError, CheckedArgs, FdGuard, FlagsGuard, Guard, GuardDrop, GuardError};
pub use handles::{HandleRegistry, IdGenerator};
pub use sockaddr::SockAddr;
pub use types::*;
