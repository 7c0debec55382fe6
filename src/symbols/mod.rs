/*!
 * Symbols
 * Name resolution for invoked primitives and agent helpers
 */

pub mod primitives;
mod resolver;
mod table;

pub use primitives::{flag_setter, FcntlFn, Primitives};
pub use resolver::{resolver, ResolveError, ResolveResult, Resolver};
pub use table::{static_table, SymbolTable};
