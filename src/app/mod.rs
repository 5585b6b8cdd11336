//! App module - operator commands
//!
//! Parsing of operator input and the router that applies commands to a
//! debugging session.

mod commands;
mod router;

pub use commands::*;
pub use router::*;
