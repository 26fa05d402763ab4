//! Routing: which queries go where, and under what policy.
//!
//! An [`Instruction`] names a destination, an encryption flag, optional
//! logon capabilities and a list of [`Pattern`]s. Patterns are OR'd;
//! clauses within a pattern are AND'd. A [`RoutingTable`] evaluates its
//! instructions in insertion order and the first target wins.

mod instruction;
mod pattern;
mod table;

use thiserror::Error;

pub use instruction::{FullLogon, GuestToken, Instruction, LogonPolicy};
pub use pattern::{Clause, Pattern};
pub use table::RoutingTable;

/// Routing errors.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RoutingError {
    /// Pattern text could not be parsed.
    #[error("Invalid pattern '{pattern}': {reason}")]
    InvalidPattern {
        /// Offending pattern text.
        pattern: String,
        /// What is wrong with it.
        reason: String,
    },

    /// An instruction with this name already exists.
    #[error("Duplicate instruction: {0}")]
    DuplicateInstruction(String),
}
