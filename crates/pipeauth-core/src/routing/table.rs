//! Insertion-ordered routing table.

use super::{Instruction, RoutingError};
use crate::query::Query;
use crate::types::Destination;

/// Ordered list of instructions; the first target wins.
#[derive(Debug, Clone, Default)]
pub struct RoutingTable {
    instructions: Vec<Instruction>,
}

impl RoutingTable {
    /// Create an empty table.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Append an instruction.
    ///
    /// # Errors
    ///
    /// Returns `RoutingError::DuplicateInstruction` if the name is taken.
    pub fn push(&mut self, instruction: Instruction) -> Result<(), RoutingError> {
        if self.find(&instruction.name).is_some() {
            return Err(RoutingError::DuplicateInstruction(instruction.name));
        }
        if let Some(catch_all) = self.instructions.iter().find(|i| i.is_catch_all()) {
            tracing::warn!(
                instruction = %instruction.name,
                shadowed_by = %catch_all.name,
                "instruction placed after a catch-all is unreachable"
            );
        }
        self.instructions.push(instruction);
        Ok(())
    }

    /// Remove an instruction by name.
    pub fn remove(&mut self, name: &str) -> Option<Instruction> {
        let index = self.instructions.iter().position(|i| i.name == name)?;
        Some(self.instructions.remove(index))
    }

    /// The first instruction targeting `query`.
    #[must_use]
    pub fn match_query(&self, query: &Query) -> Option<&Instruction> {
        self.instructions.iter().find(|i| i.is_target(query))
    }

    /// Instruction by name.
    #[must_use]
    pub fn find(&self, name: &str) -> Option<&Instruction> {
        self.instructions.iter().find(|i| i.name == name)
    }

    /// The first instruction addressing `destination`; its encryption and
    /// logon policy apply to traffic on that line.
    #[must_use]
    pub fn for_destination(&self, destination: &Destination) -> Option<&Instruction> {
        self.instructions
            .iter()
            .find(|i| &i.destination == destination)
    }

    /// Instructions in table order.
    pub fn iter(&self) -> impl Iterator<Item = &Instruction> {
        self.instructions.iter()
    }

    /// Number of instructions.
    #[must_use]
    pub fn len(&self) -> usize {
        self.instructions.len()
    }

    /// Whether the table is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.instructions.is_empty()
    }
}
