//! Instruction to model lookup.
//!
//! The table is a plain value built from defaults plus config overrides and
//! handed to the executor at construction.

use crate::types::{Instruction, ModelSet};
use std::collections::BTreeMap;
use thiserror::Error;

/// Model used for instructions missing from the table.
pub const FALLBACK_MODEL: &str = "sonnet";

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("invalid model override {0:?}: expected <base-model>,<heavy-model>")]
pub struct ModelOverrideError(pub String);

/// Models for one instruction, per model set.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModelChoice {
    pub base: String,
    pub heavy: String,
}

impl ModelChoice {
    pub fn new(base: impl Into<String>, heavy: impl Into<String>) -> Self {
        Self {
            base: base.into(),
            heavy: heavy.into(),
        }
    }

    pub fn for_set(&self, set: ModelSet) -> &str {
        match set {
            ModelSet::Base => &self.base,
            ModelSet::Heavy => &self.heavy,
        }
    }

    /// Parse `sonnet,opus`. A single name applies to both sets.
    pub fn parse(value: &str) -> Result<Self, ModelOverrideError> {
        let parts: Vec<&str> = value.split(',').map(str::trim).collect();
        match parts.as_slice() {
            [one] if !one.is_empty() => Ok(Self::new(*one, *one)),
            [base, heavy] if !base.is_empty() && !heavy.is_empty() => Ok(Self::new(*base, *heavy)),
            _ => Err(ModelOverrideError(value.to_string())),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModelTable {
    entries: BTreeMap<Instruction, ModelChoice>,
}

impl Default for ModelTable {
    fn default() -> Self {
        use Instruction as I;

        let heavy_on_demand = ModelChoice::new("sonnet", "opus");
        let always_base = ModelChoice::new("sonnet", "sonnet");
        let entries = [
            (I::ClassifyIssue, always_base.clone()),
            (I::Feature, heavy_on_demand.clone()),
            (I::Bug, heavy_on_demand.clone()),
            (I::Chore, heavy_on_demand.clone()),
            (I::Implement, heavy_on_demand.clone()),
            (I::Test, always_base.clone()),
            (I::ResolveFailedTest, heavy_on_demand.clone()),
            (I::TestE2e, always_base.clone()),
            (I::ResolveFailedE2eTest, heavy_on_demand.clone()),
            (I::Review, always_base.clone()),
            (I::Patch, heavy_on_demand.clone()),
            (I::Document, heavy_on_demand),
            (I::Commit, always_base),
        ]
        .into_iter()
        .collect();
        Self { entries }
    }
}

impl ModelTable {
    pub fn empty() -> Self {
        Self {
            entries: BTreeMap::new(),
        }
    }

    pub fn set(&mut self, instruction: Instruction, choice: ModelChoice) {
        self.entries.insert(instruction, choice);
    }

    pub fn get(&self, instruction: Instruction) -> Option<&ModelChoice> {
        self.entries.get(&instruction)
    }

    /// Model name for an instruction under a model set.
    pub fn resolve(&self, instruction: Instruction, set: ModelSet) -> &str {
        self.entries
            .get(&instruction)
            .map_or(FALLBACK_MODEL, |choice| choice.for_set(set))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn heavy_set_upgrades_implementation_work() {
        let table = ModelTable::default();
        assert_eq!(table.resolve(Instruction::Implement, ModelSet::Base), "sonnet");
        assert_eq!(table.resolve(Instruction::Implement, ModelSet::Heavy), "opus");
        assert_eq!(table.resolve(Instruction::Commit, ModelSet::Heavy), "sonnet");
    }

    #[test]
    fn every_instruction_has_an_entry() {
        let table = ModelTable::default();
        for instruction in Instruction::ALL {
            assert!(table.get(instruction).is_some(), "{instruction}");
        }
    }

    #[test]
    fn missing_entries_use_fallback() {
        let table = ModelTable::empty();
        assert_eq!(table.resolve(Instruction::Review, ModelSet::Heavy), FALLBACK_MODEL);
    }

    #[test]
    fn override_parsing() {
        assert_eq!(ModelChoice::parse("haiku").unwrap(), ModelChoice::new("haiku", "haiku"));
        assert_eq!(
            ModelChoice::parse(" sonnet , opus ").unwrap(),
            ModelChoice::new("sonnet", "opus")
        );
        assert!(ModelChoice::parse("a,b,c").is_err());
        assert!(ModelChoice::parse(",opus").is_err());
    }
}
