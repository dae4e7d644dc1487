//! File system selection for backup jobs.

pub mod patterns;
pub mod selector;

pub use patterns::ExcludeSet;
pub use selector::{select, split_units, EntryKind, SelectedEntry, SelectionResult, SplitUnit};
