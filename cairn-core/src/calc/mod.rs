//! Per-type changeset calculators: diff source against deployed changes.

pub mod incremental;
pub mod rerunnable;

use crate::change::{Change, ChangePair};
use crate::change_type::ChangeType;
use crate::command::ChangeCommand;
use crate::error::Result;

pub use incremental::IncrementalCalculator;
pub use rerunnable::RerunnableCalculator;

/// Computes the commands for all pairs of one change type.
pub trait ChangeTypeCommandCalculator {
    /// `all_source_changes` is the unfiltered source; `pairs` may be a selection of it.
    fn calculate_commands(
        &self,
        change_type: &ChangeType,
        pairs: Vec<ChangePair>,
        all_source_changes: &[Change],
        rollback: bool,
        lenient_hash: bool,
    ) -> Result<Vec<ChangeCommand>>;
}
