//! Gate evaluation: decides whether a candidate image's scan outcome blocks
//! an update.

use dockhand_common::{GatePolicy, SeverityTally};

/// Returns true when the gate trips. For `MoreThanCurrent`, a missing
/// baseline (the running image could not be scanned) compares against an
/// empty tally, so any finding blocks.
pub fn gate_blocks(
    gate: GatePolicy,
    candidate: &SeverityTally,
    current: Option<&SeverityTally>,
) -> bool {
    match gate {
        GatePolicy::None => false,
        GatePolicy::AnyFound => !candidate.is_empty(),
        GatePolicy::MoreThanCurrent => {
            let empty = SeverityTally::default();
            candidate.worse_than(current.unwrap_or(&empty))
        }
    }
}
