//! Partitioning of graphs into Ethos-U accelerator regions.
//!
//! [`partition`] wraps every maximal run of supported operators in a
//! boundary-marker pair, [`check_boundaries`] verifies the resulting
//! invariant, and [`EthosUSupport`] is the capability table both consult.

mod partition;
mod support;
mod validate;

pub use partition::partition;
pub use support::{EthosUSupport, OperatorSupport, SupportDecision};
pub use validate::{PartitionError, check_boundaries};
