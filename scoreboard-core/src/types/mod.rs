//! Core types for the scoreboard.
//!
//! - `PartitionTimestamp`: identifies a partition (its truncated time boundary)
//! - `Txn`: commit sequence number identifying one version of a partition
//! - `PartitionBy`: partitioning policy of the owning table

mod ids;
mod partition_by;

pub use ids::{PartitionTimestamp, Txn};
pub use partition_by::PartitionBy;
