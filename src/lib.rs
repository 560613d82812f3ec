//! Archive of vessel tracking packets.
//!
//! Packets are written denormalized into several partition families (time
//! block, vessel, grid cell) so that queries by time, by vessel and by area
//! each read a small set of partitions. The [`pipeline`] batches writes and
//! spills to local files while the store is unreachable; the [`query`] engine
//! fans a query out over its partitions and merges the results by
//! timestamp.

pub mod config;
pub mod encoding;
pub mod error;
pub mod packet;
pub mod partition;
pub mod pipeline;
pub mod query;
pub mod spill;
pub mod store;
pub mod tracker;

pub use config::Config;
pub use error::{Error, Result};
pub use packet::{PacketRecord, Position, VesselId};
pub use partition::{Area, PartitionKey, PartitionScheme, SortKey};
pub use pipeline::{IngestionPipeline, PipelineState};
pub use query::{QueryBuilder, QueryEngine, QueryHandle, QueryState};
pub use store::{MemStore, Store};
pub use tracker::PositionTracker;
