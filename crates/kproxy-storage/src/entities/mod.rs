pub mod compaction_records;
pub mod masked_blobs;
pub mod memory_entries;
pub mod metrics;
pub mod routing_decisions;
pub mod sessions;

pub use compaction_records::Entity as CompactionRecords;
pub use masked_blobs::Entity as MaskedBlobs;
pub use memory_entries::Entity as MemoryEntries;
pub use metrics::Entity as Metrics;
pub use routing_decisions::Entity as RoutingDecisions;
pub use sessions::Entity as Sessions;
