pub mod entities;
pub mod seaorm;
pub mod store;

pub use seaorm::SeaOrmStore;
pub use store::{
    MetricUsagePatch, NewCompaction, NewMemory, NewMetric, NewRoutingDecision, NewSession, Store,
    StoreError, StoreResult,
};
