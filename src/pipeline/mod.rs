pub mod batch;
pub mod classifier;
mod coordinator;
mod processor;
pub mod retry;

pub use coordinator::{CoordinatorRun, CoordinatorSettings, SourceCoordinator, SourceReport};
pub use processor::GrantPipeline;
