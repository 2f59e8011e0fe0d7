//! Background work: indexing, bulk jobs and recovery sweeps

mod backoff;
mod batch;
mod indexer;
mod jobs;
mod reconcile;

pub use backoff::RetryPolicy;
pub use batch::{BatchOrchestrator, WorkItem};
pub use indexer::{IndexOutcome, IndexerWorker};
pub use jobs::JobRegistry;
pub use reconcile::{spawn_reaper, ReconciliationSweep};
