pub mod assembler;
pub mod collector;
pub mod config;
pub mod delay_manager;
pub mod directory;
pub mod distributor;
pub mod error;
pub mod extractor;
pub mod gate;
pub mod input_loader;
pub mod job_manager;
pub mod logger;
pub mod operator;
pub mod resume_manager;
pub mod scraper;
pub mod selector;
pub mod types;

// Exporting types for convenience
pub use collector::{EmployerOutcome, ReviewCollector};
pub use config::HarvestConfig;
pub use distributor::{partition, PartitionAssignment};
pub use error::{HarvestError, Result};
pub use gate::{GateOutcome, InteractionGate};
pub use job_manager::{JobManager, Worker, WorkerSummary};
pub use resume_manager::CheckpointStore;
pub use scraper::{RawPage, ReviewFetcher};
pub use selector::{select_targets, TargetSet};
pub use types::{Checkpoint, CollectionState, Employer, ReviewRecord, Signal, Target};
