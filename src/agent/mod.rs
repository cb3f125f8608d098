//! Agent coordination engine.
//!
//! A research run is a tree of workers sharing one loop:
//!
//! ```text
//! ResearchRunner
//!   └── coordinator (plans, searches, delegates)
//!         ├── link-follower × N   (inferClaimsFromResources)
//!         └── sub-coordinator × N (startResearchTasks)
//!               └── link-follower × N
//! ```
//!
//! Link-followers read pages through the extraction agents; every worker
//! merges what its children found and runs the dedup agent over it. Stop
//! requests flow down the tree and each parent waits for its children's
//! outcomes before finishing.

pub mod config;
pub mod context;
pub mod dedup;
pub mod entity;
pub mod events;
pub mod extraction;
pub mod identifiers;
pub mod prompt;
pub mod research;
pub mod state;
pub mod tools;
pub mod tree;
pub mod worker;

pub use config::{IterationLimits, ResearchConfig, ResearchConfigBuilder, RoleModels};
pub use context::ResearchEnv;
pub use dedup::{DedupAgent, DedupOutcome, apply_duplicates, reconcile};
pub use entity::{
    Claim, DuplicateReport, EntitySummary, EntityTypeDefinition, LocalEntityId, ProposedEntity,
};
pub use events::{ProgressEnvelope, ProgressEvent, ProgressSink};
pub use identifiers::{WorkerIdentifiers, WorkerKind};
pub use prompt::PromptSet;
pub use research::{ResearchGoal, ResearchOutcome, ResearchRunner};
pub use state::{CoordinatorState, WorkerPhase, WorkerStatus};
pub use tools::CoordinatorAction;
pub use tree::{StopHandle, StopSignal, WorkerTree};
pub use worker::{WorkerOutcome, WorkerSnapshot, advance, run_worker};
