//! External collaborators the engine talks to.
//!
//! Each boundary is a trait so runs can be driven by real HTTP services or
//! by the in-memory implementations in [`crate::testing`].

pub mod graph;
pub mod human;
pub mod web;

pub use graph::{EntityQuery, GraphStore, InMemoryGraphStore, RetryingGraphStore, StoredEntity};
pub use human::{HumanInput, TerminalInput};
pub use web::{HttpFetcher, HttpSearch, SearchHit, WebFetch, WebPage, WebSearch};
