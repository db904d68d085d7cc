//! quarry-placement: candidate search, scoring, optimistic writes and
//! simulation sessions over the Quarry resource graph.
//!
//! # Architecture
//!
//! ```text
//! Engine
//!   ├── Resolver (root filters → tree view → assignment search → filters)
//!   ├── Scorer (ordered weighers, min-max normalized, multiplied)
//!   ├── ConcurrencyController (generation-checked atomic batches)
//!   └── SessionManager (virtual deltas, overlay, commit as one batch)
//!         └── SessionReaper (tokio loop, watch-channel shutdown)
//! ```
//!
//! # Components
//!
//! - **`request`**: allocation requests, the `Constraint` union and the
//!   Placement-style query parser
//! - **`capacity`**: capacity, usage and unit arithmetic
//! - **`constraints`**: root and assignment filters
//! - **`resolver`**: the depth-first candidate search
//! - **`scorer`**: weighers and ranking
//! - **`concurrency`**: batches, expectations, mutations
//! - **`session`** / **`reaper`**: simulation sessions and their expiry
//! - **`usage`**: committed usage summaries
//! - **`engine`**: the facade tying it together

pub mod capacity;
pub mod concurrency;
pub mod constraints;
pub mod engine;
pub mod error;
pub mod reaper;
pub mod request;
pub mod resolver;
pub mod scorer;
pub mod session;
pub mod usage;

pub use capacity::UsageOverlay;
pub use concurrency::{
    AllocationItem, Batch, BatchOutcome, ConcurrencyController, ConsumerOwner, Expectation,
    Mutation, ProviderUpdate,
};
pub use engine::{AllocationWrite, ConsumerAllocations, Engine, EngineSettings, NewProvider};
pub use error::{EngineError, EngineResult, ErrorKind, StaleEntity};
pub use reaper::SessionReaper;
pub use request::{
    AllocationRequest, Constraint, GroupPlacement, Identity, IsolationPolicy, RequestGroup,
    SearchBounds,
};
pub use resolver::{Candidate, CandidateAllocation, GroupAssignment, Resolver};
pub use scorer::{RankedCandidate, Scorer, SelectionContext, Weigher};
pub use session::{
    Delta, EffectiveStateView, ReapReport, SessionHandle, SessionInfo, SessionManager,
    SessionSettings, SessionState, StateScope,
};
pub use usage::{UsageScope, UsageSummary};
