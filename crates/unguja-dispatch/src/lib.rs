//! unguja-dispatch: the permission evaluation engine
//!
//! Answers Check, Expand, LookupResources, LookupSubjects and
//! ReachableResources over the relationship graph, honoring consistency
//! revisions and caveats.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────┐
//! │              unguja-dispatch                 │
//! ├─────────────────────────────────────────────┤
//! │  engine/  - Recursive fan-out resolvers     │
//! │  cache    - Scoped memo + shared TTL cache  │
//! │  config   - Enumerated dispatch options     │
//! │  types    - Requests, responses, metadata   │
//! └─────────────────────────────────────────────┘
//! ```
//!
//! An engine instance is bound to a `(schema, snapshot reader, revision)`
//! triple chosen by the outer API call; see [`DispatchEngine`].

pub mod cache;
pub mod config;
pub mod engine;
pub mod error;
pub mod types;

pub use cache::DispatchCache;
pub use config::DispatchConfig;
pub use engine::{load_schema, DispatchEngine};
pub use error::{DispatchError, DispatchResult};
pub use types::{
    CheckRequest, CheckResponse, DispatchMetadata, ExpandNode, ExpandRequest, ExpandResponse,
    ExpandSubject, LookupResourcesRequest, LookupSubjectsRequest, Permissionship,
    ResolvedResource, ResolvedSubject,
};
