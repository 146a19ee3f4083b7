//! unguja-core: schema model and evaluation primitives
//!
//! This crate contains the synchronous heart of the engine:
//! - Relationship tuples and the objects they connect
//! - The compiled schema (namespaces, relations, rewrites, caveats)
//! - The reachability graph used by reverse lookups
//! - The caveat evaluator for conditional relationships
//! - Opaque, comparable revision tokens
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────┐
//! │                unguja-core                   │
//! ├─────────────────────────────────────────────┤
//! │  tuple        - ObjectAndRelation, tuples   │
//! │  schema/      - Compiled schema + validation│
//! │  reachability - Reverse-lookup entrypoints  │
//! │  caveat/      - CEL caveat evaluation       │
//! │  revision     - Consistency tokens          │
//! └─────────────────────────────────────────────┘
//! ```

pub mod caveat;
pub mod error;
pub mod reachability;
pub mod revision;
pub mod schema;
pub mod tuple;

pub use error::{CoreError, CoreResult};
pub use revision::Revision;
pub use schema::Schema;
pub use tuple::{ContextualizedCaveat, ObjectAndRelation, RelationTuple};
