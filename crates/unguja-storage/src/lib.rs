//! unguja-storage: the datastore contract and its reference pieces
//!
//! The dispatch engine consumes an abstract datastore; this crate defines
//! that contract and ships the plumbing every deployment needs:
//!
//! - `traits`    - Datastore / SnapshotReader and the filter vocabulary
//! - `memory`    - the in-memory MVCC backend used by tests
//! - `revisions` - the cached optimized-revision component (single-flight)
//! - `proxy`     - the context-severing datastore wrapper

pub mod error;
pub mod memory;
pub mod proxy;
pub mod revisions;
pub mod traits;

pub use error::{StorageError, StorageResult};
pub use memory::{MemoryDatastore, MemoryDatastoreOptions};
pub use proxy::SeveringDatastore;
pub use revisions::CachedOptimizedRevisions;
pub use traits::{
    apply_updates, write_schema, ChangeOperation, Datastore, FeatureSet, QueryOptions,
    ReadWriteTransaction, RelationshipChange, RelationshipFilter, RelationshipStream,
    RelationshipUpdate, RevisionChanges, SnapshotReader, SortOrder, SubjectsFilter, TxFn,
    WriteOp,
};
