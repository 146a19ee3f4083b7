//! The datastore contract consumed by the dispatch engine.
//!
//! The engine is oblivious to the concrete backend: anything that can
//! return stable revisions, snapshot-consistent readers and atomic writes
//! satisfies the contract. The in-memory implementation in this crate is
//! the reference used by tests.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::future::BoxFuture;
use futures::stream::BoxStream;
use unguja_core::schema::{CaveatDefinition, NamespaceDefinition};
use unguja_core::{RelationTuple, Revision};

use crate::error::{StorageError, StorageResult};

/// A finite, forward-only stream of relationships. Dropping the stream
/// closes it.
pub type RelationshipStream = BoxStream<'static, StorageResult<RelationTuple>>;

/// Filter applied by [`SnapshotReader::query_relationships`].
///
/// Every field is optional, but at least one must be set.
#[derive(Debug, Clone, Default)]
pub struct RelationshipFilter {
    pub resource_type: Option<String>,
    pub resource_id: Option<String>,
    pub relation: Option<String>,
    pub subject_type: Option<String>,
    pub subject_id: Option<String>,
    /// `Some(None)` matches terminal subjects only; `Some(Some(rel))`
    /// matches userset subjects on `rel`.
    pub subject_relation: Option<Option<String>>,
    pub caveat_name: Option<String>,
}

impl RelationshipFilter {
    pub fn for_resource(
        resource_type: impl Into<String>,
        resource_id: impl Into<String>,
        relation: impl Into<String>,
    ) -> Self {
        Self {
            resource_type: Some(resource_type.into()),
            resource_id: Some(resource_id.into()),
            relation: Some(relation.into()),
            ..Default::default()
        }
    }

    pub fn is_empty(&self) -> bool {
        self.resource_type.is_none()
            && self.resource_id.is_none()
            && self.relation.is_none()
            && self.subject_type.is_none()
            && self.subject_id.is_none()
            && self.subject_relation.is_none()
            && self.caveat_name.is_none()
    }

    pub fn matches(&self, tuple: &RelationTuple) -> bool {
        if let Some(v) = &self.resource_type {
            if tuple.resource.namespace != *v {
                return false;
            }
        }
        if let Some(v) = &self.resource_id {
            if tuple.resource.object_id != *v {
                return false;
            }
        }
        if let Some(v) = &self.relation {
            if tuple.resource.relation != *v {
                return false;
            }
        }
        if let Some(v) = &self.subject_type {
            if tuple.subject.namespace != *v {
                return false;
            }
        }
        if let Some(v) = &self.subject_id {
            if tuple.subject.object_id != *v {
                return false;
            }
        }
        if let Some(v) = &self.subject_relation {
            match v {
                None => {
                    if !tuple.subject.is_terminal() {
                        return false;
                    }
                }
                Some(rel) => {
                    if tuple.subject.is_terminal() || tuple.subject.relation != *rel {
                        return false;
                    }
                }
            }
        }
        if let Some(v) = &self.caveat_name {
            match &tuple.caveat {
                Some(caveat) => {
                    if caveat.caveat_name != *v {
                        return false;
                    }
                }
                None => return false,
            }
        }
        true
    }
}

/// Filter applied by [`SnapshotReader::reverse_query_relationships`]: find
/// edges whose subject matches, optionally constrained to a resource type
/// and relation.
#[derive(Debug, Clone)]
pub struct SubjectsFilter {
    pub subject_type: String,
    /// Empty means any id of the type.
    pub subject_ids: Vec<String>,
    /// `None` matches terminal subjects; `Some(rel)` matches userset
    /// subjects on `rel`.
    pub subject_relation: Option<String>,
    pub resource_type: Option<String>,
    pub resource_relation: Option<String>,
}

impl SubjectsFilter {
    pub fn matches(&self, tuple: &RelationTuple) -> bool {
        if tuple.subject.namespace != self.subject_type {
            return false;
        }
        if !self.subject_ids.is_empty()
            && !self.subject_ids.iter().any(|id| tuple.subject.object_id == *id)
        {
            return false;
        }
        match &self.subject_relation {
            None => {
                if !tuple.subject.is_terminal() {
                    return false;
                }
            }
            Some(rel) => {
                if tuple.subject.is_terminal() || tuple.subject.relation != *rel {
                    return false;
                }
            }
        }
        if let Some(v) = &self.resource_type {
            if tuple.resource.namespace != *v {
                return false;
            }
        }
        if let Some(v) = &self.resource_relation {
            if tuple.resource.relation != *v {
                return false;
            }
        }
        true
    }
}

/// Result ordering for relationship queries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SortOrder {
    #[default]
    Unsorted,
    ByResource,
}

/// Limit, ordering and cursor options for relationship queries.
#[derive(Debug, Clone, Default)]
pub struct QueryOptions {
    pub limit: Option<usize>,
    pub sort: SortOrder,
    /// Resume after this resource id; only meaningful with
    /// [`SortOrder::ByResource`].
    pub after: Option<String>,
}

/// How a relationship changed at a revision.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChangeOperation {
    Touch,
    Delete,
}

/// One changed relationship inside a revision.
#[derive(Debug, Clone)]
pub struct RelationshipChange {
    pub operation: ChangeOperation,
    pub tuple: RelationTuple,
}

/// All relationships changed by one committed revision.
#[derive(Debug, Clone)]
pub struct RevisionChanges {
    pub revision: Revision,
    pub changes: Vec<RelationshipChange>,
}

/// A single write operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteOp {
    /// Fails when the `(resource, subject)` pair already exists.
    Create,
    /// Idempotent upsert; replaces the caveat on an existing edge.
    Touch,
    /// Idempotent removal.
    Delete,
}

/// A relationship write.
#[derive(Debug, Clone)]
pub struct RelationshipUpdate {
    pub op: WriteOp,
    pub tuple: RelationTuple,
}

impl RelationshipUpdate {
    pub fn create(tuple: RelationTuple) -> Self {
        Self {
            op: WriteOp::Create,
            tuple,
        }
    }

    pub fn touch(tuple: RelationTuple) -> Self {
        Self {
            op: WriteOp::Touch,
            tuple,
        }
    }

    pub fn delete(tuple: RelationTuple) -> Self {
        Self {
            op: WriteOp::Delete,
            tuple,
        }
    }
}

/// Optional capabilities advertised by a datastore.
#[derive(Debug, Clone, Copy, Default)]
pub struct FeatureSet {
    pub watch_enabled: bool,
}

/// Reads against one consistent snapshot.
#[async_trait]
pub trait SnapshotReader: Send + Sync {
    async fn read_namespace_by_name(
        &self,
        name: &str,
    ) -> StorageResult<Arc<NamespaceDefinition>>;

    async fn read_caveat_by_name(&self, name: &str) -> StorageResult<Arc<CaveatDefinition>>;

    async fn list_namespaces(&self) -> StorageResult<Vec<Arc<NamespaceDefinition>>>;

    async fn list_caveats(&self) -> StorageResult<Vec<Arc<CaveatDefinition>>>;

    async fn lookup_namespaces_with_names(
        &self,
        names: &[String],
    ) -> StorageResult<Vec<Arc<NamespaceDefinition>>>;

    async fn lookup_caveats_with_names(
        &self,
        names: &[String],
    ) -> StorageResult<Vec<Arc<CaveatDefinition>>>;

    async fn query_relationships(
        &self,
        filter: &RelationshipFilter,
        options: &QueryOptions,
    ) -> StorageResult<RelationshipStream>;

    async fn reverse_query_relationships(
        &self,
        filter: &SubjectsFilter,
        options: &QueryOptions,
    ) -> StorageResult<RelationshipStream>;
}

/// Mutations applied atomically inside [`Datastore::read_write_tx`].
#[async_trait]
pub trait ReadWriteTransaction: Send {
    async fn write_relationships(
        &mut self,
        updates: Vec<RelationshipUpdate>,
    ) -> StorageResult<()>;

    /// Deletes everything matching the filter; returns the count removed.
    async fn delete_relationships(
        &mut self,
        filter: &RelationshipFilter,
    ) -> StorageResult<usize>;

    async fn write_namespaces(
        &mut self,
        namespaces: Vec<NamespaceDefinition>,
    ) -> StorageResult<()>;

    async fn write_caveats(&mut self, caveats: Vec<CaveatDefinition>) -> StorageResult<()>;
}

/// The transaction body passed to [`Datastore::read_write_tx`].
pub type TxFn = Box<
    dyn for<'a> FnOnce(&'a mut dyn ReadWriteTransaction) -> BoxFuture<'a, StorageResult<()>>
        + Send,
>;

/// An abstract reader/writer of relationships, schemas and revisions.
#[async_trait]
pub trait Datastore: Send + Sync + 'static {
    /// A revision suitable for cache-friendly reads, with how long callers
    /// may keep using it.
    async fn optimized_revision(&self) -> StorageResult<(Revision, Duration)>;

    /// The most recent committed revision.
    async fn head_revision(&self) -> StorageResult<Revision>;

    /// Ok when the revision is usable, [`StorageError::StaleRevision`] when
    /// it has aged out, [`StorageError::InvalidRevision`] when it was never
    /// issued.
    async fn check_revision(&self, revision: Revision) -> StorageResult<()>;

    /// A reader pinned to the snapshot at `revision`.
    fn snapshot_reader(&self, revision: Revision) -> Arc<dyn SnapshotReader>;

    /// Runs `f` in an atomic read-write transaction and returns the
    /// revision at which it committed.
    async fn read_write_tx(&self, f: TxFn) -> StorageResult<Revision>;

    /// Streams changes committed after `after`. The second stream carries
    /// at most one terminal error.
    fn watch(
        &self,
        after: Revision,
    ) -> (
        BoxStream<'static, RevisionChanges>,
        BoxStream<'static, StorageError>,
    );

    fn features(&self) -> FeatureSet;
}

/// Convenience wrapper for the common "apply these updates" transaction.
pub async fn apply_updates(
    datastore: &dyn Datastore,
    updates: Vec<RelationshipUpdate>,
) -> StorageResult<Revision> {
    datastore
        .read_write_tx(Box::new(move |tx| {
            Box::pin(async move { tx.write_relationships(updates).await })
        }))
        .await
}

/// Convenience wrapper for installing schema definitions.
pub async fn write_schema(
    datastore: &dyn Datastore,
    namespaces: Vec<NamespaceDefinition>,
    caveats: Vec<CaveatDefinition>,
) -> StorageResult<Revision> {
    datastore
        .read_write_tx(Box::new(move |tx| {
            Box::pin(async move {
                tx.write_caveats(caveats).await?;
                tx.write_namespaces(namespaces).await
            })
        }))
        .await
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tuple(s: &str) -> RelationTuple {
        RelationTuple::parse(s).unwrap()
    }

    #[test]
    fn relationship_filter_matches_fields() {
        let t = tuple("resource:r1#viewer@user:alice");

        let by_resource = RelationshipFilter::for_resource("resource", "r1", "viewer");
        assert!(by_resource.matches(&t));

        let wrong_relation = RelationshipFilter {
            relation: Some("owner".to_string()),
            ..Default::default()
        };
        assert!(!wrong_relation.matches(&t));

        let terminal_only = RelationshipFilter {
            subject_relation: Some(None),
            ..Default::default()
        };
        assert!(terminal_only.matches(&t));
        assert!(!terminal_only.matches(&tuple("resource:r1#viewer@group:eng#member")));
    }

    #[test]
    fn caveat_name_filter_requires_a_caveat() {
        let filter = RelationshipFilter {
            caveat_name: Some("ip_in_range".to_string()),
            ..Default::default()
        };
        assert!(filter.matches(&tuple("resource:r1#viewer@user:alice[ip_in_range]")));
        assert!(!filter.matches(&tuple("resource:r1#viewer@user:alice")));
    }

    #[test]
    fn subjects_filter_matches_usersets_and_ids() {
        let filter = SubjectsFilter {
            subject_type: "group".to_string(),
            subject_ids: vec!["eng".to_string()],
            subject_relation: Some("member".to_string()),
            resource_type: Some("resource".to_string()),
            resource_relation: Some("viewer".to_string()),
        };
        assert!(filter.matches(&tuple("resource:r1#viewer@group:eng#member")));
        assert!(!filter.matches(&tuple("resource:r1#viewer@group:ops#member")));
        assert!(!filter.matches(&tuple("resource:r1#owner@group:eng#member")));
        assert!(!filter.matches(&tuple("resource:r1#viewer@group:eng")));
    }

    #[test]
    fn object_safety() {
        fn _reader(_: Arc<dyn SnapshotReader>) {}
        fn _store(_: Arc<dyn Datastore>) {}
    }
}
