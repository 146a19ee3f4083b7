//! Context severing.
//!
//! Dropping a dispatch future must not abort a datastore query mid-flight:
//! an aborted query can invalidate a pooled connection that would
//! otherwise return cleanly. This proxy severs the cancellation scope from
//! the observability scope: every delegate call runs on a detached task
//! that inherits only the caller's tracing span. A caller that goes away
//! abandons its join handle; the query runs to completion on its own.
//!
//! `watch` is the deliberate exception and passes cancellation through,
//! since a watch stream should end when its consumer does.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::stream::BoxStream;
use tracing::Instrument;
use unguja_core::schema::{CaveatDefinition, NamespaceDefinition};
use unguja_core::Revision;

use crate::error::{StorageError, StorageResult};
use crate::traits::{
    Datastore, FeatureSet, QueryOptions, RelationshipFilter, RelationshipStream,
    RevisionChanges, SnapshotReader, SubjectsFilter, TxFn,
};

/// Wraps a datastore so cancellation never reaches the delegate.
pub struct SeveringDatastore<D> {
    delegate: Arc<D>,
}

impl<D: Datastore> SeveringDatastore<D> {
    pub fn new(delegate: Arc<D>) -> Self {
        Self { delegate }
    }
}

/// Runs `fut` on a detached task carrying the current span; awaiting the
/// handle is cancel-safe because dropping it leaves the task running.
async fn severed<T: Send + 'static>(
    fut: impl std::future::Future<Output = StorageResult<T>> + Send + 'static,
) -> StorageResult<T> {
    let span = tracing::Span::current();
    tokio::spawn(fut.instrument(span))
        .await
        .map_err(|e| StorageError::Unavailable {
            reason: format!("datastore task failed: {e}"),
        })?
}

#[async_trait]
impl<D: Datastore> Datastore for SeveringDatastore<D> {
    async fn optimized_revision(&self) -> StorageResult<(Revision, Duration)> {
        let delegate = Arc::clone(&self.delegate);
        severed(async move { delegate.optimized_revision().await }).await
    }

    async fn head_revision(&self) -> StorageResult<Revision> {
        let delegate = Arc::clone(&self.delegate);
        severed(async move { delegate.head_revision().await }).await
    }

    async fn check_revision(&self, revision: Revision) -> StorageResult<()> {
        let delegate = Arc::clone(&self.delegate);
        severed(async move { delegate.check_revision(revision).await }).await
    }

    fn snapshot_reader(&self, revision: Revision) -> Arc<dyn SnapshotReader> {
        Arc::new(SeveringReader {
            delegate: self.delegate.snapshot_reader(revision),
        })
    }

    async fn read_write_tx(&self, f: TxFn) -> StorageResult<Revision> {
        let delegate = Arc::clone(&self.delegate);
        severed(async move { delegate.read_write_tx(f).await }).await
    }

    fn watch(
        &self,
        after: Revision,
    ) -> (
        BoxStream<'static, RevisionChanges>,
        BoxStream<'static, StorageError>,
    ) {
        self.delegate.watch(after)
    }

    fn features(&self) -> FeatureSet {
        self.delegate.features()
    }
}

/// The reader-side counterpart of [`SeveringDatastore`].
pub struct SeveringReader {
    delegate: Arc<dyn SnapshotReader>,
}

#[async_trait]
impl SnapshotReader for SeveringReader {
    async fn read_namespace_by_name(
        &self,
        name: &str,
    ) -> StorageResult<Arc<NamespaceDefinition>> {
        let delegate = Arc::clone(&self.delegate);
        let name = name.to_string();
        severed(async move { delegate.read_namespace_by_name(&name).await }).await
    }

    async fn read_caveat_by_name(&self, name: &str) -> StorageResult<Arc<CaveatDefinition>> {
        let delegate = Arc::clone(&self.delegate);
        let name = name.to_string();
        severed(async move { delegate.read_caveat_by_name(&name).await }).await
    }

    async fn list_namespaces(&self) -> StorageResult<Vec<Arc<NamespaceDefinition>>> {
        let delegate = Arc::clone(&self.delegate);
        severed(async move { delegate.list_namespaces().await }).await
    }

    async fn list_caveats(&self) -> StorageResult<Vec<Arc<CaveatDefinition>>> {
        let delegate = Arc::clone(&self.delegate);
        severed(async move { delegate.list_caveats().await }).await
    }

    async fn lookup_namespaces_with_names(
        &self,
        names: &[String],
    ) -> StorageResult<Vec<Arc<NamespaceDefinition>>> {
        let delegate = Arc::clone(&self.delegate);
        let names = names.to_vec();
        severed(async move { delegate.lookup_namespaces_with_names(&names).await }).await
    }

    async fn lookup_caveats_with_names(
        &self,
        names: &[String],
    ) -> StorageResult<Vec<Arc<CaveatDefinition>>> {
        let delegate = Arc::clone(&self.delegate);
        let names = names.to_vec();
        severed(async move { delegate.lookup_caveats_with_names(&names).await }).await
    }

    async fn query_relationships(
        &self,
        filter: &RelationshipFilter,
        options: &QueryOptions,
    ) -> StorageResult<RelationshipStream> {
        let delegate = Arc::clone(&self.delegate);
        let filter = filter.clone();
        let options = options.clone();
        severed(async move { delegate.query_relationships(&filter, &options).await }).await
    }

    async fn reverse_query_relationships(
        &self,
        filter: &SubjectsFilter,
        options: &QueryOptions,
    ) -> StorageResult<RelationshipStream> {
        let delegate = Arc::clone(&self.delegate);
        let filter = filter.clone();
        let options = options.clone();
        severed(async move { delegate.reverse_query_relationships(&filter, &options).await }).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::MemoryDatastore;
    use crate::traits::{apply_updates, write_schema, RelationshipUpdate};
    use futures::TryStreamExt;
    use std::time::Duration;
    use unguja_core::schema::{AllowedRelation, RelationDef};
    use unguja_core::RelationTuple;

    #[tokio::test]
    async fn delegates_reads_and_writes() {
        let proxied = SeveringDatastore::new(Arc::new(MemoryDatastore::new()));
        write_schema(
            &proxied,
            vec![
                NamespaceDefinition::new("user", vec![]),
                NamespaceDefinition::new(
                    "resource",
                    vec![RelationDef::direct(
                        "viewer",
                        vec![AllowedRelation::terminal("user")],
                    )],
                ),
            ],
            vec![],
        )
        .await
        .unwrap();

        let rev = apply_updates(
            &proxied,
            vec![RelationshipUpdate::touch(
                RelationTuple::parse("resource:r1#viewer@user:alice").unwrap(),
            )],
        )
        .await
        .unwrap();

        let tuples: Vec<RelationTuple> = proxied
            .snapshot_reader(rev)
            .query_relationships(
                &RelationshipFilter::for_resource("resource", "r1", "viewer"),
                &QueryOptions::default(),
            )
            .await
            .unwrap()
            .try_collect()
            .await
            .unwrap();
        assert_eq!(tuples.len(), 1);
    }

    #[tokio::test]
    async fn aborted_callers_do_not_abort_the_delegate_call() {
        let proxied = Arc::new(SeveringDatastore::new(Arc::new(MemoryDatastore::new())));

        // Abort a caller mid-flight; the severed task keeps running and the
        // proxy stays usable.
        let handle = {
            let proxied = Arc::clone(&proxied);
            tokio::spawn(async move { proxied.head_revision().await })
        };
        handle.abort();
        let _ = handle.await;

        tokio::time::sleep(Duration::from_millis(5)).await;
        assert!(proxied.head_revision().await.is_ok());
    }
}
