//! In-memory datastore.
//!
//! The reference implementation of the contract, used by tests and local
//! development. Rows are multi-versioned: each carries the revision window
//! in which it is live, so a snapshot reader at revision `r` sees exactly
//! the rows with `created <= r < deleted`. Every committed transaction
//! advances the head revision by one and appends to a change log consumed
//! by `watch`.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::stream::{self, BoxStream, StreamExt};
use tokio::sync::{broadcast, mpsc, RwLock};
use unguja_core::schema::{CaveatDefinition, NamespaceDefinition};
use unguja_core::{RelationTuple, Revision, Schema};

use crate::error::{StorageError, StorageResult};
use crate::traits::{
    ChangeOperation, Datastore, FeatureSet, QueryOptions, ReadWriteTransaction,
    RelationshipChange, RelationshipFilter, RelationshipStream, RelationshipUpdate,
    RevisionChanges, SnapshotReader, SortOrder, SubjectsFilter, TxFn, WriteOp,
};

/// Tuning options for the memory datastore.
#[derive(Debug, Clone)]
pub struct MemoryDatastoreOptions {
    /// How long callers may reuse an optimized revision.
    pub revision_validity: Duration,
    /// Revisions older than `head - gc_window` report as stale.
    pub gc_window: Option<u64>,
    /// Buffered change events per watch subscriber.
    pub watch_buffer: usize,
    /// When true, write transactions fail with [`StorageError::ReadOnly`].
    pub read_only: bool,
}

impl Default for MemoryDatastoreOptions {
    fn default() -> Self {
        Self {
            revision_validity: Duration::ZERO,
            gc_window: None,
            watch_buffer: 1024,
            read_only: false,
        }
    }
}

#[derive(Debug, Clone)]
struct Row {
    tuple: RelationTuple,
    created: Revision,
    deleted: Option<Revision>,
}

impl Row {
    fn visible_at(&self, revision: Revision) -> bool {
        self.created <= revision && self.deleted.map_or(true, |d| d > revision)
    }

    fn live(&self) -> bool {
        self.deleted.is_none()
    }
}

#[derive(Debug, Clone)]
struct VersionedDef<T> {
    def: Arc<T>,
    created: Revision,
    deleted: Option<Revision>,
}

impl<T> VersionedDef<T> {
    fn visible_at(&self, revision: Revision) -> bool {
        self.created <= revision && self.deleted.map_or(true, |d| d > revision)
    }
}

#[derive(Debug, Clone, Default)]
struct Inner {
    head: Revision,
    rows: Vec<Row>,
    namespaces: Vec<VersionedDef<NamespaceDefinition>>,
    caveats: Vec<VersionedDef<CaveatDefinition>>,
    log: Vec<RevisionChanges>,
}

/// An in-memory, multi-versioned datastore.
pub struct MemoryDatastore {
    inner: Arc<RwLock<Inner>>,
    options: MemoryDatastoreOptions,
    changes_tx: broadcast::Sender<RevisionChanges>,
}

impl MemoryDatastore {
    pub fn new() -> Self {
        Self::with_options(MemoryDatastoreOptions::default())
    }

    pub fn with_options(options: MemoryDatastoreOptions) -> Self {
        let (changes_tx, _) = broadcast::channel(options.watch_buffer);
        Self {
            inner: Arc::new(RwLock::new(Inner::default())),
            options,
            changes_tx,
        }
    }
}

impl Default for MemoryDatastore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Datastore for MemoryDatastore {
    async fn optimized_revision(&self) -> StorageResult<(Revision, Duration)> {
        let inner = self.inner.read().await;
        Ok((inner.head, self.options.revision_validity))
    }

    async fn head_revision(&self) -> StorageResult<Revision> {
        Ok(self.inner.read().await.head)
    }

    async fn check_revision(&self, revision: Revision) -> StorageResult<()> {
        let head = self.inner.read().await.head;
        if revision > head {
            return Err(StorageError::InvalidRevision { revision });
        }
        if let Some(window) = self.options.gc_window {
            if revision.sequence() + window < head.sequence() {
                return Err(StorageError::StaleRevision { revision });
            }
        }
        Ok(())
    }

    fn snapshot_reader(&self, revision: Revision) -> Arc<dyn SnapshotReader> {
        Arc::new(MemoryReader {
            inner: Arc::clone(&self.inner),
            revision,
        })
    }

    async fn read_write_tx(&self, f: TxFn) -> StorageResult<Revision> {
        if self.options.read_only {
            return Err(StorageError::ReadOnly);
        }

        let mut inner = self.inner.write().await;
        let next = inner.head.next();

        // Stage on a copy so a failing transaction body leaves no trace.
        let mut staged = inner.clone();
        let mut tx = MemoryTransaction {
            staged: &mut staged,
            revision: next,
            changes: Vec::new(),
            schema: None,
        };
        f(&mut tx).await?;
        let changes = tx.changes;

        staged.head = next;
        *inner = staged;

        if !changes.is_empty() {
            let entry = RevisionChanges {
                revision: next,
                changes,
            };
            inner.log.push(entry.clone());
            // Nobody listening is fine.
            let _ = self.changes_tx.send(entry);
        }
        Ok(next)
    }

    fn watch(
        &self,
        after: Revision,
    ) -> (
        BoxStream<'static, RevisionChanges>,
        BoxStream<'static, StorageError>,
    ) {
        let (changes_out, changes_rx) = mpsc::channel::<RevisionChanges>(self.options.watch_buffer);
        let (errors_out, errors_rx) = mpsc::channel::<StorageError>(1);

        let inner = Arc::clone(&self.inner);
        let mut live = self.changes_tx.subscribe();
        tokio::spawn(async move {
            // Subscribe before replay so nothing committed in between is
            // missed; replayed revisions are deduplicated below.
            let mut last = after;
            {
                let inner = inner.read().await;
                for entry in inner.log.iter().filter(|e| e.revision > after) {
                    last = entry.revision;
                    if changes_out.send(entry.clone()).await.is_err() {
                        return;
                    }
                }
            }
            loop {
                match live.recv().await {
                    Ok(entry) => {
                        if entry.revision <= last {
                            continue;
                        }
                        last = entry.revision;
                        if changes_out.send(entry).await.is_err() {
                            return;
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(missed)) => {
                        let _ = errors_out.send(StorageError::WatchLagged { missed }).await;
                        return;
                    }
                    Err(broadcast::error::RecvError::Closed) => return,
                }
            }
        });

        (
            receiver_stream(changes_rx).boxed(),
            receiver_stream(errors_rx).boxed(),
        )
    }

    fn features(&self) -> FeatureSet {
        FeatureSet {
            watch_enabled: true,
        }
    }
}

fn receiver_stream<T: Send + 'static>(rx: mpsc::Receiver<T>) -> impl futures::Stream<Item = T> {
    stream::unfold(rx, |mut rx| async move { rx.recv().await.map(|v| (v, rx)) })
}

struct MemoryTransaction<'a> {
    staged: &'a mut Inner,
    revision: Revision,
    changes: Vec<RelationshipChange>,
    schema: Option<Arc<Schema>>,
}

impl MemoryTransaction<'_> {
    /// The schema visible to this transaction, compiled once on demand from
    /// the staged definitions.
    fn schema(&mut self) -> StorageResult<Arc<Schema>> {
        if let Some(schema) = &self.schema {
            return Ok(Arc::clone(schema));
        }
        let namespaces = self
            .staged
            .namespaces
            .iter()
            .filter(|v| v.deleted.is_none())
            .map(|v| (*v.def).clone())
            .collect();
        let caveats = self
            .staged
            .caveats
            .iter()
            .filter(|v| v.deleted.is_none())
            .map(|v| (*v.def).clone())
            .collect();
        let schema = Arc::new(Schema::compile(namespaces, caveats)?);
        self.schema = Some(Arc::clone(&schema));
        Ok(schema)
    }

    fn live_row_index(&self, tuple: &RelationTuple) -> Option<usize> {
        self.staged
            .rows
            .iter()
            .position(|row| row.live() && row.tuple == *tuple)
    }
}

#[async_trait]
impl ReadWriteTransaction for MemoryTransaction<'_> {
    async fn write_relationships(
        &mut self,
        updates: Vec<RelationshipUpdate>,
    ) -> StorageResult<()> {
        let schema = self.schema()?;
        for update in updates {
            let existing = self.live_row_index(&update.tuple);
            match update.op {
                WriteOp::Create => {
                    schema.validate_tuple(&update.tuple)?;
                    if existing.is_some() {
                        return Err(StorageError::ConflictingWrite {
                            tuple: update.tuple.to_string(),
                        });
                    }
                    self.staged.rows.push(Row {
                        tuple: update.tuple.clone(),
                        created: self.revision,
                        deleted: None,
                    });
                    self.changes.push(RelationshipChange {
                        operation: ChangeOperation::Touch,
                        tuple: update.tuple,
                    });
                }
                WriteOp::Touch => {
                    schema.validate_tuple(&update.tuple)?;
                    if let Some(index) = existing {
                        // Same edge, possibly a different caveat: replace.
                        self.staged.rows[index].deleted = Some(self.revision);
                    }
                    self.staged.rows.push(Row {
                        tuple: update.tuple.clone(),
                        created: self.revision,
                        deleted: None,
                    });
                    self.changes.push(RelationshipChange {
                        operation: ChangeOperation::Touch,
                        tuple: update.tuple,
                    });
                }
                WriteOp::Delete => {
                    if let Some(index) = existing {
                        self.staged.rows[index].deleted = Some(self.revision);
                        self.changes.push(RelationshipChange {
                            operation: ChangeOperation::Delete,
                            tuple: update.tuple,
                        });
                    }
                }
            }
        }
        Ok(())
    }

    async fn delete_relationships(
        &mut self,
        filter: &RelationshipFilter,
    ) -> StorageResult<usize> {
        if filter.is_empty() {
            return Err(StorageError::InvalidFilter {
                message: "refusing to delete with an empty filter".to_string(),
            });
        }
        let mut removed = 0;
        let revision = self.revision;
        for row in self
            .staged
            .rows
            .iter_mut()
            .filter(|row| row.live() && filter.matches(&row.tuple))
        {
            row.deleted = Some(revision);
            self.changes.push(RelationshipChange {
                operation: ChangeOperation::Delete,
                tuple: row.tuple.clone(),
            });
            removed += 1;
        }
        Ok(removed)
    }

    async fn write_namespaces(
        &mut self,
        namespaces: Vec<NamespaceDefinition>,
    ) -> StorageResult<()> {
        for namespace in namespaces {
            for existing in self
                .staged
                .namespaces
                .iter_mut()
                .filter(|v| v.deleted.is_none() && v.def.name == namespace.name)
            {
                existing.deleted = Some(self.revision);
            }
            self.staged.namespaces.push(VersionedDef {
                def: Arc::new(namespace),
                created: self.revision,
                deleted: None,
            });
        }
        self.schema = None;
        Ok(())
    }

    async fn write_caveats(&mut self, caveats: Vec<CaveatDefinition>) -> StorageResult<()> {
        for caveat in caveats {
            for existing in self
                .staged
                .caveats
                .iter_mut()
                .filter(|v| v.deleted.is_none() && v.def.name == caveat.name)
            {
                existing.deleted = Some(self.revision);
            }
            self.staged.caveats.push(VersionedDef {
                def: Arc::new(caveat),
                created: self.revision,
                deleted: None,
            });
        }
        self.schema = None;
        Ok(())
    }
}

struct MemoryReader {
    inner: Arc<RwLock<Inner>>,
    revision: Revision,
}

impl MemoryReader {
    async fn collect_matching(
        &self,
        matches: impl Fn(&RelationTuple) -> bool,
        options: &QueryOptions,
    ) -> Vec<StorageResult<RelationTuple>> {
        let inner = self.inner.read().await;
        let mut tuples: Vec<RelationTuple> = inner
            .rows
            .iter()
            .filter(|row| row.visible_at(self.revision) && matches(&row.tuple))
            .map(|row| row.tuple.clone())
            .collect();

        if options.sort == SortOrder::ByResource {
            tuples.sort_by(|a, b| {
                a.resource
                    .cmp(&b.resource)
                    .then_with(|| a.subject.cmp(&b.subject))
            });
            if let Some(after) = &options.after {
                tuples.retain(|t| t.resource.object_id > *after);
            }
        }
        if let Some(limit) = options.limit {
            tuples.truncate(limit);
        }
        tuples.into_iter().map(Ok).collect()
    }
}

#[async_trait]
impl SnapshotReader for MemoryReader {
    async fn read_namespace_by_name(
        &self,
        name: &str,
    ) -> StorageResult<Arc<NamespaceDefinition>> {
        let inner = self.inner.read().await;
        inner
            .namespaces
            .iter()
            .find(|v| v.visible_at(self.revision) && v.def.name == name)
            .map(|v| Arc::clone(&v.def))
            .ok_or_else(|| StorageError::NamespaceNotFound {
                namespace: name.to_string(),
            })
    }

    async fn read_caveat_by_name(&self, name: &str) -> StorageResult<Arc<CaveatDefinition>> {
        let inner = self.inner.read().await;
        inner
            .caveats
            .iter()
            .find(|v| v.visible_at(self.revision) && v.def.name == name)
            .map(|v| Arc::clone(&v.def))
            .ok_or_else(|| StorageError::CaveatNotFound {
                caveat: name.to_string(),
            })
    }

    async fn list_namespaces(&self) -> StorageResult<Vec<Arc<NamespaceDefinition>>> {
        let inner = self.inner.read().await;
        Ok(inner
            .namespaces
            .iter()
            .filter(|v| v.visible_at(self.revision))
            .map(|v| Arc::clone(&v.def))
            .collect())
    }

    async fn list_caveats(&self) -> StorageResult<Vec<Arc<CaveatDefinition>>> {
        let inner = self.inner.read().await;
        Ok(inner
            .caveats
            .iter()
            .filter(|v| v.visible_at(self.revision))
            .map(|v| Arc::clone(&v.def))
            .collect())
    }

    async fn lookup_namespaces_with_names(
        &self,
        names: &[String],
    ) -> StorageResult<Vec<Arc<NamespaceDefinition>>> {
        let inner = self.inner.read().await;
        Ok(inner
            .namespaces
            .iter()
            .filter(|v| v.visible_at(self.revision) && names.contains(&v.def.name))
            .map(|v| Arc::clone(&v.def))
            .collect())
    }

    async fn lookup_caveats_with_names(
        &self,
        names: &[String],
    ) -> StorageResult<Vec<Arc<CaveatDefinition>>> {
        let inner = self.inner.read().await;
        Ok(inner
            .caveats
            .iter()
            .filter(|v| v.visible_at(self.revision) && names.contains(&v.def.name))
            .map(|v| Arc::clone(&v.def))
            .collect())
    }

    async fn query_relationships(
        &self,
        filter: &RelationshipFilter,
        options: &QueryOptions,
    ) -> StorageResult<RelationshipStream> {
        if filter.is_empty() {
            return Err(StorageError::InvalidFilter {
                message: "relationship filter must constrain at least one field".to_string(),
            });
        }
        let results = self
            .collect_matching(|tuple| filter.matches(tuple), options)
            .await;
        Ok(stream::iter(results).boxed())
    }

    async fn reverse_query_relationships(
        &self,
        filter: &SubjectsFilter,
        options: &QueryOptions,
    ) -> StorageResult<RelationshipStream> {
        let results = self
            .collect_matching(|tuple| filter.matches(tuple), options)
            .await;
        Ok(stream::iter(results).boxed())
    }
}
