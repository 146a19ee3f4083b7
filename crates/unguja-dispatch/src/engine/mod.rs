//! The dispatch engine.
//!
//! One engine instance is bound to `(schema, snapshot reader, revision)`:
//! the outer API call selects a revision, acquires a reader, compiles or
//! fetches the schema, and then dispatches. The engine itself is stateless
//! beyond its caches and may be cloned cheaply.

mod check;
mod expand;
mod lookup_resources;
mod lookup_subjects;

use std::sync::Arc;

use futures::stream::BoxStream;
use futures::{StreamExt, TryStreamExt};
use tokio::sync::mpsc;
use tracing::instrument;
use unguja_core::caveat::{CaveatEnv, CaveatVerdict};
use unguja_core::schema::Schema;
use unguja_core::tuple::WILDCARD;
use unguja_core::{ObjectAndRelation, RelationTuple, Revision};
use unguja_storage::{QueryOptions, RelationshipFilter, SnapshotReader, SubjectsFilter};

use crate::cache::{DispatchCache, RequestScope};
use crate::config::DispatchConfig;
use crate::error::{DispatchError, DispatchResult};
use crate::types::{
    CheckRequest, CheckResponse, ExpandRequest, ExpandResponse, LookupResourcesRequest,
    LookupSubjectsRequest, Permissionship, ResolvedResource, ResolvedSubject,
};

pub(crate) use lookup_resources::LookupMode;

/// Compiles the schema stored at the reader's snapshot.
pub async fn load_schema(reader: &dyn SnapshotReader) -> DispatchResult<Schema> {
    let namespaces = reader.list_namespaces().await?;
    let caveats = reader.list_caveats().await?;
    Schema::compile(
        namespaces.iter().map(|ns| (**ns).clone()).collect(),
        caveats.iter().map(|cv| (**cv).clone()).collect(),
    )
    .map_err(Into::into)
}

pub(crate) struct EngineInner {
    pub(crate) schema: Arc<Schema>,
    pub(crate) reader: Arc<dyn SnapshotReader>,
    pub(crate) caveats: CaveatEnv,
    pub(crate) revision: Revision,
    pub(crate) config: DispatchConfig,
    pub(crate) shared_cache: Option<Arc<DispatchCache>>,
}

/// Per-request handle threaded through the recursive resolvers.
#[derive(Clone)]
pub(crate) struct ResolveCtx {
    pub(crate) inner: Arc<EngineInner>,
    pub(crate) scope: Arc<RequestScope>,
    pub(crate) initial_depth: u32,
}

impl ResolveCtx {
    pub(crate) fn used_depth(&self, remaining: u32) -> u32 {
        self.initial_depth.saturating_sub(remaining) + 1
    }
}

/// The concurrent graph-traversal engine answering Check, Expand,
/// LookupResources, LookupSubjects and ReachableResources.
#[derive(Clone)]
pub struct DispatchEngine {
    inner: Arc<EngineInner>,
}

impl DispatchEngine {
    pub fn new(
        schema: Arc<Schema>,
        reader: Arc<dyn SnapshotReader>,
        revision: Revision,
        config: DispatchConfig,
    ) -> Self {
        let caveats = CaveatEnv::for_schema(&schema);
        Self {
            inner: Arc::new(EngineInner {
                schema,
                reader,
                caveats,
                revision,
                config,
                shared_cache: None,
            }),
        }
    }

    /// Attaches a cache shared across engine instances (and therefore
    /// across requests and schema versions, via canonical keys).
    pub fn with_shared_cache(mut self, cache: Arc<DispatchCache>) -> Self {
        let inner = Arc::get_mut(&mut self.inner)
            .expect("with_shared_cache must be called before the engine is shared");
        inner.shared_cache = Some(cache);
        self
    }

    pub fn revision(&self) -> Revision {
        self.inner.revision
    }

    fn resolve_depth(&self, requested: Option<u32>) -> DispatchResult<u32> {
        let max = self.inner.config.max_depth;
        match requested {
            None => Ok(max),
            Some(depth) if depth <= max => Ok(depth),
            Some(depth) => Err(DispatchError::invalid(format!(
                "requested depth {depth} exceeds the maximum of {max}"
            ))),
        }
    }

    fn ctx(&self, initial_depth: u32) -> ResolveCtx {
        ResolveCtx {
            inner: Arc::clone(&self.inner),
            scope: Arc::new(RequestScope::default()),
            initial_depth,
        }
    }

    /// Does `subject` hold `resource.relation` on `resource`?
    #[instrument(skip_all, fields(resource = %request.resource, subject = %request.subject))]
    pub async fn check(&self, request: CheckRequest) -> DispatchResult<CheckResponse> {
        validate_resource(&request.resource)?;
        validate_subject(&request.subject)?;
        let depth = self.resolve_depth(request.depth)?;
        let ctx = self.ctx(depth);

        let outcome = tokio::time::timeout(
            self.inner.config.request_timeout,
            check::check_internal(
                ctx.clone(),
                request.resource.clone(),
                request.subject.clone(),
                depth,
            ),
        )
        .await
        .map_err(|_| DispatchError::DeadlineExceeded)??;

        let permissionship = evaluate_outcome(&self.inner, outcome, &request.context)?;
        Ok(CheckResponse {
            permissionship,
            metadata: ctx.scope.metadata(),
        })
    }

    /// Materializes the full rewrite tree beneath a relation.
    #[instrument(skip_all, fields(resource = %request.resource))]
    pub async fn expand(&self, request: ExpandRequest) -> DispatchResult<ExpandResponse> {
        validate_resource(&request.resource)?;
        let depth = self.resolve_depth(request.depth)?;
        let ctx = self.ctx(depth);

        let tree = tokio::time::timeout(
            self.inner.config.request_timeout,
            expand::expand_internal(ctx.clone(), request.resource.clone(), depth),
        )
        .await
        .map_err(|_| DispatchError::DeadlineExceeded)??;

        Ok(ExpandResponse {
            tree,
            metadata: ctx.scope.metadata(),
        })
    }

    /// Streams resources of `resource_type` on which the subject holds
    /// `permission`. Candidates reachable only conditionally are verified
    /// with a positive check before emission.
    pub fn lookup_resources(
        &self,
        request: LookupResourcesRequest,
    ) -> BoxStream<'static, DispatchResult<ResolvedResource>> {
        self.lookup_resources_with_mode(request, LookupMode::Verified)
    }

    /// As [`Self::lookup_resources`], but skips verification: results under
    /// an intersection or exclusion may be overreported as conditional.
    /// Intended as the first phase of a two-phase enumeration followed by
    /// checks.
    pub fn reachable_resources(
        &self,
        request: LookupResourcesRequest,
    ) -> BoxStream<'static, DispatchResult<ResolvedResource>> {
        self.lookup_resources_with_mode(request, LookupMode::Reachable)
    }

    fn lookup_resources_with_mode(
        &self,
        request: LookupResourcesRequest,
        mode: LookupMode,
    ) -> BoxStream<'static, DispatchResult<ResolvedResource>> {
        let depth = match self.resolve_depth(request.depth) {
            Ok(depth) => depth,
            Err(e) => return error_stream(e),
        };
        if let Err(e) = validate_subject(&request.subject) {
            return error_stream(e);
        }
        let ctx = self.ctx(depth);
        let timeout = self.inner.config.request_timeout;

        let (tx, rx) = mpsc::channel(self.inner.config.max_dispatch_fanout.max(1));
        tokio::spawn(async move {
            let driver = lookup_resources::drive(ctx, request, mode, depth, tx.clone());
            let outcome = match tokio::time::timeout(timeout, driver).await {
                Ok(outcome) => outcome,
                Err(_) => Err(DispatchError::DeadlineExceeded),
            };
            if let Err(e) = outcome {
                let _ = tx.send(Err(e)).await;
            }
        });
        receiver_stream(rx).boxed()
    }

    /// Streams subjects of `subject_type` holding `resource.relation` on
    /// the resource. A wildcard grant is emitted as the subject id `*`
    /// carrying its exclusions.
    pub fn lookup_subjects(
        &self,
        request: LookupSubjectsRequest,
    ) -> BoxStream<'static, DispatchResult<ResolvedSubject>> {
        if let Err(e) = validate_resource(&request.resource) {
            return error_stream(e);
        }
        let depth = match self.resolve_depth(request.depth) {
            Ok(depth) => depth,
            Err(e) => return error_stream(e),
        };
        let ctx = self.ctx(depth);
        let timeout = self.inner.config.request_timeout;
        let limit = request
            .limit
            .unwrap_or(self.inner.config.default_limit)
            .max(1) as usize;

        let (tx, rx) = mpsc::channel(self.inner.config.max_dispatch_fanout.max(1));
        tokio::spawn(async move {
            let driver = lookup_subjects::drive(ctx, request, depth, limit, tx.clone());
            let outcome = match tokio::time::timeout(timeout, driver).await {
                Ok(outcome) => outcome,
                Err(_) => Err(DispatchError::DeadlineExceeded),
            };
            if let Err(e) = outcome {
                let _ = tx.send(Err(e)).await;
            }
        });
        receiver_stream(rx).boxed()
    }
}

fn validate_resource(resource: &ObjectAndRelation) -> DispatchResult<()> {
    if resource.is_terminal() {
        return Err(DispatchError::invalid(format!(
            "resource '{resource}' must name a relation or permission"
        )));
    }
    if resource.is_wildcard() {
        return Err(DispatchError::invalid(format!(
            "resource '{resource}' may not be a wildcard"
        )));
    }
    Ok(())
}

fn validate_subject(subject: &ObjectAndRelation) -> DispatchResult<()> {
    if subject.is_wildcard() {
        if !subject.is_terminal() {
            return Err(DispatchError::invalid(format!(
                "wildcard subject '{subject}' may not carry a relation"
            )));
        }
        return Err(DispatchError::invalid(
            "a wildcard may not be the subject of a dispatch",
        ));
    }
    Ok(())
}

fn error_stream<T: Send + 'static>(error: DispatchError) -> BoxStream<'static, DispatchResult<T>> {
    futures::stream::once(async move { Err(error) }).boxed()
}

fn receiver_stream<T: Send + 'static>(rx: mpsc::Receiver<T>) -> impl futures::Stream<Item = T> {
    futures::stream::unfold(rx, |mut rx| async move { rx.recv().await.map(|v| (v, rx)) })
}

/// Folds a traversal outcome through the caveat evaluator with the
/// caller's context. A caveat branch that failed to evaluate stays
/// conditional with its error logged, rather than failing the request.
pub(crate) fn evaluate_outcome(
    inner: &EngineInner,
    outcome: Permissionship,
    context: &serde_json::Map<String, serde_json::Value>,
) -> DispatchResult<Permissionship> {
    match outcome {
        Permissionship::Conditional(expression) => {
            match inner.caveats.evaluate(&expression, context)? {
                CaveatVerdict::True => Ok(Permissionship::HasPermission),
                CaveatVerdict::False => Ok(Permissionship::NoPermission),
                CaveatVerdict::Partial(partial) => {
                    if let Some(error) = &partial.evaluation_error {
                        tracing::warn!(error, "caveat branch failed to evaluate");
                    }
                    Ok(Permissionship::Conditional(partial.residual))
                }
            }
        }
        decided => Ok(decided),
    }
}

/// Collects every stored edge matching the filter.
pub(crate) async fn collect_edges(
    inner: &EngineInner,
    filter: RelationshipFilter,
) -> DispatchResult<Vec<RelationTuple>> {
    let stream = inner
        .reader
        .query_relationships(&filter, &QueryOptions::default())
        .await?;
    stream
        .try_collect::<Vec<_>>()
        .await
        .map_err(Into::into)
}

/// Collects every stored edge whose subject matches the filter.
pub(crate) async fn collect_reverse_edges(
    inner: &EngineInner,
    filter: SubjectsFilter,
) -> DispatchResult<Vec<RelationTuple>> {
    let stream = inner
        .reader
        .reverse_query_relationships(&filter, &QueryOptions::default())
        .await?;
    stream
        .try_collect::<Vec<_>>()
        .await
        .map_err(Into::into)
}

/// Whether a stored edge's subject grants to the queried subject: exact
/// match, or a wildcard of the subject's type matching a terminal subject.
pub(crate) fn subject_matches(stored: &ObjectAndRelation, queried: &ObjectAndRelation) -> bool {
    if stored == queried {
        return true;
    }
    stored.object_id == WILDCARD
        && stored.is_terminal()
        && queried.is_terminal()
        && stored.namespace == queried.namespace
}

#[cfg(test)]
mod tests {
    use super::*;

    fn or(s: &str) -> ObjectAndRelation {
        ObjectAndRelation::parse(s).unwrap()
    }

    #[test]
    fn wildcards_grant_to_terminal_subjects_of_the_type() {
        assert!(subject_matches(&or("user:*"), &or("user:alice")));
        assert!(!subject_matches(&or("user:*"), &or("group:eng")));
        assert!(!subject_matches(&or("user:*"), &or("user:alice#member")));
        assert!(subject_matches(&or("user:alice"), &or("user:alice")));
        assert!(!subject_matches(&or("user:alice"), &or("user:bob")));
        assert!(subject_matches(&or("group:eng#member"), &or("group:eng#member")));
    }

    #[test]
    fn dispatch_subjects_may_not_be_wildcards() {
        assert!(validate_subject(&or("user:alice")).is_ok());
        assert!(validate_subject(&or("user:*")).is_err());
    }

    #[test]
    fn dispatch_resources_must_name_a_relation() {
        assert!(validate_resource(&or("resource:r1#view")).is_ok());
        assert!(validate_resource(&or("resource:r1")).is_err());
        assert!(validate_resource(&or("resource:*#view")).is_err());
    }
}
