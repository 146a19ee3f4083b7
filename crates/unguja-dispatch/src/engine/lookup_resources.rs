//! The LookupResources / ReachableResources resolver.
//!
//! A breadth-first walk over the reachability graph, starting from the
//! queried subject. Each frontier item is a proven position: the subject
//! itself, or an object whose relation was reached on the way to the
//! target. The item's entrypoints are processed concurrently:
//!
//! - RELATION hops reverse-query the landing relation's stored edges for
//!   the item (and the type wildcard, for terminal subjects).
//! - COMPUTED_USERSET hops promote the item to another relation of the
//!   same object with no query.
//! - TUPLESET_TO_USERSET hops reverse-query the tupleset's edges for the
//!   intermediate object, landing on each mapped resource.
//!
//! Positions are visited once, so cyclic schemas and cyclic data both
//! terminate; depth bounds the hop count of any single path. Whenever a
//! discovered position matches the lookup target, its object id is
//! emitted: deduplicated, capped by the limit, and in verified mode
//! confirmed with a positive check when the path crossed a conditional
//! hop. Dropping the consumer tears the walk down.

use std::collections::{HashSet, VecDeque};

use futures::stream::{self, StreamExt};
use tokio::sync::mpsc;
use unguja_core::reachability::{Entrypoint, EntrypointKind, ResultStatus};
use unguja_core::tuple::WILDCARD;
use unguja_core::ObjectAndRelation;
use unguja_storage::SubjectsFilter;

use crate::error::{DispatchError, DispatchResult};
use crate::types::{LookupResourcesRequest, Permissionship, ResolvedResource};

use super::check::check_internal;
use super::{collect_reverse_edges, evaluate_outcome, ResolveCtx};

/// Whether conditionally-reachable candidates are confirmed with a check.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum LookupMode {
    /// Confirm before emitting; no false positives.
    Verified,
    /// Emit as conditional without confirming; may overreport.
    Reachable,
}

/// A position proven reachable from the subject.
#[derive(Debug, Clone)]
struct FrontierItem {
    position: ObjectAndRelation,
    /// An edge on the path carried a caveat.
    caveated: bool,
    /// The path crossed a conditional hop; membership must be confirmed.
    requires_check: bool,
    /// Remaining hop budget.
    depth: u32,
}

pub(crate) async fn drive(
    ctx: ResolveCtx,
    request: LookupResourcesRequest,
    mode: LookupMode,
    depth: u32,
    tx: mpsc::Sender<DispatchResult<ResolvedResource>>,
) -> DispatchResult<()> {
    ctx.inner
        .schema
        .relation(&request.resource_type, &request.permission)?;
    let graph = ctx
        .inner
        .schema
        .reachability_graph(&request.resource_type, &request.permission)?;

    let limit = request
        .limit
        .unwrap_or(ctx.inner.config.default_limit)
        .max(1) as usize;
    let fanout = ctx.inner.config.max_dispatch_fanout;

    let mut frontier = VecDeque::new();
    let mut visited: HashSet<ObjectAndRelation> = HashSet::new();
    let mut emitted: HashSet<String> = HashSet::new();

    visited.insert(request.subject.clone());
    frontier.push_back(FrontierItem {
        position: request.subject.clone(),
        caveated: false,
        requires_check: false,
        depth,
    });

    while let Some(item) = frontier.pop_front() {
        ctx.scope.count_dispatch();
        if item.depth == 0 {
            return Err(DispatchError::ExhaustedDepth);
        }
        ctx.scope.record_depth(ctx.used_depth(item.depth));

        let entrypoints = graph.entrypoints_for(&item.position.subject_key()).to_vec();
        if entrypoints.is_empty() {
            continue;
        }

        // All hops of one frontier item run concurrently.
        let mut hops = stream::iter(
            entrypoints
                .into_iter()
                .map(|ep| process_entrypoint(&ctx, &item, ep)),
        )
        .buffer_unordered(fanout);

        while let Some(found) = hops.next().await {
            for next in found? {
                if !visited.insert(next.position.clone()) {
                    continue;
                }

                if next.position.namespace == request.resource_type
                    && next.position.relation == request.permission
                {
                    let resolved =
                        resolve_candidate(&ctx, &request, mode, &next, depth).await?;
                    if let Some(resolved) = resolved {
                        if emitted.insert(resolved.resource_id.clone()) {
                            if tx.send(Ok(resolved)).await.is_err() {
                                return Ok(()); // consumer went away
                            }
                            if emitted.len() >= limit {
                                return Ok(());
                            }
                        }
                    }
                }
                frontier.push_back(next);
            }
        }
    }
    Ok(())
}

async fn resolve_candidate(
    ctx: &ResolveCtx,
    request: &LookupResourcesRequest,
    mode: LookupMode,
    item: &FrontierItem,
    depth: u32,
) -> DispatchResult<Option<ResolvedResource>> {
    let resource_id = item.position.object_id.clone();
    match mode {
        LookupMode::Reachable => Ok(Some(ResolvedResource {
            resource_id,
            conditional: item.caveated || item.requires_check,
        })),
        LookupMode::Verified => {
            if item.requires_check {
                let outcome = check_internal(
                    ctx.clone(),
                    item.position.clone(),
                    request.subject.clone(),
                    depth,
                )
                .await?;
                match evaluate_outcome(&ctx.inner, outcome, &request.context)? {
                    Permissionship::HasPermission => Ok(Some(ResolvedResource {
                        resource_id,
                        conditional: false,
                    })),
                    Permissionship::Conditional(_) => Ok(Some(ResolvedResource {
                        resource_id,
                        conditional: true,
                    })),
                    Permissionship::NoPermission => Ok(None),
                }
            } else {
                Ok(Some(ResolvedResource {
                    resource_id,
                    conditional: item.caveated,
                }))
            }
        }
    }
}

/// Executes one hop for one frontier item, returning the new positions.
async fn process_entrypoint(
    ctx: &ResolveCtx,
    item: &FrontierItem,
    entrypoint: Entrypoint,
) -> DispatchResult<Vec<FrontierItem>> {
    let conditional = entrypoint.result_status == ResultStatus::ReachableConditionalResult;
    match entrypoint.kind {
        EntrypointKind::ComputedUserset => Ok(vec![FrontierItem {
            position: ObjectAndRelation {
                namespace: entrypoint.target_namespace,
                object_id: item.position.object_id.clone(),
                relation: entrypoint.target_relation,
            },
            caveated: item.caveated,
            requires_check: item.requires_check || conditional,
            depth: item.depth - 1,
        }]),

        EntrypointKind::Relation => {
            let mut subject_ids = vec![item.position.object_id.clone()];
            if item.position.is_terminal() {
                subject_ids.push(WILDCARD.to_string());
            }
            let filter = SubjectsFilter {
                subject_type: item.position.namespace.clone(),
                subject_ids,
                subject_relation: if item.position.is_terminal() {
                    None
                } else {
                    Some(item.position.relation.clone())
                },
                resource_type: Some(entrypoint.target_namespace.clone()),
                resource_relation: Some(entrypoint.target_relation.clone()),
            };
            let edges = collect_reverse_edges(&ctx.inner, filter).await?;
            Ok(edges
                .into_iter()
                .map(|edge| FrontierItem {
                    position: edge.resource,
                    caveated: item.caveated || edge.caveat.is_some(),
                    requires_check: item.requires_check || conditional,
                    depth: item.depth - 1,
                })
                .collect())
        }

        EntrypointKind::TuplesetToUserset => {
            let Some(tupleset) = entrypoint.tupleset_relation else {
                return Err(DispatchError::internal(
                    "tupleset entrypoint without a tupleset relation",
                ));
            };
            let filter = SubjectsFilter {
                subject_type: item.position.namespace.clone(),
                subject_ids: vec![item.position.object_id.clone()],
                subject_relation: None,
                resource_type: Some(entrypoint.target_namespace.clone()),
                resource_relation: Some(tupleset),
            };
            let edges = collect_reverse_edges(&ctx.inner, filter).await?;
            let target_relation = entrypoint.target_relation;
            Ok(edges
                .into_iter()
                .map(|edge| FrontierItem {
                    position: edge.resource.with_relation(target_relation.clone()),
                    caveated: item.caveated || edge.caveat.is_some(),
                    requires_check: item.requires_check || conditional,
                    depth: item.depth - 1,
                })
                .collect())
        }
    }
}
