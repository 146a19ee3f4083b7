//! The Check resolver.
//!
//! Recursively resolves whether a subject is in the extension of a
//! relation, walking stored edges for data relations and set-operation
//! rewrites for permissions. Union children race and the first proven
//! member cancels its siblings; intersections cancel on the first proven
//! non-member; exclusion joins both operands and folds certainty.
//!
//! Caveats encountered along the way accumulate into a single expression
//! (union under OR, intersection under AND, exclusion as `base AND NOT
//! subtract`); the engine evaluates that expression against the caller's
//! context after traversal.

use futures::future::BoxFuture;
use futures::stream::{self, StreamExt};
use unguja_core::caveat::CaveatExpression;
use unguja_core::schema::{ChildKind, RelationDef, SetOperation, UsersetRewrite};
use unguja_core::tuple::ContextualizedCaveat;
use unguja_core::ObjectAndRelation;
use unguja_storage::RelationshipFilter;

use crate::cache::{DispatchKey, SingleflightGuard, SingleflightKey, SingleflightSlot};
use crate::error::{DispatchError, DispatchResult};
use crate::types::Permissionship;

use super::{collect_edges, subject_matches, ResolveCtx};

/// One recursive dispatch: depth accounting, cache lookup, single-flight,
/// then the actual resolution.
pub(crate) fn check_internal(
    ctx: ResolveCtx,
    resource: ObjectAndRelation,
    subject: ObjectAndRelation,
    depth: u32,
) -> BoxFuture<'static, DispatchResult<Permissionship>> {
    Box::pin(async move {
        ctx.scope.count_dispatch();
        if depth == 0 {
            return Err(DispatchError::ExhaustedDepth);
        }
        ctx.scope.record_depth(ctx.used_depth(depth));

        let canonical_key = ctx
            .inner
            .schema
            .canonical_key(&resource.namespace, &resource.relation)?;
        let key = DispatchKey {
            canonical_key,
            resource_object_id: resource.object_id.clone(),
            subject: subject.clone(),
            revision: ctx.inner.revision,
        };

        if let Some(hit) = ctx.scope.memoized(&key) {
            ctx.scope.count_cache_hit();
            return Ok(hit);
        }
        if let Some(shared) = &ctx.inner.shared_cache {
            if let Some(hit) = shared.get(&key).await {
                ctx.scope.count_cache_hit();
                ctx.scope.memoize(key, hit.clone());
                return Ok(hit);
            }
        }

        let flight_key = SingleflightKey {
            key: key.clone(),
            depth,
        };
        match ctx.scope.singleflight.acquire(flight_key.clone()) {
            SingleflightSlot::Follower(mut rx) => {
                if let Ok(result) = rx.recv().await {
                    ctx.scope.count_cache_hit();
                    return result;
                }
                // The leader was cancelled before broadcasting; resolve
                // independently rather than failing the follower.
                resolve(&ctx, &resource, &subject, depth).await
            }
            SingleflightSlot::Leader(tx) => {
                let guard = SingleflightGuard::new(&ctx.scope.singleflight, flight_key);
                let result = resolve(&ctx, &resource, &subject, depth).await;
                if let Ok(value) = &result {
                    ctx.scope.memoize(key.clone(), value.clone());
                    if let Some(shared) = &ctx.inner.shared_cache {
                        shared.insert(key, value.clone()).await;
                    }
                }
                let _ = tx.send(result.clone());
                guard.complete();
                result
            }
        }
    })
}

async fn resolve(
    ctx: &ResolveCtx,
    resource: &ObjectAndRelation,
    subject: &ObjectAndRelation,
    depth: u32,
) -> DispatchResult<Permissionship> {
    let def = ctx
        .inner
        .schema
        .relation(&resource.namespace, &resource.relation)?
        .clone();
    match &def.rewrite {
        Some(rewrite) => resolve_rewrite(ctx, resource, subject, &def, rewrite, depth).await,
        None => resolve_direct(ctx, resource, subject, depth).await,
    }
}

/// Direct resolution over stored edges: exact and wildcard matches answer
/// immediately, userset subjects recurse.
async fn resolve_direct(
    ctx: &ResolveCtx,
    resource: &ObjectAndRelation,
    subject: &ObjectAndRelation,
    depth: u32,
) -> DispatchResult<Permissionship> {
    let edges = collect_edges(
        &ctx.inner,
        RelationshipFilter::for_resource(
            resource.namespace.clone(),
            resource.object_id.clone(),
            resource.relation.clone(),
        ),
    )
    .await?;

    let mut caveated: Vec<CaveatExpression> = Vec::new();
    let mut userset_futures = Vec::new();
    for edge in edges {
        if subject_matches(&edge.subject, subject) {
            match edge.caveat {
                None => return Ok(Permissionship::HasPermission),
                Some(caveat) => caveated.push(CaveatExpression::leaf(caveat)),
            }
        } else if !edge.subject.is_terminal() {
            let ctx = ctx.clone();
            let queried = subject.clone();
            let target = edge.subject.clone();
            let edge_caveat = edge.caveat.clone();
            userset_futures.push(async move {
                let result = check_internal(ctx, target, queried, depth - 1).await?;
                Ok::<_, DispatchError>(apply_edge_caveat(result, edge_caveat))
            });
        }
    }

    let fanout = ctx.inner.config.max_dispatch_fanout;
    let mut pending = stream::iter(userset_futures).buffer_unordered(fanout);
    while let Some(result) = pending.next().await {
        match result? {
            Permissionship::HasPermission => return Ok(Permissionship::HasPermission),
            Permissionship::NoPermission => {}
            Permissionship::Conditional(expression) => caveated.push(expression),
        }
    }
    Ok(conditional_union(caveated))
}

fn resolve_rewrite<'a>(
    ctx: &'a ResolveCtx,
    resource: &'a ObjectAndRelation,
    subject: &'a ObjectAndRelation,
    def: &'a RelationDef,
    rewrite: &'a UsersetRewrite,
    depth: u32,
) -> BoxFuture<'a, DispatchResult<Permissionship>> {
    Box::pin(async move {
        match rewrite.operation {
            SetOperation::Union => {
                resolve_union(ctx, resource, subject, def, &rewrite.children, depth).await
            }
            SetOperation::Intersection => {
                resolve_intersection(ctx, resource, subject, def, &rewrite.children, depth).await
            }
            SetOperation::Exclusion => {
                let [base, subtract] = rewrite.children.as_slice() else {
                    return Err(DispatchError::internal(format!(
                        "exclusion on '{}#{}' does not have exactly two operands",
                        resource.namespace, resource.relation
                    )));
                };
                resolve_exclusion(ctx, resource, subject, def, base, subtract, depth).await
            }
        }
    })
}

fn resolve_child<'a>(
    ctx: &'a ResolveCtx,
    resource: &'a ObjectAndRelation,
    subject: &'a ObjectAndRelation,
    def: &'a RelationDef,
    child: &'a ChildKind,
    depth: u32,
) -> BoxFuture<'a, DispatchResult<Permissionship>> {
    Box::pin(async move {
        match child {
            ChildKind::This => resolve_direct(ctx, resource, subject, depth).await,
            ChildKind::ComputedUserset { relation } => {
                check_internal(
                    ctx.clone(),
                    resource.with_relation(relation.clone()),
                    subject.clone(),
                    depth - 1,
                )
                .await
            }
            ChildKind::TupleToUserset {
                tupleset,
                computed_relation,
            } => resolve_tuple_to_userset(ctx, resource, subject, tupleset, computed_relation, depth)
                .await,
            ChildKind::Rewrite(nested) => {
                resolve_rewrite(ctx, resource, subject, def, nested, depth).await
            }
            ChildKind::Nil => Ok(Permissionship::NoPermission),
        }
    })
}

/// Any child proves membership; the first to do so cancels the rest.
async fn resolve_union(
    ctx: &ResolveCtx,
    resource: &ObjectAndRelation,
    subject: &ObjectAndRelation,
    def: &RelationDef,
    children: &[unguja_core::schema::RewriteChild],
    depth: u32,
) -> DispatchResult<Permissionship> {
    let fanout = ctx.inner.config.max_dispatch_fanout;
    let child_futures: Vec<_> = children
        .iter()
        .map(|child| resolve_child(ctx, resource, subject, def, &child.kind, depth))
        .collect();
    let mut pending = stream::iter(child_futures).buffer_unordered(fanout);

    let mut caveated = Vec::new();
    while let Some(result) = pending.next().await {
        match result? {
            Permissionship::HasPermission => return Ok(Permissionship::HasPermission),
            Permissionship::NoPermission => {}
            Permissionship::Conditional(expression) => caveated.push(expression),
        }
    }
    Ok(conditional_union(caveated))
}

/// Every child must prove membership; the first non-member cancels the
/// rest. Conditional children accumulate under AND.
async fn resolve_intersection(
    ctx: &ResolveCtx,
    resource: &ObjectAndRelation,
    subject: &ObjectAndRelation,
    def: &RelationDef,
    children: &[unguja_core::schema::RewriteChild],
    depth: u32,
) -> DispatchResult<Permissionship> {
    let fanout = ctx.inner.config.max_dispatch_fanout;
    let child_futures: Vec<_> = children
        .iter()
        .map(|child| resolve_child(ctx, resource, subject, def, &child.kind, depth))
        .collect();
    let mut pending = stream::iter(child_futures).buffer_unordered(fanout);

    let mut caveated = Vec::new();
    while let Some(result) = pending.next().await {
        match result? {
            Permissionship::NoPermission => return Ok(Permissionship::NoPermission),
            Permissionship::HasPermission => {}
            Permissionship::Conditional(expression) => caveated.push(expression),
        }
    }
    if caveated.is_empty() {
        Ok(Permissionship::HasPermission)
    } else {
        Ok(Permissionship::Conditional(and_all(caveated)))
    }
}

/// `base AND NOT subtract`, evaluated in parallel. An errored operand only
/// propagates when its result is actually needed.
#[allow(clippy::too_many_arguments)]
async fn resolve_exclusion(
    ctx: &ResolveCtx,
    resource: &ObjectAndRelation,
    subject: &ObjectAndRelation,
    def: &RelationDef,
    base: &unguja_core::schema::RewriteChild,
    subtract: &unguja_core::schema::RewriteChild,
    depth: u32,
) -> DispatchResult<Permissionship> {
    let (base_result, subtract_result) = futures::future::join(
        resolve_child(ctx, resource, subject, def, &base.kind, depth),
        resolve_child(ctx, resource, subject, def, &subtract.kind, depth),
    )
    .await;

    use Permissionship::{Conditional, HasPermission, NoPermission};
    match (base_result, subtract_result) {
        (Ok(NoPermission), _) => Ok(NoPermission),
        (_, Ok(HasPermission)) => Ok(NoPermission),
        (Ok(HasPermission), Ok(NoPermission)) => Ok(HasPermission),
        (Ok(HasPermission), Ok(Conditional(sub))) => {
            Ok(Conditional(CaveatExpression::not(sub)))
        }
        (Ok(Conditional(base)), Ok(NoPermission)) => Ok(Conditional(base)),
        (Ok(Conditional(base)), Ok(Conditional(sub))) => Ok(Conditional(
            CaveatExpression::and(vec![base, CaveatExpression::not(sub)]),
        )),
        (Ok(_), Err(e)) => Err(e),
        (Err(e), _) => Err(e),
    }
}

/// Follow the tupleset's edges, then check the computed relation on each
/// intermediate object; any member proves membership.
async fn resolve_tuple_to_userset(
    ctx: &ResolveCtx,
    resource: &ObjectAndRelation,
    subject: &ObjectAndRelation,
    tupleset: &str,
    computed_relation: &str,
    depth: u32,
) -> DispatchResult<Permissionship> {
    let edges = collect_edges(
        &ctx.inner,
        RelationshipFilter::for_resource(
            resource.namespace.clone(),
            resource.object_id.clone(),
            tupleset.to_string(),
        ),
    )
    .await?;

    let mut futures = Vec::new();
    for edge in edges {
        if !edge.subject.is_terminal() {
            continue;
        }
        // Intermediate types lacking the computed relation are skipped, so
        // one tupleset can span heterogeneous namespaces.
        let namespace = &edge.subject.namespace;
        let Ok(ns_def) = ctx.inner.schema.namespace(namespace) else {
            continue;
        };
        if ns_def.relation(computed_relation).is_none() {
            continue;
        }

        let target = edge.subject.with_relation(computed_relation.to_string());
        let ctx = ctx.clone();
        let queried = subject.clone();
        let edge_caveat = edge.caveat.clone();
        futures.push(async move {
            let result = check_internal(ctx, target, queried, depth - 1).await?;
            Ok::<_, DispatchError>(apply_edge_caveat(result, edge_caveat))
        });
    }

    let fanout = ctx.inner.config.max_dispatch_fanout;
    let mut pending = stream::iter(futures).buffer_unordered(fanout);
    let mut caveated = Vec::new();
    while let Some(result) = pending.next().await {
        match result? {
            Permissionship::HasPermission => return Ok(Permissionship::HasPermission),
            Permissionship::NoPermission => {}
            Permissionship::Conditional(expression) => caveated.push(expression),
        }
    }
    Ok(conditional_union(caveated))
}

/// A caveat on the traversed edge gates whatever lies beyond it.
fn apply_edge_caveat(
    result: Permissionship,
    caveat: Option<ContextualizedCaveat>,
) -> Permissionship {
    let Some(caveat) = caveat else {
        return result;
    };
    match result {
        Permissionship::HasPermission => {
            Permissionship::Conditional(CaveatExpression::leaf(caveat))
        }
        Permissionship::NoPermission => Permissionship::NoPermission,
        Permissionship::Conditional(expression) => Permissionship::Conditional(
            CaveatExpression::and(vec![CaveatExpression::leaf(caveat), expression]),
        ),
    }
}

fn conditional_union(mut caveated: Vec<CaveatExpression>) -> Permissionship {
    match caveated.len() {
        0 => Permissionship::NoPermission,
        1 => Permissionship::Conditional(caveated.remove(0)),
        _ => Permissionship::Conditional(CaveatExpression::or(caveated)),
    }
}

fn and_all(mut caveated: Vec<CaveatExpression>) -> CaveatExpression {
    if caveated.len() == 1 {
        caveated.remove(0)
    } else {
        CaveatExpression::and(caveated)
    }
}
