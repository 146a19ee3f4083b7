//! The Expand resolver.
//!
//! Materializes the rewrite tree beneath a relation, with leaves holding
//! the concrete subject sets stored on data relations. Userset subjects
//! are reported as-is in leaves; tuple_to_userset children expand through
//! their intermediate objects.

use futures::future::BoxFuture;
use unguja_core::schema::{ChildKind, SetOperation, UsersetRewrite};
use unguja_core::ObjectAndRelation;
use unguja_storage::RelationshipFilter;

use crate::error::{DispatchError, DispatchResult};
use crate::types::{ExpandNode, ExpandSubject};

use super::{collect_edges, ResolveCtx};

pub(crate) fn expand_internal(
    ctx: ResolveCtx,
    resource: ObjectAndRelation,
    depth: u32,
) -> BoxFuture<'static, DispatchResult<ExpandNode>> {
    Box::pin(async move {
        ctx.scope.count_dispatch();
        if depth == 0 {
            return Err(DispatchError::ExhaustedDepth);
        }
        ctx.scope.record_depth(ctx.used_depth(depth));

        let def = ctx
            .inner
            .schema
            .relation(&resource.namespace, &resource.relation)?
            .clone();
        match &def.rewrite {
            None => expand_direct(&ctx, &resource).await,
            Some(rewrite) => expand_rewrite(&ctx, &resource, rewrite, depth).await,
        }
    })
}

async fn expand_direct(
    ctx: &ResolveCtx,
    resource: &ObjectAndRelation,
) -> DispatchResult<ExpandNode> {
    let edges = collect_edges(
        &ctx.inner,
        RelationshipFilter::for_resource(
            resource.namespace.clone(),
            resource.object_id.clone(),
            resource.relation.clone(),
        ),
    )
    .await?;

    let subjects = edges
        .into_iter()
        .map(|edge| ExpandSubject {
            subject: edge.subject,
            caveat: edge.caveat,
        })
        .collect();
    Ok(ExpandNode::Leaf {
        relation: resource.clone(),
        subjects,
    })
}

fn expand_rewrite<'a>(
    ctx: &'a ResolveCtx,
    resource: &'a ObjectAndRelation,
    rewrite: &'a UsersetRewrite,
    depth: u32,
) -> BoxFuture<'a, DispatchResult<ExpandNode>> {
    Box::pin(async move {
        let mut children = Vec::with_capacity(rewrite.children.len());
        for child in &rewrite.children {
            children.push(expand_child(ctx, resource, &child.kind, depth).await?);
        }

        Ok(match rewrite.operation {
            SetOperation::Union => ExpandNode::Union { children },
            SetOperation::Intersection => ExpandNode::Intersection { children },
            SetOperation::Exclusion => {
                let mut iter = children.into_iter();
                let (Some(base), Some(subtract)) = (iter.next(), iter.next()) else {
                    return Err(DispatchError::internal(format!(
                        "exclusion on '{}#{}' does not have exactly two operands",
                        resource.namespace, resource.relation
                    )));
                };
                ExpandNode::Exclusion {
                    base: Box::new(base),
                    subtract: Box::new(subtract),
                }
            }
        })
    })
}

async fn expand_child(
    ctx: &ResolveCtx,
    resource: &ObjectAndRelation,
    child: &ChildKind,
    depth: u32,
) -> DispatchResult<ExpandNode> {
    match child {
        ChildKind::This => expand_direct(ctx, resource).await,
        ChildKind::ComputedUserset { relation } => {
            expand_internal(
                ctx.clone(),
                resource.with_relation(relation.clone()),
                depth - 1,
            )
            .await
        }
        ChildKind::TupleToUserset {
            tupleset,
            computed_relation,
        } => {
            let edges = collect_edges(
                &ctx.inner,
                RelationshipFilter::for_resource(
                    resource.namespace.clone(),
                    resource.object_id.clone(),
                    tupleset.clone(),
                ),
            )
            .await?;

            let mut children = Vec::new();
            for edge in edges {
                if !edge.subject.is_terminal() {
                    continue;
                }
                let Ok(ns_def) = ctx.inner.schema.namespace(&edge.subject.namespace) else {
                    continue;
                };
                if ns_def.relation(computed_relation).is_none() {
                    continue;
                }
                children.push(
                    expand_internal(
                        ctx.clone(),
                        edge.subject.with_relation(computed_relation.clone()),
                        depth - 1,
                    )
                    .await?,
                );
            }
            Ok(ExpandNode::Union { children })
        }
        ChildKind::Rewrite(nested) => expand_rewrite(ctx, resource, nested, depth).await,
        ChildKind::Nil => Ok(ExpandNode::Union {
            children: Vec::new(),
        }),
    }
}
