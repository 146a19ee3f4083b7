//! The LookupSubjects resolver.
//!
//! Computes the set of subjects of a requested type holding a relation,
//! by set algebra over the rewrite: union merges, intersection keeps the
//! common members with caveats ANDed, exclusion removes with `AND NOT` on
//! caveated removals. Wildcard grants are tracked separately and carry the
//! subjects excluded from them.

use std::collections::{BTreeMap, BTreeSet};

use futures::future::BoxFuture;
use tokio::sync::mpsc;
use unguja_core::caveat::{and_optional, or_optional, CaveatExpression};
use unguja_core::schema::{ChildKind, SetOperation, UsersetRewrite};
use unguja_core::tuple::WILDCARD;
use unguja_core::ObjectAndRelation;
use unguja_storage::RelationshipFilter;

use crate::error::{DispatchError, DispatchResult};
use crate::types::{LookupSubjectsRequest, ResolvedSubject};

use super::{collect_edges, ResolveCtx};

/// A wildcard grant: every subject of the type except the exclusions.
#[derive(Debug, Clone, Default, PartialEq)]
pub(crate) struct WildcardEntry {
    pub caveat: Option<CaveatExpression>,
    pub exclusions: BTreeSet<String>,
}

/// The working set of subjects for one traversal node. A `None` caveat
/// means the member is unconditional.
#[derive(Debug, Clone, Default, PartialEq)]
pub(crate) struct SubjectSet {
    pub concrete: BTreeMap<String, Option<CaveatExpression>>,
    pub wildcard: Option<WildcardEntry>,
}

impl SubjectSet {
    fn add_concrete(&mut self, id: impl Into<String>, caveat: Option<CaveatExpression>) {
        let id = id.into();
        match self.concrete.remove(&id) {
            Some(existing) => {
                self.concrete.insert(id, or_optional(existing, caveat));
            }
            None => {
                self.concrete.insert(id, caveat);
            }
        }
    }

    fn add_wildcard(&mut self, caveat: Option<CaveatExpression>) {
        match self.wildcard.take() {
            Some(existing) => {
                self.wildcard = Some(WildcardEntry {
                    caveat: or_optional(existing.caveat, caveat),
                    exclusions: existing.exclusions,
                });
            }
            None => {
                self.wildcard = Some(WildcardEntry {
                    caveat,
                    exclusions: BTreeSet::new(),
                });
            }
        }
    }

    /// ANDs a gate caveat onto every member; used when a whole subtree was
    /// reached through a caveated edge.
    fn gated(mut self, gate: Option<CaveatExpression>) -> Self {
        let Some(gate) = gate else {
            return self;
        };
        for caveat in self.concrete.values_mut() {
            *caveat = and_optional(caveat.take(), Some(gate.clone()));
        }
        if let Some(wildcard) = &mut self.wildcard {
            wildcard.caveat = and_optional(wildcard.caveat.take(), Some(gate));
        }
        self
    }

    pub(crate) fn union(mut a: Self, b: Self) -> Self {
        for (id, caveat) in b.concrete {
            a.add_concrete(id, caveat);
        }
        a.wildcard = match (a.wildcard.take(), b.wildcard) {
            (None, w) | (w, None) => w,
            (Some(wa), Some(wb)) => Some(WildcardEntry {
                caveat: or_optional(wa.caveat, wb.caveat),
                // Only subjects excluded from both sides stay excluded.
                exclusions: wa
                    .exclusions
                    .intersection(&wb.exclusions)
                    .cloned()
                    .collect(),
            }),
        };
        a
    }

    pub(crate) fn intersect(a: Self, b: Self) -> Self {
        let mut out = Self::default();
        for (id, a_caveat) in &a.concrete {
            if let Some(b_caveat) = b.concrete.get(id) {
                out.add_concrete(
                    id.clone(),
                    and_optional(a_caveat.clone(), b_caveat.clone()),
                );
            } else if let Some(wb) = &b.wildcard {
                if !wb.exclusions.contains(id) {
                    out.add_concrete(id.clone(), and_optional(a_caveat.clone(), wb.caveat.clone()));
                }
            }
        }
        for (id, b_caveat) in &b.concrete {
            if a.concrete.contains_key(id) {
                continue;
            }
            if let Some(wa) = &a.wildcard {
                if !wa.exclusions.contains(id) {
                    out.add_concrete(id.clone(), and_optional(b_caveat.clone(), wa.caveat.clone()));
                }
            }
        }
        if let (Some(wa), Some(wb)) = (a.wildcard, b.wildcard) {
            out.wildcard = Some(WildcardEntry {
                caveat: and_optional(wa.caveat, wb.caveat),
                exclusions: wa.exclusions.union(&wb.exclusions).cloned().collect(),
            });
        }
        out
    }

    pub(crate) fn subtract(a: Self, b: Self) -> Self {
        let mut out = Self::default();
        for (id, a_caveat) in a.concrete {
            let mut removal: Option<Option<CaveatExpression>> = None;
            if let Some(b_caveat) = b.concrete.get(&id) {
                removal = Some(b_caveat.clone());
            }
            if let Some(wb) = &b.wildcard {
                if !wb.exclusions.contains(&id) {
                    removal = Some(match removal {
                        // Removed by either the concrete entry or the
                        // wildcard; an unconditional leg wins.
                        Some(existing) => or_optional(existing, wb.caveat.clone()),
                        None => wb.caveat.clone(),
                    });
                }
            }
            match removal {
                None => {
                    out.add_concrete(id, a_caveat);
                }
                Some(None) => {} // unconditionally removed
                Some(Some(removal_caveat)) => {
                    out.add_concrete(
                        id,
                        and_optional(a_caveat, Some(CaveatExpression::not(removal_caveat))),
                    );
                }
            }
        }

        if let Some(wa) = a.wildcard {
            match b.wildcard {
                Some(WildcardEntry { caveat: None, .. }) => {
                    // An unconditional wildcard subtraction removes the
                    // wildcard grant entirely.
                }
                Some(WildcardEntry {
                    caveat: Some(b_caveat),
                    ..
                }) => {
                    out.wildcard = Some(WildcardEntry {
                        caveat: and_optional(
                            wa.caveat,
                            Some(CaveatExpression::not(b_caveat)),
                        ),
                        exclusions: wa.exclusions,
                    });
                }
                None => {
                    let mut exclusions = wa.exclusions;
                    // A caveated subtraction excludes conservatively.
                    for id in b.concrete.keys() {
                        exclusions.insert(id.clone());
                    }
                    out.wildcard = Some(WildcardEntry {
                        caveat: wa.caveat,
                        exclusions,
                    });
                }
            }
        }
        out
    }
}

pub(crate) async fn drive(
    ctx: ResolveCtx,
    request: LookupSubjectsRequest,
    depth: u32,
    limit: usize,
    tx: mpsc::Sender<DispatchResult<ResolvedSubject>>,
) -> DispatchResult<()> {
    let set = subjects_internal(
        ctx,
        request.resource.clone(),
        request.subject_type.clone(),
        depth,
    )
    .await?;

    let mut emitted = 0usize;
    if let Some(wildcard) = set.wildcard {
        let resolved = ResolvedSubject {
            subject_id: WILDCARD.to_string(),
            conditional: wildcard.caveat.is_some(),
            excluded_subject_ids: wildcard.exclusions.into_iter().collect(),
        };
        if tx.send(Ok(resolved)).await.is_err() {
            return Ok(());
        }
        emitted += 1;
    }
    for (subject_id, caveat) in set.concrete {
        if emitted >= limit {
            return Ok(());
        }
        let resolved = ResolvedSubject {
            subject_id,
            conditional: caveat.is_some(),
            excluded_subject_ids: Vec::new(),
        };
        if tx.send(Ok(resolved)).await.is_err() {
            return Ok(());
        }
        emitted += 1;
    }
    Ok(())
}

fn subjects_internal(
    ctx: ResolveCtx,
    resource: ObjectAndRelation,
    subject_type: String,
    depth: u32,
) -> BoxFuture<'static, DispatchResult<SubjectSet>> {
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
            None => subjects_direct(&ctx, &resource, &subject_type, depth).await,
            Some(rewrite) => {
                subjects_rewrite(&ctx, &resource, &subject_type, rewrite, depth).await
            }
        }
    })
}

async fn subjects_direct(
    ctx: &ResolveCtx,
    resource: &ObjectAndRelation,
    subject_type: &str,
    depth: u32,
) -> DispatchResult<SubjectSet> {
    let edges = collect_edges(
        &ctx.inner,
        RelationshipFilter::for_resource(
            resource.namespace.clone(),
            resource.object_id.clone(),
            resource.relation.clone(),
        ),
    )
    .await?;

    let mut set = SubjectSet::default();
    for edge in edges {
        let edge_caveat = edge.caveat.clone().map(CaveatExpression::leaf);
        if edge.subject.is_terminal() {
            if edge.subject.namespace != subject_type {
                continue;
            }
            if edge.subject.object_id == WILDCARD {
                set.add_wildcard(edge_caveat);
            } else {
                set.add_concrete(edge.subject.object_id.clone(), edge_caveat);
            }
        } else {
            // A userset subject: everyone in it holds this relation.
            let nested = subjects_internal(
                ctx.clone(),
                edge.subject.clone(),
                subject_type.to_string(),
                depth - 1,
            )
            .await?;
            set = SubjectSet::union(set, nested.gated(edge_caveat));
        }
    }
    Ok(set)
}

fn subjects_rewrite<'a>(
    ctx: &'a ResolveCtx,
    resource: &'a ObjectAndRelation,
    subject_type: &'a str,
    rewrite: &'a UsersetRewrite,
    depth: u32,
) -> BoxFuture<'a, DispatchResult<SubjectSet>> {
    Box::pin(async move {
        let mut children = Vec::with_capacity(rewrite.children.len());
        for child in &rewrite.children {
            children.push(subjects_child(ctx, resource, subject_type, &child.kind, depth).await?);
        }

        Ok(match rewrite.operation {
            SetOperation::Union => children
                .into_iter()
                .fold(SubjectSet::default(), SubjectSet::union),
            SetOperation::Intersection => {
                let mut iter = children.into_iter();
                let first = iter.next().unwrap_or_default();
                iter.fold(first, SubjectSet::intersect)
            }
            SetOperation::Exclusion => {
                let mut iter = children.into_iter();
                let (Some(base), Some(subtract)) = (iter.next(), iter.next()) else {
                    return Err(DispatchError::internal(format!(
                        "exclusion on '{}#{}' does not have exactly two operands",
                        resource.namespace, resource.relation
                    )));
                };
                SubjectSet::subtract(base, subtract)
            }
        })
    })
}

async fn subjects_child(
    ctx: &ResolveCtx,
    resource: &ObjectAndRelation,
    subject_type: &str,
    child: &ChildKind,
    depth: u32,
) -> DispatchResult<SubjectSet> {
    match child {
        ChildKind::This => subjects_direct(ctx, resource, subject_type, depth).await,
        ChildKind::ComputedUserset { relation } => {
            subjects_internal(
                ctx.clone(),
                resource.with_relation(relation.clone()),
                subject_type.to_string(),
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

            let mut set = SubjectSet::default();
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
                let nested = subjects_internal(
                    ctx.clone(),
                    edge.subject.with_relation(computed_relation.clone()),
                    subject_type.to_string(),
                    depth - 1,
                )
                .await?;
                set = SubjectSet::union(
                    set,
                    nested.gated(edge.caveat.clone().map(CaveatExpression::leaf)),
                );
            }
            Ok(set)
        }
        ChildKind::Rewrite(nested) => {
            subjects_rewrite(ctx, resource, subject_type, nested, depth).await
        }
        ChildKind::Nil => Ok(SubjectSet::default()),
    }
}
