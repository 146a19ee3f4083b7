//! The reachability graph: the reverse index behind LookupResources.
//!
//! For a target relation, the graph answers "given something holding a
//! position in the relationship graph (a terminal subject, or an object
//! whose relation was just proven reachable), which single hops can carry
//! it toward the target?". Each hop is an [`Entrypoint`]; the dispatch
//! engine walks hops breadth-first from the queried subject, so traversal
//! is driven by stored data and terminates on cyclic schemas once no new
//! objects are discovered.
//!
//! An entrypoint is DIRECT when every ancestor operation in its rewrite is
//! a union: reaching the target through direct hops alone proves
//! membership. A hop beneath an intersection or exclusion is CONDITIONAL,
//! and candidates carrying it must be confirmed with a positive check.
//! The subtracted operand of an exclusion contributes no entrypoints; it
//! can never grant.

use std::collections::{BTreeSet, HashMap};

use crate::error::CoreResult;
use crate::schema::types::{ChildKind, RelationDef, SetOperation, UsersetRewrite};
use crate::schema::Schema;

/// How a hop lands in its target relation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EntrypointKind {
    /// A stored edge: reverse-query `target_relation` for the subject.
    Relation,
    /// A rewrite on the same object: whoever reaches the source relation
    /// reaches `target_relation` with no query.
    ComputedUserset,
    /// A tupleset walk: reverse-query `tupleset_relation` for the
    /// intermediate object, landing in `target_relation` on each result.
    TuplesetToUserset,
}

/// Whether reaching the target through this hop alone proves membership.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ResultStatus {
    /// All-union ancestry: reachability is membership.
    DirectOperationResult,
    /// Beneath an intersection or exclusion: verify with a check.
    ReachableConditionalResult,
}

/// One hop toward the target relation.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Entrypoint {
    pub kind: EntrypointKind,
    /// The relation this hop lands in.
    pub target_namespace: String,
    pub target_relation: String,
    pub result_status: ResultStatus,
    /// The relation to reverse-query for
    /// [`EntrypointKind::TuplesetToUserset`] hops.
    pub tupleset_relation: Option<String>,
}

/// Every hop on any path into one target relation, keyed by the position
/// the hop departs from: `namespace` for terminal subjects and wildcards,
/// `namespace#relation` for usersets and proven intermediate objects.
#[derive(Debug, Default)]
pub struct ReachabilityGraph {
    entrypoints: HashMap<String, Vec<Entrypoint>>,
}

impl ReachabilityGraph {
    /// Walks backwards from the target, visiting each contributing
    /// relation's definition once.
    pub fn build(schema: &Schema, namespace: &str, relation: &str) -> CoreResult<Self> {
        let mut graph = ReachabilityGraph::default();
        let mut queue = vec![(namespace.to_string(), relation.to_string())];
        let mut visited = BTreeSet::new();

        while let Some((ns, rel)) = queue.pop() {
            if !visited.insert((ns.clone(), rel.clone())) {
                continue;
            }
            let def = schema.relation(&ns, &rel)?.clone();
            match &def.rewrite {
                None => graph.add_data_relation(&ns, &rel, &def, &mut queue),
                Some(rewrite) => graph.add_rewrite(
                    schema,
                    &ns,
                    &rel,
                    &def,
                    rewrite,
                    ResultStatus::DirectOperationResult,
                    &mut queue,
                )?,
            }
        }
        Ok(graph)
    }

    /// Hops departing from the given position; empty when nothing at that
    /// position can move toward the target.
    pub fn entrypoints_for(&self, subject_key: &str) -> &[Entrypoint] {
        self.entrypoints
            .get(subject_key)
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }

    /// All departure keys with at least one hop.
    pub fn subject_keys(&self) -> impl Iterator<Item = &str> {
        self.entrypoints.keys().map(String::as_str)
    }

    fn insert(&mut self, key: String, entrypoint: Entrypoint) {
        let slot = self.entrypoints.entry(key).or_default();
        if !slot.contains(&entrypoint) {
            slot.push(entrypoint);
        }
    }

    fn add_data_relation(
        &mut self,
        namespace: &str,
        relation: &str,
        def: &RelationDef,
        queue: &mut Vec<(String, String)>,
    ) {
        for allowed in &def.type_information {
            self.insert(
                allowed.subject_key(),
                Entrypoint {
                    kind: EntrypointKind::Relation,
                    target_namespace: namespace.to_string(),
                    target_relation: relation.to_string(),
                    result_status: ResultStatus::DirectOperationResult,
                    tupleset_relation: None,
                },
            );
            if let Some(subject_relation) = &allowed.relation {
                queue.push((allowed.namespace.clone(), subject_relation.clone()));
            }
        }
    }

    #[allow(clippy::too_many_arguments)]
    fn add_rewrite(
        &mut self,
        schema: &Schema,
        namespace: &str,
        relation: &str,
        def: &RelationDef,
        rewrite: &UsersetRewrite,
        status: ResultStatus,
        queue: &mut Vec<(String, String)>,
    ) -> CoreResult<()> {
        for (index, child) in rewrite.children.iter().enumerate() {
            let child_status = match rewrite.operation {
                SetOperation::Union => status,
                SetOperation::Intersection => ResultStatus::ReachableConditionalResult,
                SetOperation::Exclusion => {
                    if index > 0 {
                        break; // the subtracted side never grants
                    }
                    ResultStatus::ReachableConditionalResult
                }
            };

            match &child.kind {
                ChildKind::This => {
                    for allowed in &def.type_information {
                        self.insert(
                            allowed.subject_key(),
                            Entrypoint {
                                kind: EntrypointKind::Relation,
                                target_namespace: namespace.to_string(),
                                target_relation: relation.to_string(),
                                result_status: child_status,
                                tupleset_relation: None,
                            },
                        );
                        if let Some(subject_relation) = &allowed.relation {
                            queue.push((allowed.namespace.clone(), subject_relation.clone()));
                        }
                    }
                }
                ChildKind::ComputedUserset { relation: source } => {
                    self.insert(
                        format!("{namespace}#{source}"),
                        Entrypoint {
                            kind: EntrypointKind::ComputedUserset,
                            target_namespace: namespace.to_string(),
                            target_relation: relation.to_string(),
                            result_status: child_status,
                            tupleset_relation: None,
                        },
                    );
                    queue.push((namespace.to_string(), source.clone()));
                }
                ChildKind::TupleToUserset {
                    tupleset,
                    computed_relation,
                } => {
                    let tupleset_def = schema.relation(namespace, tupleset)?;
                    for allowed in &tupleset_def.type_information {
                        if allowed.relation.is_some() {
                            continue;
                        }
                        let Ok(ns_def) = schema.namespace(&allowed.namespace) else {
                            continue;
                        };
                        if ns_def.relation(computed_relation).is_none() {
                            continue;
                        }
                        self.insert(
                            format!("{}#{computed_relation}", allowed.namespace),
                            Entrypoint {
                                kind: EntrypointKind::TuplesetToUserset,
                                target_namespace: namespace.to_string(),
                                target_relation: relation.to_string(),
                                result_status: child_status,
                                tupleset_relation: Some(tupleset.clone()),
                            },
                        );
                        queue.push((allowed.namespace.clone(), computed_relation.clone()));
                    }
                }
                ChildKind::Rewrite(nested) => {
                    self.add_rewrite(schema, namespace, relation, def, nested, child_status, queue)?;
                }
                ChildKind::Nil => {}
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::{
        AllowedRelation, ChildKind, NamespaceDefinition, RelationDef, UsersetRewrite,
    };

    fn compile(namespaces: Vec<NamespaceDefinition>) -> Schema {
        Schema::compile(namespaces, vec![]).unwrap()
    }

    fn document_schema() -> Schema {
        compile(vec![
            NamespaceDefinition::new("user", vec![]),
            NamespaceDefinition::new(
                "organization",
                vec![RelationDef::direct(
                    "admin",
                    vec![AllowedRelation::terminal("user")],
                )],
            ),
            NamespaceDefinition::new(
                "resource",
                vec![
                    RelationDef::direct("org", vec![AllowedRelation::terminal("organization")]),
                    RelationDef::direct("viewer", vec![AllowedRelation::terminal("user")]),
                    RelationDef::direct("owner", vec![AllowedRelation::terminal("user")]),
                    RelationDef::direct("banned", vec![AllowedRelation::terminal("user")]),
                    RelationDef::permission(
                        "view",
                        UsersetRewrite::union(vec![
                            ChildKind::computed("viewer"),
                            ChildKind::computed("owner"),
                            ChildKind::tuple_to_userset("org", "admin"),
                        ]),
                    ),
                    RelationDef::permission(
                        "restricted_view",
                        UsersetRewrite::exclusion(
                            ChildKind::computed("viewer"),
                            ChildKind::computed("banned"),
                        ),
                    ),
                ],
            ),
        ])
    }

    #[test]
    fn union_permission_exposes_all_hops() {
        let schema = document_schema();
        let graph = schema.reachability_graph("resource", "view").unwrap();

        // A terminal user can step onto viewer, owner or organization#admin.
        let from_user: Vec<_> = graph
            .entrypoints_for("user")
            .iter()
            .map(|e| (e.kind, e.target_relation.as_str()))
            .collect();
        assert!(from_user.contains(&(EntrypointKind::Relation, "viewer")));
        assert!(from_user.contains(&(EntrypointKind::Relation, "owner")));
        assert!(from_user.contains(&(EntrypointKind::Relation, "admin")));

        // A proven viewer steps into view with no query.
        let from_viewer = graph.entrypoints_for("resource#viewer");
        assert_eq!(from_viewer.len(), 1);
        assert_eq!(from_viewer[0].kind, EntrypointKind::ComputedUserset);
        assert_eq!(from_viewer[0].target_relation, "view");
        assert_eq!(
            from_viewer[0].result_status,
            ResultStatus::DirectOperationResult
        );

        // A proven org admin walks the tupleset into view.
        let from_admin = graph.entrypoints_for("organization#admin");
        assert_eq!(from_admin.len(), 1);
        assert_eq!(from_admin[0].kind, EntrypointKind::TuplesetToUserset);
        assert_eq!(from_admin[0].target_relation, "view");
        assert_eq!(from_admin[0].tupleset_relation.as_deref(), Some("org"));
    }

    #[test]
    fn exclusion_base_is_conditional_and_subtract_is_absent() {
        let schema = document_schema();
        let graph = schema
            .reachability_graph("resource", "restricted_view")
            .unwrap();

        let from_viewer = graph.entrypoints_for("resource#viewer");
        assert_eq!(from_viewer.len(), 1);
        assert_eq!(
            from_viewer[0].result_status,
            ResultStatus::ReachableConditionalResult
        );

        // The subtracted operand contributes nothing.
        assert!(graph.entrypoints_for("resource#banned").is_empty());
    }

    #[test]
    fn intersection_children_are_conditional() {
        let schema = compile(vec![
            NamespaceDefinition::new("user", vec![]),
            NamespaceDefinition::new(
                "thing",
                vec![
                    RelationDef::direct("viewer", vec![AllowedRelation::terminal("user")]),
                    RelationDef::direct("editor", vec![AllowedRelation::terminal("user")]),
                    RelationDef::permission(
                        "view_and_edit",
                        UsersetRewrite::intersection(vec![
                            ChildKind::computed("viewer"),
                            ChildKind::computed("editor"),
                        ]),
                    ),
                ],
            ),
        ]);
        let graph = schema.reachability_graph("thing", "view_and_edit").unwrap();

        for key in ["thing#viewer", "thing#editor"] {
            let hops = graph.entrypoints_for(key);
            assert_eq!(hops.len(), 1);
            assert_eq!(
                hops[0].result_status,
                ResultStatus::ReachableConditionalResult
            );
        }
        // The hops onto viewer and editor themselves are plain data hops.
        assert_eq!(graph.entrypoints_for("user").len(), 2);
    }

    #[test]
    fn userset_subjects_schedule_their_relation() {
        let schema = compile(vec![
            NamespaceDefinition::new("user", vec![]),
            NamespaceDefinition::new(
                "group",
                vec![RelationDef::direct(
                    "member",
                    vec![AllowedRelation::terminal("user")],
                )],
            ),
            NamespaceDefinition::new(
                "doc",
                vec![RelationDef::direct(
                    "viewer",
                    vec![AllowedRelation::userset("group", "member")],
                )],
            ),
        ]);
        let graph = schema.reachability_graph("doc", "viewer").unwrap();

        // The userset itself lands on viewer; users land on member first.
        assert_eq!(graph.entrypoints_for("group#member").len(), 1);
        let from_user = graph.entrypoints_for("user");
        assert_eq!(from_user.len(), 1);
        assert_eq!(from_user[0].target_relation, "member");
    }

    #[test]
    fn recursive_schemas_terminate() {
        let schema = compile(vec![
            NamespaceDefinition::new("user", vec![]),
            NamespaceDefinition::new(
                "folder",
                vec![
                    RelationDef::direct("parent", vec![AllowedRelation::terminal("folder")]),
                    RelationDef::direct("viewer", vec![AllowedRelation::terminal("user")]),
                    RelationDef::permission(
                        "view",
                        UsersetRewrite::union(vec![
                            ChildKind::computed("viewer"),
                            ChildKind::tuple_to_userset("parent", "view"),
                        ]),
                    ),
                ],
            ),
        ]);
        let graph = schema.reachability_graph("folder", "view").unwrap();

        assert!(!graph.entrypoints_for("user").is_empty());
        // A folder with a proven view hops through its children's parent
        // edges back into view.
        let from_view = graph.entrypoints_for("folder#view");
        assert_eq!(from_view.len(), 1);
        assert_eq!(from_view[0].kind, EntrypointKind::TuplesetToUserset);
        assert_eq!(from_view[0].tupleset_relation.as_deref(), Some("parent"));
    }

    #[test]
    fn wildcard_entries_key_by_namespace() {
        let schema = compile(vec![
            NamespaceDefinition::new("user", vec![]),
            NamespaceDefinition::new(
                "doc",
                vec![RelationDef::direct(
                    "viewer",
                    vec![
                        AllowedRelation::terminal("user"),
                        AllowedRelation::wildcard("user"),
                    ],
                )],
            ),
        ]);
        let graph = schema.reachability_graph("doc", "viewer").unwrap();
        // Terminal and wildcard entries share the bare-namespace key.
        assert_eq!(graph.entrypoints_for("user").len(), 1);
    }

    #[test]
    fn nil_contributes_no_entrypoints() {
        let schema = compile(vec![
            NamespaceDefinition::new("user", vec![]),
            NamespaceDefinition::new(
                "thing",
                vec![RelationDef::permission(
                    "empty",
                    UsersetRewrite::union(vec![ChildKind::Nil]),
                )],
            ),
        ]);
        let graph = schema.reachability_graph("thing", "empty").unwrap();
        assert_eq!(graph.subject_keys().count(), 0);
    }
}
