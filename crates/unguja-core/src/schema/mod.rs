//! The compiled, immutable schema handle.
//!
//! `Schema::compile` validates a set of definitions, assigns operation
//! paths, computes canonical keys, and produces a handle that is shared
//! across requests behind an `Arc`. All lookups are by name; rewrite
//! children never hold cross-relation pointers, only names resolved
//! through this index.

mod canonical;
pub mod types;
mod validation;

use std::collections::BTreeMap;
use std::sync::Arc;

use dashmap::DashMap;

use crate::error::{CoreError, CoreResult};
use crate::reachability::ReachabilityGraph;
use crate::tuple::RelationTuple;

pub use canonical::CanonicalKey;
pub use types::{
    AllowedRelation, CaveatDefinition, CaveatParameterType, ChildKind, NamespaceDefinition,
    RelationDef, RewriteChild, SetOperation, UsersetRewrite,
};

/// A compiled schema: namespaces, relations, caveats, canonical keys, and
/// a cache of reachability graphs.
///
/// Immutable once compiled; the dispatch engine never mutates it.
#[derive(Debug)]
pub struct Schema {
    namespaces: BTreeMap<String, Arc<NamespaceDefinition>>,
    caveats: BTreeMap<String, Arc<CaveatDefinition>>,
    canonical_keys: BTreeMap<(String, String), CanonicalKey>,
    /// Reachability graphs keyed by the target relation's canonical key, so
    /// semantically identical relations share a graph.
    reachability: DashMap<CanonicalKey, Arc<ReachabilityGraph>>,
}

impl Schema {
    /// Validates and compiles a set of definitions.
    pub fn compile(
        namespaces: Vec<NamespaceDefinition>,
        caveats: Vec<CaveatDefinition>,
    ) -> CoreResult<Self> {
        let mut ns_map = BTreeMap::new();
        for mut namespace in namespaces {
            for relation in &mut namespace.relations {
                if let Some(rewrite) = &mut relation.rewrite {
                    rewrite.number_children(&[]);
                }
            }
            let name = namespace.name.clone();
            if ns_map.insert(name.clone(), namespace).is_some() {
                return Err(CoreError::SchemaValidation {
                    message: format!("duplicate namespace '{name}'"),
                });
            }
        }

        let mut caveat_map = BTreeMap::new();
        for caveat in caveats {
            let name = caveat.name.clone();
            if caveat_map.insert(name.clone(), caveat).is_some() {
                return Err(CoreError::SchemaValidation {
                    message: format!("duplicate caveat '{name}'"),
                });
            }
        }

        validation::validate(&ns_map, &caveat_map)?;
        let canonical_keys = canonical::compute_keys(&ns_map);

        Ok(Self {
            namespaces: ns_map
                .into_iter()
                .map(|(name, namespace)| (name, Arc::new(namespace)))
                .collect(),
            caveats: caveat_map
                .into_iter()
                .map(|(name, caveat)| (name, Arc::new(caveat)))
                .collect(),
            canonical_keys,
            reachability: DashMap::new(),
        })
    }

    pub fn namespace(&self, name: &str) -> CoreResult<&Arc<NamespaceDefinition>> {
        self.namespaces
            .get(name)
            .ok_or_else(|| CoreError::NamespaceNotFound {
                namespace: name.to_string(),
            })
    }

    pub fn relation(&self, namespace: &str, relation: &str) -> CoreResult<&RelationDef> {
        self.namespace(namespace)?
            .relation(relation)
            .ok_or_else(|| CoreError::RelationNotFound {
                namespace: namespace.to_string(),
                relation: relation.to_string(),
            })
    }

    pub fn caveat(&self, name: &str) -> CoreResult<&Arc<CaveatDefinition>> {
        self.caveats.get(name).ok_or_else(|| CoreError::CaveatNotFound {
            caveat: name.to_string(),
        })
    }

    pub fn is_permission(&self, namespace: &str, relation: &str) -> CoreResult<bool> {
        Ok(self.relation(namespace, relation)?.is_permission())
    }

    pub fn allowed_direct(&self, namespace: &str, relation: &str) -> CoreResult<&[AllowedRelation]> {
        Ok(&self.relation(namespace, relation)?.type_information)
    }

    /// The relation's stable content hash; equal across schemas iff the
    /// extension-producing definition is identical.
    pub fn canonical_key(&self, namespace: &str, relation: &str) -> CoreResult<CanonicalKey> {
        self.relation(namespace, relation)?;
        Ok(self.canonical_keys[&(namespace.to_string(), relation.to_string())])
    }

    /// The reachability graph for a relation, built on first use and cached
    /// under the relation's canonical key.
    pub fn reachability_graph(
        &self,
        namespace: &str,
        relation: &str,
    ) -> CoreResult<Arc<ReachabilityGraph>> {
        let key = self.canonical_key(namespace, relation)?;
        if let Some(graph) = self.reachability.get(&key) {
            return Ok(Arc::clone(&graph));
        }
        let graph = Arc::new(ReachabilityGraph::build(self, namespace, relation)?);
        self.reachability.insert(key, Arc::clone(&graph));
        Ok(graph)
    }

    pub fn namespace_names(&self) -> impl Iterator<Item = &str> {
        self.namespaces.keys().map(String::as_str)
    }

    pub fn caveat_definitions(&self) -> impl Iterator<Item = &Arc<CaveatDefinition>> {
        self.caveats.values()
    }

    /// Write-time admissibility of an edge against this schema.
    ///
    /// Rejects edges on permissions, subjects not enumerated in the
    /// relation's allowed types, wildcard misuse, and caveat mismatches.
    pub fn validate_tuple(&self, tuple: &RelationTuple) -> CoreResult<()> {
        let inadmissible = |message: String| CoreError::SchemaValidation { message };

        if tuple.resource.is_wildcard() {
            return Err(inadmissible(format!(
                "resource '{}' may not be a wildcard",
                tuple.resource
            )));
        }
        if tuple.subject.is_wildcard() && !tuple.subject.is_terminal() {
            return Err(inadmissible(format!(
                "wildcard subject '{}' may not carry a relation",
                tuple.subject
            )));
        }

        let relation = self.relation(&tuple.resource.namespace, &tuple.resource.relation)?;
        if relation.is_permission() {
            return Err(inadmissible(format!(
                "'{}#{}' is a permission; relationships may only be written to relations",
                tuple.resource.namespace, tuple.resource.relation
            )));
        }

        self.namespace(&tuple.subject.namespace)?;
        if !tuple.subject.is_terminal() {
            self.relation(&tuple.subject.namespace, &tuple.subject.relation)?;
        }
        if let Some(caveat) = &tuple.caveat {
            self.caveat(&caveat.caveat_name)?;
        }

        let caveat_name = tuple.caveat.as_ref().map(|c| c.caveat_name.as_str());
        let matched = relation.type_information.iter().any(|allowed| {
            if allowed.namespace != tuple.subject.namespace {
                return false;
            }
            if allowed.required_caveat.as_deref() != caveat_name {
                return false;
            }
            if tuple.subject.is_wildcard() {
                return allowed.wildcard;
            }
            match &allowed.relation {
                Some(required) => !tuple.subject.is_terminal() && tuple.subject.relation == *required,
                None => tuple.subject.is_terminal() && !allowed.wildcard,
            }
        });

        if !matched {
            return Err(inadmissible(format!(
                "subject '{}' is not an allowed subject type of '{}#{}'",
                tuple.subject, tuple.resource.namespace, tuple.resource.relation
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn document_schema() -> Schema {
        Schema::compile(
            vec![
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
                        RelationDef::direct(
                            "org",
                            vec![AllowedRelation::terminal("organization")],
                        ),
                        RelationDef::direct("viewer", vec![AllowedRelation::terminal("user")]),
                        RelationDef::direct("owner", vec![AllowedRelation::terminal("user")]),
                        RelationDef::permission(
                            "view",
                            UsersetRewrite::union(vec![
                                ChildKind::computed("viewer"),
                                ChildKind::computed("owner"),
                                ChildKind::tuple_to_userset("org", "admin"),
                            ]),
                        ),
                    ],
                ),
            ],
            vec![],
        )
        .unwrap()
    }

    #[test]
    fn lookups_resolve_relations() {
        let schema = document_schema();
        assert!(schema.namespace("resource").is_ok());
        assert!(schema.relation("resource", "view").is_ok());
        assert!(matches!(
            schema.relation("resource", "nope"),
            Err(CoreError::RelationNotFound { .. })
        ));
        assert!(schema.is_permission("resource", "view").unwrap());
        assert!(!schema.is_permission("resource", "viewer").unwrap());
    }

    #[test]
    fn duplicate_relation_names_are_rejected() {
        let result = Schema::compile(
            vec![
                NamespaceDefinition::new("user", vec![]),
                NamespaceDefinition::new(
                    "thing",
                    vec![
                        RelationDef::direct("viewer", vec![AllowedRelation::terminal("user")]),
                        RelationDef::direct("viewer", vec![AllowedRelation::terminal("user")]),
                    ],
                ),
            ],
            vec![],
        );
        assert!(matches!(result, Err(CoreError::SchemaValidation { .. })));
    }

    #[test]
    fn computed_cycles_are_rejected() {
        let result = Schema::compile(
            vec![NamespaceDefinition::new(
                "thing",
                vec![
                    RelationDef::permission(
                        "a",
                        UsersetRewrite::union(vec![ChildKind::computed("b")]),
                    ),
                    RelationDef::permission(
                        "b",
                        UsersetRewrite::union(vec![ChildKind::computed("a")]),
                    ),
                ],
            )],
            vec![],
        );
        assert!(matches!(result, Err(CoreError::SchemaValidation { .. })));
    }

    #[test]
    fn cycles_through_data_relations_are_legal() {
        // folder#parent stores edges, so parent -> view -> parent is bounded
        // by data rather than being a purely computed loop.
        let result = Schema::compile(
            vec![
                NamespaceDefinition::new("user", vec![]),
                NamespaceDefinition::new(
                    "folder",
                    vec![
                        RelationDef::direct(
                            "parent",
                            vec![AllowedRelation::terminal("folder")],
                        ),
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
            ],
            vec![],
        );
        assert!(result.is_ok());
    }

    #[test]
    fn exclusion_requires_exactly_two_operands() {
        let mut rewrite = UsersetRewrite::union(vec![ChildKind::computed("viewer")]);
        rewrite.operation = SetOperation::Exclusion;
        let result = Schema::compile(
            vec![
                NamespaceDefinition::new("user", vec![]),
                NamespaceDefinition::new(
                    "thing",
                    vec![
                        RelationDef::direct("viewer", vec![AllowedRelation::terminal("user")]),
                        RelationDef::permission("view", rewrite),
                    ],
                ),
            ],
            vec![],
        );
        assert!(matches!(result, Err(CoreError::SchemaValidation { .. })));
    }

    #[test]
    fn tupleset_must_be_a_data_relation() {
        let result = Schema::compile(
            vec![
                NamespaceDefinition::new("user", vec![]),
                NamespaceDefinition::new(
                    "thing",
                    vec![
                        RelationDef::direct("viewer", vec![AllowedRelation::terminal("user")]),
                        RelationDef::permission(
                            "indirect",
                            UsersetRewrite::union(vec![ChildKind::computed("viewer")]),
                        ),
                        RelationDef::permission(
                            "view",
                            UsersetRewrite::union(vec![ChildKind::tuple_to_userset(
                                "indirect",
                                "viewer",
                            )]),
                        ),
                    ],
                ),
            ],
            vec![],
        );
        assert!(matches!(result, Err(CoreError::SchemaValidation { .. })));
    }

    #[test]
    fn unknown_relation_references_are_rejected() {
        let result = Schema::compile(
            vec![NamespaceDefinition::new(
                "thing",
                vec![RelationDef::permission(
                    "view",
                    UsersetRewrite::union(vec![ChildKind::computed("missing")]),
                )],
            )],
            vec![],
        );
        assert!(matches!(result, Err(CoreError::SchemaValidation { .. })));
    }

    #[test]
    fn canonical_keys_identify_identical_definitions() {
        let schema_a = document_schema();
        let schema_b = document_schema();
        assert_eq!(
            schema_a.canonical_key("resource", "view").unwrap(),
            schema_b.canonical_key("resource", "view").unwrap()
        );
        assert_ne!(
            schema_a.canonical_key("resource", "view").unwrap(),
            schema_a.canonical_key("resource", "viewer").unwrap()
        );
        assert_ne!(
            schema_a.canonical_key("resource", "viewer").unwrap(),
            schema_a.canonical_key("resource", "owner").unwrap()
        );
    }

    #[test]
    fn canonical_keys_survive_renames() {
        // The permission's own name does not participate in its key.
        let renamed = Schema::compile(
            vec![
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
                        RelationDef::direct(
                            "org",
                            vec![AllowedRelation::terminal("organization")],
                        ),
                        RelationDef::direct("viewer", vec![AllowedRelation::terminal("user")]),
                        RelationDef::direct("owner", vec![AllowedRelation::terminal("user")]),
                        RelationDef::permission(
                            "can_see",
                            UsersetRewrite::union(vec![
                                ChildKind::computed("viewer"),
                                ChildKind::computed("owner"),
                                ChildKind::tuple_to_userset("org", "admin"),
                            ]),
                        ),
                    ],
                ),
            ],
            vec![],
        )
        .unwrap();

        assert_eq!(
            document_schema().canonical_key("resource", "view").unwrap(),
            renamed.canonical_key("resource", "can_see").unwrap()
        );
    }

    #[test]
    fn validate_tuple_enforces_admissibility() {
        let schema = document_schema();

        let ok = RelationTuple::parse("resource:r1#viewer@user:alice").unwrap();
        assert!(schema.validate_tuple(&ok).is_ok());

        // Writes to permissions are rejected.
        let to_permission = RelationTuple::parse("resource:r1#view@user:alice").unwrap();
        assert!(schema.validate_tuple(&to_permission).is_err());

        // Subject type not enumerated.
        let wrong_type = RelationTuple::parse("resource:r1#viewer@organization:o1").unwrap();
        assert!(schema.validate_tuple(&wrong_type).is_err());

        // Wildcards require an explicit wildcard entry.
        let wildcard = RelationTuple::parse("resource:r1#viewer@user:*").unwrap();
        assert!(schema.validate_tuple(&wildcard).is_err());

        // Caveated edge without a caveat-bearing allowed type.
        let caveated = RelationTuple::parse("resource:r1#viewer@user:alice[ip_in_range]").unwrap();
        assert!(schema.validate_tuple(&caveated).is_err());
    }
}
