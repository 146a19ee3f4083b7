//! Canonical cache keys for relations.
//!
//! A canonical key is a content hash of everything that determines a
//! relation's extension: the sorted allowed subject types of a data
//! relation, or the rewrite structure of a permission with referenced
//! relations contributing their own keys. The permission's own name does
//! not participate, so a renamed-but-identical permission keeps its key and
//! cached dispatch results remain reusable across schema versions.

use std::collections::BTreeMap;
use std::fmt;

use sha2::{Digest, Sha256};

use super::types::{ChildKind, NamespaceDefinition, RelationDef, SetOperation, UsersetRewrite};

/// A stable content hash identifying a relation's extension-producing
/// definition.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct CanonicalKey([u8; 32]);

impl CanonicalKey {
    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }
}

impl fmt::Display for CanonicalKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for byte in &self.0 {
            write!(f, "{byte:02x}")?;
        }
        Ok(())
    }
}

/// Computes keys for every relation of every namespace.
///
/// Same-namespace computed-userset references are resolved to the
/// referenced relation's key; validation has already guaranteed those
/// references are acyclic among permissions, so the memoized walk is a
/// topological iteration.
pub(crate) fn compute_keys(
    namespaces: &BTreeMap<String, NamespaceDefinition>,
) -> BTreeMap<(String, String), CanonicalKey> {
    let mut keys = BTreeMap::new();
    for (ns_name, namespace) in namespaces {
        for relation in &namespace.relations {
            key_for(namespace, relation, &mut keys);
            debug_assert!(keys.contains_key(&(ns_name.clone(), relation.name.clone())));
        }
    }
    keys
}

fn key_for(
    namespace: &NamespaceDefinition,
    relation: &RelationDef,
    keys: &mut BTreeMap<(String, String), CanonicalKey>,
) -> CanonicalKey {
    let map_key = (namespace.name.clone(), relation.name.clone());
    if let Some(existing) = keys.get(&map_key) {
        return *existing;
    }

    let mut hasher = Sha256::new();
    match &relation.rewrite {
        None => {
            hasher.update(b"data\0");
            hasher.update(namespace.name.as_bytes());
            hasher.update(b"\0");
            hasher.update(relation.name.as_bytes());
            let mut allowed = relation.type_information.clone();
            allowed.sort();
            for entry in allowed {
                hasher.update(b"\0allowed\0");
                hasher.update(entry.subject_key().as_bytes());
                hasher.update(if entry.wildcard { b"\0*" } else { b"\0." });
                if let Some(caveat) = &entry.required_caveat {
                    hasher.update(b"\0with\0");
                    hasher.update(caveat.as_bytes());
                }
            }
        }
        Some(rewrite) => {
            hasher.update(b"perm\0");
            hash_rewrite(namespace, relation, rewrite, keys, &mut hasher);
        }
    }

    let key = CanonicalKey(hasher.finalize().into());
    keys.insert(map_key, key);
    key
}

fn hash_rewrite(
    namespace: &NamespaceDefinition,
    relation: &RelationDef,
    rewrite: &UsersetRewrite,
    keys: &mut BTreeMap<(String, String), CanonicalKey>,
    hasher: &mut Sha256,
) {
    hasher.update(match rewrite.operation {
        SetOperation::Union => b"u(",
        SetOperation::Intersection => b"i(",
        SetOperation::Exclusion => b"e(",
    });
    for child in &rewrite.children {
        match &child.kind {
            ChildKind::This => {
                // The direct edges of the enclosing relation.
                hasher.update(b"this\0");
                hasher.update(namespace.name.as_bytes());
                hasher.update(b"\0");
                hasher.update(relation.name.as_bytes());
            }
            ChildKind::ComputedUserset { relation: target } => {
                hasher.update(b"cu\0");
                match namespace.relation(target) {
                    Some(target_def) => {
                        let key = key_for(namespace, target_def, keys);
                        hasher.update(key.as_bytes());
                    }
                    None => hasher.update(target.as_bytes()),
                }
            }
            ChildKind::TupleToUserset {
                tupleset,
                computed_relation,
            } => {
                // Crosses to other objects; names are the stable identity.
                hasher.update(b"ttu\0");
                hasher.update(namespace.name.as_bytes());
                hasher.update(b"\0");
                hasher.update(tupleset.as_bytes());
                hasher.update(b"\0");
                hasher.update(computed_relation.as_bytes());
            }
            ChildKind::Rewrite(nested) => {
                hash_rewrite(namespace, relation, nested, keys, hasher);
            }
            ChildKind::Nil => hasher.update(b"nil\0"),
        }
        hasher.update(b",");
    }
    hasher.update(b")");
}
