//! Definitions that make up an authorization schema.
//!
//! These are the pre-compiled inputs to [`Schema::compile`]: namespaces
//! with their relations, set-operation rewrites, and caveat definitions.
//! Schema surface syntax and parsing live outside this crate; callers hand
//! us the structured form.
//!
//! [`Schema::compile`]: crate::schema::Schema::compile

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

/// An object type and the relations defined on it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NamespaceDefinition {
    pub name: String,
    /// Ordered; order is preserved in Expand trees and canonical keys.
    pub relations: Vec<RelationDef>,
}

impl NamespaceDefinition {
    pub fn new(name: impl Into<String>, relations: Vec<RelationDef>) -> Self {
        Self {
            name: name.into(),
            relations,
        }
    }

    pub fn relation(&self, name: &str) -> Option<&RelationDef> {
        self.relations.iter().find(|r| r.name == name)
    }
}

/// A relation on a namespace.
///
/// Without a rewrite this is a *data relation*: relationships are stored
/// directly on it and `type_information` enumerates the admissible subject
/// types. With a rewrite it is a *permission* whose extension is computed.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RelationDef {
    pub name: String,
    #[serde(default)]
    pub type_information: Vec<AllowedRelation>,
    pub rewrite: Option<UsersetRewrite>,
    /// When this relation is a pure alias (`permission x = y`), the name of
    /// the relation it forwards to.
    pub aliasing_relation: Option<String>,
}

impl RelationDef {
    /// A data relation holding stored edges.
    pub fn direct(name: impl Into<String>, type_information: Vec<AllowedRelation>) -> Self {
        Self {
            name: name.into(),
            type_information,
            rewrite: None,
            aliasing_relation: None,
        }
    }

    /// A permission computed from a rewrite.
    pub fn permission(name: impl Into<String>, rewrite: UsersetRewrite) -> Self {
        let aliasing_relation = rewrite.sole_computed_userset().map(str::to_string);
        Self {
            name: name.into(),
            type_information: Vec::new(),
            rewrite: Some(rewrite),
            aliasing_relation,
        }
    }

    pub fn is_permission(&self) -> bool {
        self.rewrite.is_some()
    }
}

/// A subject type admitted on a data relation.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct AllowedRelation {
    pub namespace: String,
    /// `None` for terminal subjects (`user`), `Some` for userset subjects
    /// (`group#member`).
    pub relation: Option<String>,
    /// Whether the wildcard subject `ns:*` is admitted.
    #[serde(default)]
    pub wildcard: bool,
    /// When set, edges of this type must carry the named caveat.
    pub required_caveat: Option<String>,
}

impl AllowedRelation {
    pub fn terminal(namespace: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
            relation: None,
            wildcard: false,
            required_caveat: None,
        }
    }

    pub fn userset(namespace: impl Into<String>, relation: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
            relation: Some(relation.into()),
            wildcard: false,
            required_caveat: None,
        }
    }

    pub fn wildcard(namespace: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
            relation: None,
            wildcard: true,
            required_caveat: None,
        }
    }

    pub fn with_caveat(mut self, caveat: impl Into<String>) -> Self {
        self.required_caveat = Some(caveat.into());
        self
    }

    /// The `namespace` or `namespace#relation` key this entry matches.
    pub fn subject_key(&self) -> String {
        match &self.relation {
            Some(relation) => format!("{}#{}", self.namespace, relation),
            None => self.namespace.clone(),
        }
    }
}

/// The set operation at the root of a rewrite node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SetOperation {
    Union,
    Intersection,
    /// Exactly two operands: the base and the subtracted set.
    Exclusion,
}

/// A set-operation expression over relations of the same object.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UsersetRewrite {
    pub operation: SetOperation,
    pub children: Vec<RewriteChild>,
}

impl UsersetRewrite {
    pub fn union(children: Vec<ChildKind>) -> Self {
        Self::with_operation(SetOperation::Union, children)
    }

    pub fn intersection(children: Vec<ChildKind>) -> Self {
        Self::with_operation(SetOperation::Intersection, children)
    }

    pub fn exclusion(base: ChildKind, subtract: ChildKind) -> Self {
        Self::with_operation(SetOperation::Exclusion, vec![base, subtract])
    }

    fn with_operation(operation: SetOperation, children: Vec<ChildKind>) -> Self {
        Self {
            operation,
            children: children
                .into_iter()
                .map(|kind| RewriteChild {
                    operation_path: Vec::new(),
                    kind,
                })
                .collect(),
        }
    }

    /// When the rewrite is a single computed-userset union (`x = y`), the
    /// aliased relation name.
    pub fn sole_computed_userset(&self) -> Option<&str> {
        match (self.operation, self.children.as_slice()) {
            (SetOperation::Union, [child]) => match &child.kind {
                ChildKind::ComputedUserset { relation } => Some(relation),
                _ => None,
            },
            _ => None,
        }
    }

    /// Assigns `operation_path` values by position, recursively. Called once
    /// during schema compilation.
    pub(crate) fn number_children(&mut self, prefix: &[usize]) {
        for (index, child) in self.children.iter_mut().enumerate() {
            let mut path = prefix.to_vec();
            path.push(index);
            if let ChildKind::Rewrite(nested) = &mut child.kind {
                nested.number_children(&path);
            }
            child.operation_path = path;
        }
    }
}

/// One operand of a rewrite, tagged with its position in the tree.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RewriteChild {
    /// Index path from the rewrite root; unique within a relation.
    pub operation_path: Vec<usize>,
    pub kind: ChildKind,
}

/// The operand variants of a rewrite.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum ChildKind {
    /// The direct relationships stored on the enclosing relation.
    This,
    /// Rewrite to another relation on the same object.
    ComputedUserset { relation: String },
    /// Follow the tupleset relation's edges, then apply `computed_relation`
    /// on each intermediate object.
    TupleToUserset {
        tupleset: String,
        computed_relation: String,
    },
    /// A nested set operation.
    Rewrite(Box<UsersetRewrite>),
    /// The empty set.
    Nil,
}

impl ChildKind {
    pub fn computed(relation: impl Into<String>) -> Self {
        ChildKind::ComputedUserset {
            relation: relation.into(),
        }
    }

    pub fn tuple_to_userset(
        tupleset: impl Into<String>,
        computed_relation: impl Into<String>,
    ) -> Self {
        ChildKind::TupleToUserset {
            tupleset: tupleset.into(),
            computed_relation: computed_relation.into(),
        }
    }

    pub fn nested(rewrite: UsersetRewrite) -> Self {
        ChildKind::Rewrite(Box::new(rewrite))
    }
}

/// The declared type of a caveat parameter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CaveatParameterType {
    String,
    Int,
    Uint,
    Double,
    Bool,
    List,
    Map,
}

/// A named boolean predicate over typed parameters.
///
/// `serialized_expression` is the pre-compiled form stored by the schema
/// writer; this workspace's evaluator treats it as CEL source bytes.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CaveatDefinition {
    pub name: String,
    pub serialized_expression: Vec<u8>,
    pub parameter_types: BTreeMap<String, CaveatParameterType>,
}

impl CaveatDefinition {
    pub fn new(
        name: impl Into<String>,
        expression: impl Into<Vec<u8>>,
        parameter_types: BTreeMap<String, CaveatParameterType>,
    ) -> Self {
        Self {
            name: name.into(),
            serialized_expression: expression.into(),
            parameter_types,
        }
    }
}
