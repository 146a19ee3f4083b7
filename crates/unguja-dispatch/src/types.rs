//! Request and response types for the dispatch operations.

use serde_json::{Map, Value};
use unguja_core::caveat::CaveatExpression;
use unguja_core::tuple::ContextualizedCaveat;
use unguja_core::ObjectAndRelation;

/// The answer to a permission check.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Permissionship {
    HasPermission,
    NoPermission,
    /// Membership depends on a caveat expression the caller must evaluate
    /// with additional context.
    Conditional(CaveatExpression),
}

/// Counters describing the work a dispatch performed.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DispatchMetadata {
    /// Sub-dispatches issued, including the root.
    pub dispatch_count: u64,
    /// Sub-dispatches answered from a cache.
    pub cache_hit_count: u64,
    /// The deepest recursion level the request actually needed.
    pub depth_required: u32,
}

/// A request to check whether `subject` holds `resource.relation` on the
/// resource.
#[derive(Debug, Clone)]
pub struct CheckRequest {
    /// `namespace:object_id#permission` being tested.
    pub resource: ObjectAndRelation,
    pub subject: ObjectAndRelation,
    /// Context for caveat evaluation; merged beneath any context written on
    /// the matched edges.
    pub context: Map<String, Value>,
    /// Depth budget; `None` uses the configured maximum.
    pub depth: Option<u32>,
}

impl CheckRequest {
    pub fn new(resource: ObjectAndRelation, subject: ObjectAndRelation) -> Self {
        Self {
            resource,
            subject,
            context: Map::new(),
            depth: None,
        }
    }

    pub fn with_context(mut self, context: Map<String, Value>) -> Self {
        self.context = context;
        self
    }

    pub fn with_depth(mut self, depth: u32) -> Self {
        self.depth = Some(depth);
        self
    }
}

/// The result of [`CheckRequest`].
#[derive(Debug, Clone)]
pub struct CheckResponse {
    pub permissionship: Permissionship,
    pub metadata: DispatchMetadata,
}

/// A request to materialize the rewrite tree beneath a relation.
#[derive(Debug, Clone)]
pub struct ExpandRequest {
    pub resource: ObjectAndRelation,
    pub depth: Option<u32>,
}

impl ExpandRequest {
    pub fn new(resource: ObjectAndRelation) -> Self {
        Self {
            resource,
            depth: None,
        }
    }
}

/// The result of [`ExpandRequest`].
#[derive(Debug, Clone)]
pub struct ExpandResponse {
    pub tree: ExpandNode,
    pub metadata: DispatchMetadata,
}

/// A subject found at an expansion leaf.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExpandSubject {
    pub subject: ObjectAndRelation,
    pub caveat: Option<ContextualizedCaveat>,
}

/// The materialized rewrite tree: set-operation nodes over concrete
/// subject-set leaves.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExpandNode {
    /// The direct subjects stored on a relation.
    Leaf {
        relation: ObjectAndRelation,
        subjects: Vec<ExpandSubject>,
    },
    Union { children: Vec<ExpandNode> },
    Intersection { children: Vec<ExpandNode> },
    Exclusion {
        base: Box<ExpandNode>,
        subtract: Box<ExpandNode>,
    },
}

impl ExpandNode {
    /// All subjects mentioned anywhere in the tree, for tests and debugging.
    pub fn leaf_subjects(&self) -> Vec<&ExpandSubject> {
        match self {
            ExpandNode::Leaf { subjects, .. } => subjects.iter().collect(),
            ExpandNode::Union { children } | ExpandNode::Intersection { children } => {
                children.iter().flat_map(|c| c.leaf_subjects()).collect()
            }
            ExpandNode::Exclusion { base, subtract } => {
                let mut subjects = base.leaf_subjects();
                subjects.extend(subtract.leaf_subjects());
                subjects
            }
        }
    }
}

/// A request to enumerate resources of a type on which the subject holds a
/// permission.
#[derive(Debug, Clone)]
pub struct LookupResourcesRequest {
    pub resource_type: String,
    pub permission: String,
    pub subject: ObjectAndRelation,
    /// Context for caveat evaluation during verification.
    pub context: Map<String, Value>,
    /// Cap on unique emissions; `None` uses the configured default.
    pub limit: Option<u32>,
    pub depth: Option<u32>,
}

impl LookupResourcesRequest {
    pub fn new(
        resource_type: impl Into<String>,
        permission: impl Into<String>,
        subject: ObjectAndRelation,
    ) -> Self {
        Self {
            resource_type: resource_type.into(),
            permission: permission.into(),
            subject,
            context: Map::new(),
            limit: None,
            depth: None,
        }
    }

    pub fn with_limit(mut self, limit: u32) -> Self {
        self.limit = Some(limit);
        self
    }

    pub fn with_context(mut self, context: Map<String, Value>) -> Self {
        self.context = context;
        self
    }
}

/// One resource produced by a lookup stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedResource {
    pub resource_id: String,
    /// True when membership still depends on caveat context or, for
    /// reachable-resources, on a subsequent positive check.
    pub conditional: bool,
}

/// A request to enumerate subjects of a type holding a permission on a
/// resource.
#[derive(Debug, Clone)]
pub struct LookupSubjectsRequest {
    pub resource: ObjectAndRelation,
    pub subject_type: String,
    pub limit: Option<u32>,
    pub depth: Option<u32>,
}

impl LookupSubjectsRequest {
    pub fn new(resource: ObjectAndRelation, subject_type: impl Into<String>) -> Self {
        Self {
            resource,
            subject_type: subject_type.into(),
            limit: None,
            depth: None,
        }
    }
}

/// One subject produced by a lookup stream. A wildcard emission has
/// subject id `*` and lists the subjects excluded from it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedSubject {
    pub subject_id: String,
    pub conditional: bool,
    pub excluded_subject_ids: Vec<String>,
}

impl ResolvedSubject {
    pub fn new(subject_id: impl Into<String>, conditional: bool) -> Self {
        Self {
            subject_id: subject_id.into(),
            conditional,
            excluded_subject_ids: Vec::new(),
        }
    }
}
