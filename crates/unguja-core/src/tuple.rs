//! Relationship tuples: the edges of the authorization graph.

use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::{CoreError, CoreResult};

/// The relation used for terminal subjects ("the object itself").
pub const ELLIPSIS: &str = "...";

/// The object id wildcard, matching every object of a type.
pub const WILDCARD: &str = "*";

/// Returns true when `value` is a valid namespace or relation identifier.
///
/// Identifiers are lowercase, start with a letter, and may contain digits
/// and underscores, up to 64 characters.
pub fn is_valid_identifier(value: &str) -> bool {
    if value.is_empty() || value.len() > 64 {
        return false;
    }
    let mut chars = value.chars();
    match chars.next() {
        Some(c) if c.is_ascii_lowercase() => {}
        _ => return false,
    }
    value
        .chars()
        .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '_')
}

fn is_valid_object_id(value: &str) -> bool {
    if value == WILDCARD {
        return true;
    }
    !value.is_empty()
        && value.len() <= 128
        && value
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '_' | '-' | '.' | '@' | '|'))
}

/// A `(namespace, object_id, relation)` triple.
///
/// Used both as the resource side of a tuple (where `relation` names the
/// relation the edge is stored on) and as the subject side (where the
/// ellipsis relation `...` denotes the object itself).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ObjectAndRelation {
    pub namespace: String,
    pub object_id: String,
    pub relation: String,
}

impl ObjectAndRelation {
    /// Creates a new triple, validating each component.
    pub fn new(
        namespace: impl Into<String>,
        object_id: impl Into<String>,
        relation: impl Into<String>,
    ) -> CoreResult<Self> {
        let namespace = namespace.into();
        let object_id = object_id.into();
        let relation = relation.into();

        if !is_valid_identifier(&namespace) {
            return Err(CoreError::InvalidIdentifier {
                field: "namespace",
                value: namespace,
            });
        }
        if !is_valid_object_id(&object_id) {
            return Err(CoreError::InvalidIdentifier {
                field: "object_id",
                value: object_id,
            });
        }
        if relation != ELLIPSIS && !is_valid_identifier(&relation) {
            return Err(CoreError::InvalidIdentifier {
                field: "relation",
                value: relation,
            });
        }

        Ok(Self {
            namespace,
            object_id,
            relation,
        })
    }

    /// Creates a terminal subject (`ns:id` with the ellipsis relation).
    pub fn terminal(namespace: impl Into<String>, object_id: impl Into<String>) -> CoreResult<Self> {
        Self::new(namespace, object_id, ELLIPSIS)
    }

    /// Parses `"ns:id"` or `"ns:id#relation"`.
    pub fn parse(value: &str) -> CoreResult<Self> {
        let err = || CoreError::InvalidObjectReference {
            value: value.to_string(),
        };

        let (object, relation) = match value.split_once('#') {
            Some((object, relation)) if !relation.is_empty() => (object, relation),
            Some(_) => return Err(err()),
            None => (value, ELLIPSIS),
        };
        let (namespace, object_id) = object.split_once(':').ok_or_else(err)?;
        if namespace.is_empty() || object_id.is_empty() {
            return Err(err());
        }
        Self::new(namespace, object_id, relation)
    }

    /// Returns true when the object id is the wildcard.
    pub fn is_wildcard(&self) -> bool {
        self.object_id == WILDCARD
    }

    /// Returns true when the relation is the ellipsis.
    pub fn is_terminal(&self) -> bool {
        self.relation == ELLIPSIS
    }

    /// Returns a copy pointing at a different relation on the same object.
    pub fn with_relation(&self, relation: impl Into<String>) -> Self {
        Self {
            namespace: self.namespace.clone(),
            object_id: self.object_id.clone(),
            relation: relation.into(),
        }
    }

    /// The `namespace#relation` key used by the reachability graph, or the
    /// bare namespace for terminal subjects.
    pub fn subject_key(&self) -> String {
        if self.is_terminal() {
            self.namespace.clone()
        } else {
            format!("{}#{}", self.namespace, self.relation)
        }
    }
}

impl fmt::Display for ObjectAndRelation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_terminal() {
            write!(f, "{}:{}", self.namespace, self.object_id)
        } else {
            write!(f, "{}:{}#{}", self.namespace, self.object_id, self.relation)
        }
    }
}

/// A caveat reference attached to a stored tuple, carrying partial context
/// bound at write time.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContextualizedCaveat {
    pub caveat_name: String,
    /// Parameter bindings written alongside the edge. Takes precedence over
    /// context supplied at check time.
    #[serde(default)]
    pub context: Map<String, Value>,
}

impl ContextualizedCaveat {
    pub fn new(caveat_name: impl Into<String>) -> Self {
        Self {
            caveat_name: caveat_name.into(),
            context: Map::new(),
        }
    }

    pub fn with_context(caveat_name: impl Into<String>, context: Map<String, Value>) -> Self {
        Self {
            caveat_name: caveat_name.into(),
            context,
        }
    }
}

/// The canonical authorization edge: `resource` relates to `subject`.
///
/// The uniqueness key is `(resource, subject)`; the caveat is metadata on
/// the edge and does not participate in identity.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RelationTuple {
    pub resource: ObjectAndRelation,
    pub subject: ObjectAndRelation,
    pub caveat: Option<ContextualizedCaveat>,
}

impl RelationTuple {
    pub fn new(resource: ObjectAndRelation, subject: ObjectAndRelation) -> Self {
        Self {
            resource,
            subject,
            caveat: None,
        }
    }

    pub fn with_caveat(
        resource: ObjectAndRelation,
        subject: ObjectAndRelation,
        caveat: ContextualizedCaveat,
    ) -> Self {
        Self {
            resource,
            subject,
            caveat: Some(caveat),
        }
    }

    /// Parses `"ns:id#rel@ns:id"`, `"ns:id#rel@ns:id#rel"` and the caveated
    /// form `"...[caveat_name]"`. The context of a parsed caveat is empty.
    pub fn parse(value: &str) -> CoreResult<Self> {
        let err = || CoreError::InvalidObjectReference {
            value: value.to_string(),
        };

        let (body, caveat) = match value.split_once('[') {
            Some((body, rest)) => {
                let name = rest.strip_suffix(']').ok_or_else(err)?;
                (body, Some(ContextualizedCaveat::new(name)))
            }
            None => (value, None),
        };

        let (resource, subject) = body.split_once('@').ok_or_else(err)?;
        let resource = ObjectAndRelation::parse(resource)?;
        if resource.is_terminal() {
            return Err(err());
        }
        let subject = ObjectAndRelation::parse(subject)?;
        Ok(Self {
            resource,
            subject,
            caveat,
        })
    }

    /// The identity key of the edge.
    pub fn key(&self) -> (&ObjectAndRelation, &ObjectAndRelation) {
        (&self.resource, &self.subject)
    }
}

impl PartialEq for RelationTuple {
    fn eq(&self, other: &Self) -> bool {
        self.key() == other.key()
    }
}

impl Eq for RelationTuple {}

impl std::hash::Hash for RelationTuple {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        self.resource.hash(state);
        self.subject.hash(state);
    }
}

impl fmt::Display for RelationTuple {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.resource, self.subject)?;
        if let Some(caveat) = &self.caveat {
            write!(f, "[{}]", caveat.caveat_name)?;
        }
        Ok(())
    }
}
