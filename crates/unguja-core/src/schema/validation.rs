//! Semantic validation of schema definitions.
//!
//! Runs once during [`Schema::compile`]. After validation the rewrite
//! graph is a DAG when restricted to computed usersets, so evaluation
//! only needs depth limiting for cycles that pass through stored data.
//!
//! [`Schema::compile`]: crate::schema::Schema::compile

use std::collections::{BTreeMap, HashSet};

use crate::error::{CoreError, CoreResult};
use crate::tuple::is_valid_identifier;

use super::types::{
    CaveatDefinition, ChildKind, NamespaceDefinition, RelationDef, SetOperation, UsersetRewrite,
};

pub(crate) fn validate(
    namespaces: &BTreeMap<String, NamespaceDefinition>,
    caveats: &BTreeMap<String, CaveatDefinition>,
) -> CoreResult<()> {
    for name in caveats.keys() {
        if !is_valid_identifier(name) {
            return Err(invalid(format!("caveat name '{name}' is not a valid identifier")));
        }
    }

    for (ns_name, namespace) in namespaces {
        if !is_valid_identifier(ns_name) {
            return Err(invalid(format!(
                "namespace name '{ns_name}' is not a valid identifier"
            )));
        }

        let mut seen = HashSet::new();
        for relation in &namespace.relations {
            if !is_valid_identifier(&relation.name) {
                return Err(invalid(format!(
                    "relation name '{}' on '{ns_name}' is not a valid identifier",
                    relation.name
                )));
            }
            if !seen.insert(relation.name.as_str()) {
                return Err(invalid(format!(
                    "duplicate relation '{}' on namespace '{ns_name}'",
                    relation.name
                )));
            }

            validate_relation(namespaces, caveats, namespace, relation)?;
        }

        detect_computed_cycles(namespace)?;
    }

    Ok(())
}

fn validate_relation(
    namespaces: &BTreeMap<String, NamespaceDefinition>,
    caveats: &BTreeMap<String, CaveatDefinition>,
    namespace: &NamespaceDefinition,
    relation: &RelationDef,
) -> CoreResult<()> {
    match &relation.rewrite {
        Some(rewrite) => {
            if !relation.type_information.is_empty() {
                return Err(invalid(format!(
                    "permission '{}#{}' must not declare allowed subject types",
                    namespace.name, relation.name
                )));
            }
            validate_rewrite(namespaces, namespace, relation, rewrite)
        }
        None => {
            if relation.type_information.is_empty() {
                return Err(invalid(format!(
                    "relation '{}#{}' has no allowed subject types",
                    namespace.name, relation.name
                )));
            }
            for allowed in &relation.type_information {
                let target_ns = namespaces.get(&allowed.namespace).ok_or_else(|| {
                    invalid(format!(
                        "relation '{}#{}' allows unknown namespace '{}'",
                        namespace.name, relation.name, allowed.namespace
                    ))
                })?;
                if let Some(subject_relation) = &allowed.relation {
                    if allowed.wildcard {
                        return Err(invalid(format!(
                            "relation '{}#{}' allows a wildcard with subject relation '{}'",
                            namespace.name, relation.name, subject_relation
                        )));
                    }
                    if target_ns.relation(subject_relation).is_none() {
                        return Err(invalid(format!(
                            "relation '{}#{}' allows unknown subject relation '{}#{}'",
                            namespace.name, relation.name, allowed.namespace, subject_relation
                        )));
                    }
                }
                if let Some(caveat) = &allowed.required_caveat {
                    if !caveats.contains_key(caveat) {
                        return Err(invalid(format!(
                            "relation '{}#{}' requires unknown caveat '{caveat}'",
                            namespace.name, relation.name
                        )));
                    }
                }
            }
            Ok(())
        }
    }
}

fn validate_rewrite(
    namespaces: &BTreeMap<String, NamespaceDefinition>,
    namespace: &NamespaceDefinition,
    relation: &RelationDef,
    rewrite: &UsersetRewrite,
) -> CoreResult<()> {
    match rewrite.operation {
        SetOperation::Exclusion => {
            if rewrite.children.len() != 2 {
                return Err(invalid(format!(
                    "exclusion in '{}#{}' has {} operands, expected exactly 2",
                    namespace.name,
                    relation.name,
                    rewrite.children.len()
                )));
            }
        }
        SetOperation::Union | SetOperation::Intersection => {
            if rewrite.children.is_empty() {
                return Err(invalid(format!(
                    "empty set operation in '{}#{}'",
                    namespace.name, relation.name
                )));
            }
        }
    }

    for child in &rewrite.children {
        match &child.kind {
            ChildKind::This | ChildKind::Nil => {}
            ChildKind::ComputedUserset { relation: target } => {
                if namespace.relation(target).is_none() {
                    return Err(invalid(format!(
                        "'{}#{}' references unknown relation '{target}'",
                        namespace.name, relation.name
                    )));
                }
            }
            ChildKind::TupleToUserset {
                tupleset,
                computed_relation,
            } => {
                validate_tupleset(namespaces, namespace, relation, tupleset, computed_relation)?;
            }
            ChildKind::Rewrite(nested) => {
                validate_rewrite(namespaces, namespace, relation, nested)?;
            }
        }
    }
    Ok(())
}

fn validate_tupleset(
    namespaces: &BTreeMap<String, NamespaceDefinition>,
    namespace: &NamespaceDefinition,
    relation: &RelationDef,
    tupleset: &str,
    computed_relation: &str,
) -> CoreResult<()> {
    let tupleset_def = namespace.relation(tupleset).ok_or_else(|| {
        invalid(format!(
            "'{}#{}' walks unknown tupleset relation '{tupleset}'",
            namespace.name, relation.name
        ))
    })?;
    if tupleset_def.is_permission() {
        return Err(invalid(format!(
            "'{}#{}' walks tupleset '{tupleset}', which is a permission",
            namespace.name, relation.name
        )));
    }

    // Tupleset subjects name intermediate objects, so userset and wildcard
    // subjects have no meaning there.
    let mut computed_exists_somewhere = false;
    for allowed in &tupleset_def.type_information {
        if allowed.relation.is_some() {
            return Err(invalid(format!(
                "tupleset '{}#{tupleset}' admits userset subject '{}'",
                namespace.name,
                allowed.subject_key()
            )));
        }
        if allowed.wildcard {
            return Err(invalid(format!(
                "tupleset '{}#{tupleset}' admits a wildcard subject",
                namespace.name
            )));
        }
        if let Some(target_ns) = namespaces.get(&allowed.namespace) {
            if target_ns.relation(computed_relation).is_some() {
                computed_exists_somewhere = true;
            }
        }
    }
    if !computed_exists_somewhere {
        return Err(invalid(format!(
            "'{}#{}' applies '{computed_relation}', which exists on none of the \
             subject types of tupleset '{tupleset}'",
            namespace.name, relation.name
        )));
    }
    Ok(())
}

/// Rejects cycles that never leave computed usersets. A cycle that passes
/// through a data relation or a tuple_to_userset is legal and bounded at
/// evaluation time by the dispatch depth limit.
fn detect_computed_cycles(namespace: &NamespaceDefinition) -> CoreResult<()> {
    #[derive(Clone, Copy, PartialEq)]
    enum Mark {
        Visiting,
        Done,
    }

    fn computed_targets<'a>(rewrite: &'a UsersetRewrite, out: &mut Vec<&'a str>) {
        for child in &rewrite.children {
            match &child.kind {
                ChildKind::ComputedUserset { relation } => out.push(relation),
                ChildKind::Rewrite(nested) => computed_targets(nested, out),
                _ => {}
            }
        }
    }

    fn visit<'a>(
        namespace: &'a NamespaceDefinition,
        name: &'a str,
        marks: &mut BTreeMap<&'a str, Mark>,
        path: &mut Vec<&'a str>,
    ) -> CoreResult<()> {
        match marks.get(name) {
            Some(Mark::Done) => return Ok(()),
            Some(Mark::Visiting) => {
                return Err(invalid(format!(
                    "computed userset cycle on '{}': {} -> {name}",
                    namespace.name,
                    path.join(" -> ")
                )));
            }
            None => {}
        }

        let Some(relation) = namespace.relation(name) else {
            return Ok(()); // unknown references are reported elsewhere
        };
        let Some(rewrite) = &relation.rewrite else {
            return Ok(()); // data relations terminate the walk
        };

        marks.insert(name, Mark::Visiting);
        path.push(name);
        let mut targets = Vec::new();
        computed_targets(rewrite, &mut targets);
        for target in targets {
            visit(namespace, target, marks, path)?;
        }
        path.pop();
        marks.insert(name, Mark::Done);
        Ok(())
    }

    let mut marks = BTreeMap::new();
    for relation in &namespace.relations {
        visit(namespace, &relation.name, &mut marks, &mut Vec::new())?;
    }
    Ok(())
}

fn invalid(message: String) -> CoreError {
    CoreError::SchemaValidation { message }
}
