//! Caveat expressions and their evaluator.
//!
//! Caveats make relationships conditional: an edge carrying a caveat is
//! only effective when the caveat's boolean expression holds under the
//! merged write-time and check-time context. Traversal combines caveats
//! from multiple branches into [`CaveatExpression`] trees; this module
//! evaluates those trees, folding certainty through the boolean algebra
//! and leaving a simplified residual where parameters are still unbound.

mod context;
mod expression;

use std::collections::BTreeMap;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::{CoreError, CoreResult};
use crate::schema::{CaveatDefinition, Schema};
use crate::tuple::ContextualizedCaveat;

pub use context::{json_to_cel, value_matches_type};
pub use expression::{CaveatProgramCache, CompiledCaveat};

/// Boolean operators over caveat expressions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CaveatOp {
    And,
    Or,
    Not,
}

/// A boolean combination of contextualized caveats, produced by traversal
/// and consumed by callers that hold additional context.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum CaveatExpression {
    Caveat(ContextualizedCaveat),
    Operation {
        op: CaveatOp,
        children: Vec<CaveatExpression>,
    },
}

impl CaveatExpression {
    pub fn leaf(caveat: ContextualizedCaveat) -> Self {
        CaveatExpression::Caveat(caveat)
    }

    pub fn and(children: Vec<CaveatExpression>) -> Self {
        CaveatExpression::Operation {
            op: CaveatOp::And,
            children,
        }
    }

    pub fn or(children: Vec<CaveatExpression>) -> Self {
        CaveatExpression::Operation {
            op: CaveatOp::Or,
            children,
        }
    }

    pub fn not(child: CaveatExpression) -> Self {
        CaveatExpression::Operation {
            op: CaveatOp::Not,
            children: vec![child],
        }
    }
}

/// Combines two optional branch caveats under OR; `None` means the branch
/// was unconditional, which absorbs the other side.
pub fn or_optional(
    a: Option<CaveatExpression>,
    b: Option<CaveatExpression>,
) -> Option<CaveatExpression> {
    match (a, b) {
        (None, _) | (_, None) => None,
        (Some(a), Some(b)) => Some(flatten(CaveatOp::Or, a, b)),
    }
}

/// Combines two optional branch caveats under AND; `None` means the branch
/// was unconditional and drops out.
pub fn and_optional(
    a: Option<CaveatExpression>,
    b: Option<CaveatExpression>,
) -> Option<CaveatExpression> {
    match (a, b) {
        (None, None) => None,
        (Some(a), None) => Some(a),
        (None, Some(b)) => Some(b),
        (Some(a), Some(b)) => Some(flatten(CaveatOp::And, a, b)),
    }
}

/// `base AND NOT subtract` for exclusion traversal, where either side may
/// be unconditional.
pub fn subtract_optional(
    base: Option<CaveatExpression>,
    subtract: Option<CaveatExpression>,
) -> Option<CaveatExpression> {
    match subtract {
        None => base, // unconditionally subtracted branches are handled by the caller
        Some(subtract) => and_optional(base, Some(CaveatExpression::not(subtract))),
    }
}

fn flatten(op: CaveatOp, a: CaveatExpression, b: CaveatExpression) -> CaveatExpression {
    let mut children = Vec::new();
    for expr in [a, b] {
        match expr {
            CaveatExpression::Operation {
                op: child_op,
                children: nested,
            } if child_op == op => children.extend(nested),
            other => children.push(other),
        }
    }
    CaveatExpression::Operation { op, children }
}

/// The simplified remainder of a partial evaluation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PartialVerdict {
    /// The residual expression with unresolved parameters still free.
    pub residual: CaveatExpression,
    /// Declared parameters that were not bound by any context.
    pub missing_parameters: Vec<String>,
    /// Set when a branch failed to evaluate; the caller decides whether to
    /// treat the branch as undecided or to surface the failure.
    pub evaluation_error: Option<String>,
}

/// The outcome of evaluating a caveat expression under a context.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CaveatVerdict {
    True,
    False,
    Partial(Box<PartialVerdict>),
}

/// Caveat definitions plus the compiled-program cache; evaluation is
/// deterministic and side-effect free.
#[derive(Debug)]
pub struct CaveatEnv {
    definitions: BTreeMap<String, Arc<CaveatDefinition>>,
    programs: CaveatProgramCache,
}

impl CaveatEnv {
    pub fn new(definitions: impl IntoIterator<Item = CaveatDefinition>) -> Self {
        Self {
            definitions: definitions
                .into_iter()
                .map(|def| (def.name.clone(), Arc::new(def)))
                .collect(),
            programs: CaveatProgramCache::default(),
        }
    }

    /// Builds an environment over every caveat of a compiled schema.
    pub fn for_schema(schema: &Schema) -> Self {
        Self {
            definitions: schema
                .caveat_definitions()
                .map(|def| (def.name.clone(), Arc::clone(def)))
                .collect(),
            programs: CaveatProgramCache::default(),
        }
    }

    /// Evaluates an expression under the request context, folding certainty
    /// through the boolean algebra.
    pub fn evaluate(
        &self,
        expression: &CaveatExpression,
        request_context: &Map<String, Value>,
    ) -> CoreResult<CaveatVerdict> {
        match expression {
            CaveatExpression::Caveat(leaf) => self.evaluate_leaf(leaf, request_context),
            CaveatExpression::Operation { op, children } => match op {
                CaveatOp::And => self.evaluate_and(children, request_context),
                CaveatOp::Or => self.evaluate_or(children, request_context),
                CaveatOp::Not => {
                    let child = children.first().ok_or_else(|| CoreError::CaveatEvaluation {
                        caveat: "<expression>".to_string(),
                        message: "NOT requires exactly one child".to_string(),
                    })?;
                    Ok(match self.evaluate(child, request_context)? {
                        CaveatVerdict::True => CaveatVerdict::False,
                        CaveatVerdict::False => CaveatVerdict::True,
                        CaveatVerdict::Partial(partial) => {
                            CaveatVerdict::Partial(Box::new(PartialVerdict {
                                residual: CaveatExpression::not(partial.residual),
                                missing_parameters: partial.missing_parameters,
                                evaluation_error: partial.evaluation_error,
                            }))
                        }
                    })
                }
            },
        }
    }

    fn evaluate_and(
        &self,
        children: &[CaveatExpression],
        request_context: &Map<String, Value>,
    ) -> CoreResult<CaveatVerdict> {
        let mut partials: Vec<PartialVerdict> = Vec::new();
        for child in children {
            match self.evaluate(child, request_context)? {
                CaveatVerdict::False => return Ok(CaveatVerdict::False),
                CaveatVerdict::True => {}
                CaveatVerdict::Partial(partial) => partials.push(*partial),
            }
        }
        Ok(fold_partials(CaveatOp::And, partials, CaveatVerdict::True))
    }

    fn evaluate_or(
        &self,
        children: &[CaveatExpression],
        request_context: &Map<String, Value>,
    ) -> CoreResult<CaveatVerdict> {
        let mut partials: Vec<PartialVerdict> = Vec::new();
        for child in children {
            match self.evaluate(child, request_context)? {
                CaveatVerdict::True => return Ok(CaveatVerdict::True),
                CaveatVerdict::False => {}
                CaveatVerdict::Partial(partial) => partials.push(*partial),
            }
        }
        Ok(fold_partials(CaveatOp::Or, partials, CaveatVerdict::False))
    }

    fn evaluate_leaf(
        &self,
        leaf: &ContextualizedCaveat,
        request_context: &Map<String, Value>,
    ) -> CoreResult<CaveatVerdict> {
        let definition =
            self.definitions
                .get(&leaf.caveat_name)
                .ok_or_else(|| CoreError::CaveatNotFound {
                    caveat: leaf.caveat_name.clone(),
                })?;

        // Tuple context takes precedence: bindings written alongside the
        // edge cannot be overridden by the caller's request context.
        let mut merged = request_context.clone();
        for (key, value) in &leaf.context {
            merged.insert(key.clone(), value.clone());
        }

        let mut missing = Vec::new();
        for (parameter, expected) in &definition.parameter_types {
            match merged.get(parameter) {
                None => missing.push(parameter.clone()),
                Some(value) => {
                    if !value_matches_type(value, *expected) {
                        return Err(CoreError::CaveatParameterType {
                            caveat: leaf.caveat_name.clone(),
                            parameter: parameter.clone(),
                            expected: parameter_type_name(*expected),
                        });
                    }
                }
            }
        }

        if !missing.is_empty() {
            return Ok(CaveatVerdict::Partial(Box::new(PartialVerdict {
                residual: CaveatExpression::leaf(ContextualizedCaveat::with_context(
                    leaf.caveat_name.clone(),
                    merged,
                )),
                missing_parameters: missing,
                evaluation_error: None,
            })));
        }

        let program = self
            .programs
            .get_or_compile(&definition.name, &definition.serialized_expression)?;
        let bindings = merged
            .iter()
            .map(|(name, value)| (name.clone(), json_to_cel(value)));

        match program.evaluate_bool(&definition.name, bindings) {
            Ok(true) => Ok(CaveatVerdict::True),
            Ok(false) => Ok(CaveatVerdict::False),
            // A branch that fails to evaluate is undecided, not fatal; the
            // caller sees the residual with the error attached.
            Err(message) => Ok(CaveatVerdict::Partial(Box::new(PartialVerdict {
                residual: CaveatExpression::leaf(leaf.clone()),
                missing_parameters: Vec::new(),
                evaluation_error: Some(message),
            }))),
        }
    }
}

fn fold_partials(
    op: CaveatOp,
    mut partials: Vec<PartialVerdict>,
    when_empty: CaveatVerdict,
) -> CaveatVerdict {
    match partials.len() {
        0 => when_empty,
        1 => CaveatVerdict::Partial(Box::new(partials.remove(0))),
        _ => {
            let mut missing = Vec::new();
            let mut error = None;
            let children: Vec<CaveatExpression> = partials
                .into_iter()
                .map(|partial| {
                    missing.extend(partial.missing_parameters);
                    if error.is_none() {
                        error = partial.evaluation_error;
                    }
                    partial.residual
                })
                .collect();
            missing.sort();
            missing.dedup();
            CaveatVerdict::Partial(Box::new(PartialVerdict {
                residual: CaveatExpression::Operation { op, children },
                missing_parameters: missing,
                evaluation_error: error,
            }))
        }
    }
}

fn parameter_type_name(parameter_type: crate::schema::CaveatParameterType) -> &'static str {
    use crate::schema::CaveatParameterType as P;
    match parameter_type {
        P::String => "string",
        P::Int => "int",
        P::Uint => "uint",
        P::Double => "double",
        P::Bool => "bool",
        P::List => "list",
        P::Map => "map",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::CaveatParameterType;
    use serde_json::json;

    fn ip_caveat() -> CaveatDefinition {
        let mut params = BTreeMap::new();
        params.insert("cidr".to_string(), CaveatParameterType::String);
        params.insert("ip".to_string(), CaveatParameterType::String);
        CaveatDefinition::new("ip_in_range", b"ip.startsWith(cidr)".to_vec(), params)
    }

    fn limit_caveat() -> CaveatDefinition {
        let mut params = BTreeMap::new();
        params.insert("amount".to_string(), CaveatParameterType::Int);
        params.insert("max_amount".to_string(), CaveatParameterType::Int);
        CaveatDefinition::new("under_limit", b"amount <= max_amount".to_vec(), params)
    }

    fn env() -> CaveatEnv {
        CaveatEnv::new([ip_caveat(), limit_caveat()])
    }

    fn leaf(name: &str) -> CaveatExpression {
        CaveatExpression::leaf(ContextualizedCaveat::new(name))
    }

    fn ctx(value: Value) -> Map<String, Value> {
        value.as_object().cloned().unwrap_or_default()
    }

    #[test]
    fn full_context_decides_the_leaf() {
        let env = env();
        let satisfied = env
            .evaluate(
                &leaf("ip_in_range"),
                &ctx(json!({"ip": "10.0.0.1", "cidr": "10.0."})),
            )
            .unwrap();
        assert_eq!(satisfied, CaveatVerdict::True);

        let falsified = env
            .evaluate(
                &leaf("ip_in_range"),
                &ctx(json!({"ip": "192.168.0.1", "cidr": "10.0."})),
            )
            .unwrap();
        assert_eq!(falsified, CaveatVerdict::False);
    }

    #[test]
    fn missing_parameters_yield_partial() {
        let env = env();
        let verdict = env
            .evaluate(&leaf("ip_in_range"), &ctx(json!({"cidr": "10.0."})))
            .unwrap();
        let CaveatVerdict::Partial(partial) = verdict else {
            panic!("expected a partial verdict");
        };
        assert_eq!(partial.missing_parameters, vec!["ip".to_string()]);
        assert!(partial.evaluation_error.is_none());
    }

    #[test]
    fn type_mismatch_is_an_error() {
        let env = env();
        let result = env.evaluate(
            &leaf("under_limit"),
            &ctx(json!({"amount": "lots", "max_amount": 10})),
        );
        assert!(matches!(
            result,
            Err(CoreError::CaveatParameterType { .. })
        ));
    }

    #[test]
    fn unknown_caveat_is_an_error() {
        let env = env();
        assert!(matches!(
            env.evaluate(&leaf("nope"), &Map::new()),
            Err(CoreError::CaveatNotFound { .. })
        ));
    }

    #[test]
    fn tuple_context_wins_over_request_context() {
        let env = env();
        let written = CaveatExpression::leaf(ContextualizedCaveat::with_context(
            "under_limit",
            ctx(json!({"max_amount": 10})),
        ));
        // The caller tries to raise the limit; the written binding holds.
        let verdict = env
            .evaluate(&written, &ctx(json!({"amount": 50, "max_amount": 1000})))
            .unwrap();
        assert_eq!(verdict, CaveatVerdict::False);
    }

    #[test]
    fn and_folds_certainty() {
        let env = env();
        let expr = CaveatExpression::and(vec![leaf("ip_in_range"), leaf("under_limit")]);

        // One child true, other false => false.
        let verdict = env
            .evaluate(
                &expr,
                &ctx(json!({
                    "ip": "10.0.0.1", "cidr": "10.0.",
                    "amount": 50, "max_amount": 10
                })),
            )
            .unwrap();
        assert_eq!(verdict, CaveatVerdict::False);

        // One child true, other undecided => the undecided residual.
        let verdict = env
            .evaluate(
                &expr,
                &ctx(json!({"ip": "10.0.0.1", "cidr": "10.0.", "amount": 5})),
            )
            .unwrap();
        let CaveatVerdict::Partial(partial) = verdict else {
            panic!("expected partial");
        };
        assert_eq!(
            partial.missing_parameters,
            vec!["max_amount".to_string()]
        );
        assert!(matches!(partial.residual, CaveatExpression::Caveat(_)));
    }

    #[test]
    fn or_short_circuits_on_true() {
        let env = env();
        let expr = CaveatExpression::or(vec![leaf("ip_in_range"), leaf("under_limit")]);
        let verdict = env
            .evaluate(&expr, &ctx(json!({"ip": "10.0.0.1", "cidr": "10.0."})))
            .unwrap();
        assert_eq!(verdict, CaveatVerdict::True);
    }

    #[test]
    fn or_of_false_and_partial_is_the_partial() {
        let env = env();
        let expr = CaveatExpression::or(vec![leaf("ip_in_range"), leaf("under_limit")]);
        let verdict = env
            .evaluate(
                &expr,
                &ctx(json!({"ip": "192.168.0.1", "cidr": "10.0.", "amount": 5})),
            )
            .unwrap();
        assert!(matches!(verdict, CaveatVerdict::Partial(_)));
    }

    #[test]
    fn not_inverts_certainty_and_keeps_partials() {
        let env = env();
        let expr = CaveatExpression::not(leaf("ip_in_range"));

        let verdict = env
            .evaluate(&expr, &ctx(json!({"ip": "192.168.0.1", "cidr": "10.0."})))
            .unwrap();
        assert_eq!(verdict, CaveatVerdict::True);

        let verdict = env.evaluate(&expr, &Map::new()).unwrap();
        let CaveatVerdict::Partial(partial) = verdict else {
            panic!("expected partial");
        };
        assert!(matches!(
            partial.residual,
            CaveatExpression::Operation {
                op: CaveatOp::Not,
                ..
            }
        ));
    }

    #[test]
    fn evaluation_failures_become_error_bearing_partials() {
        let mut params = BTreeMap::new();
        params.insert("flag".to_string(), CaveatParameterType::Bool);
        let env = CaveatEnv::new([CaveatDefinition::new(
            "odd",
            b"flag && undefined_variable".to_vec(),
            params,
        )]);

        let verdict = env
            .evaluate(&leaf("odd"), &ctx(json!({"flag": true})))
            .unwrap();
        let CaveatVerdict::Partial(partial) = verdict else {
            panic!("expected partial");
        };
        assert!(partial.evaluation_error.is_some());
    }

    #[test]
    fn optional_combinators_absorb_unconditional_branches() {
        let a = Some(leaf("ip_in_range"));
        let b = Some(leaf("under_limit"));

        assert_eq!(or_optional(None, a.clone()), None);
        assert_eq!(and_optional(None, b.clone()), b);
        assert!(matches!(
            or_optional(a.clone(), b.clone()),
            Some(CaveatExpression::Operation {
                op: CaveatOp::Or,
                ..
            })
        ));
        assert!(matches!(
            subtract_optional(a, b),
            Some(CaveatExpression::Operation {
                op: CaveatOp::And,
                ..
            })
        ));
    }
}
