//! Guard expressions: the sum type edges use to gate conditional transitions.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::{ExecutorError, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Operator {
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LogicOp {
    And,
    Or,
}

/// A condition's literal operand. Untagged: serializes as a bare JSON string,
/// number, or boolean, matching how a guard would be authored by hand.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum GuardValue {
    String(String),
    Number(f64),
    Bool(bool),
}

/// `Condition | Group`, tagged so a persisted `guard_expression_json` column
/// round-trips without ambiguity.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum GuardExpression {
    Condition {
        field: String,
        operator: Operator,
        value: GuardValue,
    },
    Group {
        logic: LogicOp,
        conditions: Vec<GuardExpression>,
    },
}

impl GuardExpression {
    /// Structural validation: a `Group` must have at least one child.
    pub fn validate(&self) -> Result<()> {
        match self {
            GuardExpression::Condition { .. } => Ok(()),
            GuardExpression::Group { conditions, .. } => {
                if conditions.is_empty() {
                    return Err(ExecutorError::InvalidGuardExpression(
                        "group expression must have at least one condition".to_string(),
                    ));
                }
                conditions.iter().try_for_each(GuardExpression::validate)
            }
        }
    }

    /// Evaluate against a decision context (artifact metadata plus the
    /// synthesized `decision` field). A missing field evaluates false.
    pub fn evaluate(&self, context: &Map<String, Value>) -> bool {
        match self {
            GuardExpression::Condition {
                field,
                operator,
                value,
            } => match context.get(field) {
                None => false,
                Some(actual) => evaluate_condition(actual, *operator, value),
            },
            GuardExpression::Group { logic, conditions } => match logic {
                LogicOp::And => conditions.iter().all(|c| c.evaluate(context)),
                LogicOp::Or => conditions.iter().any(|c| c.evaluate(context)),
            },
        }
    }
}

fn evaluate_condition(actual: &Value, operator: Operator, expected: &GuardValue) -> bool {
    match (actual, expected) {
        (Value::String(a), GuardValue::String(b)) => compare(a, b, operator),
        (Value::Number(a), GuardValue::Number(b)) => match a.as_f64() {
            Some(a) => compare(&a, b, operator),
            None => false,
        },
        (Value::Bool(a), GuardValue::Bool(b)) => match operator {
            Operator::Eq => a == b,
            Operator::Ne => a != b,
            _ => false,
        },
        // Cross-type comparisons are false; we do not coerce numeric-looking
        // strings (see DESIGN.md, "cross-type guard comparisons").
        _ => false,
    }
}

fn compare<T: PartialOrd>(a: &T, b: &T, operator: Operator) -> bool {
    match operator {
        Operator::Eq => a == b,
        Operator::Ne => a != b,
        Operator::Lt => a < b,
        Operator::Le => a <= b,
        Operator::Gt => a > b,
        Operator::Ge => a >= b,
    }
}
