//! Parses reference functions embedded in stored values.
//!
//! A value is either a plain literal or a function call. Function calls
//! are stored as a single-key JSON object, `{"<operator>": [operands...]}`,
//! where each operand is in turn either a JSON string (a literal operand)
//! or a nested single-key object (a nested function call). This is the
//! wire shape the topology loader (out of scope here) is expected to
//! produce when it lowers a parsed TOSCA function into a KV value.

use std::fmt;
use thiserror::Error;

pub const GET_ATTRIBUTE: &str = "get_attribute";
pub const GET_OPERATION_OUTPUT: &str = "get_operation_output";
pub const GET_PROPERTY: &str = "get_property";
pub const CONCAT: &str = "concat";
pub const JOIN: &str = "join";
pub const GET_INPUT: &str = "get_input";

#[derive(Debug, Error)]
#[error("malformed expression: {0}")]
pub struct MalformedExpression(pub String);

/// One operand of a function call: either a literal string or a nested
/// function call.
#[derive(Debug, Clone, PartialEq)]
pub enum Operand {
    Literal(String),
    Function(FunctionCall),
}

impl Operand {
    pub fn as_literal(&self) -> Option<&str> {
        match self {
            Operand::Literal(s) => Some(s),
            Operand::Function(_) => None,
        }
    }
}

/// A parsed function call: `operator(operands...)`.
#[derive(Debug, Clone, PartialEq)]
pub struct FunctionCall {
    pub operator: String,
    pub operands: Vec<Operand>,
}

impl FunctionCall {
    /// Every `get_attribute`/`get_operation_output` (etc) sub-function
    /// reachable from this call, including itself, matching `operator`.
    /// Traversal order is depth-first, left to right.
    pub fn functions_by_operator<'a>(&'a self, operator: &str) -> Vec<&'a FunctionCall> {
        let mut out = Vec::new();
        self.collect_by_operator(operator, &mut out);
        out
    }

    fn collect_by_operator<'a>(&'a self, operator: &str, out: &mut Vec<&'a FunctionCall>) {
        if self.operator == operator {
            out.push(self);
        }
        for operand in &self.operands {
            if let Operand::Function(f) = operand {
                f.collect_by_operator(operator, out);
            }
        }
    }

    /// Validates and extracts a `get_attribute` operand shape: 2 operands
    /// (`[notifier, attr]`) or 3 (`[notifier, capability, attr]`).
    pub fn as_get_attribute(&self) -> Result<GetAttribute, MalformedExpression> {
        if self.operator != GET_ATTRIBUTE {
            return Err(MalformedExpression(format!(
                "not a get_attribute call: {}",
                self.operator
            )));
        }
        let operands: Vec<&str> = self
            .operands
            .iter()
            .map(|o| o.as_literal())
            .collect::<Option<_>>()
            .ok_or_else(|| MalformedExpression("get_attribute operands must be literal".into()))?;
        match operands.as_slice() {
            [notifier, attr] => Ok(GetAttribute {
                notifier: notifier.to_string(),
                capability: None,
                attribute: attr.to_string(),
            }),
            [notifier, capability, attr] => Ok(GetAttribute {
                notifier: notifier.to_string(),
                capability: Some(capability.to_string()),
                attribute: attr.to_string(),
            }),
            _ => Err(MalformedExpression(format!(
                "get_attribute expects 2 or 3 operands, got {}",
                operands.len()
            ))),
        }
    }

    /// Validates and extracts a `get_operation_output` operand shape:
    /// exactly 4 operands (`[entity, interface, operation, output]`).
    pub fn as_get_operation_output(&self) -> Result<GetOperationOutput, MalformedExpression> {
        if self.operator != GET_OPERATION_OUTPUT {
            return Err(MalformedExpression(format!(
                "not a get_operation_output call: {}",
                self.operator
            )));
        }
        let operands: Vec<&str> = self
            .operands
            .iter()
            .map(|o| o.as_literal())
            .collect::<Option<_>>()
            .ok_or_else(|| {
                MalformedExpression("get_operation_output operands must be literal".into())
            })?;
        match operands.as_slice() {
            [entity, interface, operation, output] => Ok(GetOperationOutput {
                entity: entity.to_string(),
                interface: interface.to_lowercase(),
                operation: operation.to_lowercase(),
                output: output.to_string(),
            }),
            _ => Err(MalformedExpression(format!(
                "get_operation_output expects exactly 4 operands, got {}",
                operands.len()
            ))),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GetAttribute {
    /// `SELF`, `HOST`, `TARGET`, `SOURCE`, or a literal node name.
    pub notifier: String,
    pub capability: Option<String>,
    pub attribute: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GetOperationOutput {
    pub entity: String,
    pub interface: String,
    pub operation: String,
    pub output: String,
}

/// A value read from the store: either a literal or a function tree.
#[derive(Debug, Clone, PartialEq)]
pub enum ParsedValue {
    Literal(String),
    Function(FunctionCall),
}

impl ParsedValue {
    pub fn is_function(&self) -> bool {
        matches!(self, ParsedValue::Function(_))
    }
}

impl fmt::Display for ParsedValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ParsedValue::Literal(s) => write!(f, "{s}"),
            ParsedValue::Function(fc) => write!(f, "{}(...)", fc.operator),
        }
    }
}

/// Parses a raw stored value. Anything that isn't a single-key
/// `{"operator": [...]}` JSON object is treated as a literal, even if it
/// happens to be otherwise-valid JSON (a bare JSON string or number).
/// Once a value *does* look like a function call (single-key object)
/// but the value isn't an operand array, or an operand is neither a
/// string nor a nested function object, parsing fails as
/// **malformed-expression**.
pub fn parse(raw: &str) -> Result<ParsedValue, MalformedExpression> {
    let Ok(serde_json::Value::Object(map)) = serde_json::from_str::<serde_json::Value>(raw) else {
        return Ok(ParsedValue::Literal(raw.to_string()));
    };
    if map.len() != 1 {
        return Ok(ParsedValue::Literal(raw.to_string()));
    }
    let (operator, value) = map.into_iter().next().expect("checked len == 1");
    parse_call(operator, value).map(ParsedValue::Function)
}

pub fn is_function(raw: &str) -> bool {
    parse(raw).map(|v| v.is_function()).unwrap_or(false)
}

fn parse_call(
    operator: String,
    value: serde_json::Value,
) -> Result<FunctionCall, MalformedExpression> {
    let serde_json::Value::Array(items) = value else {
        return Err(MalformedExpression(format!(
            "function {operator} operands must be an array"
        )));
    };
    let operands = items
        .into_iter()
        .map(parse_operand)
        .collect::<Result<Vec<_>, _>>()?;
    Ok(FunctionCall { operator, operands })
}

fn parse_operand(value: serde_json::Value) -> Result<Operand, MalformedExpression> {
    match value {
        serde_json::Value::String(s) => Ok(Operand::Literal(s)),
        serde_json::Value::Object(map) if map.len() == 1 => {
            let (operator, inner) = map.into_iter().next().expect("checked len == 1");
            Ok(Operand::Function(parse_call(operator, inner)?))
        }
        other => Err(MalformedExpression(format!(
            "unsupported operand shape: {other}"
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn plain_string_is_literal() {
        let parsed = parse("10.0.0.5").unwrap();
        assert_eq!(parsed, ParsedValue::Literal("10.0.0.5".into()));
    }

    #[test]
    fn parses_get_attribute_two_operands() {
        let parsed = parse(r#"{"get_attribute": ["SELF", "ip_address"]}"#).unwrap();
        let ParsedValue::Function(call) = parsed else {
            panic!("expected function");
        };
        let ga = call.as_get_attribute().unwrap();
        assert_eq!(ga.notifier, "SELF");
        assert_eq!(ga.capability, None);
        assert_eq!(ga.attribute, "ip_address");
    }

    #[test]
    fn parses_get_attribute_three_operands() {
        let parsed = parse(r#"{"get_attribute": ["SELF", "connection", "ip_address"]}"#).unwrap();
        let ParsedValue::Function(call) = parsed else {
            panic!("expected function");
        };
        let ga = call.as_get_attribute().unwrap();
        assert_eq!(ga.capability.as_deref(), Some("connection"));
    }

    #[test]
    fn rejects_wrong_get_attribute_arity() {
        let parsed = parse(r#"{"get_attribute": ["SELF"]}"#).unwrap();
        let ParsedValue::Function(call) = parsed else {
            panic!("expected function");
        };
        assert!(call.as_get_attribute().is_err());
    }

    #[test]
    fn get_operation_output_lowercases_interface_and_operation() {
        let parsed =
            parse(r#"{"get_operation_output": ["SELF", "Standard", "Configure", "PORT"]}"#)
                .unwrap();
        let ParsedValue::Function(call) = parsed else {
            panic!("expected function");
        };
        let goo = call.as_get_operation_output().unwrap();
        assert_eq!(goo.interface, "standard");
        assert_eq!(goo.operation, "configure");
        assert_eq!(goo.output, "PORT");
    }

    #[test]
    fn finds_nested_functions_by_operator() {
        let parsed = parse(
            r#"{"concat": ["prefix-", {"get_attribute": ["SELF", "ip_address"]}, {"get_attribute": ["HOST", "port"]}]}"#,
        )
        .unwrap();
        let ParsedValue::Function(call) = parsed else {
            panic!("expected function");
        };
        let found = call.functions_by_operator(GET_ATTRIBUTE);
        assert_eq!(found.len(), 2);
    }

    #[test]
    fn malformed_operand_array_errors() {
        let err = parse(r#"{"get_attribute": "not-an-array"}"#).unwrap_err();
        assert!(err.to_string().contains("malformed"));
    }
}
