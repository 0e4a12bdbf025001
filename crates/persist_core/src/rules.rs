use regex::Regex;
use serde_json::Value;

use crate::error::{PersistError, Result};

/// Field comparison operator.
///
/// Operators compare the canonical JSON text of the addressed field against
/// the JSON-serialized literal, which is also the domain the SQL lowering
/// compares in (`json_quote(json_extract(..))` against a serialized
/// parameter). `~` is a regular-expression match, `match` a glob match.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FieldOp {
    Eq,
    Ne,
    Gt,
    Ge,
    Lt,
    Le,
    Regex,
    Glob,
}

impl FieldOp {
    pub fn parse(op: &str) -> Option<Self> {
        match op {
            "=" => Some(Self::Eq),
            "!=" => Some(Self::Ne),
            ">" => Some(Self::Gt),
            ">=" => Some(Self::Ge),
            "<" => Some(Self::Lt),
            "<=" => Some(Self::Le),
            "~" => Some(Self::Regex),
            "match" => Some(Self::Glob),
            _ => None,
        }
    }

    pub fn symbol(&self) -> &'static str {
        match self {
            Self::Eq => "=",
            Self::Ne => "!=",
            Self::Gt => ">",
            Self::Ge => ">=",
            Self::Lt => "<",
            Self::Le => "<=",
            Self::Regex => "~",
            Self::Glob => "match",
        }
    }
}

/// Boolean combinator over a sequence of sub-rules.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogicalOp {
    And,
    Or,
    Nor,
}

impl LogicalOp {
    pub fn parse(op: &str) -> Option<Self> {
        match op {
            "and" => Some(Self::And),
            "or" => Some(Self::Or),
            "nor" => Some(Self::Nor),
            _ => None,
        }
    }
}

/// A single node of a query rule tree.
///
/// Wire format: a field predicate is the 3-tuple `[field, op, value]`, a
/// logical predicate the 2-tuple `[op, [rules...]]`. A top-level sequence of
/// rules is implicitly conjoined.
#[derive(Debug, Clone, PartialEq)]
pub enum Rule {
    Field {
        field: String,
        op: FieldOp,
        value: Value,
    },
    Logical {
        op: LogicalOp,
        operands: Vec<Rule>,
    },
}

impl Rule {
    /// Parses one rule tuple. Any malformed node aborts the whole parse.
    pub fn from_value(value: &Value) -> Result<Rule> {
        let items = value
            .as_array()
            .ok_or_else(|| PersistError::invalid_argument("rule is not a sequence"))?;

        match items.len() {
            2 => Self::parse_logical(items),
            3 => Self::parse_field(items),
            n => Err(PersistError::invalid_argument(format!(
                "invalid number of items in a rule tuple: {n}"
            ))),
        }
    }

    /// Parses a top-level rule sequence (the implicit conjunction).
    pub fn parse_list(value: &Value) -> Result<Vec<Rule>> {
        let items = value
            .as_array()
            .ok_or_else(|| PersistError::invalid_argument("rule list is not a sequence"))?;

        items.iter().map(Rule::from_value).collect()
    }

    fn parse_logical(items: &[Value]) -> Result<Rule> {
        let op_name = items[0]
            .as_str()
            .ok_or_else(|| PersistError::invalid_argument("logical operator is not a string"))?;

        let op = LogicalOp::parse(op_name).ok_or_else(|| {
            PersistError::invalid_argument(format!("invalid logical operator: {op_name}"))
        })?;

        let operands = items[1]
            .as_array()
            .ok_or_else(|| PersistError::invalid_argument("logical operands are not a sequence"))?
            .iter()
            .map(Rule::from_value)
            .collect::<Result<Vec<_>>>()?;

        Ok(Rule::Logical { op, operands })
    }

    fn parse_field(items: &[Value]) -> Result<Rule> {
        let field = items[0]
            .as_str()
            .ok_or_else(|| PersistError::invalid_argument("field name is not a string"))?;

        let op_name = items[1]
            .as_str()
            .ok_or_else(|| PersistError::invalid_argument("field operator is not a string"))?;

        let op = FieldOp::parse(op_name).ok_or_else(|| {
            PersistError::invalid_argument(format!("invalid operator: {op_name}"))
        })?;

        Ok(Rule::Field {
            field: field.to_string(),
            op,
            value: items[2].clone(),
        })
    }

    /// Evaluates this rule against an in-memory document.
    ///
    /// Uses the same operator table and comparison domain as the SQL
    /// lowering, so a document matches here iff the compiled predicate
    /// selects its stored row.
    pub fn matches(&self, doc: &Value) -> Result<bool> {
        match self {
            Rule::Field { field, op, value } => {
                let lhs = field_json_text(doc, field);
                let rhs = serde_json::to_string(value)?;

                match op {
                    FieldOp::Eq => Ok(lhs == rhs),
                    FieldOp::Ne => Ok(lhs != rhs),
                    FieldOp::Gt => Ok(lhs > rhs),
                    FieldOp::Ge => Ok(lhs >= rhs),
                    FieldOp::Lt => Ok(lhs < rhs),
                    FieldOp::Le => Ok(lhs <= rhs),
                    FieldOp::Regex => {
                        let re = Regex::new(&rhs).map_err(|e| {
                            PersistError::invalid_argument(format!("invalid regex: {e}"))
                        })?;
                        Ok(re.is_match(&lhs))
                    }
                    FieldOp::Glob => Ok(glob_matches(&rhs, &lhs)),
                }
            }
            Rule::Logical { op, operands } => {
                let mut any = false;
                let mut all = true;

                for rule in operands {
                    if rule.matches(doc)? {
                        any = true;
                    } else {
                        all = false;
                    }
                }

                Ok(match op {
                    LogicalOp::And => all,
                    LogicalOp::Or => any,
                    LogicalOp::Nor => !any,
                })
            }
        }
    }
}

/// Evaluates a top-level rule sequence (implicit conjunction; empty matches
/// everything).
pub fn rules_match(rules: &[Rule], doc: &Value) -> Result<bool> {
    for rule in rules {
        if !rule.matches(doc)? {
            return Ok(false);
        }
    }

    Ok(true)
}

/// Canonical JSON text of a dotted-path field inside a document.
///
/// Mirrors `json_quote(json_extract(value, '$.<path>'))`: an absent path
/// yields the text `null`.
pub fn field_json_text(doc: &Value, path: &str) -> String {
    let mut current = doc;
    for segment in path.split('.') {
        match current.get(segment) {
            Some(next) => current = next,
            None => return "null".to_string(),
        }
    }

    serde_json::to_string(current).unwrap_or_else(|_| "null".to_string())
}

/// GLOB-style matching over the full text: `*` any run, `?` one character,
/// `[...]`/`[^...]` character classes. Case sensitive.
fn glob_matches(pattern: &str, text: &str) -> bool {
    match glob_to_regex(pattern) {
        Some(re) => re.is_match(text),
        None => false,
    }
}

fn glob_to_regex(pattern: &str) -> Option<Regex> {
    let mut out = String::with_capacity(pattern.len() + 8);
    out.push('^');

    let mut chars = pattern.chars().peekable();
    while let Some(c) = chars.next() {
        match c {
            '*' => out.push_str(".*"),
            '?' => out.push('.'),
            '[' => {
                out.push('[');
                if chars.peek() == Some(&'^') {
                    chars.next();
                    out.push('^');
                }
                for inner in chars.by_ref() {
                    if inner == ']' {
                        break;
                    }
                    if inner == '\\' {
                        out.push('\\');
                    }
                    out.push(inner);
                }
                out.push(']');
            }
            _ => out.push_str(&regex::escape(&c.to_string())),
        }
    }

    out.push('$');
    Regex::new(&out).ok()
}
