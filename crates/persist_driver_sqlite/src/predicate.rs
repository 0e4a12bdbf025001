//! Lowers rule trees into `WHERE` fragments over the JSON payload column.
//!
//! Field paths are interpolated as quoted literals so the resulting
//! expressions stay textually identical to the ones secondary indexes are
//! built on; comparison values are JSON-serialized and bound as parameters.

use std::fmt::Write as _;

use persist_core::{FieldOp, LogicalOp, QueryParams, Result, Rule};

/// A compiled SELECT with its bound parameter values in order.
#[derive(Debug, Clone, PartialEq)]
pub(crate) struct CompiledQuery {
    pub sql: String,
    pub params: Vec<String>,
}

/// Builds the full statement for a query or count over `collection`.
pub(crate) fn build_query_sql(
    collection: &str,
    rules: &[Rule],
    params: &QueryParams,
) -> Result<CompiledQuery> {
    let projection = if params.count { "count(id)" } else { "id, value" };

    let mut sql = format!("SELECT {projection} FROM {}", quote_ident(collection));
    let mut bound = Vec::new();

    if !rules.is_empty() {
        sql.push_str(" WHERE ");
        write_conjunction(&mut sql, &mut bound, rules)?;
    }

    push_pagination(&mut sql, params);

    Ok(CompiledQuery { sql, params: bound })
}

fn write_rule(sql: &mut String, bound: &mut Vec<String>, rule: &Rule) -> Result<()> {
    match rule {
        Rule::Field { field, op, value } => {
            bound.push(serde_json::to_string(value)?);
            let _ = write!(sql, "{} {} ?", json_path_expr(field), sql_operator(*op));
            Ok(())
        }
        Rule::Logical { op, operands } => match op {
            LogicalOp::And => write_conjunction(sql, bound, operands),
            LogicalOp::Or => write_disjunction(sql, bound, operands),
            LogicalOp::Nor => {
                sql.push_str("NOT ");
                write_disjunction(sql, bound, operands)
            }
        },
    }
}

fn write_conjunction(sql: &mut String, bound: &mut Vec<String>, rules: &[Rule]) -> Result<()> {
    if rules.is_empty() {
        sql.push_str("(1=1)");
        return Ok(());
    }

    write_joined(sql, bound, rules, " AND ")
}

fn write_disjunction(sql: &mut String, bound: &mut Vec<String>, rules: &[Rule]) -> Result<()> {
    if rules.is_empty() {
        sql.push_str("(1=0)");
        return Ok(());
    }

    write_joined(sql, bound, rules, " OR ")
}

fn write_joined(
    sql: &mut String,
    bound: &mut Vec<String>,
    rules: &[Rule],
    separator: &str,
) -> Result<()> {
    sql.push('(');
    for (idx, rule) in rules.iter().enumerate() {
        if idx > 0 {
            sql.push_str(separator);
        }
        write_rule(sql, bound, rule)?;
    }
    sql.push(')');

    Ok(())
}

fn sql_operator(op: FieldOp) -> &'static str {
    match op {
        FieldOp::Eq => "=",
        FieldOp::Ne => "!=",
        FieldOp::Gt => ">",
        FieldOp::Ge => ">=",
        FieldOp::Lt => "<",
        FieldOp::Le => "<=",
        FieldOp::Regex => "REGEXP",
        FieldOp::Glob => "GLOB",
    }
}

/// Appends ordering and pagination: ORDER BY, LIMIT, OFFSET, in that order.
/// `single` overrides any explicit limit; SQLite requires a LIMIT clause
/// before OFFSET, so an offset without a limit gets `LIMIT -1`.
fn push_pagination(sql: &mut String, params: &QueryParams) {
    if let Some(field) = &params.sort_field {
        let direction = if params.descending { "DESC" } else { "ASC" };
        let _ = write!(sql, " ORDER BY {} {direction}", json_path_expr(field));
    }

    if params.single {
        sql.push_str(" LIMIT 1");
    } else if let Some(limit) = params.limit {
        let _ = write!(sql, " LIMIT {limit}");
    } else if params.offset.is_some() {
        sql.push_str(" LIMIT -1");
    }

    if let Some(offset) = params.offset {
        let _ = write!(sql, " OFFSET {offset}");
    }
}

/// Expression extracting a dotted payload path as canonical JSON text.
pub(crate) fn json_path_expr(path: &str) -> String {
    format!(
        "json_quote(json_extract(value, '$.{}'))",
        path.replace('\'', "''")
    )
}

pub(crate) fn quote_ident(ident: &str) -> String {
    format!("\"{}\"", ident.replace('"', "\"\""))
}
