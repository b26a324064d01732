//! Logical row query and its SQL form
//!
//! The gateway accepts exactly one query shape, a keyed range lookup:
//!
//! ```sql
//! SELECT * FROM <table>
//! WHERE scenario_id = '<id>' AND bucket BETWEEN <lo> AND <hi>
//! [LIMIT <n>]
//! ```
//!
//! Predicates may appear in either order, and `bucket = <n>` is accepted as a
//! single-bucket range. Anything else (joins, projections, other columns) is a
//! `ParseError`: backends only have to support bounded keyed lookups.
//!
//! References:
//! - sqlparser-rs: <https://docs.rs/sqlparser>

use std::ops::RangeInclusive;

use sqlparser::ast::{BinaryOperator, Expr, Query, SelectItem, SetExpr, Statement, Value};
use sqlparser::dialect::GenericDialect;
use sqlparser::parser::Parser;

use crate::{Error, Result};

/// Column holding the scenario id in every virtual table.
pub const SCENARIO_COLUMN: &str = "scenario_id";
/// Column holding the time bucket in every virtual table.
pub const BUCKET_COLUMN: &str = "bucket";

/// Bounded keyed lookup against one logical table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RowQuery {
    table: String,
    scenario_id: String,
    buckets: RangeInclusive<u64>,
    limit: Option<usize>,
}

impl RowQuery {
    /// Lookup of `buckets` for one scenario.
    #[must_use]
    pub fn new(
        table: impl Into<String>,
        scenario_id: impl Into<String>,
        buckets: RangeInclusive<u64>,
    ) -> Self {
        Self {
            table: table.into(),
            scenario_id: scenario_id.into(),
            buckets,
            limit: None,
        }
    }

    /// Cap the number of returned rows.
    #[must_use]
    pub const fn with_limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }

    /// Logical table name.
    #[must_use]
    pub fn table(&self) -> &str {
        &self.table
    }

    /// Scenario id the rows must match.
    #[must_use]
    pub fn scenario_id(&self) -> &str {
        &self.scenario_id
    }

    /// Inclusive bucket range.
    #[must_use]
    pub const fn buckets(&self) -> &RangeInclusive<u64> {
        &self.buckets
    }

    /// Row cap, if any.
    #[must_use]
    pub const fn limit(&self) -> Option<usize> {
        self.limit
    }

    /// Render the query in its SQL form.
    #[must_use]
    pub fn to_sql(&self) -> String {
        let mut sql = format!(
            "SELECT * FROM {} WHERE {SCENARIO_COLUMN} = '{}' AND {BUCKET_COLUMN} BETWEEN {} AND {}",
            self.table,
            self.scenario_id.replace('\'', "''"),
            self.buckets.start(),
            self.buckets.end()
        );
        if let Some(limit) = self.limit {
            sql.push_str(&format!(" LIMIT {limit}"));
        }
        sql
    }

    /// Parse the SQL form of a lookup.
    ///
    /// # Errors
    ///
    /// Returns `ParseError` if the SQL is invalid or not a keyed range lookup.
    ///
    /// # Example
    ///
    /// ```
    /// use gemelo::gateway::RowQuery;
    ///
    /// # fn main() -> gemelo::Result<()> {
    /// let query = RowQuery::parse_sql(
    ///     "SELECT * FROM enterprise_context \
    ///      WHERE scenario_id = 'c1-n0.500-l0-r0' AND bucket BETWEEN 0 AND 9",
    /// )?;
    /// assert_eq!(query.table(), "enterprise_context");
    /// assert_eq!(query.buckets(), &(0..=9));
    /// # Ok(())
    /// # }
    /// ```
    pub fn parse_sql(sql: &str) -> Result<Self> {
        let statements = Parser::parse_sql(&GenericDialect {}, sql)
            .map_err(|e| Error::ParseError(e.to_string()))?;

        if statements.len() != 1 {
            return Err(Error::ParseError("Only single statements supported".to_string()));
        }
        let Statement::Query(query) = &statements[0] else {
            return Err(Error::ParseError("Only SELECT queries supported".to_string()));
        };
        Self::from_query(query)
    }

    fn from_query(query: &Query) -> Result<Self> {
        let SetExpr::Select(select) = query.body.as_ref() else {
            return Err(Error::ParseError("Only SELECT queries supported".to_string()));
        };

        if !matches!(select.projection.as_slice(), [SelectItem::Wildcard(_)]) {
            return Err(Error::ParseError(
                "virtual table lookups must select *".to_string(),
            ));
        }

        if select.from.len() != 1 {
            return Err(Error::ParseError("Exactly one table required".to_string()));
        }
        let table_with_joins = &select.from[0];
        if !table_with_joins.joins.is_empty() {
            return Err(Error::ParseError("JOINs not supported".to_string()));
        }
        let table = table_with_joins.relation.to_string();

        let selection = select
            .selection
            .as_ref()
            .ok_or_else(|| Error::ParseError("missing WHERE clause".to_string()))?;

        let mut predicates = Vec::new();
        flatten_and(selection, &mut predicates);

        let mut scenario_id = None;
        let mut buckets = None;
        for predicate in predicates {
            match predicate {
                Expr::BinaryOp {
                    left,
                    op: BinaryOperator::Eq,
                    right,
                } => match column_name(left).as_deref() {
                    Some(SCENARIO_COLUMN) => scenario_id = Some(string_literal(right)?),
                    Some(BUCKET_COLUMN) => {
                        let bucket = number_literal(right)?;
                        buckets = Some(bucket..=bucket);
                    }
                    _ => return Err(unsupported(predicate)),
                },
                Expr::Between {
                    expr,
                    negated: false,
                    low,
                    high,
                } if column_name(expr).as_deref() == Some(BUCKET_COLUMN) => {
                    buckets = Some(number_literal(low)?..=number_literal(high)?);
                }
                _ => return Err(unsupported(predicate)),
            }
        }

        let scenario_id = scenario_id
            .ok_or_else(|| Error::ParseError(format!("missing {SCENARIO_COLUMN} predicate")))?;
        let buckets =
            buckets.ok_or_else(|| Error::ParseError(format!("missing {BUCKET_COLUMN} predicate")))?;
        if buckets.start() > buckets.end() {
            return Err(Error::ParseError(format!(
                "empty bucket range {}..={}",
                buckets.start(),
                buckets.end()
            )));
        }

        let limit = query
            .limit
            .as_ref()
            .map(|expr| {
                number_literal(expr).and_then(|n| {
                    usize::try_from(n).map_err(|_| Error::ParseError(format!("LIMIT {n} too large")))
                })
            })
            .transpose()?;

        Ok(Self {
            table,
            scenario_id,
            buckets,
            limit,
        })
    }
}

fn flatten_and<'a>(expr: &'a Expr, out: &mut Vec<&'a Expr>) {
    match expr {
        Expr::BinaryOp {
            left,
            op: BinaryOperator::And,
            right,
        } => {
            flatten_and(left, out);
            flatten_and(right, out);
        }
        Expr::Nested(inner) => flatten_and(inner, out),
        other => out.push(other),
    }
}

fn column_name(expr: &Expr) -> Option<String> {
    match expr {
        Expr::Identifier(ident) => Some(ident.value.to_lowercase()),
        _ => None,
    }
}

fn string_literal(expr: &Expr) -> Result<String> {
    match expr {
        Expr::Value(Value::SingleQuotedString(s)) => Ok(s.clone()),
        other => Err(Error::ParseError(format!("expected string literal, got {other}"))),
    }
}

fn number_literal(expr: &Expr) -> Result<u64> {
    match expr {
        Expr::Value(Value::Number(n, _)) => n
            .parse()
            .map_err(|_| Error::ParseError(format!("expected unsigned integer, got {n}"))),
        other => Err(Error::ParseError(format!("expected unsigned integer, got {other}"))),
    }
}

fn unsupported(expr: &Expr) -> Error {
    Error::ParseError(format!("unsupported predicate: {expr}"))
}
