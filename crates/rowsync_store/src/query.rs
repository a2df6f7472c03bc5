//! Query model shared by local reads and remote pulls.

use crate::Row;
use serde_json::Value;
use std::cmp::Ordering;

/// Sort direction for an order-by clause.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueryOrder {
    /// Ascending order.
    Ascending,
    /// Descending order.
    Descending,
}

/// A single order-by clause.
#[derive(Debug, Clone, PartialEq)]
pub struct OrderBy {
    /// Column to sort by.
    pub field: String,
    /// Sort direction.
    pub order: QueryOrder,
}

/// A row filter expression.
///
/// Filters are a small predicate tree: field comparisons combined with
/// `and`/`or`. Comparisons against a missing column evaluate to false.
#[derive(Debug, Clone, PartialEq)]
pub enum Filter {
    /// Field equals value.
    Eq(String, Value),
    /// Field is strictly greater than value.
    Gt(String, Value),
    /// Field is greater than or equal to value.
    Ge(String, Value),
    /// Field is strictly less than value.
    Lt(String, Value),
    /// Both sides must hold.
    And(Box<Filter>, Box<Filter>),
    /// Either side must hold.
    Or(Box<Filter>, Box<Filter>),
}

impl Filter {
    /// Creates an equality comparison.
    pub fn eq(field: impl Into<String>, value: impl Into<Value>) -> Self {
        Filter::Eq(field.into(), value.into())
    }

    /// Creates a greater-than comparison.
    pub fn gt(field: impl Into<String>, value: impl Into<Value>) -> Self {
        Filter::Gt(field.into(), value.into())
    }

    /// Creates a greater-or-equal comparison.
    pub fn ge(field: impl Into<String>, value: impl Into<Value>) -> Self {
        Filter::Ge(field.into(), value.into())
    }

    /// Creates a less-than comparison.
    pub fn lt(field: impl Into<String>, value: impl Into<Value>) -> Self {
        Filter::Lt(field.into(), value.into())
    }

    /// Combines this filter with another; both must hold.
    pub fn and(self, other: Filter) -> Self {
        Filter::And(Box::new(self), Box::new(other))
    }

    /// Combines this filter with another; either may hold.
    pub fn or(self, other: Filter) -> Self {
        Filter::Or(Box::new(self), Box::new(other))
    }

    /// Evaluates the filter against a row.
    pub fn matches(&self, row: &Row) -> bool {
        match self {
            Filter::Eq(field, value) => {
                compare_field(row, field, value) == Some(Ordering::Equal)
            }
            Filter::Gt(field, value) => {
                compare_field(row, field, value) == Some(Ordering::Greater)
            }
            Filter::Ge(field, value) => matches!(
                compare_field(row, field, value),
                Some(Ordering::Greater | Ordering::Equal)
            ),
            Filter::Lt(field, value) => compare_field(row, field, value) == Some(Ordering::Less),
            Filter::And(a, b) => a.matches(row) && b.matches(row),
            Filter::Or(a, b) => a.matches(row) || b.matches(row),
        }
    }
}

/// A bounded query over one table.
///
/// The same model drives local-store reads and remote pulls. `top`/`skip`
/// bound the result window; `order` gives the total order pagination
/// relies on. `include_deleted` asks a remote service to include
/// soft-deleted rows; local stores ignore it.
#[derive(Debug, Clone, PartialEq)]
pub struct Query {
    /// The table this query targets.
    pub table_name: String,
    /// Optional row filter.
    pub filter: Option<Filter>,
    /// Order-by clauses, applied in sequence.
    pub order: Vec<OrderBy>,
    /// Maximum number of rows to return.
    pub top: Option<u32>,
    /// Number of rows to skip before returning results.
    pub skip: Option<u32>,
    /// Whether soft-deleted rows should be included (remote reads only).
    pub include_deleted: bool,
}

impl Query {
    /// Creates a query over the given table.
    pub fn table(name: impl Into<String>) -> Self {
        Self {
            table_name: name.into(),
            filter: None,
            order: Vec::new(),
            top: None,
            skip: None,
            include_deleted: false,
        }
    }

    /// Sets the row filter.
    pub fn filter(mut self, filter: Filter) -> Self {
        self.filter = Some(filter);
        self
    }

    /// Appends an order-by clause.
    pub fn order_by(mut self, field: impl Into<String>, order: QueryOrder) -> Self {
        self.order.push(OrderBy {
            field: field.into(),
            order,
        });
        self
    }

    /// Sets the maximum number of rows to return.
    pub fn top(mut self, top: u32) -> Self {
        self.top = Some(top);
        self
    }

    /// Sets the number of rows to skip.
    pub fn skip(mut self, skip: u32) -> Self {
        self.skip = Some(skip);
        self
    }

    /// Requests soft-deleted rows from a remote read.
    pub fn include_deleted(mut self, include: bool) -> Self {
        self.include_deleted = include;
        self
    }

    /// Applies filter, ordering and the top/skip window to a row set.
    pub fn apply(&self, rows: Vec<Row>) -> Vec<Row> {
        let mut rows: Vec<Row> = match &self.filter {
            Some(filter) => rows.into_iter().filter(|r| filter.matches(r)).collect(),
            None => rows,
        };

        if !self.order.is_empty() {
            rows.sort_by(|a, b| {
                for clause in &self.order {
                    let av = a.get(&clause.field);
                    let bv = b.get(&clause.field);
                    let ord = compare_values_opt(av, bv);
                    let ord = match clause.order {
                        QueryOrder::Ascending => ord,
                        QueryOrder::Descending => ord.reverse(),
                    };
                    if ord != Ordering::Equal {
                        return ord;
                    }
                }
                Ordering::Equal
            });
        }

        let skip = self.skip.unwrap_or(0) as usize;
        let rows = rows.into_iter().skip(skip);
        match self.top {
            Some(top) => rows.take(top as usize).collect(),
            None => rows.collect(),
        }
    }
}

fn compare_field(row: &Row, field: &str, value: &Value) -> Option<Ordering> {
    row.get(field).and_then(|v| compare_values(v, value))
}

/// Compares two JSON values of the same kind.
///
/// Numbers compare numerically, strings lexicographically (RFC 3339
/// timestamps in a fixed format sort correctly this way), booleans as
/// false < true. Mismatched kinds do not compare.
fn compare_values(a: &Value, b: &Value) -> Option<Ordering> {
    match (a, b) {
        (Value::Number(x), Value::Number(y)) => {
            x.as_f64().and_then(|x| y.as_f64().and_then(|y| x.partial_cmp(&y)))
        }
        (Value::String(x), Value::String(y)) => Some(x.cmp(y)),
        (Value::Bool(x), Value::Bool(y)) => Some(x.cmp(y)),
        (Value::Null, Value::Null) => Some(Ordering::Equal),
        _ => None,
    }
}

/// Total order used for sorting: missing values and nulls sort first,
/// then by kind, then `compare_values` within a kind.
fn compare_values_opt(a: Option<&Value>, b: Option<&Value>) -> Ordering {
    match (a, b) {
        (None, None) => Ordering::Equal,
        (None, Some(_)) => Ordering::Less,
        (Some(_), None) => Ordering::Greater,
        (Some(a), Some(b)) => {
            compare_values(a, b).unwrap_or_else(|| kind_rank(a).cmp(&kind_rank(b)))
        }
    }
}

fn kind_rank(value: &Value) -> u8 {
    match value {
        Value::Null => 0,
        Value::Bool(_) => 1,
        Value::Number(_) => 2,
        Value::String(_) => 3,
        Value::Array(_) => 4,
        Value::Object(_) => 5,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn row(id: &str, rank: i64) -> Row {
        let mut row = Row::new();
        row.insert("id".into(), json!(id));
        row.insert("rank".into(), json!(rank));
        row
    }

    #[test]
    fn filter_eq_and_gt() {
        let r = row("a", 5);

        assert!(Filter::eq("id", "a").matches(&r));
        assert!(!Filter::eq("id", "b").matches(&r));
        assert!(Filter::gt("rank", 4).matches(&r));
        assert!(!Filter::gt("rank", 5).matches(&r));
        assert!(Filter::ge("rank", 5).matches(&r));
        assert!(Filter::lt("rank", 6).matches(&r));
    }

    #[test]
    fn filter_missing_field_is_false() {
        let r = row("a", 1);
        assert!(!Filter::eq("missing", "x").matches(&r));
        assert!(!Filter::gt("missing", 0).matches(&r));
    }

    #[test]
    fn filter_and_or() {
        let r = row("a", 5);

        let both = Filter::eq("id", "a").and(Filter::gt("rank", 1));
        assert!(both.matches(&r));

        let either = Filter::eq("id", "b").or(Filter::gt("rank", 1));
        assert!(either.matches(&r));

        let neither = Filter::eq("id", "b").and(Filter::gt("rank", 1));
        assert!(!neither.matches(&r));
    }

    #[test]
    fn apply_orders_and_windows() {
        let rows = vec![row("c", 3), row("a", 1), row("b", 2), row("d", 4)];

        let query = Query::table("t")
            .order_by("id", QueryOrder::Ascending)
            .skip(1)
            .top(2);

        let result = query.apply(rows);
        let ids: Vec<&str> = result
            .iter()
            .map(|r| r.get("id").and_then(|v| v.as_str()).unwrap())
            .collect();
        assert_eq!(ids, vec!["b", "c"]);
    }

    #[test]
    fn apply_multi_key_order() {
        let mut r1 = row("b", 1);
        r1.insert("ts".into(), json!("2024-01-01T00:00:00.000Z"));
        let mut r2 = row("a", 2);
        r2.insert("ts".into(), json!("2024-01-01T00:00:00.000Z"));
        let mut r3 = row("c", 3);
        r3.insert("ts".into(), json!("2023-12-31T23:59:59.000Z"));

        let query = Query::table("t")
            .order_by("ts", QueryOrder::Ascending)
            .order_by("id", QueryOrder::Ascending);

        let result = query.apply(vec![r1, r2, r3]);
        let ids: Vec<&str> = result
            .iter()
            .map(|r| r.get("id").and_then(|v| v.as_str()).unwrap())
            .collect();
        assert_eq!(ids, vec!["c", "a", "b"]);
    }

    #[test]
    fn apply_filters_before_window() {
        let rows = vec![row("a", 1), row("b", 2), row("c", 3)];

        let query = Query::table("t")
            .filter(Filter::gt("rank", 1))
            .order_by("rank", QueryOrder::Descending)
            .top(1);

        let result = query.apply(rows);
        assert_eq!(result.len(), 1);
        assert_eq!(result[0].get("id"), Some(&json!("c")));
    }

    #[test]
    fn rfc3339_strings_order_lexicographically() {
        let early = json!("2024-01-01T00:00:00.000Z");
        let late = json!("2024-01-01T00:00:00.001Z");
        assert_eq!(compare_values(&early, &late), Some(Ordering::Less));
    }
}
