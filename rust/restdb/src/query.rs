//! Filter, ordering and pagination types shared by every `Querier`
//! implementation.

use serde_json::Value;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FilterOp {
    Eq,
    Neq,
    Gte,
    Lte,
    Ilike,
    In,
}

impl FilterOp {
    /// Operator token in the backend's query-string dialect.
    pub fn as_str(&self) -> &'static str {
        match self {
            FilterOp::Eq => "eq",
            FilterOp::Neq => "neq",
            FilterOp::Gte => "gte",
            FilterOp::Lte => "lte",
            FilterOp::Ilike => "ilike",
            FilterOp::In => "in",
        }
    }
}

#[derive(Debug, Clone)]
pub struct Filter {
    pub column: String,
    pub op: FilterOp,
    pub value: Value,
}

impl Filter {
    pub fn new(column: impl Into<String>, op: FilterOp, value: impl Into<Value>) -> Self {
        Self {
            column: column.into(),
            op,
            value: value.into(),
        }
    }

    pub fn eq(column: impl Into<String>, value: impl Into<Value>) -> Self {
        Self::new(column, FilterOp::Eq, value)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Asc,
    Desc,
}

/// Builder for a read query: column projection, equality/pattern filters,
/// ordering and pagination.
#[derive(Debug, Clone, Default)]
pub struct SelectQuery {
    pub columns: Option<String>,
    pub filters: Vec<Filter>,
    pub order: Vec<(String, Direction)>,
    pub limit: Option<u64>,
    pub offset: Option<u64>,
}

impl SelectQuery {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn columns(mut self, columns: impl Into<String>) -> Self {
        self.columns = Some(columns.into());
        self
    }

    pub fn eq(mut self, column: impl Into<String>, value: impl Into<Value>) -> Self {
        self.filters.push(Filter::new(column, FilterOp::Eq, value));
        self
    }

    pub fn neq(mut self, column: impl Into<String>, value: impl Into<Value>) -> Self {
        self.filters.push(Filter::new(column, FilterOp::Neq, value));
        self
    }

    pub fn gte(mut self, column: impl Into<String>, value: impl Into<Value>) -> Self {
        self.filters.push(Filter::new(column, FilterOp::Gte, value));
        self
    }

    pub fn lte(mut self, column: impl Into<String>, value: impl Into<Value>) -> Self {
        self.filters.push(Filter::new(column, FilterOp::Lte, value));
        self
    }

    /// Case-insensitive pattern match. `*` is the wildcard, so a contains
    /// search is `*term*`.
    pub fn ilike(mut self, column: impl Into<String>, pattern: impl Into<String>) -> Self {
        self.filters
            .push(Filter::new(column, FilterOp::Ilike, pattern.into()));
        self
    }

    pub fn in_(mut self, column: impl Into<String>, values: Vec<Value>) -> Self {
        self.filters
            .push(Filter::new(column, FilterOp::In, Value::Array(values)));
        self
    }

    pub fn order(mut self, column: impl Into<String>) -> Self {
        self.order.push((column.into(), Direction::Asc));
        self
    }

    pub fn order_desc(mut self, column: impl Into<String>) -> Self {
        self.order.push((column.into(), Direction::Desc));
        self
    }

    pub fn limit(mut self, limit: u64) -> Self {
        self.limit = Some(limit);
        self
    }

    /// Inclusive row range, mirroring the backend's `range(from, to)`.
    pub fn range(mut self, from: u64, to: u64) -> Self {
        self.offset = Some(from);
        self.limit = Some(to.saturating_sub(from) + 1);
        self
    }
}
