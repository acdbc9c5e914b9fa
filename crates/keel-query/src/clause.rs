//! Sorting clauses.

use crate::ident::PropertyPath;
use keel_core::{Dialect, ValidationError};
use serde::{Deserialize, Serialize};

/// Sort direction.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum Direction {
    #[default]
    Asc,
    Desc,
}

impl Direction {
    pub const fn as_sql(self) -> &'static str {
        match self {
            Direction::Asc => "ASC",
            Direction::Desc => "DESC",
        }
    }
}

/// One ORDER BY term: a property path and a direction.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OrderBy {
    /// `column` or `association.column`
    pub property: String,
    pub direction: Direction,
}

impl OrderBy {
    /// Create an ascending order by clause.
    pub fn asc(property: impl Into<String>) -> Self {
        Self {
            property: property.into(),
            direction: Direction::Asc,
        }
    }

    /// Create a descending order by clause.
    pub fn desc(property: impl Into<String>) -> Self {
        Self {
            property: property.into(),
            direction: Direction::Desc,
        }
    }

    /// Generate SQL for this term, qualifying root columns with `root`.
    pub fn to_sql(&self, dialect: Dialect, root: &str) -> Result<String, ValidationError> {
        let path = PropertyPath::parse(&self.property)?;
        let table = path.association.as_deref().unwrap_or(root);
        Ok(format!(
            "{}.{} {}",
            dialect.quote_identifier(table),
            dialect.quote_identifier(&path.column),
            self.direction.as_sql()
        ))
    }
}

/// An ordered list of ORDER BY terms.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Sort {
    orders: Vec<OrderBy>,
}

impl Sort {
    /// No ordering.
    pub fn unsorted() -> Self {
        Self::default()
    }

    pub fn asc(property: impl Into<String>) -> Self {
        Self {
            orders: vec![OrderBy::asc(property)],
        }
    }

    pub fn desc(property: impl Into<String>) -> Self {
        Self {
            orders: vec![OrderBy::desc(property)],
        }
    }

    /// Append the terms of `other`.
    #[must_use]
    pub fn and(mut self, other: Sort) -> Self {
        self.orders.extend(other.orders);
        self
    }

    /// Parse `property[,asc|desc]` terms separated by `;`, as they appear
    /// in request parameters.
    pub fn parse(spec: &str) -> Result<Self, ValidationError> {
        let mut orders = Vec::new();
        for term in spec.split(';').map(str::trim).filter(|t| !t.is_empty()) {
            let mut parts = term.split(',').map(str::trim);
            let property = parts.next().unwrap_or_default();
            PropertyPath::parse(property)?;
            let direction = match parts.next().map(str::to_ascii_lowercase).as_deref() {
                None | Some("asc") => Direction::Asc,
                Some("desc") => Direction::Desc,
                Some(other) => {
                    let mut err = ValidationError::new();
                    err.add_identifier("direction", other);
                    return Err(err);
                }
            };
            orders.push(OrderBy {
                property: property.to_string(),
                direction,
            });
        }
        Ok(Self { orders })
    }

    pub fn is_empty(&self) -> bool {
        self.orders.is_empty()
    }

    pub fn orders(&self) -> &[OrderBy] {
        &self.orders
    }
}

impl From<OrderBy> for Sort {
    fn from(order: OrderBy) -> Self {
        Self {
            orders: vec![order],
        }
    }
}
