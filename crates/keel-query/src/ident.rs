//! Identifier and property-path validation.
//!
//! Sort properties and column names can arrive from outside the program
//! (a `?sort=username,desc` query string, say), so they are checked before
//! they reach SQL text.

use keel_core::{Entity, ValidationError};
use regex::Regex;
use std::sync::OnceLock;

fn identifier_regex() -> &'static Result<Regex, regex::Error> {
    static IDENT: OnceLock<Result<Regex, regex::Error>> = OnceLock::new();
    IDENT.get_or_init(|| Regex::new(r"^[A-Za-z_][A-Za-z0-9_]*$"))
}

/// Is `s` a plain SQL identifier?
pub fn is_identifier(s: &str) -> bool {
    identifier_regex()
        .as_ref()
        .is_ok_and(|re| re.is_match(s))
}

/// A property reference: `column` on the root entity or `association.column`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PropertyPath {
    pub association: Option<String>,
    pub column: String,
}

impl PropertyPath {
    /// Parse `column` or `association.column`.
    pub fn parse(path: &str) -> Result<Self, ValidationError> {
        let mut parts = path.split('.');
        let (association, column) = match (parts.next(), parts.next(), parts.next()) {
            (Some(column), None, None) => (None, column),
            (Some(association), Some(column), None) => (Some(association), column),
            _ => return Err(invalid(path)),
        };
        if !is_identifier(column) || association.is_some_and(|a| !is_identifier(a)) {
            return Err(invalid(path));
        }
        Ok(Self {
            association: association.map(str::to_string),
            column: column.to_string(),
        })
    }

    /// Check the path against `E`'s mapping metadata.
    pub fn resolve<E: Entity>(&self) -> Result<(), ValidationError> {
        let known = match &self.association {
            None => E::column(&self.column).is_some(),
            Some(name) => E::association(name)
                .is_some_and(|a| (a.target_columns)().iter().any(|c| c.name == self.column)),
        };
        if known {
            Ok(())
        } else {
            let mut err = ValidationError::new();
            err.add_unknown_property(&self.to_string(), E::NAME);
            Err(err)
        }
    }
}

impl std::fmt::Display for PropertyPath {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.association {
            Some(a) => write!(f, "{a}.{}", self.column),
            None => f.write_str(&self.column),
        }
    }
}

fn invalid(path: &str) -> ValidationError {
    let mut err = ValidationError::new();
    err.add_identifier("property", path);
    err
}
