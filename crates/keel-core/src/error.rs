//! Error types for keel operations.
//!
//! "Not found" is deliberately absent: lookups return `Option` so that a
//! missing row stays distinguishable from a failure.

use std::fmt;

/// The primary error type for all keel operations.
#[derive(Debug)]
pub enum Error {
    /// Connection-related errors (open, disconnect)
    Connection(ConnectionError),
    /// Statement execution errors reported by the store
    Query(QueryError),
    /// Type conversion errors while decoding rows
    Type(TypeError),
    /// Unit-of-work demarcation errors (begin/commit/rollback)
    Transaction(TransactionError),
    /// A lazy association pointed at a row that no longer exists
    StaleReference(StaleReferenceError),
    /// Caller misuse of the persistence context
    InvalidOperation(InvalidOperationError),
    /// Rejected input (page size, identifiers, predicates)
    Validation(ValidationError),
    /// Custom error with message
    Custom(String),
}

#[derive(Debug)]
pub struct ConnectionError {
    pub kind: ConnectionErrorKind,
    pub message: String,
    pub source: Option<Box<dyn std::error::Error + Send + Sync>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionErrorKind {
    /// Failed to open the store
    Connect,
    /// Connection lost during operation
    Disconnected,
}

#[derive(Debug)]
pub struct QueryError {
    pub kind: QueryErrorKind,
    pub sql: Option<String>,
    pub message: String,
    pub source: Option<Box<dyn std::error::Error + Send + Sync>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueryErrorKind {
    /// Syntax error in SQL
    Syntax,
    /// Constraint violation (unique, foreign key, not null)
    Constraint,
    /// Table or column not found
    NotFound,
    /// Permission denied
    Permission,
    /// Data too large for column
    DataTruncation,
    /// Lock contention (busy, deadlock)
    Deadlock,
    /// Interrupted
    Cancelled,
    /// Other database error
    Database,
}

#[derive(Debug)]
pub struct TypeError {
    pub expected: &'static str,
    pub actual: String,
    pub column: Option<String>,
}

#[derive(Debug)]
pub struct TransactionError {
    pub kind: TransactionErrorKind,
    pub message: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransactionErrorKind {
    /// `begin` while a unit of work is already open
    AlreadyActive,
    /// `commit`/`rollback` without an open unit of work
    NotActive,
}

/// A lazy association could not be resolved because its target row is gone.
#[derive(Debug, Clone)]
pub struct StaleReferenceError {
    /// Entity that owns the association.
    pub owner: &'static str,
    /// Association name on the owner.
    pub association: &'static str,
    /// Table the reference points into.
    pub target_table: &'static str,
    /// Key that was looked up.
    pub key: String,
}

/// Misuse of the persistence context.
#[derive(Debug, Clone)]
pub struct InvalidOperationError {
    pub kind: InvalidOperationKind,
    pub message: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InvalidOperationKind {
    /// The entity was deleted in this context and may no longer change.
    MutateAfterDelete,
    /// The entity is not managed by this context.
    NotManaged,
    /// The context that produced a proxy has ended.
    ContextClosed,
    /// A proxy was resolved against a context that did not produce it.
    ForeignContext,
    /// A previous flush failed; only rollback is allowed.
    ContextFailed,
    /// Another instance with the same identity is already managed.
    DuplicateIdentity,
    /// The operation needs an identity the entity does not have yet.
    MissingIdentity,
}

impl InvalidOperationKind {
    /// Short stable label used in messages and logs.
    pub const fn as_str(self) -> &'static str {
        match self {
            InvalidOperationKind::MutateAfterDelete => "mutate after delete",
            InvalidOperationKind::NotManaged => "entity not managed",
            InvalidOperationKind::ContextClosed => "context closed",
            InvalidOperationKind::ForeignContext => "foreign context",
            InvalidOperationKind::ContextFailed => "context failed",
            InvalidOperationKind::DuplicateIdentity => "duplicate identity",
            InvalidOperationKind::MissingIdentity => "missing identity",
        }
    }
}

/// Validation error listing every rejected input.
#[derive(Debug, Clone)]
pub struct ValidationError {
    /// The errors grouped by field name.
    pub errors: Vec<FieldValidationError>,
}

/// A single rejected input.
#[derive(Debug, Clone)]
pub struct FieldValidationError {
    /// The input that failed validation
    pub field: String,
    /// The kind of validation that failed
    pub kind: ValidationErrorKind,
    /// Human-readable error message
    pub message: String,
}

/// The type of validation constraint that was violated.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ValidationErrorKind {
    /// Page size is zero or negative
    InvalidPageSize,
    /// Offset is negative
    InvalidOffset,
    /// String is not a plain SQL identifier
    InvalidIdentifier,
    /// Property does not exist on the entity
    UnknownProperty,
    /// Predicate cannot be rendered (e.g. empty IN list)
    EmptyPredicate,
    /// Bulk update without any SET clause
    EmptyMutation,
    /// Required value is missing
    Required,
}

impl ValidationError {
    /// Create a new empty validation error container.
    pub fn new() -> Self {
        Self { errors: Vec::new() }
    }

    /// Convenience constructor for a single violation.
    pub fn single(
        field: impl Into<String>,
        kind: ValidationErrorKind,
        message: impl Into<String>,
    ) -> Self {
        let mut err = Self::new();
        err.add(field, kind, message);
        err
    }

    /// Check if there are any validation errors.
    pub fn is_empty(&self) -> bool {
        self.errors.is_empty()
    }

    /// Kind of the first violation, if any.
    pub fn first_kind(&self) -> Option<ValidationErrorKind> {
        self.errors.first().map(|e| e.kind)
    }

    /// Add a field validation error.
    pub fn add(
        &mut self,
        field: impl Into<String>,
        kind: ValidationErrorKind,
        message: impl Into<String>,
    ) {
        self.errors.push(FieldValidationError {
            field: field.into(),
            kind,
            message: message.into(),
        });
    }

    /// Add an invalid page size error.
    pub fn add_page_size(&mut self, actual: i64) {
        self.add(
            "limit",
            ValidationErrorKind::InvalidPageSize,
            format!("invalid page size: must be at least 1, got {actual}"),
        );
    }

    /// Add an invalid offset error.
    pub fn add_offset(&mut self, actual: i64) {
        self.add(
            "offset",
            ValidationErrorKind::InvalidOffset,
            format!("invalid offset: must not be negative, got {actual}"),
        );
    }

    /// Add an invalid identifier error.
    pub fn add_identifier(&mut self, field: impl Into<String>, ident: &str) {
        self.add(
            field,
            ValidationErrorKind::InvalidIdentifier,
            format!("'{ident}' is not a valid identifier"),
        );
    }

    /// Add an unknown property error.
    pub fn add_unknown_property(&mut self, property: &str, entity: &str) {
        self.add(
            property.to_string(),
            ValidationErrorKind::UnknownProperty,
            format!("no property '{property}' found for type '{entity}'"),
        );
    }

    /// Convert to Result, returning Ok(()) if no errors, Err(self) otherwise.
    pub fn into_result(self) -> std::result::Result<(), Self> {
        if self.is_empty() { Ok(()) } else { Err(self) }
    }
}

impl Default for ValidationError {
    fn default() -> Self {
        Self::new()
    }
}

impl Error {
    /// Build an `InvalidOperation` error.
    pub fn invalid(kind: InvalidOperationKind, message: impl Into<String>) -> Self {
        Error::InvalidOperation(InvalidOperationError {
            kind,
            message: message.into(),
        })
    }

    /// Build a single-entry `Validation` error.
    pub fn validation(
        field: impl Into<String>,
        kind: ValidationErrorKind,
        message: impl Into<String>,
    ) -> Self {
        Error::Validation(ValidationError::single(field, kind, message))
    }

    /// Does this error come from the underlying store?
    pub fn is_store_failure(&self) -> bool {
        matches!(
            self,
            Error::Connection(_) | Error::Query(_) | Error::Transaction(_)
        )
    }

    /// The misuse kind, if this is an `InvalidOperation`.
    pub fn invalid_operation_kind(&self) -> Option<InvalidOperationKind> {
        match self {
            Error::InvalidOperation(e) => Some(e.kind),
            _ => None,
        }
    }

    /// The first validation kind, if this is a `Validation` error.
    pub fn validation_kind(&self) -> Option<ValidationErrorKind> {
        match self {
            Error::Validation(e) => e.first_kind(),
            _ => None,
        }
    }

    /// Get the SQL that caused this error, if available
    pub fn sql(&self) -> Option<&str> {
        match self {
            Error::Query(q) => q.sql.as_deref(),
            _ => None,
        }
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::Connection(e) => write!(f, "Connection error: {}", e.message),
            Error::Query(e) => write!(f, "Query error: {}", e.message),
            Error::Type(e) => write!(f, "Type error: {}", e),
            Error::Transaction(e) => write!(f, "Transaction error: {}", e.message),
            Error::StaleReference(e) => write!(f, "Stale reference: {}", e),
            Error::InvalidOperation(e) => write!(f, "Invalid operation: {}", e),
            Error::Validation(e) => write!(f, "Validation error: {}", e),
            Error::Custom(msg) => write!(f, "{}", msg),
        }
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Error::Connection(e) => e
                .source
                .as_deref()
                .map(|err| err as &(dyn std::error::Error + 'static)),
            Error::Query(e) => e
                .source
                .as_deref()
                .map(|err| err as &(dyn std::error::Error + 'static)),
            Error::Validation(e) => Some(e),
            _ => None,
        }
    }
}

impl fmt::Display for ConnectionError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.message)
    }
}

impl fmt::Display for QueryError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.message)
    }
}

impl fmt::Display for TypeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if let Some(col) = &self.column {
            write!(
                f,
                "expected {} for column '{}', found {}",
                self.expected, col, self.actual
            )
        } else {
            write!(f, "expected {}, found {}", self.expected, self.actual)
        }
    }
}

impl fmt::Display for TransactionError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.message)
    }
}

impl fmt::Display for StaleReferenceError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}.{} refers to {} row {} which no longer exists",
            self.owner, self.association, self.target_table, self.key
        )
    }
}

impl fmt::Display for InvalidOperationError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({})", self.message, self.kind.as_str())
    }
}

impl fmt::Display for ValidationError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.errors.is_empty() {
            write!(f, "validation passed")
        } else if self.errors.len() == 1 {
            let err = &self.errors[0];
            write!(f, "validation error on '{}': {}", err.field, err.message)
        } else {
            writeln!(f, "validation errors:")?;
            for err in &self.errors {
                writeln!(f, "  - {}: {}", err.field, err.message)?;
            }
            Ok(())
        }
    }
}

impl std::error::Error for ValidationError {}

impl From<ConnectionError> for Error {
    fn from(err: ConnectionError) -> Self {
        Error::Connection(err)
    }
}

impl From<QueryError> for Error {
    fn from(err: QueryError) -> Self {
        Error::Query(err)
    }
}

impl From<TypeError> for Error {
    fn from(err: TypeError) -> Self {
        Error::Type(err)
    }
}

impl From<TransactionError> for Error {
    fn from(err: TransactionError) -> Self {
        Error::Transaction(err)
    }
}

impl From<StaleReferenceError> for Error {
    fn from(err: StaleReferenceError) -> Self {
        Error::StaleReference(err)
    }
}

impl From<InvalidOperationError> for Error {
    fn from(err: InvalidOperationError) -> Self {
        Error::InvalidOperation(err)
    }
}

impl From<ValidationError> for Error {
    fn from(err: ValidationError) -> Self {
        Error::Validation(err)
    }
}

/// Result type alias for keel operations.
pub type Result<T> = std::result::Result<T, Error>;
