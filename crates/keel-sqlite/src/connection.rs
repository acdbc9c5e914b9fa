//! SQLite connection implementing the keel `Store` trait.
//!
//! All access to the database handle goes through a mutex, so a connection
//! can be moved between threads and shared by reference.

// Lengths and indices cross into C as c_int.
#![allow(clippy::cast_possible_truncation)]
#![allow(clippy::cast_sign_loss)]
#![allow(clippy::borrow_as_ptr)] // FFI requires raw pointers

use crate::ffi;
use crate::types;
use keel_core::{
    ConnectionError, ConnectionErrorKind, Dialect, Error, QueryError, QueryErrorKind, Result, Row,
    Store, TransactionError, TransactionErrorKind, Value, row::ColumnInfo,
};
use std::ffi::{CStr, CString, c_int};
use std::ptr;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

/// Configuration for opening SQLite connections.
#[derive(Debug, Clone)]
pub struct SqliteConfig {
    /// File path, or `:memory:`.
    pub path: String,
    /// How the file is opened.
    pub flags: OpenFlags,
    /// How long a statement waits on a locked database, in milliseconds.
    pub busy_timeout_ms: u32,
    /// Enforce foreign key constraints (`PRAGMA foreign_keys`).
    pub foreign_keys: bool,
}

/// `sqlite3_open_v2` flags.
#[derive(Debug, Clone, Copy, Default)]
pub struct OpenFlags {
    /// Open for reading only.
    pub read_only: bool,
    /// Open for reading and writing.
    pub read_write: bool,
    /// Create the database if it doesn't exist.
    pub create: bool,
    /// Enable URI filename interpretation.
    pub uri: bool,
    /// Open in multi-thread mode.
    pub no_mutex: bool,
    /// Open in serialized mode.
    pub full_mutex: bool,
}

impl OpenFlags {
    /// Read-only.
    pub fn read_only() -> Self {
        Self {
            read_only: true,
            ..Default::default()
        }
    }

    /// Read-write; the file must already exist.
    pub fn read_write() -> Self {
        Self {
            read_write: true,
            ..Default::default()
        }
    }

    /// Read-write, creating the file if needed.
    pub fn create_read_write() -> Self {
        Self {
            read_write: true,
            create: true,
            ..Default::default()
        }
    }

    fn to_sqlite_flags(self) -> c_int {
        let mut flags = 0;

        if self.read_only {
            flags |= ffi::SQLITE_OPEN_READONLY;
        }
        if self.read_write {
            flags |= ffi::SQLITE_OPEN_READWRITE;
        }
        if self.create {
            flags |= ffi::SQLITE_OPEN_CREATE;
        }
        if self.uri {
            flags |= ffi::SQLITE_OPEN_URI;
        }
        if self.no_mutex {
            flags |= ffi::SQLITE_OPEN_NOMUTEX;
        }
        if self.full_mutex {
            flags |= ffi::SQLITE_OPEN_FULLMUTEX;
        }

        if flags & (ffi::SQLITE_OPEN_READONLY | ffi::SQLITE_OPEN_READWRITE) == 0 {
            flags |= ffi::SQLITE_OPEN_READWRITE | ffi::SQLITE_OPEN_CREATE;
        }

        flags
    }
}

impl Default for SqliteConfig {
    fn default() -> Self {
        Self {
            path: ":memory:".to_string(),
            flags: OpenFlags::create_read_write(),
            busy_timeout_ms: 5000,
            foreign_keys: true,
        }
    }
}

impl SqliteConfig {
    /// A database file at `path`.
    pub fn file(path: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            ..Self::default()
        }
    }

    /// A private in-memory database.
    pub fn memory() -> Self {
        Self::default()
    }

    /// Set open flags.
    pub fn flags(mut self, flags: OpenFlags) -> Self {
        self.flags = flags;
        self
    }

    /// Set busy timeout.
    pub fn busy_timeout(mut self, ms: u32) -> Self {
        self.busy_timeout_ms = ms;
        self
    }

    pub fn foreign_keys(mut self, enabled: bool) -> Self {
        self.foreign_keys = enabled;
        self
    }
}

/// Inner state of the SQLite connection, protected by a mutex.
struct SqliteInner {
    db: *mut ffi::sqlite3,
    in_transaction: bool,
}

// SAFETY: the handle is only used while the owning Mutex is held.
unsafe impl Send for SqliteInner {}

/// One SQLite database handle, usable as a keel [`Store`].
pub struct SqliteConnection {
    inner: Mutex<SqliteInner>,
    path: String,
}

/// Finalizes a prepared statement when dropped.
struct PreparedStmt(*mut ffi::sqlite3_stmt);

impl Drop for PreparedStmt {
    fn drop(&mut self) {
        // SAFETY: the handle came from sqlite3_prepare_v2 and is finalized once
        unsafe {
            ffi::sqlite3_finalize(self.0);
        }
    }
}

impl SqliteConnection {
    /// Open a handle per `config`.
    #[tracing::instrument(level = "debug", skip(config), fields(path = %config.path))]
    pub fn open(config: &SqliteConfig) -> Result<Self> {
        let c_path = CString::new(config.path.as_str()).map_err(|_| {
            Error::Connection(ConnectionError {
                kind: ConnectionErrorKind::Connect,
                message: "Invalid path: contains null byte".to_string(),
                source: None,
            })
        })?;

        let mut db: *mut ffi::sqlite3 = ptr::null_mut();
        let flags = config.flags.to_sqlite_flags();

        // SAFETY: We pass valid pointers and check the return value
        let rc = unsafe { ffi::sqlite3_open_v2(c_path.as_ptr(), &mut db, flags, ptr::null()) };

        if rc != ffi::SQLITE_OK {
            let msg = if db.is_null() {
                ffi::error_string(rc).to_string()
            } else {
                // SAFETY: db is a valid handle that failed to open and must
                // still be closed
                unsafe {
                    let (_, msg) = ffi::last_error(db);
                    ffi::sqlite3_close(db);
                    msg
                }
            };

            return Err(Error::Connection(ConnectionError {
                kind: ConnectionErrorKind::Connect,
                message: format!("Failed to open database: {}", msg),
                source: None,
            }));
        }

        if config.busy_timeout_ms > 0 {
            // SAFETY: db is valid
            unsafe {
                ffi::sqlite3_busy_timeout(
                    db,
                    c_int::try_from(config.busy_timeout_ms).unwrap_or(c_int::MAX),
                );
            }
        }

        let conn = Self {
            inner: Mutex::new(SqliteInner {
                db,
                in_transaction: false,
            }),
            path: config.path.clone(),
        };
        if config.foreign_keys {
            conn.execute_raw("PRAGMA foreign_keys = ON")?;
        }
        tracing::debug!(version = ffi::version(), "sqlite database opened");
        Ok(conn)
    }

    /// Shorthand for `open(&SqliteConfig::memory())`.
    pub fn open_memory() -> Result<Self> {
        Self::open(&SqliteConfig::memory())
    }

    /// Shorthand for `open(&SqliteConfig::file(path))`.
    pub fn open_file(path: impl Into<String>) -> Result<Self> {
        Self::open(&SqliteConfig::file(path))
    }

    /// The path this handle was opened with.
    pub fn path(&self) -> &str {
        &self.path
    }

    fn lock(&self) -> MutexGuard<'_, SqliteInner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Run one or more statements without parameters, e.g. schema DDL.
    ///
    /// `sql` may contain several statements separated by semicolons.
    pub fn execute_raw(&self, sql: &str) -> Result<()> {
        let inner = self.lock();
        exec(inner.db, sql)
    }

    /// Rowid of the most recent successful INSERT.
    pub fn last_insert_rowid(&self) -> i64 {
        let inner = self.lock();
        // SAFETY: db is valid
        unsafe { ffi::sqlite3_last_insert_rowid(inner.db) }
    }

    /// Rows changed by the most recent statement.
    pub fn changes(&self) -> i32 {
        let inner = self.lock();
        // SAFETY: db is valid
        unsafe { ffi::sqlite3_changes(inner.db) }
    }

    /// Is a transaction open on this connection?
    pub fn in_transaction(&self) -> bool {
        self.lock().in_transaction
    }

    /// Prepare `sql` and bind `params`.
    fn prepare(db: *mut ffi::sqlite3, sql: &str, params: &[Value]) -> Result<PreparedStmt> {
        let stmt = PreparedStmt(prepare_stmt(db, sql)?);

        // SAFETY: stmt is valid
        let expected = unsafe { ffi::sqlite3_bind_parameter_count(stmt.0) };
        if usize::try_from(expected).unwrap_or(0) != params.len() {
            return Err(Error::Query(QueryError {
                kind: QueryErrorKind::Database,
                sql: Some(sql.to_string()),
                message: format!(
                    "statement expects {} parameters, {} given",
                    expected,
                    params.len()
                ),
                source: None,
            }));
        }

        for (i, param) in params.iter().enumerate() {
            // SAFETY: stmt is valid, index is 1-based and within the count
            let rc = unsafe { types::bind_value(stmt.0, (i + 1) as c_int, param) };
            if rc != ffi::SQLITE_OK {
                return Err(bind_error(db, sql, i + 1));
            }
        }
        Ok(stmt)
    }

    fn transaction_control(&self, sql: &str, opening: bool) -> Result<()> {
        let mut inner = self.lock();
        if inner.in_transaction == opening {
            let (kind, message) = if opening {
                (TransactionErrorKind::AlreadyActive, "Already in a transaction")
            } else {
                (TransactionErrorKind::NotActive, "Not in a transaction")
            };
            return Err(Error::Transaction(TransactionError {
                kind,
                message: message.to_string(),
            }));
        }
        exec(inner.db, sql)?;
        inner.in_transaction = opening;
        tracing::debug!(path = %self.path, "{sql}");
        Ok(())
    }
}

impl Store for SqliteConnection {
    fn dialect(&self) -> Dialect {
        Dialect::Sqlite
    }

    fn query(&self, sql: &str, params: &[Value]) -> Result<Vec<Row>> {
        let inner = self.lock();
        let stmt = Self::prepare(inner.db, sql, params)?;

        // SAFETY: stmt is valid
        let col_count = unsafe { ffi::sqlite3_column_count(stmt.0) };
        let col_names = (0..col_count)
            .map(|i| {
                // SAFETY: stmt is valid, i < col_count
                unsafe { types::column_name(stmt.0, i) }.unwrap_or_else(|| format!("col{}", i))
            })
            .collect();
        let columns = Arc::new(ColumnInfo::new(col_names));

        let mut rows = Vec::new();
        loop {
            // SAFETY: stmt is valid
            let rc = unsafe { ffi::sqlite3_step(stmt.0) };
            match rc {
                ffi::SQLITE_ROW => {
                    let values = (0..col_count)
                        // SAFETY: stmt is valid, we just got SQLITE_ROW
                        .map(|i| unsafe { types::read_column(stmt.0, i) })
                        .collect();
                    rows.push(Row::with_columns(Arc::clone(&columns), values));
                }
                ffi::SQLITE_DONE => break,
                _ => return Err(step_error(inner.db, sql)),
            }
        }

        tracing::trace!(sql, rows = rows.len(), "query");
        Ok(rows)
    }

    fn execute(&self, sql: &str, params: &[Value]) -> Result<u64> {
        let inner = self.lock();
        let stmt = Self::prepare(inner.db, sql, params)?;

        // SAFETY: stmt is valid
        let rc = unsafe { ffi::sqlite3_step(stmt.0) };
        if rc != ffi::SQLITE_DONE && rc != ffi::SQLITE_ROW {
            return Err(step_error(inner.db, sql));
        }
        drop(stmt);

        // SAFETY: db is valid
        let changes = unsafe { ffi::sqlite3_changes(inner.db) };
        tracing::trace!(sql, changes, "execute");
        Ok(u64::try_from(changes).unwrap_or(0))
    }

    fn insert(&self, sql: &str, params: &[Value]) -> Result<i64> {
        self.execute(sql, params)?;
        Ok(self.last_insert_rowid())
    }

    /// Starts a write transaction up front so the unit of work never has to
    /// upgrade a read lock mid-flush.
    fn begin(&self) -> Result<()> {
        self.transaction_control("BEGIN IMMEDIATE", true)
    }

    fn commit(&self) -> Result<()> {
        self.transaction_control("COMMIT", false)
    }

    fn rollback(&self) -> Result<()> {
        self.transaction_control("ROLLBACK", false)
    }
}

impl Drop for SqliteConnection {
    fn drop(&mut self) {
        let inner = self.lock();
        if !inner.db.is_null() {
            // SAFETY: db is valid and closed exactly once
            unsafe {
                ffi::sqlite3_close_v2(inner.db);
            }
        }
    }
}

impl std::fmt::Debug for SqliteConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SqliteConnection")
            .field("path", &self.path)
            .field("in_transaction", &self.in_transaction())
            .finish_non_exhaustive()
    }
}

// Helper functions

fn exec(db: *mut ffi::sqlite3, sql: &str) -> Result<()> {
    let c_sql = CString::new(sql).map_err(|_| null_byte(sql))?;
    let mut errmsg: *mut std::ffi::c_char = ptr::null_mut();

    // SAFETY: All pointers are valid
    let rc = unsafe { ffi::sqlite3_exec(db, c_sql.as_ptr(), None, ptr::null_mut(), &mut errmsg) };

    if rc != ffi::SQLITE_OK {
        let message = if errmsg.is_null() {
            ffi::error_string(rc).to_string()
        } else {
            // SAFETY: errmsg was allocated by SQLite and is freed once
            unsafe {
                let msg = CStr::from_ptr(errmsg).to_string_lossy().into_owned();
                ffi::sqlite3_free(errmsg.cast());
                msg
            }
        };
        return Err(Error::Query(QueryError {
            kind: error_code_to_kind(rc),
            sql: Some(sql.to_string()),
            message,
            source: None,
        }));
    }
    Ok(())
}

fn prepare_stmt(db: *mut ffi::sqlite3, sql: &str) -> Result<*mut ffi::sqlite3_stmt> {
    let c_sql = CString::new(sql).map_err(|_| null_byte(sql))?;
    let mut stmt: *mut ffi::sqlite3_stmt = ptr::null_mut();

    // SAFETY: All pointers are valid
    let rc = unsafe {
        ffi::sqlite3_prepare_v2(
            db,
            c_sql.as_ptr(),
            c_sql.as_bytes().len() as c_int,
            &mut stmt,
            ptr::null_mut(),
        )
    };

    if rc != ffi::SQLITE_OK {
        return Err(step_error(db, sql));
    }
    Ok(stmt)
}

fn null_byte(sql: &str) -> Error {
    Error::Query(QueryError {
        kind: QueryErrorKind::Syntax,
        sql: Some(sql.to_string()),
        message: "SQL contains null byte".to_string(),
        source: None,
    })
}

fn bind_error(db: *mut ffi::sqlite3, sql: &str, param_index: usize) -> Error {
    // SAFETY: db is valid
    let (_, msg) = unsafe { ffi::last_error(db) };
    Error::Query(QueryError {
        kind: QueryErrorKind::Database,
        sql: Some(sql.to_string()),
        message: format!("Failed to bind parameter {}: {}", param_index, msg),
        source: None,
    })
}

fn step_error(db: *mut ffi::sqlite3, sql: &str) -> Error {
    // SAFETY: db is valid
    let (code, message) = unsafe { ffi::last_error(db) };
    Error::Query(QueryError {
        kind: error_code_to_kind(code),
        sql: Some(sql.to_string()),
        message,
        source: None,
    })
}

fn error_code_to_kind(code: c_int) -> QueryErrorKind {
    // Extended codes carry the primary code in the low byte.
    match code & 0xff {
        ffi::SQLITE_CONSTRAINT => QueryErrorKind::Constraint,
        ffi::SQLITE_BUSY | ffi::SQLITE_LOCKED => QueryErrorKind::Deadlock,
        ffi::SQLITE_PERM | ffi::SQLITE_AUTH | ffi::SQLITE_READONLY => QueryErrorKind::Permission,
        ffi::SQLITE_NOTFOUND => QueryErrorKind::NotFound,
        ffi::SQLITE_TOOBIG => QueryErrorKind::DataTruncation,
        ffi::SQLITE_INTERRUPT => QueryErrorKind::Cancelled,
        _ => QueryErrorKind::Database,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn conn_with_table() -> SqliteConnection {
        let conn = SqliteConnection::open_memory().unwrap();
        conn.execute_raw("CREATE TABLE test (id INTEGER PRIMARY KEY, name TEXT, age INTEGER)")
            .unwrap();
        conn
    }

    #[test]
    fn test_open_memory() {
        let conn = SqliteConnection::open_memory().unwrap();
        assert_eq!(conn.path(), ":memory:");
        assert_eq!(conn.dialect(), Dialect::Sqlite);
    }

    #[test]
    fn test_execute_raw() {
        let conn = conn_with_table();
        conn.execute_raw("INSERT INTO test (name) VALUES ('Alice')")
            .unwrap();
        assert_eq!(conn.changes(), 1);
        assert_eq!(conn.last_insert_rowid(), 1);
    }

    #[test]
    fn test_parameterized_query() {
        let conn = conn_with_table();
        conn.execute(
            "INSERT INTO test (name, age) VALUES (?1, ?2)",
            &[Value::Text("Alice".to_string()), Value::Int(30)],
        )
        .unwrap();

        let rows = conn
            .query(
                "SELECT id, name, age FROM test WHERE name = ?1",
                &[Value::Text("Alice".to_string())],
            )
            .unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].get_named::<String>("name").unwrap(), "Alice");
        assert_eq!(rows[0].get_named::<i32>("age").unwrap(), 30);
    }

    #[test]
    fn test_aliased_columns() {
        let conn = conn_with_table();
        conn.execute_raw("INSERT INTO test (name) VALUES ('Bob')")
            .unwrap();
        let rows = conn
            .query("SELECT \"t\".\"name\" AS \"team__name\" FROM test AS \"t\"", &[])
            .unwrap();
        assert_eq!(rows[0].get_named::<String>("team__name").unwrap(), "Bob");
    }

    #[test]
    fn test_null_handling() {
        let conn = conn_with_table();
        conn.execute("INSERT INTO test (name) VALUES (?1)", &[Value::Null])
            .unwrap();
        let rows = conn.query("SELECT * FROM test", &[]).unwrap();
        assert_eq!(rows[0].get_named::<Option<String>>("name").unwrap(), None);
    }

    #[test]
    fn test_insert_rowid() {
        let conn = conn_with_table();
        let sql = "INSERT INTO test (name) VALUES (?1)";
        assert_eq!(conn.insert(sql, &[Value::Text("Alice".into())]).unwrap(), 1);
        assert_eq!(conn.insert(sql, &[Value::Text("Bob".into())]).unwrap(), 2);
    }

    #[test]
    fn test_execute_reports_changes() {
        let conn = conn_with_table();
        conn.execute_raw("INSERT INTO test (name, age) VALUES ('a', 1), ('b', 2), ('c', 3)")
            .unwrap();
        let changed = conn
            .execute("UPDATE test SET age = age + 1 WHERE age >= ?1", &[Value::Int(2)])
            .unwrap();
        assert_eq!(changed, 2);
    }

    #[test]
    fn test_transaction() {
        let conn = conn_with_table();

        conn.begin().unwrap();
        assert!(conn.in_transaction());
        conn.execute("INSERT INTO test (name) VALUES (?1)", &[Value::Text("Alice".into())])
            .unwrap();
        conn.rollback().unwrap();
        assert!(conn.query("SELECT * FROM test", &[]).unwrap().is_empty());

        conn.begin().unwrap();
        conn.execute("INSERT INTO test (name) VALUES (?1)", &[Value::Text("Bob".into())])
            .unwrap();
        conn.commit().unwrap();
        assert_eq!(conn.query("SELECT * FROM test", &[]).unwrap().len(), 1);
    }

    #[test]
    fn test_transaction_misuse() {
        let conn = conn_with_table();
        let err = conn.commit().unwrap_err();
        assert!(matches!(
            err,
            Error::Transaction(TransactionError {
                kind: TransactionErrorKind::NotActive,
                ..
            })
        ));
        conn.begin().unwrap();
        let err = conn.begin().unwrap_err();
        assert!(matches!(
            err,
            Error::Transaction(TransactionError {
                kind: TransactionErrorKind::AlreadyActive,
                ..
            })
        ));
    }

    #[test]
    #[allow(clippy::approx_constant)]
    fn test_type_conversions() {
        let conn = SqliteConnection::open_memory().unwrap();
        conn.execute_raw("CREATE TABLE types (b BOOLEAN, i INTEGER, f REAL, t TEXT, bl BLOB, ts INTEGER, j TEXT)")
            .unwrap();
        conn.execute(
            "INSERT INTO types VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            &[
                Value::Bool(true),
                Value::BigInt(42),
                Value::Double(3.14),
                Value::Text("hello".to_string()),
                Value::Bytes(vec![1, 2, 3]),
                Value::Timestamp(1_700_000_000_000_000),
                Value::Json(serde_json::json!({"a": 1})),
            ],
        )
        .unwrap();

        let rows = conn.query("SELECT * FROM types", &[]).unwrap();
        let row = &rows[0];
        assert!(row.get_named::<bool>("b").unwrap());
        assert_eq!(row.get_named::<i64>("i").unwrap(), 42);
        assert!((row.get_named::<f64>("f").unwrap() - 3.14).abs() < 0.001);
        assert_eq!(row.get_named::<String>("t").unwrap(), "hello");
        assert_eq!(row.get_named::<Vec<u8>>("bl").unwrap(), vec![1, 2, 3]);
        assert_eq!(row.get_named::<i64>("ts").unwrap(), 1_700_000_000_000_000);
        assert_eq!(
            row.get_named::<serde_json::Value>("j").unwrap(),
            serde_json::json!({"a": 1})
        );
    }

    #[test]
    fn test_constraint_violation() {
        let conn = SqliteConnection::open_memory().unwrap();
        conn.execute_raw("CREATE TABLE u (name TEXT UNIQUE)").unwrap();
        conn.execute_raw("INSERT INTO u VALUES ('x')").unwrap();
        let err = conn
            .execute("INSERT INTO u VALUES (?1)", &[Value::Text("x".into())])
            .unwrap_err();
        match err {
            Error::Query(q) => assert_eq!(q.kind, QueryErrorKind::Constraint),
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn test_parameter_count_mismatch() {
        let conn = conn_with_table();
        let err = conn
            .query("SELECT * FROM test WHERE id = ?1", &[])
            .unwrap_err();
        assert!(err.to_string().contains("expects 1 parameters"));
    }

    #[test]
    fn test_syntax_error() {
        let conn = SqliteConnection::open_memory().unwrap();
        assert!(conn.query("SELEKT 1", &[]).is_err());
    }

    #[test]
    fn test_open_flags() {
        let tmp = std::env::temp_dir().join(format!("keel_flags_{}.db", std::process::id()));
        let _ = std::fs::remove_file(&tmp);

        let config = SqliteConfig::file(tmp.to_string_lossy().to_string())
            .flags(OpenFlags::create_read_write());
        let conn = SqliteConnection::open(&config).unwrap();
        conn.execute_raw("CREATE TABLE test (id INTEGER)").unwrap();
        drop(conn);

        let config = SqliteConfig::file(tmp.to_string_lossy().to_string())
            .flags(OpenFlags::read_only());
        let conn = SqliteConnection::open(&config).unwrap();
        assert!(conn.query("SELECT * FROM test", &[]).unwrap().is_empty());
        assert!(conn.execute_raw("INSERT INTO test VALUES (1)").is_err());
        drop(conn);

        let _ = std::fs::remove_file(&tmp);
    }
}
