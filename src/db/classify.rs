//! SQL statement classification into read or write intent.
//!
//! Uses [sqlparser](https://docs.rs/sqlparser/) so that formatting tricks or
//! comments cannot make a write look like a read. Only statements known to be
//! read-only classify as `Read`; everything else is `Write`.

use crate::error::{DbError, DbResult};
use crate::models::{ExecutionType, SupportedDatabase};
use sqlparser::ast::{SetExpr, Statement};
use sqlparser::dialect::{
    Dialect, DuckDbDialect, GenericDialect, MsSqlDialect, MySqlDialect, PostgreSqlDialect,
    SQLiteDialect, SnowflakeDialect,
};
use sqlparser::parser::Parser;

/// Get the SQL dialect for the given product.
fn get_dialect(product: SupportedDatabase) -> Box<dyn Dialect> {
    match product {
        p if p.is_postgres_family() => Box::new(PostgreSqlDialect {}),
        p if p.is_mysql_family() => Box::new(MySqlDialect {}),
        SupportedDatabase::Sqlite => Box::new(SQLiteDialect {}),
        SupportedDatabase::DuckDb => Box::new(DuckDbDialect {}),
        SupportedDatabase::SqlServer => Box::new(MsSqlDialect {}),
        SupportedDatabase::Snowflake => Box::new(SnowflakeDialect {}),
        _ => Box::new(GenericDialect {}),
    }
}

/// Classify `sql` as a read or a write.
///
/// A batch is a write if any statement in it is.
///
/// ```
/// use db_context::db::classify::execution_type_for;
/// use db_context::models::{ExecutionType, SupportedDatabase};
///
/// let read = execution_type_for("SELECT * FROM users", SupportedDatabase::PostgreSql);
/// assert_eq!(read.unwrap(), ExecutionType::Read);
///
/// let write = execution_type_for("DELETE FROM users", SupportedDatabase::Sqlite);
/// assert_eq!(write.unwrap(), ExecutionType::Write);
/// ```
pub fn execution_type_for(sql: &str, product: SupportedDatabase) -> DbResult<ExecutionType> {
    let dialect = get_dialect(product);
    let statements = Parser::parse_sql(dialect.as_ref(), sql)
        .map_err(|e| DbError::invalid_input(format!("Failed to parse SQL statement: {}", e)))?;

    if statements.is_empty() {
        return Err(DbError::invalid_input("Empty SQL statement"));
    }

    if statements.iter().all(is_read_only) {
        Ok(ExecutionType::Read)
    } else {
        Ok(ExecutionType::Write)
    }
}

fn is_read_only(stmt: &Statement) -> bool {
    match stmt {
        Statement::Query(query) => !matches!(*query.body, SetExpr::Insert(_) | SetExpr::Update(_)),
        Statement::ShowTables { .. }
        | Statement::ShowColumns { .. }
        | Statement::ShowDatabases { .. }
        | Statement::ShowSchemas { .. }
        | Statement::ShowCreate { .. }
        | Statement::ShowFunctions { .. }
        | Statement::ShowVariable { .. }
        | Statement::ShowVariables { .. }
        | Statement::ShowStatus { .. }
        | Statement::ShowCollation { .. }
        | Statement::ExplainTable { .. } => true,
        // EXPLAIN ANALYZE runs the statement, so it inherits the inner intent.
        Statement::Explain { statement, .. } => is_read_only(statement),
        _ => false,
    }
}
