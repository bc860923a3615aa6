//! Injection-safe statement composition for relational adapters.
//!
//! Filter values always travel as bound parameters. Placeholders are numbered
//! `$1, $2, ...` in the order filters were added, and a paginated select
//! shares its WHERE clause and filter parameters with its COUNT statement.
//! Table and column names are validated and double-quoted; a name that is not
//! a plain identifier is rejected with `InvalidConfiguration`.
//!
//! ```rust
//! use servicekit::database::{Filter, Pagination, SelectBuilder, SortDirection};
//!
//! let search: Option<&str> = Some("ann");
//! let role: Option<&str> = None;
//!
//! let query = SelectBuilder::new("users")
//!     .columns(["id", "email", "name"])
//!     .filter(Filter::contains(["email", "name"], search))
//!     .filter(Filter::any("roles", role))
//!     .order_by("created_at", SortDirection::Desc)
//!     .paginate(Pagination::new(2, 10))
//!     .unwrap();
//!
//! assert_eq!(
//!     query.select.sql,
//!     "SELECT \"id\", \"email\", \"name\" FROM \"users\" \
//!      WHERE (\"email\" ILIKE $1 OR \"name\" ILIKE $1) \
//!      ORDER BY \"created_at\" DESC LIMIT $2 OFFSET $3"
//! );
//! assert_eq!(
//!     query.count.sql,
//!     "SELECT COUNT(*) AS count FROM \"users\" WHERE (\"email\" ILIKE $1 OR \"name\" ILIKE $1)"
//! );
//! ```

use std::fmt;

use serde::Serialize;
use serde_json::Value;

use super::{DatabaseProvider, Row, SqlValue};
use crate::error::{ErrorDomain, ServiceError, ServiceResult};

/// A statement and its bound parameters.
#[derive(Debug, Clone, PartialEq)]
pub struct Statement {
    pub sql: String,
    pub params: Vec<SqlValue>,
}

impl Statement {
    pub fn new(sql: impl Into<String>, params: Vec<SqlValue>) -> Self {
        Self {
            sql: sql.into(),
            params,
        }
    }
}

/// Sort direction of an `ORDER BY` clause.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SortDirection {
    Asc,
    Desc,
}

impl fmt::Display for SortDirection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SortDirection::Asc => f.write_str("ASC"),
            SortDirection::Desc => f.write_str("DESC"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Comparator {
    Equals,
    Matches,
    Contains,
    AnyOf,
}

/// One optional predicate.
///
/// A filter whose value is NULL (e.g. built from `None`) or a blank string
/// is inactive and left out of the statement. `false` and `0` are real
/// values and are kept. [`Filter::matches`] is the exception: it is always
/// rendered.
#[derive(Debug, Clone, PartialEq)]
pub struct Filter {
    columns: Vec<String>,
    comparator: Comparator,
    value: SqlValue,
}

impl Filter {
    /// `column = value`
    pub fn eq(column: impl Into<String>, value: impl Into<SqlValue>) -> Self {
        Self {
            columns: vec![column.into()],
            comparator: Comparator::Equals,
            value: value.into(),
        }
    }

    /// Strict equality that is never skipped: a blank string is compared as
    /// is and NULL renders as `column IS NULL`.
    pub fn matches(column: impl Into<String>, value: impl Into<SqlValue>) -> Self {
        Self {
            columns: vec![column.into()],
            comparator: Comparator::Matches,
            value: value.into(),
        }
    }

    /// Case-insensitive substring match of `term` against any of `columns`.
    ///
    /// All columns share one placeholder. LIKE wildcards in `term` are
    /// escaped, so `50%` matches the literal text.
    pub fn contains<I, S>(columns: I, term: impl Into<SqlValue>) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            columns: columns.into_iter().map(Into::into).collect(),
            comparator: Comparator::Contains,
            value: term.into(),
        }
    }

    /// `value = ANY(column)` for array columns.
    pub fn any(column: impl Into<String>, value: impl Into<SqlValue>) -> Self {
        Self {
            columns: vec![column.into()],
            comparator: Comparator::AnyOf,
            value: value.into(),
        }
    }

    /// Whether the filter contributes a predicate.
    pub fn is_active(&self) -> bool {
        self.comparator == Comparator::Matches || !self.value.is_absent()
    }

    /// The predicate and the value bound to `placeholder`, if any.
    fn render(&self, placeholder: usize) -> ServiceResult<(String, Option<SqlValue>)> {
        let column = |c: &String| quote_ident(c);
        match self.comparator {
            Comparator::Matches if self.value == SqlValue::Null => {
                let col = column(single(&self.columns)?)?;
                Ok((format!("{} IS NULL", col), None))
            }
            Comparator::Equals | Comparator::Matches => {
                let col = column(single(&self.columns)?)?;
                Ok((format!("{} = ${}", col, placeholder), Some(self.value.clone())))
            }
            Comparator::AnyOf => {
                let col = column(single(&self.columns)?)?;
                Ok((format!("${} = ANY({})", placeholder, col), Some(self.value.clone())))
            }
            Comparator::Contains => {
                let term = match &self.value {
                    SqlValue::Text(s) => s.trim(),
                    other => {
                        return Err(invalid(format!(
                            "substring filter requires a text value, got {:?}",
                            other
                        )))
                    }
                };
                if self.columns.is_empty() {
                    return Err(invalid("substring filter requires at least one column"));
                }
                let predicates = self
                    .columns
                    .iter()
                    .map(|c| column(c).map(|col| format!("{} ILIKE ${}", col, placeholder)))
                    .collect::<ServiceResult<Vec<_>>>()?;
                let sql = if predicates.len() == 1 {
                    predicates.join("")
                } else {
                    format!("({})", predicates.join(" OR "))
                };
                Ok((sql, Some(SqlValue::Text(format!("%{}%", escape_like(term))))))
            }
        }
    }
}

fn single(columns: &[String]) -> ServiceResult<&String> {
    match columns {
        [column] => Ok(column),
        _ => Err(invalid("filter requires exactly one column")),
    }
}

/// Render the active filters as ` WHERE ...` (or an empty string) with
/// placeholders starting at `$1`.
fn where_clause(filters: &[Filter]) -> ServiceResult<(String, Vec<SqlValue>)> {
    let mut predicates = Vec::new();
    let mut params = Vec::new();
    for filter in filters.iter().filter(|f| f.is_active()) {
        let (sql, value) = filter.render(params.len() + 1)?;
        predicates.push(sql);
        params.extend(value);
    }
    if predicates.is_empty() {
        return Ok((String::new(), params));
    }
    Ok((format!(" WHERE {}", predicates.join(" AND ")), params))
}

/// 1-based page and page size. Values below 1 are raised to 1.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct Pagination {
    page: u32,
    limit: u32,
}

impl Pagination {
    pub fn new(page: u32, limit: u32) -> Self {
        Self {
            page: page.max(1),
            limit: limit.max(1),
        }
    }

    pub fn page(&self) -> u32 {
        self.page
    }

    pub fn limit(&self) -> u32 {
        self.limit
    }

    /// Zero-based row offset: `(page - 1) * limit`.
    pub fn offset(&self) -> u64 {
        u64::from(self.page - 1) * u64::from(self.limit)
    }
}

impl Default for Pagination {
    fn default() -> Self {
        Self::new(1, 20)
    }
}

/// A paginated select and the COUNT statement sharing its filters.
#[derive(Debug, Clone, PartialEq)]
pub struct PagedQuery {
    pub select: Statement,
    pub count: Statement,
    pub pagination: Pagination,
}

/// One page of results.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Page<T> {
    pub items: Vec<T>,
    pub page: u32,
    pub limit: u32,
    pub total: u64,
    pub total_pages: u64,
}

impl<T> Page<T> {
    /// `total_pages` is `ceil(total / limit)`.
    pub fn new(items: Vec<T>, pagination: Pagination, total: u64) -> Self {
        let limit = u64::from(pagination.limit());
        Self {
            items,
            page: pagination.page(),
            limit: pagination.limit(),
            total,
            total_pages: total.div_ceil(limit),
        }
    }
}

/// Composes `SELECT` statements.
#[derive(Debug, Clone)]
pub struct SelectBuilder {
    table: String,
    columns: Vec<String>,
    filters: Vec<Filter>,
    order_by: Option<(String, SortDirection)>,
}

impl SelectBuilder {
    /// Select every column of `table`.
    pub fn new(table: impl Into<String>) -> Self {
        Self {
            table: table.into(),
            columns: Vec::new(),
            filters: Vec::new(),
            order_by: None,
        }
    }

    pub fn columns<I, S>(mut self, columns: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.columns = columns.into_iter().map(Into::into).collect();
        self
    }

    pub fn filter(mut self, filter: Filter) -> Self {
        self.filters.push(filter);
        self
    }

    pub fn order_by(mut self, column: impl Into<String>, direction: SortDirection) -> Self {
        self.order_by = Some((column.into(), direction));
        self
    }

    /// The unpaginated select.
    pub fn build(&self) -> ServiceResult<Statement> {
        let (filters, params) = where_clause(&self.filters)?;
        let sql = format!("{}{}{}", self.head()?, filters, self.order_clause()?);
        Ok(Statement::new(sql, params))
    }

    /// The select limited to one page, plus its COUNT statement.
    pub fn paginate(&self, pagination: Pagination) -> ServiceResult<PagedQuery> {
        let table = quote_ident(&self.table)?;
        let (filters, params) = where_clause(&self.filters)?;

        let count = Statement::new(
            format!("SELECT COUNT(*) AS count FROM {}{}", table, filters),
            params.clone(),
        );

        let next = params.len() + 1;
        let mut select_params = params;
        select_params.push(SqlValue::Integer(i64::from(pagination.limit())));
        select_params.push(SqlValue::Integer(
            i64::try_from(pagination.offset()).unwrap_or(i64::MAX),
        ));
        let select = Statement::new(
            format!(
                "{}{}{} LIMIT ${} OFFSET ${}",
                self.head()?,
                filters,
                self.order_clause()?,
                next,
                next + 1
            ),
            select_params,
        );

        Ok(PagedQuery {
            select,
            count,
            pagination,
        })
    }

    fn head(&self) -> ServiceResult<String> {
        let columns = if self.columns.is_empty() {
            "*".to_string()
        } else {
            quote_list(&self.columns)?
        };
        Ok(format!("SELECT {} FROM {}", columns, quote_ident(&self.table)?))
    }

    fn order_clause(&self) -> ServiceResult<String> {
        match &self.order_by {
            Some((column, direction)) => {
                Ok(format!(" ORDER BY {} {}", quote_ident(column)?, direction))
            }
            None => Ok(String::new()),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
enum Assignment {
    Value(SqlValue),
    Now,
}

/// Composes `UPDATE ... SET ... WHERE ... RETURNING ...`.
///
/// Fields set to NULL (typically `None`) are skipped; building fails when no
/// field is left to update.
#[derive(Debug, Clone)]
pub struct UpdateBuilder {
    table: String,
    assignments: Vec<(String, Assignment)>,
    keys: Vec<(String, SqlValue)>,
    returning: Vec<String>,
}

impl UpdateBuilder {
    pub fn new(table: impl Into<String>) -> Self {
        Self {
            table: table.into(),
            assignments: Vec::new(),
            keys: Vec::new(),
            returning: Vec::new(),
        }
    }

    pub fn set(mut self, column: impl Into<String>, value: impl Into<SqlValue>) -> Self {
        let value = value.into();
        if value != SqlValue::Null {
            self.assignments.push((column.into(), Assignment::Value(value)));
        }
        self
    }

    /// `column = NOW()`, applied only when another field is updated.
    pub fn touch(mut self, column: impl Into<String>) -> Self {
        self.assignments.push((column.into(), Assignment::Now));
        self
    }

    pub fn where_eq(mut self, column: impl Into<String>, value: impl Into<SqlValue>) -> Self {
        self.keys.push((column.into(), value.into()));
        self
    }

    pub fn returning<I, S>(mut self, columns: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.returning = columns.into_iter().map(Into::into).collect();
        self
    }

    pub fn build(&self) -> ServiceResult<Statement> {
        if !self
            .assignments
            .iter()
            .any(|(_, a)| matches!(a, Assignment::Value(_)))
        {
            return Err(invalid("No fields to update"));
        }
        if self.keys.is_empty() {
            return Err(invalid("UPDATE requires a key predicate"));
        }

        let mut params = Vec::new();
        let mut sets = Vec::with_capacity(self.assignments.len());
        for (column, assignment) in &self.assignments {
            let column = quote_ident(column)?;
            match assignment {
                Assignment::Value(value) => {
                    params.push(value.clone());
                    sets.push(format!("{} = ${}", column, params.len()));
                }
                Assignment::Now => sets.push(format!("{} = NOW()", column)),
            }
        }

        let mut keys = Vec::with_capacity(self.keys.len());
        for (column, value) in &self.keys {
            params.push(value.clone());
            keys.push(format!("{} = ${}", quote_ident(column)?, params.len()));
        }

        let sql = format!(
            "UPDATE {} SET {} WHERE {}{}",
            quote_ident(&self.table)?,
            sets.join(", "),
            keys.join(" AND "),
            returning_clause(&self.returning)?
        );
        Ok(Statement::new(sql, params))
    }
}

/// Composes `INSERT INTO ... VALUES ... RETURNING ...`.
#[derive(Debug, Clone)]
pub struct InsertBuilder {
    table: String,
    values: Vec<(String, SqlValue)>,
    returning: Vec<String>,
}

impl InsertBuilder {
    pub fn new(table: impl Into<String>) -> Self {
        Self {
            table: table.into(),
            values: Vec::new(),
            returning: vec!["*".to_string()],
        }
    }

    pub fn value(mut self, column: impl Into<String>, value: impl Into<SqlValue>) -> Self {
        self.values.push((column.into(), value.into()));
        self
    }

    pub fn returning<I, S>(mut self, columns: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.returning = columns.into_iter().map(Into::into).collect();
        self
    }

    pub fn build(&self) -> ServiceResult<Statement> {
        if self.values.is_empty() {
            return Err(invalid("No fields to insert"));
        }
        let columns: Vec<String> = self.values.iter().map(|(c, _)| c.clone()).collect();
        let placeholders: Vec<String> = (1..=self.values.len()).map(|i| format!("${}", i)).collect();
        let sql = format!(
            "INSERT INTO {} ({}) VALUES ({}){}",
            quote_ident(&self.table)?,
            quote_list(&columns)?,
            placeholders.join(", "),
            returning_clause(&self.returning)?
        );
        Ok(Statement::new(
            sql,
            self.values.iter().map(|(_, v)| v.clone()).collect(),
        ))
    }
}

/// `DELETE FROM table WHERE column = $1`
pub(crate) fn delete_statement(
    table: &str,
    column: &str,
    key: impl Into<SqlValue>,
) -> ServiceResult<Statement> {
    Ok(Statement::new(
        format!(
            "DELETE FROM {} WHERE {} = $1",
            quote_ident(table)?,
            quote_ident(column)?
        ),
        vec![key.into()],
    ))
}

/// Equality select over every entry of a record filter. Blank and NULL
/// entries are real conditions here, not omitted ones.
pub(crate) fn select_matching(table: &str, filters: &Row) -> ServiceResult<Statement> {
    filters
        .iter()
        .fold(SelectBuilder::new(table), |builder, (column, value)| {
            builder.filter(Filter::matches(column.clone(), value.clone()))
        })
        .build()
}

/// Run a paginated query and its COUNT statement.
pub async fn fetch_page<D>(db: &D, query: &PagedQuery) -> ServiceResult<Page<Row>>
where
    D: DatabaseProvider + ?Sized,
{
    let items = db.query(&query.select.sql, &query.select.params).await?;
    let counted = db.query(&query.count.sql, &query.count.params).await?;

    let total = counted
        .first()
        .and_then(|row| row.get("count"))
        .and_then(|value| match value {
            Value::Number(n) => n.as_u64(),
            Value::String(s) => s.parse().ok(),
            _ => None,
        })
        .ok_or_else(|| ServiceError::query_failed("count statement returned no count"))?;

    tracing::debug!(
        provider = db.name(),
        page = query.pagination.page(),
        total,
        "fetched page"
    );
    Ok(Page::new(items, query.pagination, total))
}

fn returning_clause(columns: &[String]) -> ServiceResult<String> {
    match columns {
        [] => Ok(String::new()),
        [star] if star == "*" => Ok(" RETURNING *".to_string()),
        _ => Ok(format!(" RETURNING {}", quote_list(columns)?)),
    }
}

fn quote_list(columns: &[String]) -> ServiceResult<String> {
    Ok(columns
        .iter()
        .map(|c| quote_ident(c))
        .collect::<ServiceResult<Vec<_>>>()?
        .join(", "))
}

/// Validate `name` as a plain (optionally schema-qualified) identifier and
/// double-quote each part.
pub(crate) fn quote_ident(name: &str) -> ServiceResult<String> {
    let valid_part = |part: &str| {
        let mut chars = part.chars();
        matches!(chars.next(), Some(c) if c.is_ascii_alphabetic() || c == '_')
            && chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
    };
    if name.split('.').all(valid_part) {
        Ok(name
            .split('.')
            .map(|part| format!("\"{}\"", part))
            .collect::<Vec<_>>()
            .join("."))
    } else {
        Err(invalid(format!("invalid identifier: {:?}", name)))
    }
}

fn escape_like(term: &str) -> String {
    let mut escaped = String::with_capacity(term.len());
    for c in term.chars() {
        if matches!(c, '\\' | '%' | '_') {
            escaped.push('\\');
        }
        escaped.push(c);
    }
    escaped
}

fn invalid(message: impl Into<String>) -> ServiceError {
    ServiceError::invalid_config(ErrorDomain::Database, message)
}
