//! Typed statement model
//!
//! Statements arrive already parsed. Each variant carries the table it
//! targets plus the typed pieces the transaction layer inspects: equality
//! predicates, assigned values and the locking-read flag.

use a2pc_common::{Row, Value};
use std::fmt;

/// A single WHERE-clause predicate
#[derive(Debug, Clone, PartialEq)]
pub enum Predicate {
    Eq(String, Value),
    In(String, Vec<Value>),
    Lt(String, Value),
}

impl Predicate {
    /// One `Eq` predicate per column of `row`
    pub fn all_eq(row: &Row) -> Vec<Predicate> {
        row.iter()
            .map(|(column, value)| Predicate::Eq(column.clone(), value.clone()))
            .collect()
    }

    pub fn column(&self) -> &str {
        match self {
            Predicate::Eq(column, _) | Predicate::In(column, _) | Predicate::Lt(column, _) => column,
        }
    }

    /// Evaluate against a row. Missing columns read as NULL.
    pub fn matches(&self, row: &Row) -> bool {
        let current = row.get(self.column()).unwrap_or(&Value::Null);
        match self {
            Predicate::Eq(_, value) => values_equal(current, value),
            Predicate::In(_, values) => values.iter().any(|v| values_equal(current, v)),
            Predicate::Lt(_, value) => {
                !current.is_null() && current.compare(value) == Some(std::cmp::Ordering::Less)
            }
        }
    }
}

fn values_equal(a: &Value, b: &Value) -> bool {
    !a.is_null() && a.compare(b) == Some(std::cmp::Ordering::Equal)
}

impl fmt::Display for Predicate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Predicate::Eq(column, value) => write!(f, "`{}` = {}", column, value),
            Predicate::Lt(column, value) => write!(f, "`{}` < {}", column, value),
            Predicate::In(column, values) => {
                let list: Vec<String> = values.iter().map(|v| v.to_string()).collect();
                write!(f, "`{}` IN ({})", column, list.join(", "))
            }
        }
    }
}

/// A parsed statement
#[derive(Debug, Clone, PartialEq)]
pub enum Statement {
    Select {
        table: String,
        filter: Vec<Predicate>,
        for_update: bool,
        order_by: Option<String>,
        limit: Option<usize>,
    },
    Insert {
        table: String,
        values: Row,
        ignore: bool,
    },
    Update {
        table: String,
        assignments: Row,
        filter: Vec<Predicate>,
    },
    Delete {
        table: String,
        filter: Vec<Predicate>,
        limit: Option<usize>,
    },
    /// Schema setup, idempotent
    CreateTable {
        table: String,
        unique_key: Vec<String>,
    },
}

impl Statement {
    pub fn select(table: impl Into<String>, filter: Vec<Predicate>) -> Self {
        Statement::Select {
            table: table.into(),
            filter,
            for_update: false,
            order_by: None,
            limit: None,
        }
    }

    pub fn select_for_update(table: impl Into<String>, filter: Vec<Predicate>) -> Self {
        Statement::Select {
            table: table.into(),
            filter,
            for_update: true,
            order_by: None,
            limit: None,
        }
    }

    pub fn insert(table: impl Into<String>, values: Row) -> Self {
        Statement::Insert {
            table: table.into(),
            values,
            ignore: false,
        }
    }

    pub fn insert_ignore(table: impl Into<String>, values: Row) -> Self {
        Statement::Insert {
            table: table.into(),
            values,
            ignore: true,
        }
    }

    pub fn update(table: impl Into<String>, assignments: Row, filter: Vec<Predicate>) -> Self {
        Statement::Update {
            table: table.into(),
            assignments,
            filter,
        }
    }

    pub fn delete(table: impl Into<String>, filter: Vec<Predicate>) -> Self {
        Statement::Delete {
            table: table.into(),
            filter,
            limit: None,
        }
    }

    pub fn create_table(table: impl Into<String>, unique_key: &[&str]) -> Self {
        Statement::CreateTable {
            table: table.into(),
            unique_key: unique_key.iter().map(|c| c.to_string()).collect(),
        }
    }

    pub fn table(&self) -> &str {
        match self {
            Statement::Select { table, .. }
            | Statement::Insert { table, .. }
            | Statement::Update { table, .. }
            | Statement::Delete { table, .. }
            | Statement::CreateTable { table, .. } => table,
        }
    }

    /// Same statement against another physical table
    pub fn with_table(&self, physical: &str) -> Self {
        let mut statement = self.clone();
        match &mut statement {
            Statement::Select { table, .. }
            | Statement::Insert { table, .. }
            | Statement::Update { table, .. }
            | Statement::Delete { table, .. }
            | Statement::CreateTable { table, .. } => *table = physical.to_string(),
        }
        statement
    }

    pub fn filter(&self) -> &[Predicate] {
        match self {
            Statement::Select { filter, .. }
            | Statement::Update { filter, .. }
            | Statement::Delete { filter, .. } => filter,
            Statement::Insert { .. } | Statement::CreateTable { .. } => &[],
        }
    }

    /// Column values pinned by equality predicates
    pub fn equalities(&self) -> Row {
        self.filter()
            .iter()
            .filter_map(|p| match p {
                Predicate::Eq(column, value) => Some((column.clone(), value.clone())),
                _ => None,
            })
            .collect()
    }

    /// Values written by INSERT or UPDATE
    pub fn assigned_values(&self) -> Option<&Row> {
        match self {
            Statement::Insert { values, .. } => Some(values),
            Statement::Update { assignments, .. } => Some(assignments),
            _ => None,
        }
    }

    /// Column values that identify the affected row: equality predicates,
    /// overlaid with inserted values for INSERT.
    pub fn row_identity(&self) -> Row {
        match self {
            Statement::Insert { values, .. } => values.clone(),
            _ => self.equalities(),
        }
    }

    pub fn is_locking_read(&self) -> bool {
        matches!(self, Statement::Select { for_update: true, .. })
    }

    pub fn is_write(&self) -> bool {
        matches!(
            self,
            Statement::Insert { .. } | Statement::Update { .. } | Statement::Delete { .. }
        )
    }

    pub fn matches(&self, row: &Row) -> bool {
        self.filter().iter().all(|p| p.matches(row))
    }
}

fn render_filter(f: &mut fmt::Formatter<'_>, filter: &[Predicate]) -> fmt::Result {
    if filter.is_empty() {
        return Ok(());
    }
    let parts: Vec<String> = filter.iter().map(|p| p.to_string()).collect();
    write!(f, " WHERE {}", parts.join(" AND "))
}

fn render_assignments(row: &Row) -> String {
    row.iter()
        .map(|(column, value)| format!("`{}` = {}", column, value))
        .collect::<Vec<_>>()
        .join(", ")
}

/// Renders MySQL-flavoured SQL text.
impl fmt::Display for Statement {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Statement::Select {
                table,
                filter,
                for_update,
                order_by,
                limit,
            } => {
                write!(f, "SELECT * FROM `{}`", table)?;
                render_filter(f, filter)?;
                if let Some(column) = order_by {
                    write!(f, " ORDER BY `{}`", column)?;
                }
                if let Some(limit) = limit {
                    write!(f, " LIMIT {}", limit)?;
                }
                if *for_update {
                    write!(f, " FOR UPDATE")?;
                }
                Ok(())
            }
            Statement::Insert {
                table,
                values,
                ignore,
            } => {
                let columns: Vec<String> = values.keys().map(|c| format!("`{}`", c)).collect();
                let literals: Vec<String> = values.values().map(|v| v.to_string()).collect();
                write!(
                    f,
                    "INSERT {}INTO `{}` ({}) VALUES ({})",
                    if *ignore { "IGNORE " } else { "" },
                    table,
                    columns.join(", "),
                    literals.join(", ")
                )
            }
            Statement::Update {
                table,
                assignments,
                filter,
            } => {
                write!(f, "UPDATE `{}` SET {}", table, render_assignments(assignments))?;
                render_filter(f, filter)
            }
            Statement::Delete {
                table,
                filter,
                limit,
            } => {
                write!(f, "DELETE FROM `{}`", table)?;
                render_filter(f, filter)?;
                if let Some(limit) = limit {
                    write!(f, " LIMIT {}", limit)?;
                }
                Ok(())
            }
            Statement::CreateTable { table, unique_key } => {
                write!(f, "CREATE TABLE IF NOT EXISTS `{}`", table)?;
                if !unique_key.is_empty() {
                    let columns: Vec<String> =
                        unique_key.iter().map(|c| format!("`{}`", c)).collect();
                    write!(f, " (UNIQUE KEY ({}))", columns.join(", "))?;
                }
                Ok(())
            }
        }
    }
}

/// Outcome of executing a statement
#[derive(Debug, Clone, PartialEq)]
pub enum QueryResult {
    Ok { affected_rows: u64 },
    Rows(Vec<Row>),
}

impl QueryResult {
    pub fn affected_rows(&self) -> u64 {
        match self {
            QueryResult::Ok { affected_rows } => *affected_rows,
            QueryResult::Rows(rows) => rows.len() as u64,
        }
    }

    pub fn into_rows(self) -> Vec<Row> {
        match self {
            QueryResult::Rows(rows) => rows,
            QueryResult::Ok { .. } => Vec::new(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn row(pairs: &[(&str, Value)]) -> Row {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.clone()))
            .collect()
    }

    #[test]
    fn test_render_sql() {
        let select = Statement::Select {
            table: "users".into(),
            filter: vec![Predicate::Eq("id".into(), 5.into())],
            for_update: true,
            order_by: Some("id".into()),
            limit: Some(1),
        };
        assert_eq!(
            select.to_string(),
            "SELECT * FROM `users` WHERE `id` = 5 ORDER BY `id` LIMIT 1 FOR UPDATE"
        );

        let update = Statement::update(
            "users",
            row(&[("name", "b".into())]),
            vec![Predicate::Eq("id".into(), 7.into())],
        );
        assert_eq!(update.to_string(), "UPDATE `users` SET `name` = 'b' WHERE `id` = 7");

        let insert = Statement::insert_ignore("t", row(&[("a", 1.into()), ("b", Value::Null)]));
        assert_eq!(insert.to_string(), "INSERT IGNORE INTO `t` (`a`, `b`) VALUES (1, NULL)");

        let delete = Statement::delete("t", vec![Predicate::In("a".into(), vec![1.into(), 2.into()])]);
        assert_eq!(delete.to_string(), "DELETE FROM `t` WHERE `a` IN (1, 2)");
    }

    #[test]
    fn test_equalities_and_identity() {
        let update = Statement::update(
            "users",
            row(&[("name", "b".into())]),
            vec![
                Predicate::Eq("id".into(), 7.into()),
                Predicate::Lt("age".into(), 30.into()),
            ],
        );
        assert_eq!(update.equalities(), row(&[("id", 7.into())]));
        assert_eq!(update.row_identity(), row(&[("id", 7.into())]));
        assert!(update.is_write());
        assert!(!update.is_locking_read());

        let insert = Statement::insert("users", row(&[("id", 9.into()), ("name", "x".into())]));
        assert_eq!(insert.row_identity().get("id"), Some(&Value::Integer(9)));
    }

    #[test]
    fn test_predicates() {
        let r = row(&[("id", 3.into()), ("name", "a".into())]);
        assert!(Predicate::Eq("id".into(), 3.into()).matches(&r));
        assert!(!Predicate::Eq("missing".into(), Value::Null).matches(&r));
        assert!(Predicate::In("id".into(), vec![1.into(), 3.into()]).matches(&r));
        assert!(Predicate::Lt("id".into(), 4.into()).matches(&r));
        assert!(!Predicate::Lt("id".into(), 3.into()).matches(&r));
    }

    #[test]
    fn test_with_table() {
        let select = Statement::select("users", vec![]);
        assert_eq!(select.with_table("users_1").table(), "users_1");
    }
}
