use sqlparser::ast::{
    self, Expr, LimitClause, ObjectNamePart, SetExpr, Statement, TableFactor, TableObject, Value,
    ValueWithSpan,
};
use sqlparser::dialect::PostgreSqlDialect;
use sqlparser::parser::Parser;
use ulid::Ulid;

use crate::limits::DEFAULT_PAGE_SIZE;
use crate::model::Ms;

/// Parsed command from SQL input.
#[derive(Debug, PartialEq)]
pub enum Command {
    RegisterUser {
        id: Ulid,
        name: Option<String>,
    },
    ListItem {
        id: Ulid,
        owner_id: Ulid,
        name: Option<String>,
        available: bool,
    },
    SetItemAvailability {
        id: Ulid,
        available: bool,
    },
    RequestBooking {
        id: Ulid,
        item_id: Ulid,
        booker_id: Ulid,
        start: Ms,
        end: Ms,
    },
    DecideBooking {
        id: Ulid,
        owner_id: Ulid,
        approve: bool,
    },
    SelectBooking {
        id: Ulid,
        viewer_id: Ulid,
    },
    SelectByBooker {
        booker_id: Ulid,
        state: String,
        from: i64,
        size: i64,
    },
    SelectByOwner {
        owner_id: Ulid,
        state: String,
        from: i64,
        size: i64,
    },
    SelectItemSchedule {
        item_id: Ulid,
    },
    SelectOwnerSchedules {
        owner_id: Ulid,
    },
    Listen {
        channel: String,
    },
    /// `None` means `UNLISTEN *`.
    Unlisten {
        channel: Option<String>,
    },
}

pub fn parse_sql(sql: &str) -> Result<Command, SqlError> {
    let trimmed = sql.trim();
    let upper = trimmed.to_uppercase();
    if upper.starts_with("LISTEN ") {
        let channel = trimmed[7..].trim().trim_matches(';').to_string();
        return Ok(Command::Listen { channel });
    }
    if upper.starts_with("UNLISTEN") {
        let channel = trimmed[8..].trim().trim_matches(';').to_string();
        let channel = if channel.is_empty() || channel == "*" {
            None
        } else {
            Some(channel)
        };
        return Ok(Command::Unlisten { channel });
    }

    let dialect = PostgreSqlDialect {};
    let stmts = Parser::parse_sql(&dialect, sql).map_err(|e| SqlError::Parse(e.to_string()))?;
    if stmts.is_empty() {
        return Err(SqlError::Empty);
    }

    match &stmts[0] {
        Statement::Insert(insert) => parse_insert(insert),
        Statement::Update {
            table,
            assignments,
            selection,
            ..
        } => parse_update(table, assignments, selection),
        Statement::Query(query) => parse_select(query),
        other => Err(SqlError::Unsupported(format!("{other}"))),
    }
}

fn parse_insert(insert: &ast::Insert) -> Result<Command, SqlError> {
    let table = insert_table_name(insert)?;
    let values = extract_insert_values(insert)?;

    match table.as_str() {
        "users" => {
            if values.is_empty() {
                return Err(SqlError::WrongArity("users", 1, 0));
            }
            let id = parse_ulid(&values[0])?;
            let name = if values.len() >= 2 {
                parse_string_or_null(&values[1])?
            } else {
                None
            };
            Ok(Command::RegisterUser { id, name })
        }
        "items" => {
            if values.len() < 2 {
                return Err(SqlError::WrongArity("items", 2, values.len()));
            }
            let id = parse_ulid(&values[0])?;
            let owner_id = parse_ulid(&values[1])?;
            let name = if values.len() >= 3 {
                parse_string_or_null(&values[2])?
            } else {
                None
            };
            let available = if values.len() >= 4 {
                parse_bool(&values[3])?
            } else {
                true
            };
            Ok(Command::ListItem {
                id,
                owner_id,
                name,
                available,
            })
        }
        "bookings" => {
            if values.len() < 5 {
                return Err(SqlError::WrongArity("bookings", 5, values.len()));
            }
            Ok(Command::RequestBooking {
                id: parse_ulid(&values[0])?,
                item_id: parse_ulid(&values[1])?,
                booker_id: parse_ulid(&values[2])?,
                start: parse_i64(&values[3])?,
                end: parse_i64(&values[4])?,
            })
        }
        _ => Err(SqlError::UnknownTable(table)),
    }
}

fn parse_update(
    table: &ast::TableWithJoins,
    assignments: &[ast::Assignment],
    selection: &Option<Expr>,
) -> Result<Command, SqlError> {
    let table = table_factor_name(&table.relation)?;
    let filters = collect_eq_filters(selection)?;

    match table.as_str() {
        "items" => {
            let available = assignment_value(assignments, "available")
                .ok_or(SqlError::MissingFilter("available"))?;
            let available = parse_bool(available)?;
            let id = filters.id.ok_or(SqlError::MissingFilter("id"))?;
            Ok(Command::SetItemAvailability { id, available })
        }
        "bookings" => {
            let approved = assignment_value(assignments, "approved")
                .ok_or(SqlError::MissingFilter("approved"))?;
            let approve = parse_bool(approved)?;
            let id = filters.id.ok_or(SqlError::MissingFilter("id"))?;
            let owner_id = filters.owner_id.ok_or(SqlError::MissingFilter("owner_id"))?;
            Ok(Command::DecideBooking {
                id,
                owner_id,
                approve,
            })
        }
        _ => Err(SqlError::UnknownTable(table)),
    }
}

fn parse_select(query: &ast::Query) -> Result<Command, SqlError> {
    let select = match query.body.as_ref() {
        SetExpr::Select(s) => s,
        _ => return Err(SqlError::Unsupported("non-SELECT query".into())),
    };

    if select.from.is_empty() {
        return Err(SqlError::Parse("SELECT without FROM".into()));
    }
    let table = table_factor_name(&select.from[0].relation)?;
    let filters = collect_eq_filters(&select.selection)?;

    match table.as_str() {
        "bookings" => {
            if let Some(id) = filters.id {
                let viewer_id = filters
                    .viewer_id
                    .ok_or(SqlError::MissingFilter("viewer_id"))?;
                return Ok(Command::SelectBooking { id, viewer_id });
            }
            let state = filters.state.unwrap_or_else(|| "ALL".to_string());
            let (from, size) = extract_page(query)?;
            if let Some(booker_id) = filters.booker_id {
                Ok(Command::SelectByBooker {
                    booker_id,
                    state,
                    from,
                    size,
                })
            } else if let Some(owner_id) = filters.owner_id {
                Ok(Command::SelectByOwner {
                    owner_id,
                    state,
                    from,
                    size,
                })
            } else {
                Err(SqlError::MissingFilter("booker_id or owner_id"))
            }
        }
        "schedule" => {
            if let Some(item_id) = filters.item_id {
                Ok(Command::SelectItemSchedule { item_id })
            } else if let Some(owner_id) = filters.owner_id {
                Ok(Command::SelectOwnerSchedules { owner_id })
            } else {
                Err(SqlError::MissingFilter("item_id or owner_id"))
            }
        }
        _ => Err(SqlError::UnknownTable(table)),
    }
}

/// Equality filters a WHERE clause may carry. Only `col = value` terms
/// joined by AND are understood.
#[derive(Default)]
struct EqFilters {
    id: Option<Ulid>,
    viewer_id: Option<Ulid>,
    booker_id: Option<Ulid>,
    owner_id: Option<Ulid>,
    item_id: Option<Ulid>,
    state: Option<String>,
}

fn collect_eq_filters(selection: &Option<Expr>) -> Result<EqFilters, SqlError> {
    let mut filters = EqFilters::default();
    if let Some(expr) = selection {
        walk_eq_filters(expr, &mut filters)?;
    }
    Ok(filters)
}

fn walk_eq_filters(expr: &Expr, filters: &mut EqFilters) -> Result<(), SqlError> {
    if let Expr::BinaryOp { left, op, right } = expr {
        match op {
            ast::BinaryOperator::And => {
                walk_eq_filters(left, filters)?;
                walk_eq_filters(right, filters)?;
            }
            ast::BinaryOperator::Eq => match expr_column_name(left).as_deref() {
                Some("id") => filters.id = Some(parse_ulid_expr(right)?),
                Some("viewer_id") => filters.viewer_id = Some(parse_ulid_expr(right)?),
                Some("booker_id") => filters.booker_id = Some(parse_ulid_expr(right)?),
                Some("owner_id") => filters.owner_id = Some(parse_ulid_expr(right)?),
                Some("item_id") => filters.item_id = Some(parse_ulid_expr(right)?),
                Some("state") => filters.state = Some(parse_string_expr(right)?),
                _ => {}
            },
            _ => {}
        }
    }
    Ok(())
}

/// LIMIT/OFFSET → (from, size), defaulting to the first page. Bounds are
/// checked by the engine, not here.
fn extract_page(query: &ast::Query) -> Result<(i64, i64), SqlError> {
    let (mut from, mut size) = (0, DEFAULT_PAGE_SIZE);
    if let Some(LimitClause::LimitOffset { limit, offset, .. }) = &query.limit_clause {
        if let Some(limit) = limit {
            size = parse_i64_expr(limit)?;
        }
        if let Some(offset) = offset {
            from = parse_i64_expr(&offset.value)?;
        }
    }
    Ok((from, size))
}

// ── Helpers ───────────────────────────────────────────────────

fn object_name_last(name: &ast::ObjectName) -> Option<String> {
    name.0.last().and_then(|part| match part {
        ObjectNamePart::Identifier(ident) => Some(ident.value.to_lowercase()),
        _ => None,
    })
}

fn insert_table_name(insert: &ast::Insert) -> Result<String, SqlError> {
    match &insert.table {
        TableObject::TableName(name) => {
            object_name_last(name).ok_or_else(|| SqlError::Parse("empty table name".into()))
        }
        _ => Err(SqlError::Parse("unsupported table object in INSERT".into())),
    }
}

fn table_factor_name(tf: &TableFactor) -> Result<String, SqlError> {
    match tf {
        TableFactor::Table { name, .. } => {
            object_name_last(name).ok_or_else(|| SqlError::Parse("empty table name".into()))
        }
        _ => Err(SqlError::Parse("complex table expression".into())),
    }
}

fn extract_insert_values(insert: &ast::Insert) -> Result<Vec<Expr>, SqlError> {
    let body = insert
        .source
        .as_ref()
        .ok_or(SqlError::Parse("no VALUES".into()))?;
    match body.body.as_ref() {
        SetExpr::Values(values) => {
            if values.rows.is_empty() {
                return Err(SqlError::Parse("empty VALUES".into()));
            }
            Ok(values.rows[0].clone())
        }
        _ => Err(SqlError::Parse("expected VALUES".into())),
    }
}

fn assignment_value<'a>(assignments: &'a [ast::Assignment], column: &str) -> Option<&'a Expr> {
    assignments.iter().find_map(|a| match &a.target {
        ast::AssignmentTarget::ColumnName(name)
            if object_name_last(name).as_deref() == Some(column) =>
        {
            Some(&a.value)
        }
        _ => None,
    })
}

fn expr_column_name(expr: &Expr) -> Option<String> {
    match expr {
        Expr::Identifier(ident) => Some(ident.value.to_lowercase()),
        Expr::CompoundIdentifier(parts) => parts.last().map(|i| i.value.to_lowercase()),
        _ => None,
    }
}

fn extract_value(expr: &Expr) -> Option<&Value> {
    match expr {
        Expr::Value(ValueWithSpan { value, .. }) => Some(value),
        _ => None,
    }
}

fn parse_ulid_expr(expr: &Expr) -> Result<Ulid, SqlError> {
    if let Some(value) = extract_value(expr) {
        match value {
            Value::SingleQuotedString(s) | Value::Number(s, _) => {
                Ulid::from_string(s).map_err(|e| SqlError::Parse(format!("bad ULID: {e}")))
            }
            _ => Err(SqlError::Parse(format!("expected string, got {value:?}"))),
        }
    } else {
        Err(SqlError::Parse(format!("expected value, got {expr:?}")))
    }
}

fn parse_i64_expr(expr: &Expr) -> Result<i64, SqlError> {
    if let Some(value) = extract_value(expr) {
        match value {
            Value::Number(s, _) => s
                .parse()
                .map_err(|e| SqlError::Parse(format!("bad i64: {e}"))),
            Value::SingleQuotedString(s) => s
                .parse()
                .map_err(|e| SqlError::Parse(format!("bad i64: {e}"))),
            _ => Err(SqlError::Parse(format!("expected number, got {value:?}"))),
        }
    } else if let Expr::UnaryOp {
        op: ast::UnaryOperator::Minus,
        expr,
    } = expr
    {
        Ok(-parse_i64_expr(expr)?)
    } else {
        Err(SqlError::Parse(format!("expected value, got {expr:?}")))
    }
}

fn parse_string_expr(expr: &Expr) -> Result<String, SqlError> {
    if let Some(value) = extract_value(expr) {
        match value {
            Value::SingleQuotedString(s) => Ok(s.clone()),
            _ => Err(SqlError::Parse(format!("expected string, got {value:?}"))),
        }
    } else {
        Err(SqlError::Parse(format!("expected value, got {expr:?}")))
    }
}

fn parse_string_or_null(expr: &Expr) -> Result<Option<String>, SqlError> {
    if let Some(value) = extract_value(expr) {
        match value {
            Value::Null => Ok(None),
            Value::SingleQuotedString(s) => Ok(Some(s.clone())),
            _ => Err(SqlError::Parse(format!(
                "expected string or NULL, got {value:?}"
            ))),
        }
    } else {
        Err(SqlError::Parse(format!("expected value, got {expr:?}")))
    }
}

fn parse_ulid(expr: &Expr) -> Result<Ulid, SqlError> {
    parse_ulid_expr(expr)
}

fn parse_i64(expr: &Expr) -> Result<i64, SqlError> {
    parse_i64_expr(expr)
}

fn parse_bool(expr: &Expr) -> Result<bool, SqlError> {
    if let Some(value) = extract_value(expr) {
        match value {
            Value::Boolean(b) => Ok(*b),
            Value::SingleQuotedString(s) => match s.to_lowercase().as_str() {
                "true" | "t" | "1" => Ok(true),
                "false" | "f" | "0" => Ok(false),
                _ => Err(SqlError::Parse(format!("bad bool: {s}"))),
            },
            Value::Number(n, _) => Ok(n != "0"),
            _ => Err(SqlError::Parse(format!("expected bool, got {value:?}"))),
        }
    } else {
        Err(SqlError::Parse(format!("expected value, got {expr:?}")))
    }
}

// ── Errors ────────────────────────────────────────────────────

#[derive(Debug)]
pub enum SqlError {
    Parse(String),
    Empty,
    Unsupported(String),
    UnknownTable(String),
    WrongArity(&'static str, usize, usize),
    MissingFilter(&'static str),
}

impl std::fmt::Display for SqlError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SqlError::Parse(s) => write!(f, "parse error: {s}"),
            SqlError::Empty => write!(f, "empty query"),
            SqlError::Unsupported(s) => write!(f, "unsupported: {s}"),
            SqlError::UnknownTable(t) => write!(f, "unknown table: {t}"),
            SqlError::WrongArity(t, expected, got) => {
                write!(f, "{t}: expected {expected} values, got {got}")
            }
            SqlError::MissingFilter(col) => write!(f, "missing filter: {col}"),
        }
    }
}

impl std::error::Error for SqlError {}

#[cfg(test)]
mod tests {
    use super::*;

    const U1: &str = "01ARZ3NDEKTSV4RRFFQ69G5FAV";
    const U2: &str = "01BX5ZZKBKACTAV9WEVGEMMVRZ";

    #[test]
    fn parse_insert_user() {
        let sql = format!("INSERT INTO users (id, name) VALUES ('{U1}', 'alice')");
        let cmd = parse_sql(&sql).unwrap();
        match cmd {
            Command::RegisterUser { id, name } => {
                assert_eq!(id.to_string(), U1);
                assert_eq!(name.as_deref(), Some("alice"));
            }
            _ => panic!("expected RegisterUser, got {cmd:?}"),
        }
    }

    #[test]
    fn parse_insert_user_without_name() {
        let sql = format!("INSERT INTO users (id) VALUES ('{U1}')");
        let cmd = parse_sql(&sql).unwrap();
        assert!(matches!(cmd, Command::RegisterUser { name: None, .. }));
    }

    #[test]
    fn parse_insert_user_null_name() {
        let sql = format!("INSERT INTO users (id, name) VALUES ('{U1}', NULL)");
        let cmd = parse_sql(&sql).unwrap();
        assert!(matches!(cmd, Command::RegisterUser { name: None, .. }));
    }

    #[test]
    fn parse_insert_item() {
        let sql =
            format!("INSERT INTO items (id, owner_id, name, available) VALUES ('{U1}', '{U2}', 'drill', false)");
        let cmd = parse_sql(&sql).unwrap();
        match cmd {
            Command::ListItem {
                id,
                owner_id,
                name,
                available,
            } => {
                assert_eq!(id.to_string(), U1);
                assert_eq!(owner_id.to_string(), U2);
                assert_eq!(name.as_deref(), Some("drill"));
                assert!(!available);
            }
            _ => panic!("expected ListItem, got {cmd:?}"),
        }
    }

    #[test]
    fn parse_insert_item_defaults_available() {
        let sql = format!("INSERT INTO items (id, owner_id) VALUES ('{U1}', '{U2}')");
        let cmd = parse_sql(&sql).unwrap();
        assert!(matches!(cmd, Command::ListItem { available: true, .. }));
    }

    #[test]
    fn parse_update_item_availability() {
        let sql = format!("UPDATE items SET available = false WHERE id = '{U1}'");
        let cmd = parse_sql(&sql).unwrap();
        match cmd {
            Command::SetItemAvailability { id, available } => {
                assert_eq!(id.to_string(), U1);
                assert!(!available);
            }
            _ => panic!("expected SetItemAvailability, got {cmd:?}"),
        }
    }

    #[test]
    fn parse_insert_booking() {
        let sql = format!(
            r#"INSERT INTO bookings (id, item_id, booker_id, start, "end") VALUES ('{U1}', '{U2}', '{U2}', 1000, 2000)"#
        );
        let cmd = parse_sql(&sql).unwrap();
        match cmd {
            Command::RequestBooking { start, end, .. } => {
                assert_eq!(start, 1000);
                assert_eq!(end, 2000);
            }
            _ => panic!("expected RequestBooking, got {cmd:?}"),
        }
    }

    #[test]
    fn parse_insert_booking_short_row_errors() {
        let sql = format!("INSERT INTO bookings (id, item_id) VALUES ('{U1}', '{U2}')");
        assert!(matches!(parse_sql(&sql), Err(SqlError::WrongArity(..))));
    }

    #[test]
    fn parse_decide_booking() {
        let sql =
            format!("UPDATE bookings SET approved = true WHERE id = '{U1}' AND owner_id = '{U2}'");
        let cmd = parse_sql(&sql).unwrap();
        match cmd {
            Command::DecideBooking {
                id,
                owner_id,
                approve,
            } => {
                assert_eq!(id.to_string(), U1);
                assert_eq!(owner_id.to_string(), U2);
                assert!(approve);
            }
            _ => panic!("expected DecideBooking, got {cmd:?}"),
        }
    }

    #[test]
    fn parse_decide_requires_owner() {
        let sql = format!("UPDATE bookings SET approved = true WHERE id = '{U1}'");
        assert!(matches!(
            parse_sql(&sql),
            Err(SqlError::MissingFilter("owner_id"))
        ));
    }

    #[test]
    fn parse_select_booking_for_viewer() {
        let sql = format!("SELECT * FROM bookings WHERE id = '{U1}' AND viewer_id = '{U2}'");
        let cmd = parse_sql(&sql).unwrap();
        match cmd {
            Command::SelectBooking { id, viewer_id } => {
                assert_eq!(id.to_string(), U1);
                assert_eq!(viewer_id.to_string(), U2);
            }
            _ => panic!("expected SelectBooking, got {cmd:?}"),
        }
    }

    #[test]
    fn parse_select_by_booker_defaults() {
        let sql = format!("SELECT * FROM bookings WHERE booker_id = '{U1}'");
        let cmd = parse_sql(&sql).unwrap();
        match cmd {
            Command::SelectByBooker {
                state, from, size, ..
            } => {
                assert_eq!(state, "ALL");
                assert_eq!(from, 0);
                assert_eq!(size, DEFAULT_PAGE_SIZE);
            }
            _ => panic!("expected SelectByBooker, got {cmd:?}"),
        }
    }

    #[test]
    fn parse_select_by_booker_with_state_and_page() {
        let sql = format!(
            "SELECT * FROM bookings WHERE booker_id = '{U1}' AND state = 'WAITING' LIMIT 10 OFFSET 20"
        );
        let cmd = parse_sql(&sql).unwrap();
        match cmd {
            Command::SelectByBooker {
                state, from, size, ..
            } => {
                assert_eq!(state, "WAITING");
                assert_eq!(from, 20);
                assert_eq!(size, 10);
            }
            _ => panic!("expected SelectByBooker, got {cmd:?}"),
        }
    }

    #[test]
    fn parse_select_by_owner() {
        let sql = format!("SELECT * FROM bookings WHERE owner_id = '{U1}' AND state = 'PAST'");
        let cmd = parse_sql(&sql).unwrap();
        match cmd {
            Command::SelectByOwner { owner_id, state, .. } => {
                assert_eq!(owner_id.to_string(), U1);
                assert_eq!(state, "PAST");
            }
            _ => panic!("expected SelectByOwner, got {cmd:?}"),
        }
    }

    #[test]
    fn parse_negative_offset_passes_through() {
        // Bounds are the engine's job; the parser just reads the number.
        let sql = format!("SELECT * FROM bookings WHERE booker_id = '{U1}' LIMIT 10 OFFSET -1");
        let cmd = parse_sql(&sql).unwrap();
        assert!(matches!(cmd, Command::SelectByBooker { from: -1, .. }));
    }

    #[test]
    fn parse_select_item_schedule() {
        let sql = format!("SELECT * FROM schedule WHERE item_id = '{U1}'");
        let cmd = parse_sql(&sql).unwrap();
        match cmd {
            Command::SelectItemSchedule { item_id } => {
                assert_eq!(item_id.to_string(), U1);
            }
            _ => panic!("expected SelectItemSchedule, got {cmd:?}"),
        }
    }

    #[test]
    fn parse_select_owner_schedules() {
        let sql = format!("SELECT * FROM schedule WHERE owner_id = '{U1}'");
        let cmd = parse_sql(&sql).unwrap();
        assert!(matches!(cmd, Command::SelectOwnerSchedules { .. }));
    }

    #[test]
    fn parse_listen() {
        let sql = format!("LISTEN item_{U1}");
        let cmd = parse_sql(&sql).unwrap();
        match cmd {
            Command::Listen { channel } => {
                assert_eq!(channel, format!("item_{U1}"));
            }
            _ => panic!("expected Listen, got {cmd:?}"),
        }
    }

    #[test]
    fn parse_unlisten() {
        let cmd = parse_sql(&format!("UNLISTEN item_{U1}")).unwrap();
        assert!(matches!(cmd, Command::Unlisten { channel: Some(_) }));
        let cmd = parse_sql("UNLISTEN *").unwrap();
        assert!(matches!(cmd, Command::Unlisten { channel: None }));
    }

    #[test]
    fn parse_unknown_table_errors() {
        let sql = format!("INSERT INTO foobar (id) VALUES ('{U1}')");
        assert!(parse_sql(&sql).is_err());
    }

    #[test]
    fn parse_empty_errors() {
        assert!(matches!(parse_sql(""), Err(SqlError::Empty)));
    }
}
