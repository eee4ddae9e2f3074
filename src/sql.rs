use std::collections::HashMap;

use sqlparser::ast::{
    self, AssignmentTarget, Expr, FromTable, ObjectNamePart, SetExpr, Statement, TableFactor,
    TableObject, Value, ValueWithSpan,
};
use sqlparser::dialect::PostgreSqlDialect;
use sqlparser::parser::Parser;
use ulid::Ulid;

use crate::model::*;

/// Parsed command from SQL input.
#[derive(Debug, PartialEq)]
pub enum Command {
    InsertPlan(NewPlan),
    UpdatePlan {
        id: Ulid,
        changes: PlanChanges,
    },
    ApprovePlan {
        id: Ulid,
        approver: Option<String>,
    },
    StartPlan {
        id: Ulid,
    },
    CompletePlan {
        id: Ulid,
    },
    CancelPlan {
        id: Ulid,
        reason: Option<String>,
    },
    SelectPlans {
        id: Option<Ulid>,
        year: Option<i32>,
    },
    InsertSchedule(NewSchedule),
    UpdateCapacity {
        id: Ulid,
        capacity: u32,
    },
    SetScheduleActive {
        id: Ulid,
        active: bool,
    },
    SelectSchedules {
        id: Option<Ulid>,
        plan_id: Option<Ulid>,
    },
    SelectAvailability {
        schedule_id: Option<Ulid>,
        plan_id: Option<Ulid>,
    },
    InsertReservation {
        reservation: NewReservation,
        returning: bool,
    },
    CheckIn {
        id: Ulid,
    },
    CheckOut {
        id: Ulid,
    },
    CancelReservation {
        id: Ulid,
        reason: Option<String>,
    },
    SelectReservations(ReservationFilter),
    SelectPlanProgress {
        plan_id: Ulid,
    },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReservationFilter {
    Id(Ulid),
    Number(String),
    Schedule(Ulid),
    Worker(String),
}

/// The row shape a statement produces.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResultSet {
    Plans,
    Schedules,
    Availability,
    Reservations,
    PlanProgress,
}

impl Command {
    pub fn result_set(&self) -> Option<ResultSet> {
        match self {
            Command::SelectPlans { .. } => Some(ResultSet::Plans),
            Command::SelectSchedules { .. } => Some(ResultSet::Schedules),
            Command::SelectAvailability { .. } => Some(ResultSet::Availability),
            Command::SelectReservations(_) => Some(ResultSet::Reservations),
            Command::InsertReservation { returning: true, .. } => Some(ResultSet::Reservations),
            Command::SelectPlanProgress { .. } => Some(ResultSet::PlanProgress),
            _ => None,
        }
    }
}

const PLAN_COLUMNS: &[&str] = &[
    "id",
    "year",
    "name",
    "target_total",
    "target_general",
    "target_special",
    "target_night",
    "period_start",
    "period_end",
    "approver",
    "notes",
];

const SCHEDULE_COLUMNS: &[&str] = &[
    "id",
    "plan_id",
    "start",
    "end",
    "institution",
    "exam_types",
    "capacity",
    "institution_address",
    "institution_phone",
];

const RESERVATION_COLUMNS: &[&str] = &[
    "id",
    "schedule_id",
    "worker_ref",
    "exam_types",
    "delivery",
    "phone",
    "email",
    "address",
];

pub fn parse_sql(sql: &str) -> Result<Command, SqlError> {
    match parse_statement(sql)? {
        Statement::Insert(insert) => parse_insert(&insert),
        Statement::Update {
            table,
            assignments,
            selection,
            ..
        } => parse_update(&table.relation, &assignments, &selection),
        Statement::Delete(delete) => parse_delete(&delete),
        Statement::Query(query) => parse_select(&query),
        other => Err(SqlError::Unsupported(format!("{other}"))),
    }
}

/// The row shape of a statement without interpreting its values, so `$n`
/// placeholders are fine. Used to describe prepared statements.
pub fn describe(sql: &str) -> Option<ResultSet> {
    match parse_statement(sql).ok()? {
        Statement::Query(query) => {
            let SetExpr::Select(select) = query.body.as_ref() else {
                return None;
            };
            let table = table_factor_name(&select.from.first()?.relation).ok()?;
            select_result_set(&table)
        }
        Statement::Insert(insert) => {
            let table = insert_table_name(&insert).ok()?;
            (table == "reservations" && insert.returning.is_some()).then_some(ResultSet::Reservations)
        }
        _ => None,
    }
}

fn parse_statement(sql: &str) -> Result<Statement, SqlError> {
    let dialect = PostgreSqlDialect {};
    let mut stmts = Parser::parse_sql(&dialect, sql).map_err(|e| SqlError::Parse(e.to_string()))?;
    if stmts.is_empty() {
        return Err(SqlError::Empty);
    }
    Ok(stmts.swap_remove(0))
}

fn select_result_set(table: &str) -> Option<ResultSet> {
    match table {
        "plans" => Some(ResultSet::Plans),
        "schedules" => Some(ResultSet::Schedules),
        "availability" => Some(ResultSet::Availability),
        "reservations" => Some(ResultSet::Reservations),
        "plan_progress" => Some(ResultSet::PlanProgress),
        _ => None,
    }
}

// ── INSERT ────────────────────────────────────────────────────

/// Column name → value of a single VALUES row.
struct Row<'a> {
    table: &'static str,
    values: HashMap<String, &'a Expr>,
}

impl<'a> Row<'a> {
    fn build(
        table: &'static str,
        known: &[&str],
        columns: &[ast::Ident],
        values: &'a [Expr],
    ) -> Result<Self, SqlError> {
        let names: Vec<String> = if columns.is_empty() {
            if values.len() > known.len() {
                return Err(SqlError::WrongArity(table, known.len(), values.len()));
            }
            known.iter().map(|c| c.to_string()).collect()
        } else {
            if columns.len() != values.len() {
                return Err(SqlError::WrongArity(table, columns.len(), values.len()));
            }
            columns.iter().map(|c| c.value.to_lowercase()).collect()
        };

        let mut map = HashMap::with_capacity(names.len());
        for (name, value) in names.into_iter().zip(values) {
            if !known.contains(&name.as_str()) {
                return Err(SqlError::UnknownColumn(table, name));
            }
            map.insert(name, value);
        }
        Ok(Self { table, values: map })
    }

    /// A present, non-NULL value.
    fn get(&self, col: &'static str) -> Option<&'a Expr> {
        self.values.get(col).copied().filter(|e| !is_null(e))
    }

    fn required(&self, col: &'static str) -> Result<&'a Expr, SqlError> {
        self.get(col).ok_or(SqlError::MissingColumn(self.table, col))
    }

    fn ulid(&self, col: &'static str) -> Result<Ulid, SqlError> {
        parse_ulid_expr(self.required(col)?)
    }

    fn i64(&self, col: &'static str) -> Result<i64, SqlError> {
        parse_i64_expr(self.required(col)?)
    }

    fn u32(&self, col: &'static str) -> Result<u32, SqlError> {
        parse_u32(self.required(col)?)
    }

    fn opt_u32(&self, col: &'static str) -> Result<Option<u32>, SqlError> {
        self.get(col).map(parse_u32).transpose()
    }

    fn string(&self, col: &'static str) -> Result<String, SqlError> {
        parse_string_expr(self.required(col)?)
    }

    fn opt_string(&self, col: &'static str) -> Result<Option<String>, SqlError> {
        self.get(col).map(parse_string_expr).transpose()
    }
}

fn parse_insert(insert: &ast::Insert) -> Result<Command, SqlError> {
    let table = insert_table_name(insert)?;
    let rows = extract_insert_rows(insert)?;
    if rows.len() != 1 {
        return Err(SqlError::Unsupported("multi-row INSERT".into()));
    }
    let values = &rows[0];

    match table.as_str() {
        "plans" => {
            let row = Row::build("plans", PLAN_COLUMNS, &insert.columns, values)?;
            let year = row.i64("year")?;
            Ok(Command::InsertPlan(NewPlan {
                id: row.ulid("id")?,
                year: i32::try_from(year)
                    .map_err(|_| SqlError::Parse(format!("{year} out of range for year")))?,
                name: row.string("name")?,
                targets: Targets {
                    total: row.u32("target_total")?,
                    general: row.opt_u32("target_general")?.unwrap_or(0),
                    special: row.opt_u32("target_special")?.unwrap_or(0),
                    night_work: row.opt_u32("target_night")?.unwrap_or(0),
                },
                period_start: row.i64("period_start")?,
                period_end: row.i64("period_end")?,
                approver: row.opt_string("approver")?,
                notes: row.opt_string("notes")?,
            }))
        }
        "schedules" => {
            let row = Row::build("schedules", SCHEDULE_COLUMNS, &insert.columns, values)?;
            Ok(Command::InsertSchedule(NewSchedule {
                id: row.ulid("id")?,
                plan_id: row.ulid("plan_id")?,
                start: row.i64("start")?,
                end: row.i64("end")?,
                institution: Institution {
                    name: row.string("institution")?,
                    address: row.opt_string("institution_address")?,
                    phone: row.opt_string("institution_phone")?,
                },
                exam_types: parse_exam_types_expr(row.required("exam_types")?)?,
                capacity: row.u32("capacity")?,
            }))
        }
        "reservations" => {
            let row = Row::build("reservations", RESERVATION_COLUMNS, &insert.columns, values)?;
            let delivery = match row.opt_string("delivery")? {
                Some(s) => s
                    .parse::<Delivery>()
                    .map_err(|e| SqlError::Parse(e.to_string()))?,
                None => Delivery::default(),
            };
            Ok(Command::InsertReservation {
                reservation: NewReservation {
                    id: row.ulid("id")?,
                    schedule_id: row.ulid("schedule_id")?,
                    worker_ref: row.string("worker_ref")?,
                    exam_types: parse_exam_types_expr(row.required("exam_types")?)?,
                    delivery,
                    contact: Contact {
                        phone: row.opt_string("phone")?,
                        email: row.opt_string("email")?,
                        address: row.opt_string("address")?,
                    },
                },
                returning: insert.returning.is_some(),
            })
        }
        _ => Err(SqlError::UnknownTable(table)),
    }
}

// ── UPDATE ────────────────────────────────────────────────────

fn parse_update(
    relation: &TableFactor,
    assignments: &[ast::Assignment],
    selection: &Option<Expr>,
) -> Result<Command, SqlError> {
    let table = table_factor_name(relation)?;
    let id = extract_where_id(selection)?;

    let mut set: Vec<(String, &Expr)> = Vec::with_capacity(assignments.len());
    for a in assignments {
        let col = match &a.target {
            AssignmentTarget::ColumnName(name) => {
                object_name_last(name).ok_or_else(|| SqlError::Parse("empty column name".into()))?
            }
            AssignmentTarget::Tuple(_) => {
                return Err(SqlError::Unsupported("tuple assignment".into()));
            }
        };
        set.push((col, &a.value));
    }
    if set.is_empty() {
        return Err(SqlError::Parse("UPDATE without SET".into()));
    }

    match table.as_str() {
        "plans" => parse_plan_update(id, &set),
        "schedules" => parse_schedule_update(id, &set),
        "reservations" => parse_reservation_update(id, &set),
        _ => Err(SqlError::UnknownTable(table)),
    }
}

/// Split off the `status` assignment and check that the rest only names
/// columns that may accompany it.
fn status_change<'a>(
    set: &[(String, &'a Expr)],
    allowed: &[&str],
) -> Result<Option<(String, Vec<(String, &'a Expr)>)>, SqlError> {
    let Some((_, status)) = set.iter().find(|(c, _)| c == "status") else {
        return Ok(None);
    };
    let status = parse_string_expr(status)?;
    let rest: Vec<_> = set
        .iter()
        .filter(|(c, _)| c != "status")
        .map(|(c, e)| (c.clone(), *e))
        .collect();
    if let Some((col, _)) = rest.iter().find(|(c, _)| !allowed.contains(&c.as_str())) {
        return Err(SqlError::Unsupported(format!(
            "{col} cannot be set together with status '{status}'"
        )));
    }
    Ok(Some((status, rest)))
}

fn extra_string(rest: &[(String, &Expr)], col: &str) -> Result<Option<String>, SqlError> {
    match rest.iter().find(|(c, _)| c == col) {
        Some((_, e)) if !is_null(e) => Ok(Some(parse_string_expr(e)?)),
        _ => Ok(None),
    }
}

fn parse_plan_update(id: Ulid, set: &[(String, &Expr)]) -> Result<Command, SqlError> {
    if let Some((status, rest)) = status_change(set, &["approver", "cancellation_reason"])? {
        let status: PlanStatus = status
            .parse()
            .map_err(|e: UnknownVariant| SqlError::Parse(e.to_string()))?;
        let only = |col: &str| -> Result<(), SqlError> {
            match rest.iter().find(|(c, _)| c != col) {
                Some((c, _)) => Err(SqlError::Unsupported(format!(
                    "{c} cannot be set together with status '{}'",
                    status.as_str()
                ))),
                None => Ok(()),
            }
        };
        return match status {
            PlanStatus::Approved => {
                only("approver")?;
                Ok(Command::ApprovePlan {
                    id,
                    approver: extra_string(&rest, "approver")?,
                })
            }
            PlanStatus::InProgress => {
                only("")?;
                Ok(Command::StartPlan { id })
            }
            PlanStatus::Completed => {
                only("")?;
                Ok(Command::CompletePlan { id })
            }
            PlanStatus::Cancelled => {
                only("cancellation_reason")?;
                Ok(Command::CancelPlan {
                    id,
                    reason: extra_string(&rest, "cancellation_reason")?,
                })
            }
            PlanStatus::Draft => Err(SqlError::Unsupported("plans cannot return to draft".into())),
        };
    }

    let mut changes = PlanChanges::default();
    for (col, expr) in set {
        let expr = *expr;
        match col.as_str() {
            "name" => changes.name = Some(parse_string_expr(expr)?),
            "target_total" => changes.target_total = Some(parse_u32(expr)?),
            "target_general" => changes.target_general = Some(parse_u32(expr)?),
            "target_special" => changes.target_special = Some(parse_u32(expr)?),
            "target_night" => changes.target_night = Some(parse_u32(expr)?),
            "period_start" => changes.period_start = Some(parse_i64_expr(expr)?),
            "period_end" => changes.period_end = Some(parse_i64_expr(expr)?),
            "approver" => changes.approver = Some(parse_string_expr(expr)?),
            "notes" => changes.notes = Some(parse_string_expr(expr)?),
            "year" => {
                return Err(SqlError::Unsupported("the year of a plan is fixed".into()));
            }
            _ => return Err(SqlError::UnknownColumn("plans", col.clone())),
        }
    }
    Ok(Command::UpdatePlan { id, changes })
}

fn parse_schedule_update(id: Ulid, set: &[(String, &Expr)]) -> Result<Command, SqlError> {
    let [(col, expr)] = set else {
        return Err(SqlError::Unsupported(
            "schedules are updated one column at a time".into(),
        ));
    };
    match col.as_str() {
        "capacity" => Ok(Command::UpdateCapacity {
            id,
            capacity: parse_u32(expr)?,
        }),
        "active" | "is_active" => Ok(Command::SetScheduleActive {
            id,
            active: parse_bool(expr)?,
        }),
        _ => Err(SqlError::UnknownColumn("schedules", col.clone())),
    }
}

fn parse_reservation_update(id: Ulid, set: &[(String, &Expr)]) -> Result<Command, SqlError> {
    let Some((status, rest)) = status_change(set, &["cancellation_reason"])? else {
        return Err(SqlError::MissingColumn("reservations", "status"));
    };
    let status: ReservationStatus = status
        .parse()
        .map_err(|e: UnknownVariant| SqlError::Parse(e.to_string()))?;
    if status != ReservationStatus::Cancelled && !rest.is_empty() {
        return Err(SqlError::Unsupported(format!(
            "cancellation_reason cannot be set together with status '{}'",
            status.as_str()
        )));
    }
    match status {
        ReservationStatus::CheckedIn => Ok(Command::CheckIn { id }),
        ReservationStatus::CheckedOut => Ok(Command::CheckOut { id }),
        ReservationStatus::Cancelled => Ok(Command::CancelReservation {
            id,
            reason: extra_string(&rest, "cancellation_reason")?,
        }),
        ReservationStatus::Reserved => Err(SqlError::Unsupported(
            "reservations cannot return to reserved".into(),
        )),
    }
}

// ── DELETE ────────────────────────────────────────────────────

fn parse_delete(delete: &ast::Delete) -> Result<Command, SqlError> {
    let table = delete_table_name(delete)?;
    let id = extract_where_id(&delete.selection)?;

    match table.as_str() {
        // Records are kept for the audit trail; deleting one cancels it.
        "reservations" => Ok(Command::CancelReservation { id, reason: None }),
        "plans" => Err(SqlError::Unsupported(
            "plans are never deleted; set status = 'cancelled'".into(),
        )),
        "schedules" => Err(SqlError::Unsupported(
            "schedules are never deleted; set active = false".into(),
        )),
        _ => Err(SqlError::UnknownTable(table)),
    }
}

// ── SELECT ────────────────────────────────────────────────────

fn parse_select(query: &ast::Query) -> Result<Command, SqlError> {
    let select = match query.body.as_ref() {
        SetExpr::Select(s) => s,
        _ => return Err(SqlError::Unsupported("non-SELECT query".into())),
    };

    if select.from.is_empty() {
        return Err(SqlError::Parse("SELECT without FROM".into()));
    }
    let table = table_factor_name(&select.from[0].relation)?;

    let mut filters = Vec::new();
    if let Some(selection) = &select.selection {
        extract_eq_filters(selection, &mut filters);
    }
    let filter = |col: &str| filters.iter().find(|(c, _)| c == col).map(|(_, e)| *e);
    let ulid_filter = |col: &str| filter(col).map(parse_ulid_expr).transpose();

    match table.as_str() {
        "plans" => {
            let year = filter("year")
                .map(|e| {
                    let y = parse_i64_expr(e)?;
                    i32::try_from(y).map_err(|_| SqlError::Parse(format!("{y} out of range for year")))
                })
                .transpose()?;
            Ok(Command::SelectPlans {
                id: ulid_filter("id")?,
                year,
            })
        }
        "schedules" => {
            let id = ulid_filter("id")?;
            let plan_id = ulid_filter("plan_id")?;
            if id.is_none() && plan_id.is_none() {
                return Err(SqlError::MissingFilter("id or plan_id"));
            }
            Ok(Command::SelectSchedules { id, plan_id })
        }
        "availability" => {
            let schedule_id = ulid_filter("schedule_id")?;
            let plan_id = ulid_filter("plan_id")?;
            if schedule_id.is_none() && plan_id.is_none() {
                return Err(SqlError::MissingFilter("schedule_id or plan_id"));
            }
            Ok(Command::SelectAvailability { schedule_id, plan_id })
        }
        "reservations" => {
            let by = if let Some(id) = ulid_filter("id")? {
                ReservationFilter::Id(id)
            } else if let Some(e) = filter("reservation_number").or_else(|| filter("number")) {
                ReservationFilter::Number(parse_string_expr(e)?)
            } else if let Some(sid) = ulid_filter("schedule_id")? {
                ReservationFilter::Schedule(sid)
            } else if let Some(e) = filter("worker_ref") {
                ReservationFilter::Worker(parse_string_expr(e)?)
            } else {
                return Err(SqlError::MissingFilter(
                    "id, reservation_number, schedule_id or worker_ref",
                ));
            };
            Ok(Command::SelectReservations(by))
        }
        "plan_progress" => Ok(Command::SelectPlanProgress {
            plan_id: ulid_filter("plan_id")?.ok_or(SqlError::MissingFilter("plan_id"))?,
        }),
        _ => Err(SqlError::UnknownTable(table)),
    }
}

/// Collect `column = value` terms of an AND chain. Other predicates are ignored.
fn extract_eq_filters<'a>(expr: &'a Expr, out: &mut Vec<(String, &'a Expr)>) {
    match expr {
        Expr::BinaryOp { left, op, right } => match op {
            ast::BinaryOperator::And => {
                extract_eq_filters(left, out);
                extract_eq_filters(right, out);
            }
            ast::BinaryOperator::Eq => {
                if let Some(col) = expr_column_name(left) {
                    out.push((col, right.as_ref()));
                }
            }
            _ => {}
        },
        Expr::Nested(inner) => extract_eq_filters(inner, out),
        _ => {}
    }
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

fn delete_table_name(delete: &ast::Delete) -> Result<String, SqlError> {
    let tables_with_joins = match &delete.from {
        FromTable::WithFromKeyword(t) | FromTable::WithoutKeyword(t) => t,
    };
    if let Some(first) = tables_with_joins.first() {
        table_factor_name(&first.relation)
    } else {
        Err(SqlError::Parse("DELETE without table".into()))
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

fn extract_insert_rows(insert: &ast::Insert) -> Result<&[Vec<Expr>], SqlError> {
    let body = insert
        .source
        .as_ref()
        .ok_or(SqlError::Parse("no VALUES".into()))?;
    match body.body.as_ref() {
        SetExpr::Values(values) => {
            if values.rows.is_empty() {
                return Err(SqlError::Parse("empty VALUES".into()));
            }
            Ok(&values.rows)
        }
        _ => Err(SqlError::Parse("expected VALUES".into())),
    }
}

fn extract_where_id(selection: &Option<Expr>) -> Result<Ulid, SqlError> {
    let sel = selection.as_ref().ok_or(SqlError::MissingFilter("id"))?;
    match sel {
        Expr::BinaryOp {
            left,
            op: ast::BinaryOperator::Eq,
            right,
        } => {
            if expr_column_name(left).as_deref() == Some("id") {
                parse_ulid_expr(right)
            } else {
                Err(SqlError::MissingFilter("id"))
            }
        }
        _ => Err(SqlError::MissingFilter("id")),
    }
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

fn is_null(expr: &Expr) -> bool {
    matches!(extract_value(expr), Some(Value::Null))
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

fn parse_u32(expr: &Expr) -> Result<u32, SqlError> {
    let v = parse_i64_expr(expr)?;
    u32::try_from(v).map_err(|_| SqlError::Parse(format!("{v} out of u32 range")))
}

fn parse_string_expr(expr: &Expr) -> Result<String, SqlError> {
    match extract_value(expr) {
        Some(Value::SingleQuotedString(s)) => Ok(s.clone()),
        Some(Value::Number(s, _)) => Ok(s.clone()),
        Some(value) => Err(SqlError::Parse(format!("expected string, got {value:?}"))),
        None => Err(SqlError::Parse(format!("expected value, got {expr:?}"))),
    }
}

fn parse_exam_types_expr(expr: &Expr) -> Result<ExamTypes, SqlError> {
    let s = parse_string_expr(expr)?;
    parse_exam_types(&s).map_err(|e| SqlError::Parse(e.to_string()))
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
    UnknownColumn(&'static str, String),
    MissingColumn(&'static str, &'static str),
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
            SqlError::UnknownColumn(t, c) => write!(f, "unknown column {c} in {t}"),
            SqlError::MissingColumn(t, c) => write!(f, "{t}: missing value for {c}"),
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

    const ID: &str = "01ARZ3NDEKTSV4RRFFQ69G5FAV";
    const OTHER: &str = "01BX5ZZKBKACTAV9WEVGEMMVRZ";

    #[test]
    fn parse_insert_plan_with_columns() {
        let sql = format!(
            "INSERT INTO plans (id, year, name, target_total, target_night, period_start, period_end) \
             VALUES ('{ID}', 2026, 'Site A 2026', 120, 15, 1767225600000, 1798761600000)"
        );
        match parse_sql(&sql).unwrap() {
            Command::InsertPlan(p) => {
                assert_eq!(p.id.to_string(), ID);
                assert_eq!(p.year, 2026);
                assert_eq!(p.name, "Site A 2026");
                assert_eq!(p.targets.total, 120);
                assert_eq!(p.targets.general, 0);
                assert_eq!(p.targets.night_work, 15);
                assert_eq!(p.period_start, 1_767_225_600_000);
                assert_eq!(p.approver, None);
            }
            cmd => panic!("expected InsertPlan, got {cmd:?}"),
        }
    }

    #[test]
    fn parse_insert_plan_positional() {
        let sql = format!(
            "INSERT INTO plans VALUES ('{ID}', 2026, 'Yearly', 10, 4, 3, 2, 1767225600000, 1798761600000, 'HSE lead', NULL)"
        );
        match parse_sql(&sql).unwrap() {
            Command::InsertPlan(p) => {
                assert_eq!(p.targets, Targets { total: 10, general: 4, special: 3, night_work: 2 });
                assert_eq!(p.approver.as_deref(), Some("HSE lead"));
                assert_eq!(p.notes, None);
            }
            cmd => panic!("expected InsertPlan, got {cmd:?}"),
        }
    }

    #[test]
    fn parse_insert_plan_missing_required_column() {
        let sql = format!("INSERT INTO plans (id, year) VALUES ('{ID}', 2026)");
        assert!(matches!(
            parse_sql(&sql),
            Err(SqlError::MissingColumn("plans", "name"))
        ));
    }

    #[test]
    fn parse_insert_unknown_column() {
        let sql = format!("INSERT INTO plans (id, colour) VALUES ('{ID}', 'red')");
        assert!(matches!(parse_sql(&sql), Err(SqlError::UnknownColumn("plans", _))));
    }

    #[test]
    fn parse_insert_schedule() {
        let sql = format!(
            r#"INSERT INTO schedules (id, plan_id, start, "end", institution, exam_types, capacity)
               VALUES ('{ID}', '{OTHER}', 1000, 2000, 'City Clinic', 'general, special', 30)"#
        );
        match parse_sql(&sql).unwrap() {
            Command::InsertSchedule(s) => {
                assert_eq!(s.plan_id.to_string(), OTHER);
                assert_eq!((s.start, s.end), (1000, 2000));
                assert_eq!(s.institution.name, "City Clinic");
                assert_eq!(s.institution.address, None);
                assert_eq!(format_exam_types(&s.exam_types), "general,special");
                assert_eq!(s.capacity, 30);
            }
            cmd => panic!("expected InsertSchedule, got {cmd:?}"),
        }
    }

    #[test]
    fn parse_insert_schedule_bad_exam_type() {
        let sql = format!(
            r#"INSERT INTO schedules (id, plan_id, start, "end", institution, exam_types, capacity)
               VALUES ('{ID}', '{OTHER}', 1000, 2000, 'City Clinic', 'dental', 30)"#
        );
        assert!(matches!(parse_sql(&sql), Err(SqlError::Parse(_))));
    }

    #[test]
    fn parse_insert_reservation_returning() {
        let sql = format!(
            "INSERT INTO reservations (id, schedule_id, worker_ref, exam_types, delivery, email) \
             VALUES ('{ID}', '{OTHER}', 'W-0042', 'general', 'email', 'kim@example.com') RETURNING *"
        );
        let cmd = parse_sql(&sql).unwrap();
        assert_eq!(cmd.result_set(), Some(ResultSet::Reservations));
        match cmd {
            Command::InsertReservation { reservation, returning } => {
                assert!(returning);
                assert_eq!(reservation.worker_ref, "W-0042");
                assert_eq!(reservation.delivery, Delivery::Email);
                assert_eq!(reservation.contact.email.as_deref(), Some("kim@example.com"));
                assert_eq!(reservation.contact.phone, None);
            }
            cmd => panic!("expected InsertReservation, got {cmd:?}"),
        }
    }

    #[test]
    fn parse_insert_reservation_defaults_delivery() {
        let sql = format!(
            "INSERT INTO reservations (id, schedule_id, worker_ref, exam_types) \
             VALUES ('{ID}', '{OTHER}', 'W-1', 'general')"
        );
        match parse_sql(&sql).unwrap() {
            Command::InsertReservation { reservation, returning } => {
                assert!(!returning);
                assert_eq!(reservation.delivery, Delivery::InPerson);
            }
            cmd => panic!("expected InsertReservation, got {cmd:?}"),
        }
    }

    #[test]
    fn parse_multi_row_insert_rejected() {
        let sql = format!(
            "INSERT INTO reservations (id, schedule_id, worker_ref, exam_types) \
             VALUES ('{ID}', '{OTHER}', 'W-1', 'general'), ('{OTHER}', '{OTHER}', 'W-2', 'general')"
        );
        assert!(matches!(parse_sql(&sql), Err(SqlError::Unsupported(_))));
    }

    #[test]
    fn parse_plan_transitions() {
        let approve = format!("UPDATE plans SET status = 'approved', approver = 'Director' WHERE id = '{ID}'");
        assert_eq!(
            parse_sql(&approve).unwrap(),
            Command::ApprovePlan {
                id: Ulid::from_string(ID).unwrap(),
                approver: Some("Director".into()),
            }
        );

        let start = format!("UPDATE plans SET status = 'in_progress' WHERE id = '{ID}'");
        assert!(matches!(parse_sql(&start).unwrap(), Command::StartPlan { .. }));

        let complete = format!("UPDATE plans SET status = 'completed' WHERE id = '{ID}'");
        assert!(matches!(parse_sql(&complete).unwrap(), Command::CompletePlan { .. }));

        let cancel = format!(
            "UPDATE plans SET status = 'cancelled', cancellation_reason = 'site closed' WHERE id = '{ID}'"
        );
        match parse_sql(&cancel).unwrap() {
            Command::CancelPlan { reason, .. } => assert_eq!(reason.as_deref(), Some("site closed")),
            cmd => panic!("expected CancelPlan, got {cmd:?}"),
        }
    }

    #[test]
    fn parse_plan_status_with_foreign_column_rejected() {
        let sql = format!("UPDATE plans SET status = 'approved', name = 'x' WHERE id = '{ID}'");
        assert!(matches!(parse_sql(&sql), Err(SqlError::Unsupported(_))));

        let sql = format!("UPDATE plans SET status = 'in_progress', approver = 'x' WHERE id = '{ID}'");
        assert!(matches!(parse_sql(&sql), Err(SqlError::Unsupported(_))));
    }

    #[test]
    fn parse_plan_amendment() {
        let sql = format!("UPDATE plans SET name = 'Renamed', target_total = 90, notes = 'moved' WHERE id = '{ID}'");
        match parse_sql(&sql).unwrap() {
            Command::UpdatePlan { changes, .. } => {
                assert_eq!(changes.name.as_deref(), Some("Renamed"));
                assert_eq!(changes.target_total, Some(90));
                assert_eq!(changes.notes.as_deref(), Some("moved"));
                assert_eq!(changes.period_start, None);
            }
            cmd => panic!("expected UpdatePlan, got {cmd:?}"),
        }
    }

    #[test]
    fn parse_plan_year_is_fixed() {
        let sql = format!("UPDATE plans SET year = 2027 WHERE id = '{ID}'");
        assert!(matches!(parse_sql(&sql), Err(SqlError::Unsupported(_))));
    }

    #[test]
    fn parse_schedule_updates() {
        let sql = format!("UPDATE schedules SET capacity = 25 WHERE id = '{ID}'");
        assert!(matches!(
            parse_sql(&sql).unwrap(),
            Command::UpdateCapacity { capacity: 25, .. }
        ));

        let sql = format!("UPDATE schedules SET active = false WHERE id = '{ID}'");
        assert!(matches!(
            parse_sql(&sql).unwrap(),
            Command::SetScheduleActive { active: false, .. }
        ));

        let sql = format!("UPDATE schedules SET capacity = 3, active = true WHERE id = '{ID}'");
        assert!(matches!(parse_sql(&sql), Err(SqlError::Unsupported(_))));
    }

    #[test]
    fn parse_reservation_transitions() {
        let sql = format!("UPDATE reservations SET status = 'checked_in' WHERE id = '{ID}'");
        assert!(matches!(parse_sql(&sql).unwrap(), Command::CheckIn { .. }));

        let sql = format!("UPDATE reservations SET status = 'checked_out' WHERE id = '{ID}'");
        assert!(matches!(parse_sql(&sql).unwrap(), Command::CheckOut { .. }));

        let sql = format!(
            "UPDATE reservations SET status = 'cancelled', cancellation_reason = 'ill' WHERE id = '{ID}'"
        );
        match parse_sql(&sql).unwrap() {
            Command::CancelReservation { reason, .. } => assert_eq!(reason.as_deref(), Some("ill")),
            cmd => panic!("expected CancelReservation, got {cmd:?}"),
        }

        let sql = format!("UPDATE reservations SET status = 'reserved' WHERE id = '{ID}'");
        assert!(matches!(parse_sql(&sql), Err(SqlError::Unsupported(_))));
    }

    #[test]
    fn parse_update_requires_id() {
        let sql = "UPDATE reservations SET status = 'checked_in' WHERE worker_ref = 'W-1'";
        assert!(matches!(parse_sql(sql), Err(SqlError::MissingFilter("id"))));
    }

    #[test]
    fn parse_delete_reservation_is_cancel() {
        let sql = format!("DELETE FROM reservations WHERE id = '{ID}'");
        assert_eq!(
            parse_sql(&sql).unwrap(),
            Command::CancelReservation {
                id: Ulid::from_string(ID).unwrap(),
                reason: None,
            }
        );
    }

    #[test]
    fn parse_delete_plan_rejected() {
        let sql = format!("DELETE FROM plans WHERE id = '{ID}'");
        assert!(matches!(parse_sql(&sql), Err(SqlError::Unsupported(_))));
    }

    #[test]
    fn parse_select_plans() {
        assert_eq!(
            parse_sql("SELECT * FROM plans").unwrap(),
            Command::SelectPlans { id: None, year: None }
        );
        assert_eq!(
            parse_sql("SELECT * FROM plans WHERE year = 2026").unwrap(),
            Command::SelectPlans { id: None, year: Some(2026) }
        );
    }

    #[test]
    fn parse_select_schedules_needs_filter() {
        assert!(matches!(
            parse_sql("SELECT * FROM schedules"),
            Err(SqlError::MissingFilter(_))
        ));
        let sql = format!("SELECT * FROM schedules WHERE plan_id = '{OTHER}'");
        assert!(matches!(
            parse_sql(&sql).unwrap(),
            Command::SelectSchedules { id: None, plan_id: Some(_) }
        ));
    }

    #[test]
    fn parse_select_availability() {
        let sql = format!("SELECT * FROM availability WHERE schedule_id = '{ID}'");
        let cmd = parse_sql(&sql).unwrap();
        assert_eq!(cmd.result_set(), Some(ResultSet::Availability));
        assert!(matches!(
            cmd,
            Command::SelectAvailability { schedule_id: Some(_), plan_id: None }
        ));
    }

    #[test]
    fn parse_select_reservations_filters() {
        let sql = format!("SELECT * FROM reservations WHERE schedule_id = '{ID}'");
        assert!(matches!(
            parse_sql(&sql).unwrap(),
            Command::SelectReservations(ReservationFilter::Schedule(_))
        ));

        let sql = "SELECT * FROM reservations WHERE worker_ref = 'W-7'";
        assert_eq!(
            parse_sql(sql).unwrap(),
            Command::SelectReservations(ReservationFilter::Worker("W-7".into()))
        );

        let sql = "SELECT * FROM reservations WHERE reservation_number = 'EX-20260302-ABCDEFGHJK'";
        assert!(matches!(
            parse_sql(sql).unwrap(),
            Command::SelectReservations(ReservationFilter::Number(_))
        ));

        assert!(matches!(
            parse_sql("SELECT * FROM reservations"),
            Err(SqlError::MissingFilter(_))
        ));
    }

    #[test]
    fn parse_select_plan_progress() {
        let sql = format!("SELECT * FROM plan_progress WHERE plan_id = '{ID}'");
        assert!(matches!(parse_sql(&sql).unwrap(), Command::SelectPlanProgress { .. }));
    }

    #[test]
    fn describe_with_placeholders() {
        assert_eq!(
            describe("SELECT * FROM reservations WHERE schedule_id = $1"),
            Some(ResultSet::Reservations)
        );
        assert_eq!(
            describe("INSERT INTO reservations (id, schedule_id, worker_ref, exam_types) VALUES ($1, $2, $3, $4) RETURNING *"),
            Some(ResultSet::Reservations)
        );
        assert_eq!(
            describe("UPDATE reservations SET status = 'checked_in' WHERE id = $1"),
            None
        );
    }

    #[test]
    fn parse_unknown_table_errors() {
        let sql = format!("INSERT INTO foobar (id) VALUES ('{ID}')");
        assert!(matches!(parse_sql(&sql), Err(SqlError::UnknownTable(_))));
    }

    #[test]
    fn parse_empty_errors() {
        assert!(matches!(parse_sql(""), Err(SqlError::Empty)));
    }
}
