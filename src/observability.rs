use std::net::SocketAddr;

use crate::sql::Command;

// ── RED metrics (request-driven) ────────────────────────────────

/// Counter: total queries executed. Labels: command, status.
pub const QUERIES_TOTAL: &str = "exambook_queries_total";

/// Histogram: query latency in seconds. Labels: command.
pub const QUERY_DURATION_SECONDS: &str = "exambook_query_duration_seconds";

// ── USE metrics (resource utilization) ──────────────────────────

/// Gauge: active TCP connections.
pub const CONNECTIONS_ACTIVE: &str = "exambook_connections_active";

/// Counter: total connections accepted.
pub const CONNECTIONS_TOTAL: &str = "exambook_connections_total";

/// Counter: connections rejected due to limit.
pub const CONNECTIONS_REJECTED_TOTAL: &str = "exambook_connections_rejected_total";

/// Gauge: number of active tenants (loaded engines).
pub const TENANTS_ACTIVE: &str = "exambook_tenants_active";

/// Histogram: WAL group-commit flush duration in seconds.
pub const WAL_FLUSH_DURATION_SECONDS: &str = "exambook_wal_flush_duration_seconds";

/// Histogram: WAL group-commit batch size (events per flush).
pub const WAL_FLUSH_BATCH_SIZE: &str = "exambook_wal_flush_batch_size";

/// Counter: WAL compactions performed.
pub const WAL_COMPACTIONS_TOTAL: &str = "exambook_wal_compactions_total";

// ── Booking ─────────────────────────────────────────────────────

/// Counter: reservations created.
pub const RESERVATIONS_CREATED_TOTAL: &str = "exambook_reservations_created_total";

/// Counter: reservations cancelled (slot released).
pub const RESERVATIONS_CANCELLED_TOTAL: &str = "exambook_reservations_cancelled_total";

/// Counter: bookings rejected because the session was full.
pub const CAPACITY_REJECTIONS_TOTAL: &str = "exambook_capacity_rejections_total";

/// Install Prometheus metrics exporter on the given port. No-op if port is None.
pub fn init(port: Option<u16>) -> Result<(), Box<dyn std::error::Error>> {
    let Some(port) = port else { return Ok(()) };
    let addr: SocketAddr = ([0, 0, 0, 0], port).into();
    metrics_exporter_prometheus::PrometheusBuilder::new()
        .with_http_listener(addr)
        .install()?;
    tracing::info!("metrics endpoint: http://0.0.0.0:{port}/metrics");
    Ok(())
}

/// Map a Command variant to a short label for metrics.
pub fn command_label(cmd: &Command) -> &'static str {
    match cmd {
        Command::InsertPlan(_) => "insert_plan",
        Command::UpdatePlan { .. } => "update_plan",
        Command::ApprovePlan { .. } => "approve_plan",
        Command::StartPlan { .. } => "start_plan",
        Command::CompletePlan { .. } => "complete_plan",
        Command::CancelPlan { .. } => "cancel_plan",
        Command::SelectPlans { .. } => "select_plans",
        Command::InsertSchedule(_) => "insert_schedule",
        Command::UpdateCapacity { .. } => "update_capacity",
        Command::SetScheduleActive { .. } => "set_schedule_active",
        Command::SelectSchedules { .. } => "select_schedules",
        Command::SelectAvailability { .. } => "select_availability",
        Command::InsertReservation { .. } => "insert_reservation",
        Command::CheckIn { .. } => "check_in",
        Command::CheckOut { .. } => "check_out",
        Command::CancelReservation { .. } => "cancel_reservation",
        Command::SelectReservations(_) => "select_reservations",
        Command::SelectPlanProgress { .. } => "select_plan_progress",
    }
}
