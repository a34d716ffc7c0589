use std::net::SocketAddr;

use crate::sql::Command;

// ── RED metrics (request-driven) ────────────────────────────────

/// Counter: total queries executed. Labels: command, status.
pub const QUERIES_TOTAL: &str = "roomslot_queries_total";

/// Histogram: query latency in seconds. Labels: command.
pub const QUERY_DURATION_SECONDS: &str = "roomslot_query_duration_seconds";

// ── USE metrics (resource utilization) ──────────────────────────

/// Gauge: active TCP connections.
pub const CONNECTIONS_ACTIVE: &str = "roomslot_connections_active";

/// Counter: total connections accepted.
pub const CONNECTIONS_TOTAL: &str = "roomslot_connections_total";

/// Counter: connections rejected due to limit.
pub const CONNECTIONS_REJECTED_TOTAL: &str = "roomslot_connections_rejected_total";

/// Histogram: WAL group-commit flush duration in seconds.
pub const WAL_FLUSH_DURATION_SECONDS: &str = "roomslot_wal_flush_duration_seconds";

/// Histogram: WAL group-commit batch size (transactions per flush).
pub const WAL_FLUSH_BATCH_SIZE: &str = "roomslot_wal_flush_batch_size";

// ── Domain ──────────────────────────────────────────────────────

/// Counter: bookings committed. Labels: amenity.
pub const BOOKINGS_CREATED_TOTAL: &str = "roomslot_bookings_created_total";

/// Counter: bookings removed. Labels: amenity.
pub const BOOKINGS_REMOVED_TOTAL: &str = "roomslot_bookings_removed_total";

/// Counter: creates and updates refused as SlotAlreadyBooked. Labels: amenity.
pub const BOOKING_CONFLICTS_TOTAL: &str = "roomslot_booking_conflicts_total";

pub const NOTIFICATIONS_DISPATCHED_TOTAL: &str = "roomslot_notifications_dispatched_total";
pub const NOTIFICATIONS_FAILED_TOTAL: &str = "roomslot_notifications_failed_total";

/// Install Prometheus metrics exporter on the given port. No-op if port is None.
pub fn init(port: Option<u16>) -> std::io::Result<()> {
    let Some(port) = port else { return Ok(()) };
    let addr: SocketAddr = ([0, 0, 0, 0], port).into();
    metrics_exporter_prometheus::PrometheusBuilder::new()
        .with_http_listener(addr)
        .install()
        .map_err(std::io::Error::other)?;
    tracing::info!("metrics endpoint: http://0.0.0.0:{port}/metrics");
    Ok(())
}

/// Map a Command variant to a short label for metrics.
pub fn command_label(cmd: &Command) -> &'static str {
    match cmd {
        Command::UpsertResource(_) => "upsert_resource",
        Command::DeleteResource { .. } => "delete_resource",
        Command::SelectResources { .. } => "select_resources",
        Command::UpsertUser(_) => "upsert_user",
        Command::InsertBooking { .. } => "insert_booking",
        Command::UpdateBooking { .. } => "update_booking",
        Command::DeleteBooking { .. } => "delete_booking",
        Command::SelectBookings { .. } => "select_bookings",
        Command::SelectAvailability { .. } => "select_availability",
        Command::SelectFreeResources { .. } => "select_free_resources",
        Command::SelectLedger { .. } => "select_ledger",
        Command::DeleteLedgerEntry { .. } => "delete_ledger_entry",
        Command::InsertNotification { .. } => "insert_notification",
        Command::SelectNotifications { .. } => "select_notifications",
        Command::Broadcast { .. } => "broadcast",
    }
}
