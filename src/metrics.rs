use metrics::{counter, gauge, Counter, Gauge};
use std::sync::LazyLock;

/// Metric name for counting accepted connections.
pub(crate) const CONNECTIONS: &str = "evsock.connections";
pub(crate) const CONNECTIONS_HELP: &str =
    "Number of connections that completed the handshake and were assigned a client id.";

/// Metric name for counting rejected frames and connections.
pub(crate) const REJECTIONS: &str = "evsock.rejections";
pub(crate) const REJECTIONS_HELP: &str =
    "Number of connections or frames rejected by the protocol. Rejections produce no response.";

/// Metric name for counting dispatched user events.
pub(crate) const EVENTS: &str = "evsock.events";
pub(crate) const EVENTS_HELP: &str =
    "Number of authenticated user events routed to listeners. Events with no listener are included.";

/// Metric name for tracking running listener callbacks.
pub(crate) const ACTIVE_CALLBACKS: &str = "evsock.active_callbacks";
pub(crate) const ACTIVE_CALLBACKS_HELP: &str =
    "Number of listener callbacks currently holding a concurrency slot.";

/// Metric name for counting migration attempts.
pub(crate) const MIGRATIONS: &str = "evsock.migrations";
pub(crate) const MIGRATIONS_HELP: &str =
    "Number of session migration attempts, labelled by outcome.";

/// Metric name for counting reaped sessions.
pub(crate) const REAPED: &str = "evsock.reaped";
pub(crate) const REAPED_HELP: &str =
    "Number of zombie sessions evicted after the reconnect timeout elapsed.";

/// Metric name for counting messages queued for clients.
pub(crate) const MESSAGES_SENT: &str = "evsock.messages_sent";
pub(crate) const MESSAGES_SENT_HELP: &str =
    "Number of envelopes queued for a client's writer. Filtered sends are not counted.";

static DESCRIBE: LazyLock<()> = LazyLock::new(|| {
    metrics::describe_counter!(CONNECTIONS, metrics::Unit::Count, CONNECTIONS_HELP);
    metrics::describe_counter!(REJECTIONS, metrics::Unit::Count, REJECTIONS_HELP);
    metrics::describe_counter!(EVENTS, metrics::Unit::Count, EVENTS_HELP);
    metrics::describe_gauge!(
        ACTIVE_CALLBACKS,
        metrics::Unit::Count,
        ACTIVE_CALLBACKS_HELP
    );
    metrics::describe_counter!(MIGRATIONS, metrics::Unit::Count, MIGRATIONS_HELP);
    metrics::describe_counter!(REAPED, metrics::Unit::Count, REAPED_HELP);
    metrics::describe_counter!(MESSAGES_SENT, metrics::Unit::Count, MESSAGES_SENT_HELP);
});

/// Record a completed handshake.
pub(crate) fn record_connection() {
    let _ = &DESCRIBE;
    counter!(CONNECTIONS).increment(1);
}

/// Get or register a counter for rejections with a specific reason.
pub(crate) fn rejections(reason: &'static str) -> Counter {
    let _ = &DESCRIBE;
    counter!(REJECTIONS, "reason" => reason)
}

/// Record a rejected connection or frame.
pub(crate) fn record_rejection(reason: &'static str) {
    rejections(reason).increment(1);
}

/// Record a routed user event.
pub(crate) fn record_event(name: &str) {
    let _ = &DESCRIBE;
    counter!(EVENTS, "event" => name.to_string()).increment(1);
}

/// Get or register the active callbacks gauge.
pub(crate) fn active_callbacks() -> Gauge {
    let _ = &DESCRIBE;
    gauge!(ACTIVE_CALLBACKS)
}

/// Record a migration attempt.
pub(crate) fn record_migration(success: bool) {
    let _ = &DESCRIBE;
    let outcome = if success { "success" } else { "failure" };
    counter!(MIGRATIONS, "outcome" => outcome).increment(1);
}

/// Record sessions removed by the reaper.
pub(crate) fn record_reaped(count: u64) {
    let _ = &DESCRIBE;
    counter!(REAPED).increment(count);
}

/// Record an envelope queued for a client.
pub(crate) fn record_message_sent() {
    let _ = &DESCRIBE;
    counter!(MESSAGES_SENT).increment(1);
}
