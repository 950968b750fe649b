// Metrics module for observability
// Describes the counters and gauges recorded by the cluster services

use metrics::{describe_counter, describe_gauge};

/// Initialize all metric descriptions
/// Should be called once at application startup
pub fn init_metrics() {
    // Membership
    describe_gauge!(
        "cumulus_connected_nodes",
        "Number of peers with a completed handshake"
    );
    describe_counter!(
        "cumulus_handshakes_total",
        "Total number of completed identification handshakes"
    );

    // Messaging
    describe_counter!(
        "cumulus_messages_received_total",
        "Total number of cluster messages received, by type"
    );
    describe_counter!(
        "cumulus_messages_sent_total",
        "Total number of cluster messages sent, by type"
    );

    // Wagon
    describe_counter!(
        "cumulus_wagon_circuits_total",
        "Total number of completed wagon circuits"
    );
    describe_counter!(
        "cumulus_wagon_crashes_total",
        "Total number of duplicate wagons merged"
    );
    describe_counter!(
        "cumulus_wagon_dropped_total",
        "Total number of queued messages dropped for unknown or removed nodes"
    );

    // Lock
    describe_counter!(
        "cumulus_locks_acquired_total",
        "Total number of distributed locks acquired"
    );

    // Transport
    describe_counter!(
        "cumulus_tcp_sessions_total",
        "Total number of TCP sessions opened, by direction"
    );
}
