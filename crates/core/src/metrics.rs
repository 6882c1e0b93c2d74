use ::metrics::{describe_counter, describe_gauge};

// data plane state
pub const METRICS_ENDPOINTS_LIVE: &str = "buffering_proxy_endpoints_live";
pub const METRICS_QUEUE_DEPTH: &str = "buffering_proxy_queue_depth";
pub const METRICS_RELAY_OPEN: &str = "buffering_proxy_relay_open";

// admission counting
pub const METRICS_ENQUEUED_COUNT: &str = "buffering_proxy_enqueued_count";
pub const METRICS_DEQUEUED_COUNT: &str = "buffering_proxy_dequeued_count";
pub const METRICS_QUEUE_FULL_COUNT: &str = "buffering_proxy_queue_full_count";
pub const METRICS_DIAL_ERROR_COUNT: &str = "buffering_proxy_dial_error_count";

// switchover counting
pub const METRICS_SWITCH_COUNT: &str = "buffering_proxy_switch_count";
pub const METRICS_SWITCH_ABORT_COUNT: &str = "buffering_proxy_switch_abort_count";

pub fn describe_metrics() {
    describe_gauge!(METRICS_ENDPOINTS_LIVE, "Live relayed endpoints (two per connection)");
    describe_gauge!(METRICS_QUEUE_DEPTH, "Accepted connections waiting for a backend");
    describe_gauge!(METRICS_RELAY_OPEN, "1 when new connections are relayed, 0 while draining");

    describe_counter!(METRICS_ENQUEUED_COUNT, "Number of accepted connections put in queue");
    describe_counter!(METRICS_DEQUEUED_COUNT, "Number of connections taken from queue");
    describe_counter!(METRICS_QUEUE_FULL_COUNT, "Number of connections rejected by a full queue");
    describe_counter!(METRICS_DIAL_ERROR_COUNT, "Number of failed backend dials");

    describe_counter!(METRICS_SWITCH_COUNT, "Number of completed backend switches");
    describe_counter!(METRICS_SWITCH_ABORT_COUNT, "Number of abandoned backend switches");
}
