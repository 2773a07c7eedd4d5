use lazy_static::lazy_static;
use prometheus::{Encoder, IntCounterVec, IntGauge, Opts, Registry, TextEncoder};

lazy_static! {
    /// Global Prometheus registry
    pub static ref REGISTRY: Registry = Registry::new();

    // Diameter peer metrics, labelled by peer host and command code
    pub static ref DIAMETER_REQUESTS_SENT: IntCounterVec = IntCounterVec::new(
        Opts::new("diameter_requests_sent", "Diameter requests written to a peer"),
        &["peer", "code"]
    ).unwrap();

    pub static ref DIAMETER_REQUESTS_RECEIVED: IntCounterVec = IntCounterVec::new(
        Opts::new("diameter_requests_received", "Diameter requests received from a peer"),
        &["peer", "code"]
    ).unwrap();

    pub static ref DIAMETER_ANSWERS_SENT: IntCounterVec = IntCounterVec::new(
        Opts::new("diameter_answers_sent", "Diameter answers written to a peer"),
        &["peer", "code"]
    ).unwrap();

    pub static ref DIAMETER_ANSWERS_RECEIVED: IntCounterVec = IntCounterVec::new(
        Opts::new("diameter_answers_received", "Diameter answers received from a peer"),
        &["peer", "code"]
    ).unwrap();

    pub static ref DIAMETER_REQUEST_TIMEOUTS: IntCounterVec = IntCounterVec::new(
        Opts::new("diameter_request_timeouts", "Diameter requests with no answer before the deadline"),
        &["peer", "code"]
    ).unwrap();

    /// Answers whose hop-by-hop identifier matched no pending request
    pub static ref DIAMETER_STALLED_ANSWERS: IntCounterVec = IntCounterVec::new(
        Opts::new("diameter_stalled_answers", "Diameter answers discarded for lack of a pending request"),
        &["peer"]
    ).unwrap();

    pub static ref DIAMETER_ROUTE_NOT_FOUND: IntCounterVec = IntCounterVec::new(
        Opts::new("diameter_route_not_found", "Requests with no matching rule or engaged peer"),
        &["realm"]
    ).unwrap();

    pub static ref DIAMETER_ENGAGED_PEERS: IntGauge = IntGauge::with_opts(
        Opts::new("diameter_engaged_peers", "Peers in the Engaged state")
    ).unwrap();

    // RADIUS server metrics, labelled by client address and packet code
    pub static ref RADIUS_SERVER_REQUESTS: IntCounterVec = IntCounterVec::new(
        Opts::new("radius_server_requests", "RADIUS requests accepted by the server"),
        &["client", "code"]
    ).unwrap();

    pub static ref RADIUS_SERVER_RESPONSES: IntCounterVec = IntCounterVec::new(
        Opts::new("radius_server_responses", "RADIUS responses sent by the server"),
        &["client", "code"]
    ).unwrap();

    pub static ref RADIUS_SERVER_DROPS: IntCounterVec = IntCounterVec::new(
        Opts::new("radius_server_drops", "RADIUS datagrams dropped by the server"),
        &["client", "code"]
    ).unwrap();

    // RADIUS client metrics, labelled by destination endpoint
    pub static ref RADIUS_CLIENT_REQUESTS: IntCounterVec = IntCounterVec::new(
        Opts::new("radius_client_requests", "RADIUS requests sent by the client engine"),
        &["endpoint", "code"]
    ).unwrap();

    pub static ref RADIUS_CLIENT_RESPONSES: IntCounterVec = IntCounterVec::new(
        Opts::new("radius_client_responses", "RADIUS responses delivered to callers"),
        &["endpoint", "code"]
    ).unwrap();

    pub static ref RADIUS_CLIENT_TIMEOUTS: IntCounterVec = IntCounterVec::new(
        Opts::new("radius_client_timeouts", "RADIUS request attempts that timed out"),
        &["endpoint"]
    ).unwrap();
}

/// Register all metrics with the global registry. Idempotent: repeated
/// registration of the same collector is ignored.
pub fn register_metrics() {
    let collectors: Vec<Box<dyn prometheus::core::Collector>> = vec![
        Box::new(DIAMETER_REQUESTS_SENT.clone()),
        Box::new(DIAMETER_REQUESTS_RECEIVED.clone()),
        Box::new(DIAMETER_ANSWERS_SENT.clone()),
        Box::new(DIAMETER_ANSWERS_RECEIVED.clone()),
        Box::new(DIAMETER_REQUEST_TIMEOUTS.clone()),
        Box::new(DIAMETER_STALLED_ANSWERS.clone()),
        Box::new(DIAMETER_ROUTE_NOT_FOUND.clone()),
        Box::new(DIAMETER_ENGAGED_PEERS.clone()),
        Box::new(RADIUS_SERVER_REQUESTS.clone()),
        Box::new(RADIUS_SERVER_RESPONSES.clone()),
        Box::new(RADIUS_SERVER_DROPS.clone()),
        Box::new(RADIUS_CLIENT_REQUESTS.clone()),
        Box::new(RADIUS_CLIENT_RESPONSES.clone()),
        Box::new(RADIUS_CLIENT_TIMEOUTS.clone()),
    ];
    for collector in collectors {
        let _ = REGISTRY.register(collector);
    }
}

/// Gather metrics in Prometheus text format
pub fn gather_metrics() -> String {
    let encoder = TextEncoder::new();
    let metric_families = REGISTRY.gather();
    let mut buffer = vec![];
    encoder.encode(&metric_families, &mut buffer).unwrap();
    String::from_utf8(buffer).unwrap()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_metrics_registration() {
        register_metrics();
        // Registering twice must not panic
        register_metrics();

        DIAMETER_REQUESTS_SENT
            .with_label_values(&["peer.igor", "2000"])
            .inc();
        DIAMETER_STALLED_ANSWERS.with_label_values(&["peer.igor"]).inc();
        RADIUS_SERVER_DROPS.with_label_values(&["127.0.0.1", "4"]).inc();

        let metrics = gather_metrics();
        assert!(metrics.contains("diameter_requests_sent"));
        assert!(metrics.contains("radius_server_drops"));
    }
}
