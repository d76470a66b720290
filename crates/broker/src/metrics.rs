use prometheus::{Encoder, IntCounterVec, IntGauge, Opts, Registry, TextEncoder};

/// Counters for the connection server, rendered in Prometheus text format on
/// demand.
#[derive(Clone)]
pub struct TransportMetrics {
    registry: Registry,
    requests: IntCounterVec,
    responses: IntCounterVec,
    connections: IntGauge,
}

impl TransportMetrics {
    pub fn new() -> Result<Self, String> {
        let registry = Registry::new();
        let requests = IntCounterVec::new(
            Opts::new("monolog_requests_total", "Requests decoded, by API key"),
            &["api_key"],
        )
        .map_err(|err| err.to_string())?;
        let responses = IntCounterVec::new(
            Opts::new("monolog_responses_total", "Responses emitted, by API key"),
            &["api_key"],
        )
        .map_err(|err| err.to_string())?;
        let connections = IntGauge::new("monolog_open_connections", "Open client connections")
            .map_err(|err| err.to_string())?;

        registry
            .register(Box::new(requests.clone()))
            .map_err(|err| err.to_string())?;
        registry
            .register(Box::new(responses.clone()))
            .map_err(|err| err.to_string())?;
        registry
            .register(Box::new(connections.clone()))
            .map_err(|err| err.to_string())?;

        Ok(Self {
            registry,
            requests,
            responses,
            connections,
        })
    }

    pub fn record_request(&self, api_key: i16) {
        let label = api_key.to_string();
        self.requests.with_label_values(&[label.as_str()]).inc();
    }

    pub fn record_response(&self, api_key: i16) {
        let label = api_key.to_string();
        self.responses.with_label_values(&[label.as_str()]).inc();
    }

    pub fn connection_opened(&self) {
        self.connections.inc();
    }

    pub fn connection_closed(&self) {
        self.connections.dec();
    }

    pub fn render_prometheus(&self) -> Result<String, String> {
        let mut buffer = Vec::new();
        TextEncoder::new()
            .encode(&self.registry.gather(), &mut buffer)
            .map_err(|err| err.to_string())?;
        String::from_utf8(buffer).map_err(|err| err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn renders_counters_after_recording() {
        let metrics = TransportMetrics::new().expect("metrics");
        metrics.record_request(18);
        metrics.record_response(18);
        metrics.connection_opened();
        let rendered = metrics.render_prometheus().expect("render");
        assert!(rendered.contains("monolog_requests_total"));
        assert!(rendered.contains("monolog_open_connections 1"));
        metrics.connection_closed();
        let rendered = metrics.render_prometheus().expect("render");
        assert!(rendered.contains("monolog_open_connections 0"));
    }
}
