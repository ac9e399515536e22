use prometheus::{Encoder, IntCounterVec, Opts, Registry, TextEncoder};

#[derive(Clone)]
pub struct Metrics {
    registry: Registry,

    pub learning_events_total: IntCounterVec,
    pub learning_outbox_published_total: IntCounterVec,
}

impl Metrics {
    pub fn new() -> Result<Self, prometheus::Error> {
        let registry = Registry::new();

        let learning_events_total = IntCounterVec::new(
            Opts::new("learning_events_total", "Inbound events by outcome"),
            &["event_type", "outcome"], // outcome: processed|duplicate|retried|dead_lettered
        )?;

        let learning_outbox_published_total = IntCounterVec::new(
            Opts::new("learning_outbox_published_total", "Outbox relay publish attempts"),
            &["result"], // ok|error
        )?;

        registry.register(Box::new(learning_events_total.clone()))?;
        registry.register(Box::new(learning_outbox_published_total.clone()))?;

        Ok(Self {
            registry,
            learning_events_total,
            learning_outbox_published_total,
        })
    }

    pub fn record_event(&self, event_type: &str, outcome: &str) {
        self.learning_events_total
            .with_label_values(&[event_type, outcome])
            .inc();
    }

    pub fn render(&self) -> Result<String, String> {
        let encoder = TextEncoder::new();
        let mf = self.registry.gather();
        let mut buf = Vec::new();
        encoder.encode(&mf, &mut buf).map_err(|e| e.to_string())?;
        String::from_utf8(buf).map_err(|e| e.to_string())
    }
}
