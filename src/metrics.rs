use crate::entities::{EntityValue, Platform};
use crate::state::State;
use prometheus::core::Collector;
use prometheus::{opts, Counter, CounterVec, Encoder, Gauge, GaugeVec, Registry, TextEncoder};
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

#[derive(Clone)]
pub struct Metrics {
    registry: Registry,
    pub bridge_sensor_value: GaugeVec,
    pub bridge_binary_sensor_on: GaugeVec,
    pub bridge_sensor_available: GaugeVec,
    pub bridge_entities_count: Gauge,
    pub bridge_systems_count: Gauge,
    pub bridge_systems_up: Gauge,
    pub bridge_last_update_success: Gauge,
    pub bridge_consecutive_failures: Gauge,
    pub bridge_last_refresh_timestamp_seconds: Gauge,
    pub bridge_uptime_seconds: Gauge,
    pub bridge_refresh_total: CounterVec,
    pub bridge_fetch_errors_total: CounterVec,
    pub bridge_scrape_count_total: Counter,
}

impl Metrics {
    pub fn new() -> Result<Arc<Self>, prometheus::Error> {
        let registry = Registry::new();

        let bridge_sensor_value = GaugeVec::new(
            opts!(
                "beszel_bridge_sensor_value",
                "Current numeric value of a sensor entity"
            ),
            &["unique_id", "system", "name", "unit"],
        )?;
        let bridge_binary_sensor_on = GaugeVec::new(
            opts!(
                "beszel_bridge_binary_sensor_on",
                "Binary sensor state 0/1"
            ),
            &["unique_id", "system", "name"],
        )?;
        let bridge_sensor_available = GaugeVec::new(
            opts!(
                "beszel_bridge_sensor_available",
                "Entity availability 0/1"
            ),
            &["unique_id"],
        )?;
        let bridge_entities_count = Gauge::with_opts(opts!(
            "beszel_bridge_entities_count",
            "Number of registered entities"
        ))?;
        let bridge_systems_count = Gauge::with_opts(opts!(
            "beszel_bridge_systems_count",
            "Number of systems in the last snapshot"
        ))?;
        let bridge_systems_up = Gauge::with_opts(opts!(
            "beszel_bridge_systems_up",
            "Number of systems reported up in the last snapshot"
        ))?;
        let bridge_last_update_success = Gauge::with_opts(opts!(
            "beszel_bridge_last_update_success",
            "Whether the last refresh cycle succeeded 0/1"
        ))?;
        let bridge_consecutive_failures = Gauge::with_opts(opts!(
            "beszel_bridge_consecutive_failures",
            "Failed refresh cycles since the last success"
        ))?;
        let bridge_last_refresh_timestamp_seconds = Gauge::with_opts(opts!(
            "beszel_bridge_last_refresh_timestamp_seconds",
            "Unix timestamp of the last successful refresh"
        ))?;
        let bridge_uptime_seconds = Gauge::with_opts(opts!(
            "beszel_bridge_uptime_seconds",
            "Bridge uptime in seconds"
        ))?;
        let bridge_refresh_total = CounterVec::new(
            opts!(
                "beszel_bridge_refresh_total",
                "Refresh cycles total by result"
            ),
            &["result"],
        )?;
        let bridge_fetch_errors_total = CounterVec::new(
            opts!(
                "beszel_bridge_fetch_errors_total",
                "Failed Beszel requests total by stage"
            ),
            &["stage"],
        )?;
        let bridge_scrape_count_total = Counter::with_opts(opts!(
            "beszel_bridge_scrape_count_total",
            "Number of /metrics scrapes"
        ))?;

        register(&registry, &bridge_sensor_value)?;
        register(&registry, &bridge_binary_sensor_on)?;
        register(&registry, &bridge_sensor_available)?;
        register(&registry, &bridge_entities_count)?;
        register(&registry, &bridge_systems_count)?;
        register(&registry, &bridge_systems_up)?;
        register(&registry, &bridge_last_update_success)?;
        register(&registry, &bridge_consecutive_failures)?;
        register(&registry, &bridge_last_refresh_timestamp_seconds)?;
        register(&registry, &bridge_uptime_seconds)?;
        register(&registry, &bridge_refresh_total)?;
        register(&registry, &bridge_fetch_errors_total)?;
        register(&registry, &bridge_scrape_count_total)?;

        Ok(Arc::new(Self {
            registry,
            bridge_sensor_value,
            bridge_binary_sensor_on,
            bridge_sensor_available,
            bridge_entities_count,
            bridge_systems_count,
            bridge_systems_up,
            bridge_last_update_success,
            bridge_consecutive_failures,
            bridge_last_refresh_timestamp_seconds,
            bridge_uptime_seconds,
            bridge_refresh_total,
            bridge_fetch_errors_total,
            bridge_scrape_count_total,
        }))
    }

    pub fn update_from_state(&self, state: &State) {
        let snapshot = state.snapshot();

        self.bridge_sensor_value.reset();
        self.bridge_binary_sensor_on.reset();
        self.bridge_sensor_available.reset();

        let entities = state.render_entities();
        for e in &entities {
            let system = snapshot
                .system(&e.system_id)
                .map(|s| s.name.as_str())
                .unwrap_or(e.system_id.as_str());
            let name = e.name.as_deref().unwrap_or("");
            self.bridge_sensor_available
                .with_label_values(&[&e.unique_id])
                .set(if e.available { 1.0 } else { 0.0 });

            match (e.platform, e.value) {
                (Platform::Sensor, Some(EntityValue::Number(v))) => {
                    self.bridge_sensor_value
                        .with_label_values(&[&e.unique_id, system, name, e.unit.unwrap_or("")])
                        .set(v);
                }
                (Platform::BinarySensor, Some(EntityValue::Bool(on))) => {
                    self.bridge_binary_sensor_on
                        .with_label_values(&[&e.unique_id, system, name])
                        .set(if on { 1.0 } else { 0.0 });
                }
                _ => {}
            }
        }
        self.bridge_entities_count.set(entities.len() as f64);

        self.bridge_systems_count.set(snapshot.systems.len() as f64);
        self.bridge_systems_up
            .set(snapshot.systems.iter().filter(|s| s.is_up()).count() as f64);
        self.bridge_last_update_success
            .set(if state.last_update_success { 1.0 } else { 0.0 });
        self.bridge_consecutive_failures
            .set(state.consecutive_failures as f64);
        self.bridge_last_refresh_timestamp_seconds
            .set(state.last_success_unix as f64);

        let uptime = now_unix().saturating_sub(state.started_at_unix) as f64;
        self.bridge_uptime_seconds.set(uptime);
    }

    pub fn inc_scrape_count(&self) {
        self.bridge_scrape_count_total.inc();
    }

    pub fn inc_refresh(&self, result: &str) {
        self.bridge_refresh_total.with_label_values(&[result]).inc();
    }

    pub fn inc_fetch_error(&self, stage: &str) {
        self.bridge_fetch_errors_total
            .with_label_values(&[stage])
            .inc();
    }

    pub fn encode_metrics(&self) -> Result<Vec<u8>, prometheus::Error> {
        let mut buf = Vec::new();
        let encoder = TextEncoder::new();
        let mf = self.registry.gather();
        encoder.encode(&mf, &mut buf)?;
        Ok(buf)
    }
}

fn register<T: Collector + Clone + 'static>(
    registry: &Registry,
    collector: &T,
) -> Result<(), prometheus::Error> {
    registry.register(Box::new(collector.clone()))
}

fn now_unix() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::Snapshot;
    use serde_json::json;

    fn has_sample(text: &str, metric: &str, label: &str, value: &str) -> bool {
        text.lines().any(|line| {
            line.starts_with(metric) && line.contains(label) && line.ends_with(&format!(" {value}"))
        })
    }

    #[test]
    fn exports_sensor_values_and_status() {
        let metrics = Metrics::new().expect("инициализация метрик");
        let mut state = State::new(0);
        state.publish(
            Snapshot {
                systems: vec![serde_json::from_value(
                    json!({"id": "a", "name": "nas", "status": "up", "info": {"cpu": 17.5}}),
                )
                .expect("система")],
                ..Snapshot::default()
            },
            5,
        );
        metrics.update_from_state(&state);
        metrics.inc_refresh("success");

        let text = String::from_utf8(metrics.encode_metrics().unwrap()).unwrap();
        assert!(has_sample(
            &text,
            "beszel_bridge_sensor_value{",
            "unique_id=\"beszel_a_cpu\"",
            "17.5"
        ));
        assert!(has_sample(
            &text,
            "beszel_bridge_binary_sensor_on{",
            "unique_id=\"beszel_a_status\"",
            "1"
        ));
        assert!(text.contains("beszel_bridge_systems_up 1"));
        assert!(text.contains("beszel_bridge_refresh_total{result=\"success\"} 1"));
    }

    #[test]
    fn sensors_without_value_are_not_exported() {
        let metrics = Metrics::new().expect("инициализация метрик");
        let mut state = State::new(0);
        state.publish(
            Snapshot {
                systems: vec![serde_json::from_value(json!({"id": "a", "name": "nas"}))
                    .expect("система")],
                ..Snapshot::default()
            },
            5,
        );
        metrics.update_from_state(&state);

        let text = String::from_utf8(metrics.encode_metrics().unwrap()).unwrap();
        assert!(!text
            .lines()
            .any(|l| l.starts_with("beszel_bridge_sensor_value{") && l.contains("beszel_a_ram")));
        assert!(has_sample(
            &text,
            "beszel_bridge_sensor_available{",
            "unique_id=\"beszel_a_ram\"",
            "1"
        ));
        assert!(text.contains("beszel_bridge_entities_count 7"));
    }

    #[test]
    fn vanished_system_drops_status_series() {
        let metrics = Metrics::new().expect("инициализация метрик");
        let mut state = State::new(0);
        state.publish(
            Snapshot {
                systems: vec![serde_json::from_value(
                    json!({"id": "a", "name": "nas", "status": "down"}),
                )
                .expect("система")],
                ..Snapshot::default()
            },
            5,
        );
        state.publish(Snapshot::default(), 10);
        metrics.update_from_state(&state);

        let text = String::from_utf8(metrics.encode_metrics().unwrap()).unwrap();
        assert!(!text.lines().any(|l| l.starts_with("beszel_bridge_binary_sensor_on{")));
        assert!(has_sample(
            &text,
            "beszel_bridge_sensor_available{",
            "unique_id=\"beszel_a_status\"",
            "0"
        ));
    }
}
