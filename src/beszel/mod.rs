pub mod client;

use async_trait::async_trait;
use client::ApiError;
use indexmap::IndexMap;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Deserializer};
use serde_json::{Map, Value};

#[async_trait]
pub trait BeszelApi: Send + Sync {
    async fn list_systems(&self) -> Result<Vec<System>, ApiError>;

    // Ok(None) when the system has no stats record yet.
    async fn latest_stats(&self, system_id: &str) -> Result<Option<StatsSnapshot>, ApiError>;
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct System {
    pub id: String,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub status: String,
    #[serde(default, deserialize_with = "lenient")]
    pub info: SystemInfo,
}

impl System {
    pub fn is_up(&self) -> bool {
        self.status == "up"
    }
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct SystemInfo {
    #[serde(default, rename = "cpu", deserialize_with = "lenient_number")]
    pub cpu_percent: Option<f64>,
    #[serde(default, rename = "mp", deserialize_with = "lenient_number")]
    pub memory_percent: Option<f64>,
    #[serde(default, rename = "dp", deserialize_with = "lenient_number")]
    pub disk_percent: Option<f64>,
    #[serde(default, rename = "b", deserialize_with = "lenient_number")]
    pub bandwidth_mbps: Option<f64>,
    #[serde(default, rename = "dt", deserialize_with = "lenient_number")]
    pub temperature_celsius: Option<f64>,
    #[serde(default, rename = "u", deserialize_with = "lenient_number")]
    pub uptime: Option<f64>,
    #[serde(default, rename = "m", deserialize_with = "lenient_string")]
    pub model: Option<String>,
    #[serde(default, rename = "v", deserialize_with = "lenient_string")]
    pub agent_version: Option<String>,
    #[serde(default, rename = "k", deserialize_with = "lenient_string")]
    pub kernel_version: Option<String>,
}

// Untyped sections (power-domain maps) stay in `extra` in document order.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct StatsSnapshot {
    #[serde(default, rename = "efs", deserialize_with = "lenient_map")]
    pub extra_fs: IndexMap<String, ExtraFs>,
    #[serde(default, rename = "g", deserialize_with = "lenient_map")]
    pub gpus: IndexMap<String, GpuStats>,
    #[serde(default, rename = "t", deserialize_with = "lenient")]
    pub temperatures: Map<String, Value>,
    #[serde(default, rename = "bat", deserialize_with = "lenient_battery")]
    pub battery: Option<Battery>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl StatsSnapshot {
    pub fn is_empty(&self) -> bool {
        self.extra_fs.is_empty()
            && self.gpus.is_empty()
            && self.temperatures.is_empty()
            && self.battery.is_none()
            && self.extra.is_empty()
    }
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct ExtraFs {
    #[serde(default, rename = "d", deserialize_with = "lenient_number")]
    pub total_gb: Option<f64>,
    #[serde(default, rename = "du", deserialize_with = "lenient_number")]
    pub used_gb: Option<f64>,
    #[serde(default, rename = "r", deserialize_with = "lenient_number")]
    pub read_mbps: Option<f64>,
    #[serde(default, rename = "w", deserialize_with = "lenient_number")]
    pub write_mbps: Option<f64>,
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct GpuStats {
    #[serde(default, rename = "n", deserialize_with = "lenient_string")]
    pub name: Option<String>,
    #[serde(default, rename = "u", deserialize_with = "lenient_number")]
    pub usage_percent: Option<f64>,
    #[serde(default, rename = "p", deserialize_with = "lenient_number")]
    pub power_watts: Option<f64>,
    #[serde(default, rename = "mu", deserialize_with = "lenient_number")]
    pub memory_used_mb: Option<f64>,
    #[serde(default, rename = "mt", deserialize_with = "lenient_number")]
    pub memory_total_mb: Option<f64>,
    // engine maps and package power fields, named differently per agent
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl GpuStats {
    pub fn display_name(&self, key: &str) -> String {
        match self.name.as_deref().map(str::trim) {
            Some(name) if !name.is_empty() => name.to_string(),
            _ => format!("GPU {key}"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Battery {
    pub level: Option<f64>,
    pub state: BatteryState,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BatteryState {
    Unknown,
    Empty,
    Full,
    Charging,
    Discharging,
    Idle,
}

impl BatteryState {
    pub fn from_code(code: Option<i64>) -> Self {
        match code {
            Some(1) => Self::Empty,
            Some(2) => Self::Full,
            Some(3) => Self::Charging,
            Some(4) => Self::Discharging,
            Some(5) => Self::Idle,
            _ => Self::Unknown,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Unknown => "unknown",
            Self::Empty => "empty",
            Self::Full => "full",
            Self::Charging => "charging",
            Self::Discharging => "discharging",
            Self::Idle => "idle",
        }
    }
}

fn lenient<'de, D, T>(deserializer: D) -> Result<T, D::Error>
where
    D: Deserializer<'de>,
    T: DeserializeOwned + Default,
{
    let value = Value::deserialize(deserializer)?;
    Ok(serde_json::from_value(value).unwrap_or_default())
}

// Entries that do not decode are dropped one by one instead of failing the whole map.
fn lenient_map<'de, D, T>(deserializer: D) -> Result<IndexMap<String, T>, D::Error>
where
    D: Deserializer<'de>,
    T: DeserializeOwned,
{
    let Value::Object(map) = Value::deserialize(deserializer)? else {
        return Ok(IndexMap::new());
    };
    Ok(map
        .into_iter()
        .filter_map(|(key, value)| serde_json::from_value(value).ok().map(|v| (key, v)))
        .collect())
}

fn lenient_number<'de, D>(deserializer: D) -> Result<Option<f64>, D::Error>
where
    D: Deserializer<'de>,
{
    Ok(Value::deserialize(deserializer)?.as_f64())
}

fn lenient_string<'de, D>(deserializer: D) -> Result<Option<String>, D::Error>
where
    D: Deserializer<'de>,
{
    Ok(match Value::deserialize(deserializer)? {
        Value::String(s) => Some(s),
        _ => None,
    })
}

fn lenient_battery<'de, D>(deserializer: D) -> Result<Option<Battery>, D::Error>
where
    D: Deserializer<'de>,
{
    let Value::Array(items) = Value::deserialize(deserializer)? else {
        return Ok(None);
    };
    Ok(Some(Battery {
        level: items.first().and_then(Value::as_f64),
        state: BatteryState::from_code(items.get(1).and_then(Value::as_i64)),
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn system_info_tolerates_odd_fields() {
        let system: System = serde_json::from_value(json!({
            "id": "abc",
            "name": "nas",
            "status": "up",
            "info": {"cpu": 12.5, "mp": "n/a", "u": 1440, "m": "N100", "v": 17}
        }))
        .expect("запись системы");

        assert!(system.is_up());
        assert_eq!(system.info.cpu_percent, Some(12.5));
        assert_eq!(system.info.memory_percent, None);
        assert_eq!(system.info.uptime, Some(1440.0));
        assert_eq!(system.info.model.as_deref(), Some("N100"));
        assert_eq!(system.info.agent_version, None);
    }

    #[test]
    fn system_without_info_decodes() {
        let system: System = serde_json::from_value(json!({"id": "x", "info": null}))
            .expect("запись системы");
        assert_eq!(system.info, SystemInfo::default());
        assert!(!system.is_up());
    }

    #[test]
    fn stats_keep_document_order_and_unknown_maps() {
        let stats: StatsSnapshot = serde_json::from_value(json!({
            "efs": {"/data": {"d": 500, "du": 250, "r": 1.5}, "/backup": {"d": 100}},
            "g": {"1": {"n": "Arc A380", "u": 3.0, "e": {"rcs": 40}}, "0": {"u": "bad"}},
            "t": {"zeta": 1, "alpha": 2},
            "bat": [87, 3],
            "power": {"package-0": 12.0},
            "cpu": 4.0
        }))
        .expect("статистика");

        let disks: Vec<&str> = stats.extra_fs.keys().map(String::as_str).collect();
        assert_eq!(disks, vec!["/data", "/backup"]);
        assert_eq!(stats.extra_fs["/data"].read_mbps, Some(1.5));
        assert_eq!(stats.extra_fs["/backup"].used_gb, None);

        let gpus: Vec<&str> = stats.gpus.keys().map(String::as_str).collect();
        assert_eq!(gpus, vec!["1", "0"]);
        assert!(stats.gpus["1"].extra.contains_key("e"));
        assert_eq!(stats.gpus["0"].usage_percent, None);
        assert_eq!(stats.gpus["0"].display_name("0"), "GPU 0");

        let temps: Vec<&str> = stats.temperatures.keys().map(String::as_str).collect();
        assert_eq!(temps, vec!["zeta", "alpha"]);

        let battery = stats.battery.expect("батарея");
        assert_eq!(battery.level, Some(87.0));
        assert_eq!(battery.state, BatteryState::Charging);

        assert!(stats.extra.contains_key("power"));
        assert!(!stats.extra.contains_key("efs"));
    }

    #[test]
    fn malformed_sections_degrade_to_empty() {
        let stats: StatsSnapshot = serde_json::from_value(json!({
            "efs": "oops",
            "g": {"0": 5, "1": {"n": "iGPU"}},
            "t": [1, 2],
            "bat": {"level": 3}
        }))
        .expect("статистика");

        assert!(stats.extra_fs.is_empty());
        assert_eq!(stats.gpus.len(), 1);
        assert!(stats.temperatures.is_empty());
        assert!(stats.battery.is_none());
    }

    #[test]
    fn empty_object_is_empty_snapshot() {
        let stats: StatsSnapshot = serde_json::from_value(json!({})).expect("статистика");
        assert!(stats.is_empty());
        assert_eq!(stats, StatsSnapshot::default());
    }
}
