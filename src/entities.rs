use crate::beszel::{BatteryState, GpuStats, StatsSnapshot, System};
use crate::extract::{self, Engine, ENGINES};
use crate::state::Snapshot;
use indexmap::IndexMap;
use serde::Serialize;
use serde_json::{json, Value};
use std::collections::HashSet;
use thiserror::Error;
use tracing::{debug, info, warn};

pub const DOMAIN: &str = "beszel";
const MANUFACTURER: &str = "Beszel";

#[derive(Debug, Error)]
pub enum EntityError {
    #[error("у системы '{name}' пустой идентификатор")]
    MissingSystemId { name: String },
    #[error("у GPU системы {system_id} пустой ключ")]
    MissingGpuKey { system_id: String },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SystemMetric {
    Cpu,
    Ram,
    Disk,
    Bandwidth,
    Temperature,
    Uptime,
}

const SYSTEM_METRICS: [SystemMetric; 6] = [
    SystemMetric::Cpu,
    SystemMetric::Ram,
    SystemMetric::Disk,
    SystemMetric::Bandwidth,
    SystemMetric::Temperature,
    SystemMetric::Uptime,
];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum GpuMetric {
    Usage,
    Power,
    PowerTile,
    PowerPackage,
    MemoryUsed,
    MemoryTotal,
    Temperature,
    Engine(Engine),
}

const GPU_METRICS: [GpuMetric; 7] = [
    GpuMetric::Usage,
    GpuMetric::Power,
    GpuMetric::PowerTile,
    GpuMetric::PowerPackage,
    GpuMetric::MemoryUsed,
    GpuMetric::MemoryTotal,
    GpuMetric::Temperature,
];

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Metric {
    System(SystemMetric),
    Status,
    ExtraFs { disk: String },
    Battery,
    Gpu {
        key: String,
        name: String,
        metric: GpuMetric,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Platform {
    Sensor,
    BinarySensor,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
#[serde(untagged)]
pub enum EntityValue {
    Number(f64),
    Bool(bool),
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DeviceInfo {
    pub identifiers: Vec<(String, String)>,
    pub name: String,
    pub manufacturer: &'static str,
    pub model: Option<String>,
    pub sw_version: Option<String>,
    pub hw_version: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct EntityState {
    pub unique_id: String,
    pub platform: Platform,
    pub system_id: String,
    pub name: Option<String>,
    pub available: bool,
    pub value: Option<EntityValue>,
    pub unit: Option<&'static str>,
    pub device_class: Option<&'static str>,
    pub state_class: Option<&'static str>,
    pub icon: Option<String>,
    pub suggested_display_precision: Option<u8>,
    pub attributes: IndexMap<String, Value>,
    pub device: Option<DeviceInfo>,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SensorEntity {
    pub system_id: String,
    pub metric: Metric,
}

impl SensorEntity {
    pub fn new(system_id: impl Into<String>, metric: Metric) -> Self {
        Self {
            system_id: system_id.into(),
            metric,
        }
    }

    pub fn unique_id(&self) -> String {
        format!("{DOMAIN}_{}_{}", self.system_id, self.metric.id_suffix())
    }

    pub fn platform(&self) -> Platform {
        match self.metric {
            Metric::Status => Platform::BinarySensor,
            _ => Platform::Sensor,
        }
    }

    pub fn render(&self, snapshot: &Snapshot, last_update_success: bool) -> EntityState {
        let system = snapshot.system(&self.system_id);
        let stats = snapshot.stats(&self.system_id);

        EntityState {
            unique_id: self.unique_id(),
            platform: self.platform(),
            system_id: self.system_id.clone(),
            name: system.map(|s| self.metric.display_name(&s.name)),
            available: last_update_success && system.is_some(),
            value: self.value(system, stats),
            unit: self.metric.unit(),
            device_class: self.metric.device_class(),
            state_class: self.metric.state_class(),
            icon: self.icon(stats),
            suggested_display_precision: match self.metric {
                Metric::System(SystemMetric::Uptime) => Some(0),
                _ => None,
            },
            attributes: system
                .map(|s| self.attributes(s, stats))
                .unwrap_or_default(),
            device: system.map(device_info),
        }
    }

    fn value(&self, system: Option<&System>, stats: Option<&StatsSnapshot>) -> Option<EntityValue> {
        let system = system?;
        if let Metric::Status = self.metric {
            return Some(EntityValue::Bool(system.is_up()));
        }
        let number = match &self.metric {
            Metric::System(metric) => system_value(system, *metric),
            Metric::ExtraFs { disk } => {
                let fs = stats?.extra_fs.get(disk)?;
                extract::disk_usage_percent(fs.total_gb, fs.used_gb)
            }
            Metric::Battery => stats?.battery?.level,
            Metric::Gpu { key, name, metric } => {
                let stats = stats?;
                gpu_value(stats, stats.gpus.get(key)?, name, *metric)
            }
            Metric::Status => None,
        };
        number.map(EntityValue::Number)
    }

    fn icon(&self, stats: Option<&StatsSnapshot>) -> Option<String> {
        match &self.metric {
            Metric::Battery => {
                let battery = stats.and_then(|s| s.battery);
                Some(match battery {
                    Some(b) => extract::battery_icon(b.level, b.state == BatteryState::Charging),
                    None => "mdi:battery-unknown".to_string(),
                })
            }
            metric => metric.static_icon().map(str::to_string),
        }
    }

    fn attributes(&self, system: &System, stats: Option<&StatsSnapshot>) -> IndexMap<String, Value> {
        let mut out = IndexMap::new();
        match &self.metric {
            Metric::System(SystemMetric::Uptime) => {
                if let Some(minutes) = system.info.uptime {
                    out.insert(
                        "formatted".to_string(),
                        json!(extract::format_uptime(minutes)),
                    );
                }
            }
            Metric::ExtraFs { disk } => {
                if let Some(fs) = stats.and_then(|s| s.extra_fs.get(disk)) {
                    out.insert("total_disk_space_gb".to_string(), json!(fs.total_gb));
                    out.insert("disk_used_gb".to_string(), json!(fs.used_gb));
                    out.insert("read_mb_s".to_string(), json!(fs.read_mbps));
                    out.insert("write_mb_s".to_string(), json!(fs.write_mbps));
                }
            }
            Metric::Battery => {
                if let Some(battery) = stats.and_then(|s| s.battery) {
                    out.insert("state".to_string(), json!(battery.state.as_str()));
                }
            }
            _ => {}
        }
        out
    }
}

impl Metric {
    fn id_suffix(&self) -> String {
        match self {
            Self::System(metric) => match metric {
                SystemMetric::Cpu => "cpu",
                SystemMetric::Ram => "ram",
                SystemMetric::Disk => "disk",
                SystemMetric::Bandwidth => "bandwidth",
                SystemMetric::Temperature => "temperature",
                SystemMetric::Uptime => "uptime",
            }
            .to_string(),
            Self::Status => "status".to_string(),
            Self::ExtraFs { disk } => format!("efs_{disk}"),
            Self::Battery => "battery".to_string(),
            Self::Gpu { key, metric, .. } => {
                let suffix = match metric {
                    GpuMetric::Usage => "usage",
                    GpuMetric::Power => "power",
                    GpuMetric::PowerTile => "power_tile",
                    GpuMetric::PowerPackage => "power_package",
                    GpuMetric::MemoryUsed => "mem_used",
                    GpuMetric::MemoryTotal => "mem_total",
                    GpuMetric::Temperature => "temp",
                    GpuMetric::Engine(engine) => return format!("gpu_{key}_eng_{}", engine.name()),
                };
                format!("gpu_{key}_{suffix}")
            }
        }
    }

    fn display_name(&self, system_name: &str) -> String {
        match self {
            Self::System(metric) => {
                let label = match metric {
                    SystemMetric::Cpu => "CPU",
                    SystemMetric::Ram => "RAM",
                    SystemMetric::Disk => "Disk",
                    SystemMetric::Bandwidth => "Bandwidth",
                    SystemMetric::Temperature => "temperature",
                    SystemMetric::Uptime => "uptime",
                };
                format!("{system_name} {label}")
            }
            Self::Status => format!("{system_name} Status"),
            Self::ExtraFs { disk } => format!("{system_name} EFS {disk}"),
            Self::Battery => format!("{system_name} Battery"),
            Self::Gpu { name, metric, .. } => {
                let label = match metric {
                    GpuMetric::Usage => "Usage",
                    GpuMetric::Power => "Power",
                    GpuMetric::PowerTile => "GPU Tile Power",
                    GpuMetric::PowerPackage => "Package Power",
                    GpuMetric::MemoryUsed => "Memory Used",
                    GpuMetric::MemoryTotal => "Memory Total",
                    GpuMetric::Temperature => "Temperature",
                    GpuMetric::Engine(engine) => engine.label(),
                };
                format!("{system_name} {name} {label}")
            }
        }
    }

    pub fn unit(&self) -> Option<&'static str> {
        match self {
            Self::System(SystemMetric::Bandwidth) => Some("MB/s"),
            Self::System(SystemMetric::Temperature) => Some("°C"),
            Self::System(SystemMetric::Uptime) => Some("minutes"),
            Self::System(_) | Self::ExtraFs { .. } | Self::Battery => Some("%"),
            Self::Status => None,
            Self::Gpu { metric, .. } => Some(match metric {
                GpuMetric::Usage | GpuMetric::Engine(_) => "%",
                GpuMetric::Power | GpuMetric::PowerTile | GpuMetric::PowerPackage => "W",
                GpuMetric::MemoryUsed | GpuMetric::MemoryTotal => "MB",
                GpuMetric::Temperature => "°C",
            }),
        }
    }

    pub fn device_class(&self) -> Option<&'static str> {
        match self {
            Self::System(SystemMetric::Temperature)
            | Self::Gpu {
                metric: GpuMetric::Temperature,
                ..
            } => Some("temperature"),
            Self::Status => Some("connectivity"),
            Self::Battery => Some("battery"),
            _ => None,
        }
    }

    pub fn state_class(&self) -> Option<&'static str> {
        match self {
            Self::System(SystemMetric::Uptime) => Some("total_increasing"),
            Self::Battery => Some("measurement"),
            _ => None,
        }
    }

    fn static_icon(&self) -> Option<&'static str> {
        match self {
            Self::System(metric) => match metric {
                SystemMetric::Cpu => Some("mdi:memory"),
                SystemMetric::Ram => Some("mdi:chip"),
                SystemMetric::Disk => Some("mdi:harddisk"),
                SystemMetric::Bandwidth => Some("mdi:router-network"),
                SystemMetric::Temperature => None,
                SystemMetric::Uptime => Some("mdi:sort-clock-descending"),
            },
            Self::Status | Self::Battery => None,
            Self::ExtraFs { .. } => Some("mdi:harddisk"),
            Self::Gpu { metric, .. } => Some(match metric {
                GpuMetric::Usage => "mdi:gauge",
                GpuMetric::Power | GpuMetric::PowerTile => "mdi:flash",
                GpuMetric::PowerPackage => "mdi:cpu-64-bit",
                GpuMetric::MemoryUsed | GpuMetric::MemoryTotal => "mdi:memory",
                GpuMetric::Temperature => "mdi:thermometer",
                GpuMetric::Engine(engine) => engine.icon(),
            }),
        }
    }
}

fn system_value(system: &System, metric: SystemMetric) -> Option<f64> {
    let info = &system.info;
    match metric {
        SystemMetric::Cpu => info.cpu_percent,
        SystemMetric::Ram => info.memory_percent,
        SystemMetric::Disk => info.disk_percent,
        SystemMetric::Bandwidth => info.bandwidth_mbps,
        SystemMetric::Temperature => info.temperature_celsius,
        SystemMetric::Uptime => info.uptime,
    }
}

fn gpu_value(stats: &StatsSnapshot, gpu: &GpuStats, name: &str, metric: GpuMetric) -> Option<f64> {
    match metric {
        GpuMetric::Usage => gpu.usage_percent,
        GpuMetric::Power => gpu.power_watts,
        GpuMetric::PowerTile => extract::tile_power(gpu, stats),
        GpuMetric::PowerPackage => extract::package_power(gpu, stats),
        GpuMetric::MemoryUsed => gpu.memory_used_mb,
        GpuMetric::MemoryTotal => gpu.memory_total_mb,
        GpuMetric::Temperature => extract::gpu_temperature(&stats.temperatures, name),
        GpuMetric::Engine(engine) => extract::engine_utilization(gpu, engine),
    }
}

fn device_info(system: &System) -> DeviceInfo {
    DeviceInfo {
        identifiers: vec![(DOMAIN.to_string(), system.id.clone())],
        name: system.name.clone(),
        manufacturer: MANUFACTURER,
        model: system.info.model.clone(),
        sw_version: system.info.agent_version.clone(),
        hw_version: system.info.kernel_version.clone(),
    }
}

pub fn build_entities(snapshot: &Snapshot) -> Vec<SensorEntity> {
    let mut entities = Vec::new();
    for system in &snapshot.systems {
        match entities_for_system(system, snapshot.stats(&system.id)) {
            Ok(mut built) => entities.append(&mut built),
            Err(err) => {
                warn!(system = %system.name, error = %err, "не удалось создать сенсоры системы");
            }
        }
    }
    debug!(count = entities.len(), "сенсоры построены по снимку");
    entities
}

fn entities_for_system(
    system: &System,
    stats: Option<&StatsSnapshot>,
) -> Result<Vec<SensorEntity>, EntityError> {
    if system.id.trim().is_empty() {
        return Err(EntityError::MissingSystemId {
            name: system.name.clone(),
        });
    }

    let mut out: Vec<SensorEntity> = SYSTEM_METRICS
        .iter()
        .map(|m| SensorEntity::new(&system.id, Metric::System(*m)))
        .collect();
    out.push(SensorEntity::new(&system.id, Metric::Status));

    let Some(stats) = stats else {
        return Ok(out);
    };

    for disk in stats.extra_fs.keys() {
        out.push(SensorEntity::new(
            &system.id,
            Metric::ExtraFs { disk: disk.clone() },
        ));
    }

    if stats.battery.is_some() {
        out.push(SensorEntity::new(&system.id, Metric::Battery));
    }

    for (key, gpu) in &stats.gpus {
        match gpu_entities(&system.id, key, gpu) {
            Ok(mut built) => out.append(&mut built),
            Err(err) => {
                warn!(system = %system.name, gpu = %key, error = %err, "не удалось создать сенсоры GPU");
            }
        }
    }

    Ok(out)
}

fn gpu_entities(system_id: &str, key: &str, gpu: &GpuStats) -> Result<Vec<SensorEntity>, EntityError> {
    if key.trim().is_empty() {
        return Err(EntityError::MissingGpuKey {
            system_id: system_id.to_string(),
        });
    }

    let name = gpu.display_name(key);
    let metrics = GPU_METRICS
        .into_iter()
        .chain(ENGINES.into_iter().map(GpuMetric::Engine));
    Ok(metrics
        .map(|metric| {
            SensorEntity::new(
                system_id,
                Metric::Gpu {
                    key: key.to_string(),
                    name: name.clone(),
                    metric,
                },
            )
        })
        .collect())
}

// Append-only: an entity whose system, disk or GPU disappears stays
// registered and renders unavailable.
#[derive(Debug, Clone, Default)]
pub struct EntityRegistry {
    entities: Vec<SensorEntity>,
    ids: HashSet<String>,
}

impl EntityRegistry {
    pub fn merge(&mut self, built: Vec<SensorEntity>) -> usize {
        let mut added = 0;
        for entity in built {
            if self.ids.insert(entity.unique_id()) {
                info!(unique_id = %entity.unique_id(), "зарегистрирован сенсор");
                self.entities.push(entity);
                added += 1;
            }
        }
        added
    }

    pub fn iter(&self) -> impl Iterator<Item = &SensorEntity> {
        self.entities.iter()
    }

    pub fn get(&self, unique_id: &str) -> Option<&SensorEntity> {
        if !self.ids.contains(unique_id) {
            return None;
        }
        self.entities.iter().find(|e| e.unique_id() == unique_id)
    }

    pub fn len(&self) -> usize {
        self.entities.len()
    }
}
