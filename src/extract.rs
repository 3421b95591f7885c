use crate::beszel::{GpuStats, StatsSnapshot};
use serde_json::{Map, Value};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MatchPolicy {
    First,
    Last,
}

#[derive(Debug, Clone, Copy)]
pub enum Lookup<'a> {
    Keys(&'a [&'a str]),
    // case-insensitive substring match, in document order
    Scan {
        markers: &'a [&'a str],
        policy: MatchPolicy,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Engine {
    Render,
    Blitter,
    Video,
    VideoEnhance,
}

pub const ENGINES: [Engine; 4] = [
    Engine::Render,
    Engine::Blitter,
    Engine::Video,
    Engine::VideoEnhance,
];

// intel_gpu_top / i915 engine names
const RENDER_ALIASES: &[&str] = &["render", "rcs", "3d", "gfx", "render3d"];
const BLITTER_ALIASES: &[&str] = &["blitter", "bcs", "copy"];
const VIDEO_ALIASES: &[&str] = &["video", "vcs", "media", "video0"];
const VIDEO_ENHANCE_ALIASES: &[&str] = &[
    "videoenhance",
    "vecs",
    "ve",
    "video-enhance",
    "video_enhance",
];

const ENGINE_MAP_KEYS: &[&str] = &["e", "eng", "engines", "ge", "engine_util", "engine"];
const POWER_DOMAIN_KEYS: &[&str] = &["power", "pd", "rapl", "pwr"];
const TILE_POWER_MARKERS: &[&str] = &["gpu", "gt", "graphics", "gfx"];
const PACKAGE_POWER_FIELDS: &[&str] = &["pp", "package", "pkg"];
const PACKAGE_POWER_MARKERS: &[&str] = &["package", "pkg", "rapl_package", "rapl:package"];
const GPU_TEMP_MARKERS: &[&str] = &["gpu"];

impl Engine {
    pub fn name(self) -> &'static str {
        match self {
            Self::Render => "render",
            Self::Blitter => "blitter",
            Self::Video => "video",
            Self::VideoEnhance => "videoenhance",
        }
    }

    pub fn aliases(self) -> &'static [&'static str] {
        match self {
            Self::Render => RENDER_ALIASES,
            Self::Blitter => BLITTER_ALIASES,
            Self::Video => VIDEO_ALIASES,
            Self::VideoEnhance => VIDEO_ENHANCE_ALIASES,
        }
    }

    pub fn label(self) -> &'static str {
        match self {
            Self::Render => "Render/3D Util",
            Self::Blitter => "Blitter Util",
            Self::Video => "Video Util",
            Self::VideoEnhance => "VideoEnhance Util",
        }
    }

    pub fn icon(self) -> &'static str {
        match self {
            Self::Render => "mdi:gauge",
            Self::Blitter => "mdi:content-copy",
            Self::Video => "mdi:video",
            Self::VideoEnhance => "mdi:video-vintage",
        }
    }

    fn rules(self) -> [Lookup<'static>; 2] {
        [
            Lookup::Keys(self.aliases()),
            Lookup::Scan {
                markers: self.aliases(),
                policy: MatchPolicy::First,
            },
        ]
    }
}

pub fn find_number(map: &Map<String, Value>, rules: &[Lookup<'_>]) -> Option<f64> {
    rules.iter().find_map(|rule| match *rule {
        Lookup::Keys(keys) => keys
            .iter()
            .find_map(|key| map.get(*key).and_then(Value::as_f64)),
        Lookup::Scan { markers, policy } => {
            let mut hits = map.iter().filter_map(|(key, value)| {
                let key = key.to_lowercase();
                let matched = markers
                    .iter()
                    .any(|m| !m.is_empty() && key.contains(&m.to_lowercase()));
                if matched {
                    value.as_f64()
                } else {
                    None
                }
            });
            match policy {
                MatchPolicy::First => hits.next(),
                MatchPolicy::Last => hits.last(),
            }
        }
    })
}

fn first_object<'a>(map: &'a Map<String, Value>, keys: &[&str]) -> Option<&'a Map<String, Value>> {
    keys.iter().find_map(|key| map.get(*key).and_then(Value::as_object))
}

pub fn round2(value: f64) -> f64 {
    (value * 100.0).round() / 100.0
}

pub fn disk_usage_percent(total: Option<f64>, used: Option<f64>) -> Option<f64> {
    match (total, used) {
        (Some(total), Some(used)) if total > 0.0 => Some(round2(used / total * 100.0)),
        _ => None,
    }
}

pub fn engine_map(gpu: &GpuStats) -> Option<&Map<String, Value>> {
    first_object(&gpu.extra, ENGINE_MAP_KEYS)
}

pub fn engine_utilization(gpu: &GpuStats, engine: Engine) -> Option<f64> {
    find_number(engine_map(gpu)?, &engine.rules())
}

pub fn power_domains(stats: &StatsSnapshot) -> Option<&Map<String, Value>> {
    first_object(&stats.extra, POWER_DOMAIN_KEYS)
}

// Any key containing "gpu" wins and the scan stops there. Otherwise the last
// key containing the GPU display name is used.
pub fn gpu_temperature(temperatures: &Map<String, Value>, gpu_name: &str) -> Option<f64> {
    let lower_name = gpu_name.to_lowercase();
    let name_markers = [lower_name.as_str()];
    find_number(
        temperatures,
        &[
            Lookup::Scan {
                markers: GPU_TEMP_MARKERS,
                policy: MatchPolicy::First,
            },
            Lookup::Scan {
                markers: &name_markers,
                policy: MatchPolicy::Last,
            },
        ],
    )
}

pub fn tile_power(gpu: &GpuStats, stats: &StatsSnapshot) -> Option<f64> {
    gpu.power_watts.or_else(|| {
        find_number(
            power_domains(stats)?,
            &[Lookup::Scan {
                markers: TILE_POWER_MARKERS,
                policy: MatchPolicy::First,
            }],
        )
    })
}

pub fn package_power(gpu: &GpuStats, stats: &StatsSnapshot) -> Option<f64> {
    find_number(&gpu.extra, &[Lookup::Keys(PACKAGE_POWER_FIELDS)]).or_else(|| {
        find_number(
            power_domains(stats)?,
            &[Lookup::Scan {
                markers: PACKAGE_POWER_MARKERS,
                policy: MatchPolicy::First,
            }],
        )
    })
}

pub fn battery_icon(level: Option<f64>, charging: bool) -> String {
    let Some(level) = level else {
        return "mdi:battery-unknown".to_string();
    };
    if charging && level > 10.0 {
        let step = ((level / 20.0 - 0.01).round() as i64) * 20;
        format!("mdi:battery-charging-{step}")
    } else if charging {
        "mdi:battery-outline".to_string()
    } else if level <= 5.0 {
        "mdi:battery-alert".to_string()
    } else if level < 95.0 {
        let step = ((level / 10.0 - 0.01).round() as i64) * 10;
        format!("mdi:battery-{step}")
    } else {
        "mdi:battery".to_string()
    }
}

pub fn format_uptime(minutes: f64) -> String {
    let total_minutes = (minutes.trunc() as i64).max(0);
    let hours = total_minutes / 60;
    let mins = total_minutes % 60;
    let days = hours / 24;

    if hours < 1 {
        format!("{mins}m")
    } else if hours < 24 {
        format!("{hours}h {mins}m")
    } else {
        format!("{days}d {}h", hours % 24)
    }
}
