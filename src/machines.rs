//! Machine presets and the pure resolver from task/run config to a preset.

use serde::{Deserialize, Serialize};
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum MachinePresetName {
    #[serde(rename = "micro")]
    Micro,
    #[serde(rename = "small-1x")]
    Small1x,
    #[serde(rename = "small-2x")]
    Small2x,
    #[serde(rename = "medium-1x")]
    Medium1x,
    #[serde(rename = "medium-2x")]
    Medium2x,
    #[serde(rename = "large-1x")]
    Large1x,
    #[serde(rename = "large-2x")]
    Large2x,
}

impl MachinePresetName {
    pub const ALL: [MachinePresetName; 7] = [
        MachinePresetName::Micro,
        MachinePresetName::Small1x,
        MachinePresetName::Small2x,
        MachinePresetName::Medium1x,
        MachinePresetName::Medium2x,
        MachinePresetName::Large1x,
        MachinePresetName::Large2x,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            MachinePresetName::Micro => "micro",
            MachinePresetName::Small1x => "small-1x",
            MachinePresetName::Small2x => "small-2x",
            MachinePresetName::Medium1x => "medium-1x",
            MachinePresetName::Medium2x => "medium-2x",
            MachinePresetName::Large1x => "large-1x",
            MachinePresetName::Large2x => "large-2x",
        }
    }

    pub fn preset(self) -> MachinePreset {
        let (cpu, memory, cents_per_ms) = match self {
            MachinePresetName::Micro => (0.25, 0.25, 0.000_008_5),
            MachinePresetName::Small1x => (0.5, 0.5, 0.000_016_9),
            MachinePresetName::Small2x => (1.0, 1.0, 0.000_033_8),
            MachinePresetName::Medium1x => (1.0, 2.0, 0.000_050_0),
            MachinePresetName::Medium2x => (2.0, 4.0, 0.000_100_0),
            MachinePresetName::Large1x => (4.0, 8.0, 0.000_200_0),
            MachinePresetName::Large2x => (8.0, 16.0, 0.000_400_0),
        };
        MachinePreset {
            name: self,
            cpu,
            memory,
            cents_per_ms,
        }
    }

    /// Strictly more memory (then cpu) than `other`.
    pub fn is_larger_than(self, other: MachinePresetName) -> bool {
        let (a, b) = (self.preset(), other.preset());
        a.memory > b.memory || (a.memory == b.memory && a.cpu > b.cpu)
    }
}

impl fmt::Display for MachinePresetName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Concrete resources for a preset.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MachinePreset {
    pub name: MachinePresetName,
    /// vCPUs.
    pub cpu: f64,
    /// GB.
    pub memory: f64,
    pub cents_per_ms: f64,
}

/// Machine section of a task definition.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MachineConfig {
    #[serde(default)]
    pub preset: Option<MachinePresetName>,
    #[serde(default)]
    pub cpu: Option<f64>,
    #[serde(default)]
    pub memory: Option<f64>,
}

/// Resolve a preset from task config. An explicit preset wins, then an exact
/// cpu/memory match, then `default`.
pub fn machine_preset_from_config(config: Option<&MachineConfig>, default: MachinePresetName) -> MachinePreset {
    let Some(config) = config else {
        return default.preset();
    };
    if let Some(name) = config.preset {
        return name.preset();
    }
    if let (Some(cpu), Some(memory)) = (config.cpu, config.memory) {
        if let Some(found) = MachinePresetName::ALL
            .into_iter()
            .map(MachinePresetName::preset)
            .find(|p| p.cpu == cpu && p.memory == memory)
        {
            return found;
        }
    }
    default.preset()
}

/// Run-level override first (set by an OOM upgrade or at trigger time), then task config.
pub fn machine_preset_for_run(
    run_override: Option<MachinePresetName>,
    task_config: Option<&MachineConfig>,
    default: MachinePresetName,
) -> MachinePreset {
    match run_override {
        Some(name) => name.preset(),
        None => machine_preset_from_config(task_config, default),
    }
}
