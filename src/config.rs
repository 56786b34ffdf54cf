use std::fs;
use std::time::Duration;

use anyhow::{Context, Result, ensure};
use serde::{Deserialize, Serialize};

use crate::resources::{StageId, StageMode, StageSpec};
use crate::scheduler::SchedulerSettings;
use crate::transfer::machine::DEFAULT_PREASPIRATE;
use crate::transfer::{Labware, TipHandling};

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct AppConfig {
    pub log_level: String,
    pub log_dir: String,
    pub log_file: String,
    pub use_json: bool,
    pub rotation: String,
    #[serde(default)]
    pub instrument: InstrumentConfig,
    #[serde(default)]
    pub scheduler: SchedulerConfig,
    #[serde(default)]
    pub simulation: SimulationConfig,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct InstrumentConfig {
    pub channels: u8,
    pub stages: Vec<StageSpec>,
    /// Plate-handling robot device name
    pub device_name: String,
    /// Stage locations are named `"{prefix} {stage id}"`
    pub location_prefix: String,
}

impl Default for InstrumentConfig {
    fn default() -> Self {
        let mode = |id: u8| match id {
            1 => StageMode::Destination,
            _ => StageMode::Source,
        };
        Self {
            channels: 4,
            stages: (1..=4)
                .map(|id| StageSpec {
                    id: StageId(id),
                    mode: mode(id),
                })
                .collect(),
            device_name: "Plate Handler".to_string(),
            location_prefix: "BB PM".to_string(),
        }
    }
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct SchedulerConfig {
    /// Plunger pre-aspirate before entering a source well, mm
    pub preaspirate: f64,
    /// Give up waiting for a stage or channel after this long
    #[serde(default)]
    pub acquire_timeout_ms: Option<u64>,
    /// Applied to plan rows with an empty tip handling column
    #[serde(default)]
    pub default_tip_handling: TipHandling,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            preaspirate: DEFAULT_PREASPIRATE,
            acquire_timeout_ms: None,
            default_tip_handling: TipHandling::None,
        }
    }
}

impl SchedulerConfig {
    pub fn acquire_timeout(&self) -> Option<Duration> {
        self.acquire_timeout_ms.map(Duration::from_millis)
    }
}

/// Simulated instrument used by the host binary
#[derive(Debug, Serialize, Deserialize, Clone, Default)]
pub struct SimulationConfig {
    /// Duration of every simulated move
    #[serde(default)]
    pub move_delay_ms: u64,
    /// Labware known to the simulated catalog. Empty means the standard set.
    #[serde(default)]
    pub labware: Vec<Labware>,
}

impl SimulationConfig {
    pub fn move_delay(&self) -> Duration {
        Duration::from_millis(self.move_delay_ms)
    }
}

impl AppConfig {
    pub fn load(env: &str) -> Result<Self> {
        let config_path = format!("config/{}.yaml", env);
        let content = fs::read_to_string(&config_path)
            .with_context(|| format!("Failed to read config file: {}", config_path))?;
        let config = Self::from_yaml(&content)
            .with_context(|| format!("Failed to parse config file: {}", config_path))?;
        Ok(config)
    }

    pub fn from_yaml(content: &str) -> Result<Self> {
        let config: Self = serde_yaml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<()> {
        let instrument = &self.instrument;
        ensure!(instrument.channels > 0, "instrument.channels must be at least 1");
        for mode in [StageMode::Source, StageMode::Destination] {
            ensure!(
                instrument.stages.iter().any(|s| s.mode == mode),
                "instrument.stages needs at least one {} stage",
                mode
            );
        }
        let mut ids: Vec<_> = instrument.stages.iter().map(|s| s.id).collect();
        ids.sort();
        ids.dedup();
        ensure!(
            ids.len() == instrument.stages.len(),
            "instrument.stages has duplicate ids"
        );
        ensure!(
            self.scheduler.preaspirate >= 0.0,
            "scheduler.preaspirate must not be negative"
        );
        Ok(())
    }

    pub fn scheduler_settings(&self) -> SchedulerSettings {
        SchedulerSettings {
            device_name: self.instrument.device_name.clone(),
            location_prefix: self.instrument.location_prefix.clone(),
            preaspirate: self.scheduler.preaspirate,
        }
    }
}
