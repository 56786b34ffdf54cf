//! Transfer Core Types
//!
//! Plan records, labware geometry and teachpoints consumed by the
//! per-transfer state machine.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use super::error::SchedulerError;

/// Run ID type - ULID-based unique identifier
///
/// Assigned when a transfer is dispatched to a channel. Only used to
/// correlate log lines of one aspirate/dispense cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TransferRunId(ulid::Ulid);

impl TransferRunId {
    pub fn new() -> Self {
        Self(ulid::Ulid::new())
    }

    pub fn inner(&self) -> ulid::Ulid {
        self.0
    }
}

impl Default for TransferRunId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for TransferRunId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for TransferRunId {
    type Err = ulid::DecodeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(Self(ulid::Ulid::from_string(s)?))
    }
}

/// Logical role of a plate within a transfer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PlateRole {
    Source,
    Destination,
}

impl PlateRole {
    pub fn as_str(&self) -> &'static str {
        match self {
            PlateRole::Source => "SOURCE",
            PlateRole::Destination => "DESTINATION",
        }
    }
}

impl fmt::Display for PlateRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// A plate as referenced by the plan.
///
/// Identity is the barcode. The stage currently holding the plate is
/// tracked by the resource pool, not here.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Plate {
    pub barcode: String,
    pub labware: String,
    pub role: PlateRole,
}

impl Plate {
    pub fn source(barcode: impl Into<String>, labware: impl Into<String>) -> Self {
        Self {
            barcode: barcode.into(),
            labware: labware.into(),
            role: PlateRole::Source,
        }
    }

    pub fn destination(barcode: impl Into<String>, labware: impl Into<String>) -> Self {
        Self {
            barcode: barcode.into(),
            labware: labware.into(),
            role: PlateRole::Destination,
        }
    }
}

/// Post-transfer tip protocol, selected by the transfer's liquid-handling hint
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TipHandling {
    /// Any hint other than the two recognised ones
    #[default]
    None,
    Wash,
    Change,
}

impl TipHandling {
    pub const WASH_HINT: &'static str = "Wash tip";
    pub const CHANGE_HINT: &'static str = "Change tip";

    /// Map an operator-facing hint to a protocol. Unknown hints are a no-op.
    pub fn from_hint(hint: &str) -> Self {
        match hint.trim() {
            Self::WASH_HINT => TipHandling::Wash,
            Self::CHANGE_HINT => TipHandling::Change,
            _ => TipHandling::None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            TipHandling::None => "",
            TipHandling::Wash => Self::WASH_HINT,
            TipHandling::Change => Self::CHANGE_HINT,
        }
    }

    #[inline]
    pub fn is_noop(&self) -> bool {
        matches!(self, TipHandling::None)
    }
}

impl fmt::Display for TipHandling {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TipHandling::None => write!(f, "none"),
            other => write!(f, "{}", other.as_str()),
        }
    }
}

/// One well-to-well(s) liquid transfer. Immutable once the plan is built.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Transfer {
    pub source: Plate,
    pub source_well: String,
    pub destination: Plate,
    pub destination_wells: Vec<String>,
    /// Volume in axis units of the W (plunger) axis
    pub volume: f64,
    #[serde(default)]
    pub tip_handling: TipHandling,
}

impl Transfer {
    pub fn new(
        source: Plate,
        source_well: impl Into<String>,
        destination: Plate,
        destination_wells: Vec<String>,
        volume: f64,
        tip_handling: TipHandling,
    ) -> Result<Self, SchedulerError> {
        let transfer = Self {
            source,
            source_well: source_well.into(),
            destination,
            destination_wells,
            volume,
            tip_handling,
        };
        transfer.validate()?;
        Ok(transfer)
    }

    /// Dispensing always targets the first destination well.
    pub fn primary_destination_well(&self) -> &str {
        self.destination_wells
            .first()
            .map(String::as_str)
            .unwrap_or_default()
    }

    pub fn validate(&self) -> Result<(), SchedulerError> {
        if self.source.barcode.is_empty() || self.destination.barcode.is_empty() {
            return Err(SchedulerError::InvalidPlan("plate barcode is empty".into()));
        }
        if self.source.barcode == self.destination.barcode {
            return Err(SchedulerError::InvalidPlan(format!(
                "plate {} cannot be both source and destination of one transfer",
                self.source.barcode
            )));
        }
        if self.source_well.is_empty() {
            return Err(SchedulerError::InvalidPlan(format!(
                "transfer from {} has no source well",
                self.source.barcode
            )));
        }
        if self.destination_wells.is_empty() || self.destination_wells.iter().any(String::is_empty)
        {
            return Err(SchedulerError::InvalidPlan(format!(
                "transfer {} {} -> {} has no destination well",
                self.source.barcode, self.source_well, self.destination.barcode
            )));
        }
        if !(self.volume.is_finite() && self.volume > 0.0) {
            return Err(SchedulerError::InvalidPlan(format!(
                "transfer {} {} has non-positive volume {}",
                self.source.barcode, self.source_well, self.volume
            )));
        }
        Ok(())
    }
}

impl fmt::Display for Transfer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}:{} -> {}:{} ({})",
            self.source.barcode,
            self.source_well,
            self.destination.barcode,
            self.destination_wells.join("+"),
            self.volume
        )
    }
}

/// Labware geometry needed to reach the bottom of a well
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Labware {
    pub name: String,
    pub thickness: f64,
    pub well_depth: f64,
    pub well_count: u16,
}

impl Labware {
    /// Distance from the plate's top surface teachpoint down to the well
    /// bottom, measured as `thickness - well_depth`.
    #[inline]
    pub fn well_bottom_offset(&self) -> f64 {
        self.thickness - self.well_depth
    }
}

/// Calibrated coordinate (mm / degrees)
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct Teachpoint {
    pub x: f64,
    pub y: f64,
    pub z: f64,
    pub r: f64,
}

/// Corner teachpoints of a stage for one channel
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct StageTeachpoint {
    pub upper_left: Teachpoint,
    pub lower_right: Teachpoint,
}
