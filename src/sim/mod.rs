//! Simulated Instrument
//!
//! In-memory implementations of every adapter contract. Moves take a
//! configurable delay, every call is recorded, and faults can be injected
//! per axis, per plate and per tip-handling run.
//!
//! Used by the host binary for dry runs and by the tests.

use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use rustc_hash::{FxHashMap, FxHashSet};
use tracing::{debug, trace};

use crate::resources::{ChannelId, ResourcePool, StageId, StageMode, StageSpec};
use crate::transfer::adapters::{
    Axis, BlendedAxes, Collaborators, ErrorReporter, Instrument, LabwareCatalog, Pipette,
    PlateHandler, StageMotion, TeachpointLookup, TipHandler,
};
use crate::transfer::{
    AxisFault, Labware, Plate, SchedulerError, StageTeachpoint, Teachpoint, TipHandling,
};

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|e| e.into_inner())
}

async fn settle(delay: Duration) {
    if delay.is_zero() {
        tokio::task::yield_now().await;
    } else {
        tokio::time::sleep(delay).await;
    }
}

// ============================================================
// AXES
// ============================================================

#[derive(Debug)]
pub struct SimAxis {
    name: String,
    position: Mutex<f64>,
    delay: Duration,
    pending_faults: AtomicU32,
    stalled: AtomicBool,
    moves: AtomicU64,
}

impl SimAxis {
    pub fn new(name: impl Into<String>, delay: Duration) -> Self {
        Self {
            name: name.into(),
            position: Mutex::new(0.0),
            delay,
            pending_faults: AtomicU32::new(0),
            stalled: AtomicBool::new(false),
            moves: AtomicU64::new(0),
        }
    }

    /// Fail the next `n` moves on this axis
    pub fn fail_next(&self, n: u32) {
        self.pending_faults.fetch_add(n, Ordering::SeqCst);
    }

    /// Moves started while stalled never complete
    pub fn set_stalled(&self, stalled: bool) {
        self.stalled.store(stalled, Ordering::SeqCst);
    }

    pub fn move_count(&self) -> u64 {
        self.moves.load(Ordering::SeqCst)
    }

    async fn step(&self) -> Result<(), AxisFault> {
        let fault = self
            .pending_faults
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if fault {
            return Err(AxisFault::new(&self.name, "simulated following error"));
        }
        if self.stalled.load(Ordering::SeqCst) {
            std::future::pending::<()>().await;
        }
        settle(self.delay).await;
        self.moves.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn set_position(&self, position: f64) {
        *lock(&self.position) = position;
    }
}

#[async_trait]
impl Axis for SimAxis {
    fn name(&self) -> &str {
        &self.name
    }

    async fn move_absolute(&self, position: f64, _wait: bool) -> Result<(), AxisFault> {
        self.step().await?;
        self.set_position(position);
        trace!(axis = %self.name, position, "Axis moved");
        Ok(())
    }

    async fn move_relative(&self, delta: f64) -> Result<(), AxisFault> {
        self.step().await?;
        *lock(&self.position) += delta;
        Ok(())
    }

    async fn home(&self) -> Result<(), AxisFault> {
        self.step().await?;
        self.set_position(0.0);
        Ok(())
    }

    fn position_mm(&self) -> f64 {
        *lock(&self.position)
    }
}

#[derive(Debug)]
pub struct SimPipette {
    channel: ChannelId,
    x: SimAxis,
    z: SimAxis,
    w: SimAxis,
    aspirated: Mutex<Vec<f64>>,
    dispenses: AtomicU32,
    last_blended: Mutex<Option<(f64, f64)>>,
}

impl SimPipette {
    pub fn new(channel: ChannelId, delay: Duration) -> Self {
        Self {
            channel,
            x: SimAxis::new(format!("X{}", channel), delay),
            z: SimAxis::new(format!("Z{}", channel), delay),
            w: SimAxis::new(format!("W{}", channel), delay),
            aspirated: Mutex::new(Vec::new()),
            dispenses: AtomicU32::new(0),
            last_blended: Mutex::new(None),
        }
    }

    pub fn channel(&self) -> ChannelId {
        self.channel
    }

    pub fn x_axis(&self) -> &SimAxis {
        &self.x
    }

    pub fn z_axis(&self) -> &SimAxis {
        &self.z
    }

    pub fn w_axis(&self) -> &SimAxis {
        &self.w
    }

    /// Volumes passed to `aspirate`, in call order
    pub fn aspirated(&self) -> Vec<f64> {
        lock(&self.aspirated).clone()
    }

    pub fn dispense_count(&self) -> u32 {
        self.dispenses.load(Ordering::SeqCst)
    }

    pub fn last_blended(&self) -> Option<(f64, f64)> {
        *lock(&self.last_blended)
    }
}

#[async_trait]
impl BlendedAxes for SimPipette {
    async fn move_absolute_blended(&self, x: f64, z: f64) -> Result<(), AxisFault> {
        self.x.move_absolute(x, false).await?;
        self.z.move_absolute(z, false).await?;
        *lock(&self.last_blended) = Some((x, z));
        Ok(())
    }

    async fn wait_for_move_complete(&self) -> Result<(), AxisFault> {
        Ok(())
    }
}

#[async_trait]
impl Pipette for SimPipette {
    fn x(&self) -> &dyn Axis {
        &self.x
    }

    fn z(&self) -> &dyn Axis {
        &self.z
    }

    fn w(&self) -> &dyn Axis {
        &self.w
    }

    fn xz(&self) -> &dyn BlendedAxes {
        self
    }

    async fn aspirate(&self, volume: f64) -> Result<(), AxisFault> {
        self.w.move_relative(volume).await?;
        lock(&self.aspirated).push(volume);
        Ok(())
    }

    async fn dispense(&self, _target: f64) -> Result<(), AxisFault> {
        self.w.move_absolute(0.0, true).await?;
        self.dispenses.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

#[derive(Debug)]
pub struct SimStage {
    id: StageId,
    y: SimAxis,
    r: SimAxis,
    last_yr: Mutex<Option<(f64, f64)>>,
    robot_moves: AtomicU32,
}

impl SimStage {
    pub fn new(id: StageId, delay: Duration) -> Self {
        Self {
            id,
            y: SimAxis::new(format!("Y{}", id), delay),
            r: SimAxis::new(format!("R{}", id), delay),
            last_yr: Mutex::new(None),
            robot_moves: AtomicU32::new(0),
        }
    }

    pub fn id(&self) -> StageId {
        self.id
    }

    pub fn y_axis(&self) -> &SimAxis {
        &self.y
    }

    /// Last well position commanded through `move_yr`
    pub fn last_yr(&self) -> Option<(f64, f64)> {
        *lock(&self.last_yr)
    }

    pub fn robot_moves(&self) -> u32 {
        self.robot_moves.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl StageMotion for SimStage {
    async fn move_yr(&self, y: f64, r: f64, wait: bool) -> Result<(), AxisFault> {
        self.y.move_absolute(y, wait).await?;
        self.r.move_absolute(r, wait).await?;
        *lock(&self.last_yr) = Some((y, r));
        Ok(())
    }

    async fn move_to_robot_teachpoint(&self) -> Result<(), AxisFault> {
        self.y.move_absolute(0.0, true).await?;
        self.r.move_absolute(0.0, true).await?;
        self.robot_moves.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

#[derive(Debug, Default)]
pub struct SimInstrument {
    pipettes: FxHashMap<ChannelId, Arc<SimPipette>>,
    stages: FxHashMap<StageId, Arc<SimStage>>,
}

impl SimInstrument {
    pub fn new(channels: &[ChannelId], stages: &[StageId], delay: Duration) -> Self {
        Self {
            pipettes: channels
                .iter()
                .map(|&c| (c, Arc::new(SimPipette::new(c, delay))))
                .collect(),
            stages: stages
                .iter()
                .map(|&s| (s, Arc::new(SimStage::new(s, delay))))
                .collect(),
        }
    }

    pub fn sim_pipette(&self, channel: ChannelId) -> Option<Arc<SimPipette>> {
        self.pipettes.get(&channel).cloned()
    }

    pub fn sim_stage(&self, stage: StageId) -> Option<Arc<SimStage>> {
        self.stages.get(&stage).cloned()
    }
}

impl Instrument for SimInstrument {
    fn pipette(&self, channel: ChannelId) -> Result<Arc<dyn Pipette>, SchedulerError> {
        self.pipettes
            .get(&channel)
            .map(|p| p.clone() as Arc<dyn Pipette>)
            .ok_or_else(|| SchedulerError::UnknownResource(format!("channel {}", channel)))
    }

    fn stage(&self, stage: StageId) -> Result<Arc<dyn StageMotion>, SchedulerError> {
        self.stages
            .get(&stage)
            .map(|s| s.clone() as Arc<dyn StageMotion>)
            .ok_or_else(|| SchedulerError::UnknownResource(format!("stage {}", stage)))
    }
}

// ============================================================
// PLATE HANDLING
// ============================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PlateEventKind {
    Place,
    Pick,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlateEvent {
    pub kind: PlateEventKind,
    pub device: String,
    pub location: String,
    pub barcode: String,
}

#[derive(Debug, Default)]
pub struct SimPlateHandler {
    events: Mutex<Vec<PlateEvent>>,
    fail_place: Mutex<FxHashSet<String>>,
    delay: Duration,
}

impl SimPlateHandler {
    pub fn new(delay: Duration) -> Self {
        Self {
            delay,
            ..Default::default()
        }
    }

    /// Make every `place` of this barcode fail
    pub fn fail_place_of(&self, barcode: &str) {
        lock(&self.fail_place).insert(barcode.to_string());
    }

    pub fn events(&self) -> Vec<PlateEvent> {
        lock(&self.events).clone()
    }

    pub fn count(&self, kind: PlateEventKind, barcode: &str) -> usize {
        lock(&self.events)
            .iter()
            .filter(|e| e.kind == kind && e.barcode == barcode)
            .count()
    }

    fn record(&self, kind: PlateEventKind, device: &str, location: &str, plate: &Plate) {
        debug!(?kind, device, location, plate = %plate.barcode, "Plate handled");
        lock(&self.events).push(PlateEvent {
            kind,
            device: device.to_string(),
            location: location.to_string(),
            barcode: plate.barcode.clone(),
        });
    }
}

#[async_trait]
impl PlateHandler for SimPlateHandler {
    async fn place(
        &self,
        device: &str,
        location: &str,
        plate: &Plate,
    ) -> Result<(), SchedulerError> {
        settle(self.delay).await;
        if lock(&self.fail_place).contains(&plate.barcode) {
            return Err(SchedulerError::PlateHandling {
                barcode: plate.barcode.clone(),
                message: format!("{} could not reach {}", device, location),
            });
        }
        self.record(PlateEventKind::Place, device, location, plate);
        Ok(())
    }

    async fn pick(&self, device: &str, location: &str, plate: &Plate) -> Result<(), SchedulerError> {
        settle(self.delay).await;
        self.record(PlateEventKind::Pick, device, location, plate);
        Ok(())
    }
}

// ============================================================
// TEACHPOINTS & LABWARE
// ============================================================

/// Regular grid of wells on regularly spaced stages
#[derive(Debug, Clone)]
pub struct SimTeachpoints {
    pub stage_spacing: f64,
    pub channel_spacing: f64,
    pub stage_z: f64,
}

impl Default for SimTeachpoints {
    fn default() -> Self {
        Self {
            stage_spacing: 120.0,
            channel_spacing: 9.0,
            stage_z: 40.0,
        }
    }
}

/// (rows, columns) of standard SBS plates
fn plate_layout(well_count: u16) -> Option<(u32, u32)> {
    match well_count {
        6 => Some((2, 3)),
        24 => Some((4, 6)),
        96 => Some((8, 12)),
        384 => Some((16, 24)),
        1536 => Some((32, 48)),
        _ => None,
    }
}

/// "B3" -> (row 2, column 3), 1-based. Multi-letter rows ("AF1") count on
/// past "Z".
pub fn parse_well(well: &str) -> Option<(u32, u32)> {
    let split = well.find(|c: char| c.is_ascii_digit())?;
    let (letters, digits) = well.split_at(split);
    if letters.is_empty() || !letters.chars().all(|c| c.is_ascii_uppercase()) {
        return None;
    }
    let row = letters.chars().try_fold(0u32, |acc, c| {
        acc.checked_mul(26)?.checked_add(c as u32 - 'A' as u32 + 1)
    })?;
    let column: u32 = digits.parse().ok()?;
    (column > 0).then_some((row, column))
}

impl SimTeachpoints {
    fn origin(&self, channel: ChannelId, stage: StageId) -> Teachpoint {
        Teachpoint {
            x: channel.0 as f64 * self.channel_spacing,
            y: stage.0 as f64 * self.stage_spacing,
            z: self.stage_z,
            r: 0.0,
        }
    }
}

impl TeachpointLookup for SimTeachpoints {
    fn stage_teachpoint(
        &self,
        channel: ChannelId,
        stage: StageId,
    ) -> Result<StageTeachpoint, SchedulerError> {
        let upper_left = self.origin(channel, stage);
        let lower_right = Teachpoint {
            x: upper_left.x + 99.0,
            y: upper_left.y + 63.0,
            ..upper_left
        };
        Ok(StageTeachpoint {
            upper_left,
            lower_right,
        })
    }

    fn well_position(
        &self,
        channel: ChannelId,
        stage: StageId,
        well: &str,
        well_count: u16,
    ) -> Result<Teachpoint, SchedulerError> {
        let (row, column) = parse_well(well)
            .ok_or_else(|| SchedulerError::Teachpoint(format!("malformed well name {:?}", well)))?;

        let (pitch, rows, columns) = match plate_layout(well_count) {
            Some((rows, columns)) => (108.0 / columns as f64, rows, columns),
            None => (9.0, u32::MAX, u32::MAX),
        };
        if row > rows || column > columns {
            return Err(SchedulerError::Teachpoint(format!(
                "well {} outside a {}-well plate",
                well, well_count
            )));
        }

        let origin = self.origin(channel, stage);
        Ok(Teachpoint {
            x: origin.x + (column - 1) as f64 * pitch,
            y: origin.y + (row - 1) as f64 * pitch,
            z: origin.z,
            r: 0.0,
        })
    }
}

#[derive(Debug, Clone, Default)]
pub struct SimLabwareCatalog {
    entries: FxHashMap<String, Labware>,
}

impl SimLabwareCatalog {
    pub fn new(labware: impl IntoIterator<Item = Labware>) -> Self {
        Self {
            entries: labware.into_iter().map(|l| (l.name.clone(), l)).collect(),
        }
    }

    /// "96 well" and "384 well" plates
    pub fn standard() -> Self {
        Self::new([
            Labware {
                name: "96 well".to_string(),
                thickness: 14.4,
                well_depth: 10.9,
                well_count: 96,
            },
            Labware {
                name: "384 well".to_string(),
                thickness: 14.4,
                well_depth: 11.5,
                well_count: 384,
            },
        ])
    }

    pub fn insert(&mut self, labware: Labware) {
        self.entries.insert(labware.name.clone(), labware);
    }
}

impl LabwareCatalog for SimLabwareCatalog {
    fn labware(&self, name: &str) -> Result<Labware, SchedulerError> {
        self.entries
            .get(name)
            .cloned()
            .ok_or_else(|| SchedulerError::UnknownLabware(name.to_string()))
    }
}

// ============================================================
// OPERATOR & TIP HANDLING
// ============================================================

/// Unattended operator: answers every prompt with a fixed choice
#[derive(Debug)]
pub struct AutoRetryReporter {
    choice: Mutex<String>,
    blocking: AtomicBool,
    messages: Mutex<Vec<String>>,
}

impl Default for AutoRetryReporter {
    fn default() -> Self {
        Self {
            choice: Mutex::new(crate::transfer::machine::RETRY_OPTION.to_string()),
            blocking: AtomicBool::new(false),
            messages: Mutex::new(Vec::new()),
        }
    }
}

impl AutoRetryReporter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_choice(&self, choice: &str) {
        *lock(&self.choice) = choice.to_string();
    }

    /// Never answer, like an operator who walked away
    pub fn set_blocking(&self, blocking: bool) {
        self.blocking.store(blocking, Ordering::SeqCst);
    }

    pub fn report_count(&self) -> usize {
        lock(&self.messages).len()
    }

    pub fn messages(&self) -> Vec<String> {
        lock(&self.messages).clone()
    }
}

#[async_trait]
impl ErrorReporter for AutoRetryReporter {
    async fn report_error(&self, message: &str, options: &[&str]) -> String {
        debug!(prompt = message, ?options, "Operator prompt");
        lock(&self.messages).push(message.to_string());
        if self.blocking.load(Ordering::SeqCst) {
            std::future::pending::<()>().await;
        }
        lock(&self.choice).clone()
    }
}

#[derive(Debug, Default)]
pub struct SimTipHandler {
    runs: Mutex<Vec<(ChannelId, TipHandling)>>,
    pending_failures: AtomicU32,
    stalled: AtomicBool,
    delay: Duration,
}

impl SimTipHandler {
    pub fn new(delay: Duration) -> Self {
        Self {
            delay,
            ..Default::default()
        }
    }

    /// Fail the next `n` runs
    pub fn fail_next(&self, n: u32) {
        self.pending_failures.fetch_add(n, Ordering::SeqCst);
    }

    /// Runs started while stalled never complete
    pub fn set_stalled(&self, stalled: bool) {
        self.stalled.store(stalled, Ordering::SeqCst);
    }

    pub fn runs(&self) -> Vec<(ChannelId, TipHandling)> {
        lock(&self.runs).clone()
    }
}

#[async_trait]
impl TipHandler for SimTipHandler {
    async fn run(&self, channel: ChannelId, handling: TipHandling) -> Result<(), SchedulerError> {
        if self.stalled.load(Ordering::SeqCst) {
            std::future::pending::<()>().await;
        }
        settle(self.delay).await;
        let fail = self
            .pending_failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if fail {
            return Err(SchedulerError::TipHandling {
                channel: channel.0,
                message: format!("{} did not complete", handling),
            });
        }
        lock(&self.runs).push((channel, handling));
        Ok(())
    }
}

// ============================================================
// RIG
// ============================================================

/// A complete simulated instrument plus its resource pool
#[derive(Debug, Clone)]
pub struct SimRig {
    pub pool: Arc<ResourcePool>,
    pub instrument: Arc<SimInstrument>,
    pub plate_handler: Arc<SimPlateHandler>,
    pub teachpoints: Arc<SimTeachpoints>,
    pub labware: Arc<SimLabwareCatalog>,
    pub reporter: Arc<AutoRetryReporter>,
    pub tip_handler: Arc<SimTipHandler>,
}

/// One destination stage, three source stages and a tip stage
pub fn standard_stages() -> Vec<StageSpec> {
    let mode = |id: u8| match id {
        1 => StageMode::Destination,
        5 => StageMode::Tips,
        _ => StageMode::Source,
    };
    (1..=5)
        .map(|id| StageSpec {
            id: StageId(id),
            mode: mode(id),
        })
        .collect()
}

impl SimRig {
    pub fn new(
        stages: &[StageSpec],
        channels: u8,
        move_delay: Duration,
        acquire_timeout: Option<Duration>,
        labware: SimLabwareCatalog,
    ) -> Self {
        let pool = ResourcePool::new(stages, channels, acquire_timeout);
        let channel_ids = pool.channel_ids();
        let stage_ids = pool.stage_ids();
        Self {
            pool,
            instrument: Arc::new(SimInstrument::new(&channel_ids, &stage_ids, move_delay)),
            plate_handler: Arc::new(SimPlateHandler::new(move_delay)),
            teachpoints: Arc::new(SimTeachpoints::default()),
            labware: Arc::new(labware),
            reporter: Arc::new(AutoRetryReporter::new()),
            tip_handler: Arc::new(SimTipHandler::new(move_delay)),
        }
    }

    /// Standard stages, standard labware, no move delay
    pub fn standard(channels: u8) -> Self {
        Self::new(
            &standard_stages(),
            channels,
            Duration::ZERO,
            None,
            SimLabwareCatalog::standard(),
        )
    }

    pub fn collaborators(&self) -> Collaborators {
        Collaborators {
            instrument: self.instrument.clone(),
            plate_handler: self.plate_handler.clone(),
            teachpoints: self.teachpoints.clone(),
            labware: self.labware.clone(),
            error_reporter: self.reporter.clone(),
            tip_handler: self.tip_handler.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_well() {
        assert_eq!(parse_well("A1"), Some((1, 1)));
        assert_eq!(parse_well("H12"), Some((8, 12)));
        assert_eq!(parse_well("AF48"), Some((32, 48)));
        assert_eq!(parse_well("a1"), None);
        assert_eq!(parse_well("A0"), None);
        assert_eq!(parse_well("12"), None);
        assert_eq!(parse_well("B"), None);
        assert_eq!(parse_well("ZZZZZZZ1"), None);
    }

    #[test]
    fn test_overlong_row_is_a_teachpoint_error() {
        let err = SimTeachpoints::default()
            .well_position(ChannelId(1), StageId(2), "ZZZZZZZ1", 96)
            .unwrap_err();
        assert_eq!(err.code(), "TEACHPOINT");
    }

    #[test]
    fn test_well_position_bounds() {
        let tp = SimTeachpoints::default();
        let a1 = tp.well_position(ChannelId(1), StageId(2), "A1", 96).unwrap();
        let b2 = tp.well_position(ChannelId(1), StageId(2), "B2", 96).unwrap();
        assert!((b2.x - a1.x - 9.0).abs() < 1e-9);
        assert!((b2.y - a1.y - 9.0).abs() < 1e-9);

        let err = tp
            .well_position(ChannelId(1), StageId(2), "I1", 96)
            .unwrap_err();
        assert_eq!(err.code(), "TEACHPOINT");
        assert!(tp.well_position(ChannelId(1), StageId(2), "P24", 384).is_ok());
    }

    #[tokio::test]
    async fn test_axis_fault_injection() {
        let axis = SimAxis::new("Z1", Duration::ZERO);
        axis.fail_next(1);
        assert!(axis.move_absolute(5.0, true).await.is_err());
        assert_eq!(axis.position_mm(), 0.0);
        axis.move_absolute(5.0, true).await.unwrap();
        axis.move_relative(-2.0).await.unwrap();
        assert_eq!(axis.position_mm(), 3.0);
        axis.home().await.unwrap();
        assert_eq!(axis.position_mm(), 0.0);
        assert_eq!(axis.move_count(), 3);
    }

    #[test]
    fn test_standard_labware() {
        let catalog = SimLabwareCatalog::standard();
        assert_eq!(catalog.labware("96 well").unwrap().well_count, 96);
        assert_eq!(
            catalog.labware("1536 well").unwrap_err().code(),
            "UNKNOWN_LABWARE"
        );
    }
}
