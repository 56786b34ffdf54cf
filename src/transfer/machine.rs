//! Transfer State Machine
//!
//! Drives one channel through one aspirate/dispense cycle. Every motion step
//! either completes or lands in its paired error state, where the operator
//! is asked to retry. Only tip-handling failures, collaborator lookups and
//! aborts escape a run.
//!
//! Stage leases taken in `MoveToSourceYR` / `MoveToDestinationYR` are held
//! in the run context and released in the matching `MoveOutOf*` step. If
//! the run unwinds early they are dropped, which unlocks the stage.

use std::sync::Arc;

use tracing::{debug, info, warn};

use super::adapters::{Collaborators, Pipette, StageMotion};
use super::error::{AxisFault, SchedulerError};
use super::state::{TransferState, TransferTrigger};
use super::types::{Labware, Transfer, TransferRunId};
use crate::resources::{AbortSignal, ChannelId, ResourcePool, StageId, StageLease};

/// Default plunger pre-aspirate, mm
pub const DEFAULT_PREASPIRATE: f64 = 1.0;

/// Only option offered while a motion step is in its error state
pub const RETRY_OPTION: &str = "Retry";

/// One transfer bound to one channel and its two stages
#[derive(Debug, Clone)]
pub struct TransferRun {
    pub run_id: TransferRunId,
    pub transfer: Arc<Transfer>,
    pub channel: ChannelId,
    pub source_stage: StageId,
    pub destination_stage: StageId,
}

impl TransferRun {
    pub fn new(
        transfer: Arc<Transfer>,
        channel: ChannelId,
        source_stage: StageId,
        destination_stage: StageId,
    ) -> Self {
        Self {
            run_id: TransferRunId::new(),
            transfer,
            channel,
            source_stage,
            destination_stage,
        }
    }
}

/// Result of a completed run
#[derive(Debug, Clone)]
pub struct TransferOutcome {
    pub run_id: TransferRunId,
    pub channel: ChannelId,
    /// Every state entered, starting with `Idle`
    pub history: Vec<TransferState>,
    /// Operator retries taken
    pub retries: u32,
}

/// Executes [`TransferRun`]s
#[derive(Clone)]
pub struct TransferStateMachine {
    pool: Arc<ResourcePool>,
    collaborators: Collaborators,
    abort: AbortSignal,
    preaspirate: f64,
}

/// Per-run working set, resolved during `Initialization`
struct RunContext {
    pipette: Arc<dyn Pipette>,
    source_motion: Arc<dyn StageMotion>,
    destination_motion: Arc<dyn StageMotion>,
    source_labware: Labware,
    destination_labware: Labware,
    source_x: f64,
    destination_x: f64,
    source_lease: Option<StageLease>,
    destination_lease: Option<StageLease>,
}

/// Outcome of one motion step: outer error escapes the run, inner fault is
/// routed to the error state.
type StepResult = Result<Result<(), AxisFault>, SchedulerError>;

impl TransferStateMachine {
    pub fn new(pool: Arc<ResourcePool>, collaborators: Collaborators, abort: AbortSignal) -> Self {
        Self {
            pool,
            collaborators,
            abort,
            preaspirate: DEFAULT_PREASPIRATE,
        }
    }

    pub fn with_preaspirate(mut self, preaspirate: f64) -> Self {
        self.preaspirate = preaspirate;
        self
    }

    pub fn preaspirate(&self) -> f64 {
        self.preaspirate
    }

    /// Run one transfer from `Idle` back to `Idle`.
    pub async fn execute(&self, run: TransferRun) -> Result<TransferOutcome, SchedulerError> {
        info!(
            run_id = %run.run_id,
            channel = %run.channel,
            transfer = %run.transfer,
            "Transfer started"
        );

        let mut history = vec![TransferState::Idle];
        let mut retries = 0u32;
        let mut last_fault: Option<AxisFault> = None;
        let mut ctx: Option<RunContext> = None;

        let mut state = TransferState::Idle.transition(TransferTrigger::ReceivedTransfer)?;

        while state != TransferState::Idle {
            self.abort.check()?;
            history.push(state);
            debug!(run_id = %run.run_id, channel = %run.channel, state = %state, "Entered state");

            state = match state {
                TransferState::Initialization => {
                    ctx = Some(self.initialize(&run)?);
                    state.transition(TransferTrigger::Initialized)?
                }
                TransferState::RunTipHandling => {
                    self.run_tip_handling(&run).await?;
                    state.transition(TransferTrigger::MoveComplete)?
                }
                s if s.is_motion() => {
                    let ctx = ctx.as_mut().ok_or_else(|| {
                        SchedulerError::InvalidStateTransition(format!("{} before initialization", s))
                    })?;
                    match self.run_step(s, &run, ctx).await? {
                        Ok(()) => s.transition(TransferTrigger::MoveComplete)?,
                        Err(fault) => {
                            warn!(
                                run_id = %run.run_id,
                                channel = %run.channel,
                                state = %s,
                                error = %fault,
                                "Motion fault"
                            );
                            last_fault = Some(fault);
                            s.transition(TransferTrigger::MoveError)?
                        }
                    }
                }
                s if s.is_error() => {
                    let message = match &last_fault {
                        Some(fault) => format!("{} failed on channel {}: {}", s, run.channel, fault),
                        None => format!("{} on channel {}", s, run.channel),
                    };
                    let choice = self.ask_operator(&message).await?;
                    if choice != RETRY_OPTION {
                        return Err(SchedulerError::UnhandledErrorChoice(choice));
                    }
                    retries += 1;
                    info!(run_id = %run.run_id, channel = %run.channel, state = %s, "Operator retry");
                    s.transition(TransferTrigger::Retry)?
                }
                s => {
                    return Err(SchedulerError::InvalidStateTransition(format!(
                        "no handler for {}",
                        s
                    )));
                }
            };
        }

        info!(
            run_id = %run.run_id,
            channel = %run.channel,
            retries,
            "Transfer complete"
        );

        Ok(TransferOutcome {
            run_id: run.run_id,
            channel: run.channel,
            history,
            retries,
        })
    }

    fn initialize(&self, run: &TransferRun) -> Result<RunContext, SchedulerError> {
        let instrument = &self.collaborators.instrument;
        let labware = &self.collaborators.labware;

        Ok(RunContext {
            pipette: instrument.pipette(run.channel)?,
            source_motion: instrument.stage(run.source_stage)?,
            destination_motion: instrument.stage(run.destination_stage)?,
            source_labware: labware.labware(&run.transfer.source.labware)?,
            destination_labware: labware.labware(&run.transfer.destination.labware)?,
            source_x: 0.0,
            destination_x: 0.0,
            source_lease: None,
            destination_lease: None,
        })
    }

    async fn run_step(
        &self,
        state: TransferState,
        run: &TransferRun,
        ctx: &mut RunContext,
    ) -> StepResult {
        let teachpoints = &self.collaborators.teachpoints;

        match state {
            TransferState::MoveToSafeZ => {
                self.abort
                    .guard(ctx.pipette.z().move_absolute(0.0, true))
                    .await
            }

            TransferState::MoveToSourceYR => {
                if ctx.source_lease.is_none() {
                    let lease = self
                        .pool
                        .request_stage_for_transfer(run.channel, run.source_stage, false, &self.abort)
                        .await?;
                    ctx.source_lease = Some(lease);
                }
                let tp = teachpoints.well_position(
                    run.channel,
                    run.source_stage,
                    &run.transfer.source_well,
                    ctx.source_labware.well_count,
                )?;
                ctx.source_x = tp.x;
                self.abort
                    .guard(ctx.source_motion.move_yr(tp.y, tp.r, true))
                    .await
            }

            TransferState::MoveXZIntoSource => {
                if let Err(fault) = self
                    .abort
                    .guard(ctx.pipette.w().move_absolute(self.preaspirate, true))
                    .await?
                {
                    return Ok(Err(fault));
                }
                let stage_tp = teachpoints.stage_teachpoint(run.channel, run.source_stage)?;
                let z = stage_tp.upper_left.z - ctx.source_labware.well_bottom_offset();
                self.abort
                    .guard(blended_move(ctx.pipette.as_ref(), ctx.source_x, z))
                    .await
            }

            TransferState::Aspirate => {
                self.abort
                    .guard(ctx.pipette.aspirate(run.transfer.volume + self.preaspirate))
                    .await
            }

            TransferState::MoveOutOfSource => {
                if let Err(fault) = self
                    .abort
                    .guard(ctx.pipette.z().move_absolute(0.0, true))
                    .await?
                {
                    return Ok(Err(fault));
                }
                if let Some(lease) = ctx.source_lease.take() {
                    self.pool.unlock_stage(lease);
                }
                Ok(Ok(()))
            }

            TransferState::MoveToDestinationYR => {
                if ctx.destination_lease.is_none() {
                    let lease = self
                        .pool
                        .request_stage_for_transfer(
                            run.channel,
                            run.destination_stage,
                            true,
                            &self.abort,
                        )
                        .await?;
                    ctx.destination_lease = Some(lease);
                }
                let tp = teachpoints.well_position(
                    run.channel,
                    run.destination_stage,
                    run.transfer.primary_destination_well(),
                    ctx.destination_labware.well_count,
                )?;
                ctx.destination_x = tp.x;
                self.abort
                    .guard(ctx.destination_motion.move_yr(tp.y, tp.r, true))
                    .await
            }

            TransferState::MoveXZIntoDestination => {
                let stage_tp = teachpoints.stage_teachpoint(run.channel, run.destination_stage)?;
                let z = stage_tp.upper_left.z - ctx.destination_labware.well_bottom_offset();
                self.abort
                    .guard(blended_move(ctx.pipette.as_ref(), ctx.destination_x, z))
                    .await
            }

            TransferState::Dispense => self.abort.guard(ctx.pipette.dispense(0.0)).await,

            TransferState::MoveOutOfDestination => {
                if let Err(fault) = self
                    .abort
                    .guard(ctx.pipette.z().move_absolute(0.0, true))
                    .await?
                {
                    return Ok(Err(fault));
                }
                if let Some(lease) = ctx.destination_lease.take() {
                    self.pool.unlock_stage(lease);
                }
                Ok(Ok(()))
            }

            other => Err(SchedulerError::InvalidStateTransition(format!(
                "{} is not a motion step",
                other
            ))),
        }
    }

    async fn run_tip_handling(&self, run: &TransferRun) -> Result<(), SchedulerError> {
        let handling = run.transfer.tip_handling;
        if handling.is_noop() {
            return Ok(());
        }
        debug!(run_id = %run.run_id, channel = %run.channel, handling = %handling, "Tip handling");
        self.abort
            .guard(self.collaborators.tip_handler.run(run.channel, handling))
            .await?
    }

    /// Block on the operator, unless the run is aborted first.
    async fn ask_operator(&self, message: &str) -> Result<String, SchedulerError> {
        let reporter = &self.collaborators.error_reporter;
        let options = [RETRY_OPTION];
        tokio::select! {
            choice = reporter.report_error(message, &options) => Ok(choice),
            _ = self.abort.aborted() => Err(SchedulerError::Aborted),
        }
    }
}

async fn blended_move(pipette: &dyn Pipette, x: f64, z: f64) -> Result<(), AxisFault> {
    let xz = pipette.xz();
    xz.move_absolute_blended(x, z).await?;
    xz.wait_for_move_complete().await
}
