//! End-to-end scheduler scenarios against the simulated instrument.

use std::time::Duration;

use hitpick_engine::resources::{AbortSignal, StageId, StageMode, StageSpec};
use hitpick_engine::scheduler::{
    DestinationPlateScheduler, SchedulerContext, SchedulerSettings, TransferPlanManager, WellUsage,
};
use hitpick_engine::sim::{PlateEvent, PlateEventKind, SimLabwareCatalog, SimRig, standard_stages};
use hitpick_engine::transfer::state::SUCCESS_PATH;
use hitpick_engine::transfer::{Plate, TipHandling, Transfer};

fn transfer(src: &str, src_well: &str, dst: &str, dst_well: &str) -> Transfer {
    Transfer::new(
        Plate::source(src, "96 well"),
        src_well,
        Plate::destination(dst, "384 well"),
        vec![dst_well.to_string()],
        5.0,
        TipHandling::Wash,
    )
    .unwrap()
}

fn rig(stages: &[StageSpec], channels: u8, delay_ms: u64, timeout: Option<Duration>) -> SimRig {
    SimRig::new(
        stages,
        channels,
        Duration::from_millis(delay_ms),
        timeout,
        SimLabwareCatalog::standard(),
    )
}

fn scheduler(rig: &SimRig, abort: AbortSignal) -> DestinationPlateScheduler {
    DestinationPlateScheduler::new(SchedulerContext::new(
        rig.pool.clone(),
        rig.collaborators(),
        SchedulerSettings::default(),
        abort,
    ))
}

fn position(events: &[PlateEvent], kind: PlateEventKind, barcode: &str) -> usize {
    events
        .iter()
        .position(|e| e.kind == kind && e.barcode == barcode)
        .unwrap_or_else(|| panic!("no {:?} of {}", kind, barcode))
}

fn assert_all_unlocked(rig: &SimRig) {
    for stage in rig.pool.stage_ids() {
        assert!(
            !rig.pool.stage_snapshot(stage).unwrap().is_locked(),
            "stage {} left locked",
            stage
        );
    }
    for channel in rig.pool.channel_ids() {
        assert_eq!(
            rig.pool.channel_locked(channel),
            Some(false),
            "channel {} left locked",
            channel
        );
    }
}

/// 3 transfers (P1 x2, P2 x1 -> D1) on 2 channels
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_two_sources_one_destination() {
    let rig = rig(&standard_stages(), 2, 2, None);
    let sched = scheduler(&rig, AbortSignal::new());
    let mut plan = TransferPlanManager::new(vec![
        transfer("P1", "A1", "D1", "A1"),
        transfer("P1", "A2", "D1", "A2"),
        transfer("P2", "B1", "D1", "A3"),
    ])
    .unwrap();

    let summary = sched.run(&mut plan).await.unwrap();
    assert!(plan.is_empty());

    // One destination iteration
    assert_eq!(summary.destinations.len(), 1);
    let d1 = &summary.destinations[0];
    assert_eq!(d1.destination, "D1");
    assert_eq!(d1.transfers, 3);
    assert_eq!(d1.used_wells, 3);

    // Two workers, each starting with half the channels
    assert_eq!(d1.workers.len(), 2);
    for worker in &d1.workers {
        assert_eq!(worker.initial_budget, 1);
        for outcome in &worker.outcomes {
            assert_eq!(outcome.history, SUCCESS_PATH.to_vec());
        }
    }
    assert_eq!(d1.workers[0].source.barcode, "P1");
    assert_eq!(d1.workers[0].outcomes.len(), 2);
    assert_eq!(d1.workers[1].outcomes.len(), 1);

    // Both source plates were on deck together; D1 left after both
    let events = rig.plate_handler.events();
    assert_eq!(rig.plate_handler.count(PlateEventKind::Place, "D1"), 1);
    assert_eq!(rig.plate_handler.count(PlateEventKind::Pick, "D1"), 1);
    let p1_place = position(&events, PlateEventKind::Place, "P1");
    let p2_place = position(&events, PlateEventKind::Place, "P2");
    let p1_pick = position(&events, PlateEventKind::Pick, "P1");
    let p2_pick = position(&events, PlateEventKind::Pick, "P2");
    let d1_pick = position(&events, PlateEventKind::Pick, "D1");
    assert!(p1_place < p2_pick && p2_place < p1_pick);
    assert!(d1_pick > p1_pick && d1_pick > p2_pick);

    // Locations follow the stage naming
    let d1_place = &events[position(&events, PlateEventKind::Place, "D1")];
    assert_eq!(d1_place.location, format!("BB PM {}", d1.stage));

    assert_eq!(summary.stats.transfers_completed, 3);
    assert_eq!(summary.stats.plates_loaded, 3);
    assert_eq!(summary.stats.plates_unloaded, 3);
    assert_all_unlocked(&rig);
}

/// 3 sources on 4 channels: budget 2 each until only one plate is left
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_last_plate_escalates_budget() {
    let rig = rig(&standard_stages(), 4, 2, None);
    let sched = scheduler(&rig, AbortSignal::new());

    let mut transfers = vec![
        transfer("P1", "A1", "D1", "A1"),
        transfer("P2", "A1", "D1", "A2"),
    ];
    for i in 1..=8 {
        transfers.push(transfer("P3", &format!("C{}", i), "D1", &format!("B{}", i)));
    }
    let mut plan = TransferPlanManager::new(transfers).unwrap();

    let summary = sched.run(&mut plan).await.unwrap();
    let d1 = &summary.destinations[0];
    assert_eq!(d1.transfers, 10);

    for worker in &d1.workers {
        assert_eq!(worker.initial_budget, 2);
    }
    let p3 = d1
        .workers
        .iter()
        .find(|w| w.source.barcode == "P3")
        .unwrap();
    assert_eq!(p3.final_budget, 4);
    assert!(p3.peak_concurrency > 2, "peak {}", p3.peak_concurrency);
    assert!(summary.stats.budget_escalations >= 1);
}

/// 3 sources competing for 4 channels: none exceeds its initial budget
/// until it becomes the last plate in progress
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_budget_caps_concurrency_while_sources_compete() {
    let rig = rig(&standard_stages(), 4, 2, None);
    let sched = scheduler(&rig, AbortSignal::new());

    let mut transfers = Vec::new();
    for (source, row, count) in [("P1", "A", 4), ("P2", "B", 4), ("P3", "C", 8)] {
        for i in 1..=count {
            transfers.push(transfer(
                source,
                &format!("{}{}", row, i),
                "D1",
                &format!("{}{}", row, i),
            ));
        }
    }
    let mut plan = TransferPlanManager::new(transfers).unwrap();

    let summary = sched.run(&mut plan).await.unwrap();
    let d1 = &summary.destinations[0];
    assert_eq!(d1.transfers, 16);

    for worker in &d1.workers {
        assert_eq!(worker.initial_budget, 2);
        assert_eq!(
            worker.peak_before_escalation, 2,
            "{} ran past its budget before escalation",
            worker.source.barcode
        );
        assert!(worker.peak_concurrency <= worker.final_budget);
    }
    // Only the last plate in progress may escalate
    let escalated = d1.workers.iter().filter(|w| w.final_budget == 4).count();
    assert!(escalated >= 1);
    assert!(escalated as u64 == summary.stats.budget_escalations);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_single_source_starts_with_all_channels() {
    let rig = rig(&standard_stages(), 4, 1, None);
    let sched = scheduler(&rig, AbortSignal::new());
    let transfers = (1..=6)
        .map(|i| transfer("P1", &format!("A{}", i), "D1", &format!("A{}", i)))
        .collect();
    let mut plan = TransferPlanManager::new(transfers).unwrap();

    let summary = sched.run(&mut plan).await.unwrap();
    let worker = &summary.destinations[0].workers[0];
    assert_eq!(worker.initial_budget, 4);
    assert_eq!(worker.final_budget, 4);
    assert_eq!(summary.stats.budget_escalations, 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_tip_failure_releases_all_locks() {
    let rig = rig(&standard_stages(), 2, 1, None);
    rig.tip_handler.fail_next(1);
    let sched = scheduler(&rig, AbortSignal::new());
    let mut plan = TransferPlanManager::new(vec![
        transfer("P1", "A1", "D1", "A1"),
        transfer("P2", "A1", "D1", "A2"),
    ])
    .unwrap();

    let err = sched.run(&mut plan).await.unwrap_err();
    assert_eq!(err.code(), "TIP_HANDLING");
    assert_eq!(plan.remaining(), 2);

    assert_all_unlocked(&rig);
    assert!(rig.pool.stage_holding("D1").is_some(), "destination stays on deck");
    assert_eq!(rig.plate_handler.count(PlateEventKind::Pick, "D1"), 0);

    let loaded_sources = ["P1", "P2"]
        .iter()
        .filter(|p| rig.pool.stage_holding(p).is_some())
        .count();
    assert_eq!(loaded_sources, 1, "only the failed source plate stays loaded");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_abort_unwinds_run() {
    let rig = rig(&standard_stages(), 2, 5, None);
    let abort = AbortSignal::new();
    let sched = scheduler(&rig, abort.clone());
    let transfers = (1..=6)
        .map(|i| transfer("P1", &format!("A{}", i), "D1", &format!("A{}", i)))
        .collect();
    let mut plan = TransferPlanManager::new(transfers).unwrap();

    let run = tokio::spawn(async move {
        let res = sched.run(&mut plan).await;
        (res, plan)
    });
    tokio::time::sleep(Duration::from_millis(60)).await;
    abort.request_abort();

    let (res, plan) = tokio::time::timeout(Duration::from_secs(5), run)
        .await
        .expect("abort did not unwind the run")
        .unwrap();
    assert!(res.unwrap_err().is_abort());
    assert_eq!(plan.remaining(), 6);
    assert_all_unlocked(&rig);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_sources_wait_for_a_free_stage() {
    let stages = [
        StageSpec {
            id: StageId(1),
            mode: StageMode::Destination,
        },
        StageSpec {
            id: StageId(2),
            mode: StageMode::Source,
        },
    ];
    let rig = rig(&stages, 2, 1, None);
    let sched = scheduler(&rig, AbortSignal::new());
    let mut plan = TransferPlanManager::new(vec![
        transfer("P1", "A1", "D1", "A1"),
        transfer("P2", "A1", "D1", "A2"),
        transfer("P3", "A1", "D1", "A3"),
    ])
    .unwrap();

    let summary = sched.run(&mut plan).await.unwrap();
    assert_eq!(summary.destinations[0].transfers, 3);

    // One source stage: each plate leaves before the next arrives
    let events = rig.plate_handler.events();
    let sources: Vec<_> = events
        .iter()
        .filter(|e| e.barcode.starts_with('P'))
        .map(|e| e.kind)
        .collect();
    assert_eq!(
        sources,
        vec![
            PlateEventKind::Place,
            PlateEventKind::Pick,
            PlateEventKind::Place,
            PlateEventKind::Pick,
            PlateEventKind::Place,
            PlateEventKind::Pick,
        ]
    );
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_acquire_timeout_surfaces() {
    let stages = [
        StageSpec {
            id: StageId(1),
            mode: StageMode::Destination,
        },
        StageSpec {
            id: StageId(2),
            mode: StageMode::Source,
        },
    ];
    let rig = rig(&stages, 1, 5, Some(Duration::from_millis(15)));
    let sched = scheduler(&rig, AbortSignal::new());
    let mut plan = TransferPlanManager::new(vec![
        transfer("P1", "A1", "D1", "A1"),
        transfer("P2", "A1", "D1", "A2"),
    ])
    .unwrap();

    let err = sched.run(&mut plan).await.unwrap_err();
    assert_eq!(err.code(), "ACQUIRE_TIMEOUT");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_motion_faults_counted_and_wells_used() {
    let rig = rig(&standard_stages(), 2, 2, None);
    rig.instrument
        .sim_pipette(hitpick_engine::ChannelId(1))
        .unwrap()
        .x_axis()
        .fail_next(1);
    rig.instrument
        .sim_pipette(hitpick_engine::ChannelId(2))
        .unwrap()
        .x_axis()
        .fail_next(1);
    let sched = scheduler(&rig, AbortSignal::new());
    let mut plan = TransferPlanManager::new(vec![
        transfer("P1", "A1", "D1", "H1"),
        transfer("P1", "A2", "D1", "H2"),
    ])
    .unwrap();

    let summary = sched.run(&mut plan).await.unwrap();
    assert_eq!(summary.stats.operator_retries, 2);
    assert_eq!(rig.reporter.report_count(), 2);
    assert!(rig.reporter.messages()[0].contains("MOVE_XZ_INTO_SOURCE"));

    let wells = &sched.context().wells;
    assert_eq!(wells.usage("D1", "H1"), WellUsage::Used);
    assert_eq!(wells.usage("D1", "H2"), WellUsage::Used);
    assert_eq!(wells.usage("D1", "H3"), WellUsage::Available);
}
