//! Hitpick Engine - transfer plan runner
//!
//! Loads a transfer plan and executes it against the simulated instrument.
//!
//! ```text
//! ┌──────────┐    ┌──────────────┐    ┌──────────────┐    ┌──────────┐
//! │   Plan   │───▶│ Destination  │───▶│ Source plate │───▶│ Summary  │
//! │  (CSV)   │    │  scheduler   │    │   workers    │    │  (JSON)  │
//! └──────────┘    └──────────────┘    └──────────────┘    └──────────┘
//! ```
//!
//! Usage:
//!
//! ```text
//! hitpick_engine [--env dev] [--plan fixtures/plan.csv] [--output output/summary.json]
//! ```
//!
//! Ctrl+C aborts the run; in-flight transfers unwind and release their locks.

use std::process::ExitCode;

use anyhow::{Context, Result};

use hitpick_engine::config::AppConfig;
use hitpick_engine::plan_io::{PLAN_CSV, load_plan, write_summary};
use hitpick_engine::resources::AbortSignal;
use hitpick_engine::scheduler::{DestinationPlateScheduler, SchedulerContext, TransferPlanManager};
use hitpick_engine::sim::{SimLabwareCatalog, SimRig};

fn arg_value(names: &[&str]) -> Option<String> {
    let args: Vec<String> = std::env::args().collect();
    for i in 0..args.len() {
        if names.contains(&args[i].as_str()) && i + 1 < args.len() {
            return Some(args[i + 1].clone());
        }
    }
    None
}

fn get_env() -> String {
    arg_value(&["--env", "-e"]).unwrap_or_else(|| "dev".to_string())
}

fn get_plan_path() -> String {
    arg_value(&["--plan", "-p"]).unwrap_or_else(|| PLAN_CSV.to_string())
}

fn get_output_path() -> String {
    arg_value(&["--output", "-o"]).unwrap_or_else(|| "output/summary.json".to_string())
}

fn main() -> ExitCode {
    match run() {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("❌ {:#}", e);
            ExitCode::FAILURE
        }
    }
}

fn run() -> Result<()> {
    let env = get_env();
    let app_config = AppConfig::load(&env)?;
    let _log_guard = hitpick_engine::logging::init_logging(&app_config);

    tracing::info!("Starting Hitpick Engine in {} mode", env);
    println!("=== Hitpick Engine: simulated run ({}) ===", env);

    let plan_path = get_plan_path();
    println!("[1] Loading plan {}...", plan_path);
    let transfers = load_plan(&plan_path, app_config.scheduler.default_tip_handling)?;
    let mut plan = TransferPlanManager::new(transfers).context("Plan rejected")?;
    println!("    {} transfers", plan.remaining());

    println!("[2] Building simulated instrument...");
    let sim = &app_config.simulation;
    let labware = if sim.labware.is_empty() {
        SimLabwareCatalog::standard()
    } else {
        SimLabwareCatalog::new(sim.labware.clone())
    };
    let rig = SimRig::new(
        &app_config.instrument.stages,
        app_config.instrument.channels,
        sim.move_delay(),
        app_config.scheduler.acquire_timeout(),
        labware,
    );
    println!(
        "    {} channels, {} stages",
        app_config.instrument.channels,
        app_config.instrument.stages.len()
    );

    let abort = AbortSignal::new();
    let ctx = SchedulerContext::new(
        rig.pool.clone(),
        rig.collaborators(),
        app_config.scheduler_settings(),
        abort.clone(),
    );
    let scheduler = DestinationPlateScheduler::new(ctx);

    println!("[3] Running transfers (Ctrl+C to abort)...");
    let rt = tokio::runtime::Runtime::new().context("Failed to start tokio runtime")?;
    let result = rt.block_on(async {
        let ctrl_c_abort = abort.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                tracing::warn!("Ctrl+C received, aborting run");
                ctrl_c_abort.request_abort();
            }
        });
        scheduler.run(&mut plan).await
    });

    let summary = match result {
        Ok(summary) => summary,
        Err(e) => {
            tracing::error!(code = e.code(), error = %e, remaining = plan.remaining(), "Run failed");
            return Err(e).context(format!("Run stopped with {} transfers pending", plan.remaining()));
        }
    };

    println!("    {}", summary.stats);

    let output_path = get_output_path();
    write_summary(&output_path, &summary)?;
    println!("[4] Summary written to {}", output_path);
    println!("✅ Done");
    Ok(())
}
