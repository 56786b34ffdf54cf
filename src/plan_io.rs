//! Plan I/O - Load transfer plans from CSV, write run summaries as JSON
//!
//! Plan columns:
//!
//! ```text
//! source_barcode,source_labware,source_well,dest_barcode,dest_labware,dest_wells,volume,tip_handling
//! P1,96 well,A1,D1,384 well,B2;B3,5.0,Wash tip
//! ```
//!
//! `dest_wells` is `;`-separated; dispensing targets the first one.
//! `tip_handling` is the operator hint ("Wash tip", "Change tip"); an empty
//! column takes the configured default, any other text is a no-op.

use std::fs::File;
use std::io::{BufRead, BufReader, BufWriter, Write};
use std::path::Path;

use anyhow::{Context, Result, bail};

use crate::scheduler::RunSummary;
use crate::transfer::{Plate, TipHandling, Transfer};

pub const PLAN_CSV: &str = "fixtures/plan.csv";

pub const PLAN_HEADER: &str =
    "source_barcode,source_labware,source_well,dest_barcode,dest_labware,dest_wells,volume,tip_handling";

const COLUMNS: usize = 8;

/// Load a transfer plan from a CSV file
pub fn load_plan(path: impl AsRef<Path>, default_tip: TipHandling) -> Result<Vec<Transfer>> {
    let path = path.as_ref();
    let file =
        File::open(path).with_context(|| format!("Failed to open {}", path.display()))?;
    let transfers = parse_plan(BufReader::new(file), default_tip)
        .with_context(|| format!("Failed to load plan {}", path.display()))?;
    tracing::info!(path = %path.display(), transfers = transfers.len(), "Loaded transfer plan");
    Ok(transfers)
}

/// Parse plan rows. The first line is a header and is skipped; blank lines
/// and `#` comments are ignored.
pub fn parse_plan(reader: impl BufRead, default_tip: TipHandling) -> Result<Vec<Transfer>> {
    let mut transfers = Vec::new();

    for (line_num, line) in reader.lines().enumerate().skip(1) {
        let line = line?;
        let trimmed = line.trim();
        if trimmed.is_empty() || trimmed.starts_with('#') {
            continue;
        }
        let row = line_num + 1;

        let parts: Vec<&str> = trimmed.split(',').map(str::trim).collect();
        if parts.len() != COLUMNS && parts.len() != COLUMNS - 1 {
            bail!(
                "Expected {} columns at line {}, found {}",
                COLUMNS,
                row,
                parts.len()
            );
        }

        let volume: f64 = parts[6]
            .parse()
            .with_context(|| format!("Invalid volume at line {}", row))?;
        let destination_wells: Vec<String> = parts[5]
            .split(';')
            .map(str::trim)
            .filter(|w| !w.is_empty())
            .map(str::to_string)
            .collect();
        let tip_handling = match parts.get(7) {
            Some(hint) if !hint.is_empty() => TipHandling::from_hint(hint),
            _ => default_tip,
        };

        let transfer = Transfer::new(
            Plate::source(parts[0], parts[1]),
            parts[2],
            Plate::destination(parts[3], parts[4]),
            destination_wells,
            volume,
            tip_handling,
        )
        .with_context(|| format!("Invalid transfer at line {}", row))?;
        transfers.push(transfer);
    }

    Ok(transfers)
}

/// Write a run summary as pretty JSON
pub fn write_summary(path: impl AsRef<Path>, summary: &RunSummary) -> Result<()> {
    let path = path.as_ref();
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("Failed to create {}", parent.display()))?;
    }
    let file =
        File::create(path).with_context(|| format!("Failed to create {}", path.display()))?;
    let mut writer = BufWriter::new(file);
    serde_json::to_writer_pretty(&mut writer, summary)?;
    writeln!(writer)?;
    writer.flush()?;
    tracing::info!(path = %path.display(), "Wrote run summary");
    Ok(())
}
