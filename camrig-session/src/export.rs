//! Tabular output artifacts: 2D observations, 3D trajectories, and the
//! `.trc` motion-capture interchange format.

use std::collections::{BTreeMap, BTreeSet};
use std::io::Write;
use std::path::Path;

use serde::{Deserialize, Serialize};

use camrig_types::{Tracker, XyRow};

use crate::Result;

/// One triangulated landmark row of `xyz_{tracker}.csv`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct XyzRow {
    pub sync_index: u64,
    pub point_id: u32,
    pub x_coord: f64,
    pub y_coord: f64,
    pub z_coord: f64,
}

/// Write the tracking-pass observations (`xy_{tracker}.csv`).
pub fn write_xy_csv(path: &Path, rows: &[XyRow]) -> Result<()> {
    let mut writer = csv::Writer::from_path(path)?;
    for row in rows {
        writer.serialize(row)?;
    }
    writer.flush()?;
    Ok(())
}

/// Write the long-form triangulated landmarks (`xyz_{tracker}.csv`).
pub fn write_xyz_csv(path: &Path, rows: &[XyzRow]) -> Result<()> {
    let mut writer = csv::Writer::from_path(path)?;
    for row in rows {
        writer.serialize(row)?;
    }
    writer.flush()?;
    Ok(())
}

/// Landmark names present in the rows, alphabetical: the column order of the
/// wide-form exports.
fn sorted_point_names(rows: &[XyzRow], tracker: &dyn Tracker) -> Vec<(String, u32)> {
    let ids: BTreeSet<u32> = rows.iter().map(|r| r.point_id).collect();
    let mut names: Vec<(String, u32)> = ids
        .into_iter()
        .map(|id| (tracker.point_name(id), id))
        .collect();
    names.sort();
    names
}

fn rows_by_sync(rows: &[XyzRow]) -> BTreeMap<u64, BTreeMap<u32, &XyzRow>> {
    let mut by_sync: BTreeMap<u64, BTreeMap<u32, &XyzRow>> = BTreeMap::new();
    for row in rows {
        by_sync
            .entry(row.sync_index)
            .or_default()
            .insert(row.point_id, row);
    }
    by_sync
}

/// Write the wide labelled form (`xyz_{tracker}_labelled.csv`): one column
/// triple per named landmark, one row per sync index.
pub fn write_xyz_wide_csv(path: &Path, rows: &[XyzRow], tracker: &dyn Tracker) -> Result<()> {
    let names = sorted_point_names(rows, tracker);
    let by_sync = rows_by_sync(rows);

    let mut writer = csv::Writer::from_path(path)?;
    let mut header = vec!["sync_index".to_string()];
    for (name, _) in &names {
        header.push(format!("{name}_x"));
        header.push(format!("{name}_y"));
        header.push(format!("{name}_z"));
    }
    writer.write_record(&header)?;

    for (sync_index, points) in &by_sync {
        let mut record = vec![sync_index.to_string()];
        for (_, id) in &names {
            match points.get(id) {
                Some(row) => {
                    record.push(row.x_coord.to_string());
                    record.push(row.y_coord.to_string());
                    record.push(row.z_coord.to_string());
                }
                None => {
                    record.extend([String::new(), String::new(), String::new()]);
                }
            }
        }
        writer.write_record(&record)?;
    }
    writer.flush()?;
    Ok(())
}

/// Write the `.trc` motion-capture format: five metadata lines, then one
/// `Frame# Time X1 Y1 Z1 X2 Y2 Z2 …` row per sync index.
///
/// `sync_times` maps sync indices to their mean frame time; times are
/// shifted to start at zero and the data rate is derived from their mean
/// spacing.
pub fn write_trc(
    path: &Path,
    rows: &[XyzRow],
    tracker: &dyn Tracker,
    sync_times: &BTreeMap<u64, f64>,
) -> Result<()> {
    let names = sorted_point_names(rows, tracker);
    let by_sync = rows_by_sync(rows);

    let t0 = sync_times.values().copied().fold(f64::INFINITY, f64::min);
    let times: BTreeMap<u64, f64> = sync_times
        .iter()
        .map(|(sync, t)| (*sync, ((t - t0) * 1000.0).round() / 1000.0))
        .collect();

    // mean rate over consecutive frame intervals
    let ordered: Vec<f64> = by_sync
        .keys()
        .filter_map(|sync| times.get(sync).copied())
        .collect();
    let mut rates = Vec::new();
    for pair in ordered.windows(2) {
        let dt = pair[1] - pair[0];
        if dt > 0.0 {
            rates.push(1.0 / dt);
        }
    }
    let data_rate = if rates.is_empty() {
        0
    } else {
        (rates.iter().sum::<f64>() / rates.len() as f64) as i64
    };

    let num_frames = by_sync.len().saturating_sub(1);
    let mut out = std::io::BufWriter::new(std::fs::File::create(path)?);

    writeln!(out, "PathFileType\t4\t(X/Y/Z)\t{}", path.display())?;
    writeln!(
        out,
        "DataRate\tCameraRate\tNumFrames\tNumMarkers\tUnits\tOrigDataRate\tOrigDataStartFrame\tOrigNumFrames"
    )?;
    writeln!(
        out,
        "{data_rate}\t{data_rate}\t{num_frames}\t{}\tm\t{data_rate}\t0\t{num_frames}",
        names.len()
    )?;

    let mut header = String::from("Frame#\tTime");
    for (name, _) in &names {
        header.push('\t');
        header.push_str(name);
        header.push_str("\t\t");
    }
    writeln!(out, "{header}")?;

    let mut axes = String::from("\t");
    for i in 1..=names.len() {
        axes.push_str(&format!("\tX{i}\tY{i}\tZ{i}"));
    }
    writeln!(out, "{axes}")?;
    writeln!(out)?;

    for (sync_index, points) in &by_sync {
        let time = times.get(sync_index).copied().unwrap_or(0.0);
        let mut line = format!("{sync_index}\t{time}");
        for (_, id) in &names {
            match points.get(id) {
                Some(row) => {
                    line.push_str(&format!(
                        "\t{}\t{}\t{}",
                        row.x_coord, row.y_coord, row.z_coord
                    ));
                }
                None => line.push_str("\t\t\t"),
            }
        }
        writeln!(out, "{line}")?;
    }
    out.flush()?;
    Ok(())
}
