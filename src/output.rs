// src/output.rs - Append-only CSV result files

use csv::Writer;
use log::debug;
use std::fs::{self, File};
use std::path::{Path, PathBuf};

use crate::errors::{Result, VesselAnalysisError};
use crate::results::{BranchRecord, CellRecord, GlobalRecord};

pub const GLOBAL_RESULTS_FILE: &str = "globalResults.csv";
pub const CELL_RESULTS_FILE: &str = "cellsResults.csv";
pub const VESSEL_RESULTS_FILE: &str = "vesselsResults.csv";

/// Which optional column groups the global file carries
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GlobalColumns {
    pub cells: bool,
    pub nuclei: bool,
}

/// Open `path` for appending, writing `header` first when the file is new
fn open_append(path: &Path, header: &[&str]) -> Result<Writer<File>> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).map_err(|e| VesselAnalysisError::Io(e))?;
    }

    let file_exists = path.exists();
    let file = fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .map_err(|e| VesselAnalysisError::Io(e))?;
    let mut writer = Writer::from_writer(file);

    if !file_exists {
        debug!("Creating {}", path.display());
        writer
            .write_record(header)
            .map_err(|e| VesselAnalysisError::CsvOutput(e))?;
    }
    Ok(writer)
}

fn finish(mut writer: Writer<File>) -> Result<()> {
    writer
        .flush()
        .map_err(|e| VesselAnalysisError::CsvOutput(csv::Error::from(e)))
}

/// Fixed-precision number, `NaN` kept as text
fn num(value: f64) -> String {
    if value.is_nan() {
        "NaN".to_string()
    } else {
        format!("{:.6}", value)
    }
}

pub fn global_header(columns: GlobalColumns) -> Vec<&'static str> {
    let mut header = vec![
        "Image name",
        "Image XY calibration (µm)",
        "ROI name",
        "ROI translation",
        "ROI volume (µm3)",
        "Vessel volume (µm3)",
        "Vessel density",
        "Total vessel length (µm)",
        "Mean branch length (µm)",
        "Longest branch length (µm)",
        "Nb branches",
        "Nb junctions",
        "Nb endpoints",
        "Mean vessel diameter (µm)",
        "Std vessel diameter (µm)",
        "Min vessel diameter (µm)",
        "Max vessel diameter (µm)",
    ];
    if columns.cells {
        header.extend(["Nb microglia", "Nb VAM", "Nb VTM", "Nb VDM"]);
    }
    if columns.nuclei {
        header.extend([
            "Nb endothelial nuclei",
            "Nuclei density (nb/1e6 µm3)",
            "Nuclei per vessel length (nb/µm)",
        ]);
    }
    header
}

/// Append one row per ROI to the global results file
pub fn write_global_rows<P: AsRef<Path>>(
    output_dir: P,
    records: &[GlobalRecord],
    columns: GlobalColumns,
) -> Result<PathBuf> {
    let path = output_dir.as_ref().join(GLOBAL_RESULTS_FILE);
    let mut writer = open_append(&path, &global_header(columns))?;

    for r in records {
        let s = &r.skeleton;
        let mut row = vec![
            r.image.clone(),
            num(r.pixel_width_um),
            r.roi_name.clone(),
            r.translated.to_string(),
            num(r.roi_volume),
            num(r.vessel_volume),
            num(r.vessel_density),
            num(s.total_length),
            num(s.mean_length),
            num(s.longest_branch),
            s.branch_count.to_string(),
            s.junction_count.to_string(),
            s.endpoint_count.to_string(),
            num(s.mean_diameter),
            num(s.std_diameter),
            num(s.min_diameter),
            num(s.max_diameter),
        ];
        if columns.cells {
            match r.cells {
                Some(c) => row.extend([
                    c.count.to_string(),
                    c.tally.vam.to_string(),
                    c.tally.vtm.to_string(),
                    c.tally.vdm.to_string(),
                ]),
                None => row.extend(std::iter::repeat(String::new()).take(4)),
            }
        }
        if columns.nuclei {
            match r.nuclei {
                Some(n) => row.extend([n.count.to_string(), num(n.density), num(n.per_vessel_length)]),
                None => row.extend(std::iter::repeat(String::new()).take(3)),
            }
        }
        writer
            .write_record(&row)
            .map_err(|e| VesselAnalysisError::CsvOutput(e))?;
    }

    finish(writer)?;
    Ok(path)
}

/// Append one row per cell to the cell results file
pub fn write_cell_rows<P: AsRef<Path>>(output_dir: P, records: &[CellRecord]) -> Result<PathBuf> {
    let path = output_dir.as_ref().join(CELL_RESULTS_FILE);
    let mut writer = open_append(
        &path,
        &[
            "Image name",
            "ROI name",
            "Cell id",
            "Cell volume (µm3)",
            "Cell volume coloc with vessel (µm3)",
            "Centroid cell distance to vessel (µm)",
            "Border cell distance to vessel (µm)",
            "Nearest vessel diameter (µm)",
            "Category",
        ],
    )?;

    for c in records {
        let r = &c.record;
        writer
            .write_record(&[
                c.image.clone(),
                c.roi_name.clone(),
                r.label.to_string(),
                num(r.volume),
                num(r.coloc_volume),
                num(r.centroid_distance),
                num(r.border_distance),
                num(r.nearest_vessel_diameter),
                r.category.to_string(),
            ])
            .map_err(|e| VesselAnalysisError::CsvOutput(e))?;
    }

    finish(writer)?;
    Ok(path)
}

/// Append one row per vessel branch to the branch results file
pub fn write_branch_rows<P: AsRef<Path>>(output_dir: P, records: &[BranchRecord]) -> Result<PathBuf> {
    let path = output_dir.as_ref().join(VESSEL_RESULTS_FILE);
    let mut writer = open_append(
        &path,
        &[
            "Image name",
            "ROI name",
            "Branch length (µm)",
            "Mean diameter (µm)",
            "Std diameter (µm)",
            "Min diameter (µm)",
            "Max diameter (µm)",
            "V1 x (µm)",
            "V1 y (µm)",
            "V1 z (µm)",
            "V2 x (µm)",
            "V2 y (µm)",
            "V2 z (µm)",
        ],
    )?;

    for b in records {
        let s = &b.stats;
        writer
            .write_record(&[
                b.image.clone(),
                b.roi_name.clone(),
                num(s.length),
                num(s.diameter.mean),
                num(s.diameter.std),
                num(s.diameter.min),
                num(s.diameter.max),
                num(s.start_um.x),
                num(s.start_um.y),
                num(s.start_um.z),
                num(s.end_um.x),
                num(s.end_um.y),
                num(s.end_um.z),
            ])
            .map_err(|e| VesselAnalysisError::CsvOutput(e))?;
    }

    finish(writer)?;
    Ok(path)
}
