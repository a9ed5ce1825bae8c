// src/results.rs - Per-image collection of ROI, cell and branch records

use crate::proximity::{CategoryTally, RelationshipRecord};
use crate::skeleton_graph::{BranchStats, SkeletonMetrics};

/// Cell counts for one ROI
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CellSummary {
    pub count: usize,
    pub tally: CategoryTally,
}

/// Endothelial nuclei counts for one ROI
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct NucleiSummary {
    pub count: usize,
    /// Nuclei per 10⁶ µm³ of ROI
    pub density: f64,
    /// Nuclei per µm of vessel length, NaN without vessel length
    pub per_vessel_length: f64,
}

/// One row of the global results
#[derive(Debug, Clone)]
pub struct GlobalRecord {
    pub image: String,
    pub pixel_width_um: f64,
    pub roi_name: String,
    pub translated: bool,
    pub roi_volume: f64,
    pub vessel_volume: f64,
    pub vessel_density: f64,
    pub skeleton: SkeletonMetrics,
    pub cells: Option<CellSummary>,
    pub nuclei: Option<NucleiSummary>,
}

#[derive(Debug, Clone)]
pub struct CellRecord {
    pub image: String,
    pub roi_name: String,
    pub record: RelationshipRecord,
}

#[derive(Debug, Clone)]
pub struct BranchRecord {
    pub image: String,
    pub roi_name: String,
    pub stats: BranchStats,
}

/// Everything measured in one ROI
#[derive(Debug, Clone)]
pub struct RoiMeasurements {
    pub roi_name: String,
    pub translated: bool,
    pub roi_volume: f64,
    pub vessel_volume: f64,
    pub skeleton: SkeletonMetrics,
    pub branches: Vec<BranchStats>,
    pub cells: Option<Vec<RelationshipRecord>>,
    pub nuclei_count: Option<usize>,
}

/// Collects the rows produced for one image
#[derive(Debug, Clone)]
pub struct ResultsAggregator {
    image: String,
    pixel_width_um: f64,
    global: Vec<GlobalRecord>,
    cells: Vec<CellRecord>,
    branches: Vec<BranchRecord>,
}

impl ResultsAggregator {
    pub fn new(image: impl Into<String>, pixel_width_um: f64) -> Self {
        Self {
            image: image.into(),
            pixel_width_um,
            global: Vec::new(),
            cells: Vec::new(),
            branches: Vec::new(),
        }
    }

    pub fn image(&self) -> &str {
        &self.image
    }

    pub fn add_roi(&mut self, roi: RoiMeasurements) {
        let cells = roi.cells.as_ref().map(|records| CellSummary {
            count: records.len(),
            tally: CategoryTally::from_records(records),
        });
        let nuclei = roi.nuclei_count.map(|count| NucleiSummary {
            count,
            density: per_million(count as f64, roi.roi_volume),
            per_vessel_length: if roi.skeleton.total_length > 0.0 {
                count as f64 / roi.skeleton.total_length
            } else {
                f64::NAN
            },
        });

        self.global.push(GlobalRecord {
            image: self.image.clone(),
            pixel_width_um: self.pixel_width_um,
            roi_name: roi.roi_name.clone(),
            translated: roi.translated,
            roi_volume: roi.roi_volume,
            vessel_volume: roi.vessel_volume,
            vessel_density: per_million(roi.vessel_volume, roi.roi_volume),
            skeleton: roi.skeleton,
            cells,
            nuclei,
        });

        for record in roi.cells.into_iter().flatten() {
            self.cells.push(CellRecord {
                image: self.image.clone(),
                roi_name: roi.roi_name.clone(),
                record,
            });
        }
        for stats in roi.branches {
            self.branches.push(BranchRecord {
                image: self.image.clone(),
                roi_name: roi.roi_name.clone(),
                stats,
            });
        }
    }

    pub fn global_records(&self) -> &[GlobalRecord] {
        &self.global
    }

    pub fn cell_records(&self) -> &[CellRecord] {
        &self.cells
    }

    pub fn branch_records(&self) -> &[BranchRecord] {
        &self.branches
    }
}

/// `value / volume × 10⁶`, NaN for an empty volume
fn per_million(value: f64, volume: f64) -> f64 {
    if volume > 0.0 {
        value / volume * 1e6
    } else {
        f64::NAN
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::proximity::Category;
    use assert_approx_eq::assert_approx_eq;

    fn record(label: u32, category: Category) -> RelationshipRecord {
        RelationshipRecord {
            label,
            volume: 10.0,
            coloc_volume: 0.0,
            centroid_distance: 1.0,
            border_distance: 1.0,
            nearest_vessel_diameter: 3.0,
            category,
        }
    }

    fn measurements(total_length: f64, cells: Option<Vec<RelationshipRecord>>) -> RoiMeasurements {
        RoiMeasurements {
            roi_name: "r1".to_string(),
            translated: true,
            roi_volume: 2e6,
            vessel_volume: 5e4,
            skeleton: SkeletonMetrics {
                total_length,
                ..SkeletonMetrics::default()
            },
            branches: Vec::new(),
            cells,
            nuclei_count: Some(4),
        }
    }

    #[test]
    fn densities_are_per_million_cubic_microns() {
        let mut aggregator = ResultsAggregator::new("img", 0.3);
        aggregator.add_roi(measurements(200.0, None));
        let row = &aggregator.global_records()[0];
        assert_approx_eq!(row.vessel_density, 25_000.0);
        let nuclei = row.nuclei.unwrap();
        assert_approx_eq!(nuclei.density, 2.0);
        assert_approx_eq!(nuclei.per_vessel_length, 0.02);
        assert!(row.cells.is_none());
    }

    #[test]
    fn nuclei_per_length_is_nan_without_vessel_length() {
        let mut aggregator = ResultsAggregator::new("img", 1.0);
        aggregator.add_roi(measurements(0.0, None));
        assert!(aggregator.global_records()[0].nuclei.unwrap().per_vessel_length.is_nan());
    }

    #[test]
    fn cell_rows_and_tallies_follow_records() {
        let mut aggregator = ResultsAggregator::new("img", 1.0);
        let cells = vec![
            record(1, Category::Vam),
            record(2, Category::NoVessel),
            record(3, Category::Vdm),
        ];
        aggregator.add_roi(measurements(10.0, Some(cells)));
        let summary = aggregator.global_records()[0].cells.unwrap();
        assert_eq!(summary.count, 3);
        assert_eq!(summary.tally.vdm, 2);
        assert_eq!(summary.tally.total(), summary.count);
        assert_eq!(aggregator.cell_records().len(), 3);
        assert_eq!(aggregator.cell_records()[2].roi_name, "r1");
    }
}
