//! Growth-stage resolver.
//!
//! Maps a row's cumulative GDD onto the ordered GDD matrix and infers the
//! date the resolved stage began. The matrix is preloaded once per run into
//! an explicit cache so the per-row lookup is a binary search.

use std::collections::HashMap;

use dcas_core::catalog::RunCatalogs;

use crate::grid_crop::GridCropRow;

/// One matrix entry: the cumulative-GDD upper bound of a stage.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct StageThreshold {
    /// Cumulative-GDD upper bound.
    pub gdd_threshold: f64,
    /// Stage resolved when the sum falls at or below the bound.
    pub growth_stage_id: u32,
}

/// A resolved stage plus the lower bound of its GDD interval.
///
/// The lower bound drives start-date inference: the stage began on the day
/// the cumulative sum first exceeded it.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ResolvedStage {
    /// Resolved growth stage.
    pub growth_stage_id: u32,
    /// Lower bound of the stage's cumulative-GDD interval.
    pub lower_bound: f64,
}

/// Run-scoped cache of GDD matrices keyed by (crop, stage type, config).
///
/// Thresholds are sorted ascending within each key. Built in setup, passed
/// into the stage explicitly, dropped when the run ends.
#[derive(Debug, Default)]
pub struct GrowthStageMatrixCache {
    matrices: HashMap<(u32, u32, u32), Vec<StageThreshold>>,
}

impl GrowthStageMatrixCache {
    /// Preloads every matrix from the run catalogs.
    #[must_use]
    pub fn preload(catalogs: &RunCatalogs) -> Self {
        let mut matrices: HashMap<(u32, u32, u32), Vec<StageThreshold>> = HashMap::new();
        for entry in &catalogs.gdd_matrix {
            matrices
                .entry((entry.crop_id, entry.crop_stage_type_id, entry.config_id))
                .or_default()
                .push(StageThreshold {
                    gdd_threshold: entry.gdd_threshold,
                    growth_stage_id: entry.growth_stage_id,
                });
        }
        for thresholds in matrices.values_mut() {
            thresholds.sort_by(|a, b| {
                a.gdd_threshold
                    .partial_cmp(&b.gdd_threshold)
                    .unwrap_or(std::cmp::Ordering::Equal)
            });
        }
        Self { matrices }
    }

    /// Returns the sorted matrix for a key, empty when none is configured.
    #[must_use]
    pub fn thresholds(&self, crop_id: u32, crop_stage_type_id: u32, config_id: u32) -> &[StageThreshold] {
        self.matrices
            .get(&(crop_id, crop_stage_type_id, config_id))
            .map_or(&[], Vec::as_slice)
    }
}

/// Resolves the stage for a cumulative GDD value `sigma`.
///
/// The smallest threshold at or above `sigma` wins; the lower bound is the
/// preceding threshold (0 for the first stage). A sum beyond every threshold
/// resolves to the last stage with its own threshold as the lower bound.
/// Returns `None` for an empty matrix.
#[must_use]
pub fn resolve_stage(matrix: &[StageThreshold], sigma: f64) -> Option<ResolvedStage> {
    if matrix.is_empty() {
        return None;
    }
    let idx = matrix.partition_point(|t| t.gdd_threshold < sigma);
    if idx == matrix.len() {
        let last = matrix[matrix.len() - 1];
        return Some(ResolvedStage {
            growth_stage_id: last.growth_stage_id,
            lower_bound: last.gdd_threshold,
        });
    }
    Some(ResolvedStage {
        growth_stage_id: matrix[idx].growth_stage_id,
        lower_bound: if idx == 0 {
            0.0
        } else {
            matrix[idx - 1].gdd_threshold
        },
    })
}

/// Infers the start date (epoch seconds) of a freshly resolved stage.
///
/// Walks the epoch list in reverse (skipping the last entry) looking for the
/// first cumulative sum at or below the stage's lower bound; the stage began
/// on the chronologically next day. An epoch before planting short-circuits
/// to the planting date, and an exhausted scan falls back to the first epoch.
#[must_use]
pub fn infer_start_date(
    row: &GridCropRow,
    lower_bound: f64,
    epoch_list: &[i64],
) -> Option<i64> {
    if lower_bound == 0.0 {
        return Some(row.planting_date_epoch);
    }
    let last = *epoch_list.last()?;
    let mut prev_epoch = last;
    for idx in (0..epoch_list.len().saturating_sub(1)).rev() {
        let epoch = epoch_list[idx];
        if epoch < row.planting_date_epoch {
            return Some(row.planting_date_epoch);
        }
        if let Some(sum) = row.gdd_sum.get(idx).copied().flatten() {
            if sum <= lower_bound {
                return Some(prev_epoch);
            }
        }
        prev_epoch = epoch;
    }
    epoch_list.first().copied()
}

/// Applies the resolver to one row.
///
/// An empty matrix inherits the previous stage when one exists; otherwise
/// the row is left unresolved and the caller routes it to the error log.
/// A row whose resolved stage matches the previous run's keeps that run's
/// start date.
pub fn apply(row: &mut GridCropRow, cache: &GrowthStageMatrixCache, epoch_list: &[i64]) {
    let Some(sigma) = row.total_gdd else {
        return;
    };
    let matrix = cache.thresholds(row.crop_id, row.crop_stage_type_id, row.config_id);
    let Some(resolved) = resolve_stage(matrix, sigma) else {
        row.growth_stage_id = row.prev_growth_stage_id;
        row.growth_stage_start_date = row.prev_growth_stage_start_date;
        return;
    };

    row.growth_stage_id = Some(resolved.growth_stage_id);
    if row.prev_growth_stage_id == Some(resolved.growth_stage_id)
        && row.prev_growth_stage_start_date.is_some()
    {
        row.growth_stage_start_date = row.prev_growth_stage_start_date;
        return;
    }
    row.growth_stage_start_date = infer_start_date(row, resolved.lower_bound, epoch_list);
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;
    use dcas_core::keys::{daily_epochs, date_to_epoch, GridCropKey};

    fn matrix() -> Vec<StageThreshold> {
        vec![
            StageThreshold {
                gdd_threshold: 100.0,
                growth_stage_id: 1,
            },
            StageThreshold {
                gdd_threshold: 800.0,
                growth_stage_id: 2,
            },
            StageThreshold {
                gdd_threshold: 2000.0,
                growth_stage_id: 3,
            },
        ]
    }

    #[test]
    fn stage_resolution_intervals() {
        let m = matrix();
        assert_eq!(
            resolve_stage(&m, 50.0),
            Some(ResolvedStage {
                growth_stage_id: 1,
                lower_bound: 0.0
            })
        );
        // Boundary value belongs to the lower stage.
        assert_eq!(resolve_stage(&m, 100.0).unwrap().growth_stage_id, 1);
        assert_eq!(
            resolve_stage(&m, 702.0),
            Some(ResolvedStage {
                growth_stage_id: 2,
                lower_bound: 100.0
            })
        );
        // Beyond the last threshold resolves to the last stage.
        assert_eq!(
            resolve_stage(&m, 2500.0),
            Some(ResolvedStage {
                growth_stage_id: 3,
                lower_bound: 2000.0
            })
        );
        assert_eq!(resolve_stage(&[], 10.0), None);
    }

    #[test]
    fn stage_is_monotone_in_sigma() {
        let m = matrix();
        let mut prev = 0;
        for sigma in (0..2600).step_by(25) {
            let stage = resolve_stage(&m, f64::from(sigma)).unwrap().growth_stage_id;
            assert!(stage >= prev);
            prev = stage;
        }
    }

    fn scenario_row() -> (GridCropRow, Vec<i64>) {
        // Constant 13 GDD per day from the day after planting.
        let planting = NaiveDate::from_ymd_opt(2025, 1, 9).unwrap();
        let processing = NaiveDate::from_ymd_opt(2025, 3, 4).unwrap();
        let epoch_list = daily_epochs(planting, processing);
        let mut row = GridCropRow::new(
            GridCropKey {
                crop_id: 3,
                crop_stage_type_id: 1,
                grid_id: 7,
                planting_date_epoch: date_to_epoch(planting),
            },
            1,
        );
        row.gdd_sum = epoch_list
            .iter()
            .enumerate()
            .map(|(idx, _)| (idx > 0).then(|| 13.0 * idx as f64))
            .collect();
        row.total_gdd = row.gdd_sum.last().copied().flatten();
        (row, epoch_list)
    }

    #[test]
    fn start_date_walks_back_to_threshold_crossing() {
        let (row, epoch_list) = scenario_row();
        assert_eq!(row.total_gdd, Some(702.0));

        let resolved = resolve_stage(&matrix(), 702.0).unwrap();
        assert_eq!(resolved.growth_stage_id, 2);

        // Sum reaches 91 on 2025-01-16 (<= 100) and 104 on 2025-01-17; the
        // vegetative stage began on the 17th.
        let start = infer_start_date(&row, resolved.lower_bound, &epoch_list).unwrap();
        assert_eq!(
            start,
            date_to_epoch(NaiveDate::from_ymd_opt(2025, 1, 17).unwrap())
        );
    }

    #[test]
    fn start_date_in_first_stage_is_planting_date() {
        let (mut row, epoch_list) = scenario_row();
        row.total_gdd = Some(50.0);
        let resolved = resolve_stage(&matrix(), 50.0).unwrap();
        let start = infer_start_date(&row, resolved.lower_bound, &epoch_list).unwrap();
        assert_eq!(start, row.planting_date_epoch);
    }

    #[test]
    fn start_date_exhausted_scan_falls_back_to_first_epoch() {
        let (mut row, epoch_list) = scenario_row();
        // Every defined sum exceeds the lower bound; pre-planting epochs are
        // absent from the list, so the scan exhausts.
        row.gdd_sum = epoch_list.iter().map(|_| Some(500.0)).collect();
        let start = infer_start_date(&row, 100.0, &epoch_list).unwrap();
        assert_eq!(start, epoch_list[0]);
    }

    #[test]
    fn start_date_bounds_hold() {
        let (row, epoch_list) = scenario_row();
        let resolved = resolve_stage(&matrix(), row.total_gdd.unwrap()).unwrap();
        let start = infer_start_date(&row, resolved.lower_bound, &epoch_list).unwrap();
        assert!(start >= row.planting_date_epoch);
        assert!(start <= *epoch_list.last().unwrap());
    }

    #[test]
    fn apply_inherits_start_when_stage_unchanged() {
        let (mut row, epoch_list) = scenario_row();
        row.prev_growth_stage_id = Some(2);
        row.prev_growth_stage_start_date = Some(epoch_list[3]);

        let catalogs = RunCatalogs {
            gdd_matrix: matrix()
                .into_iter()
                .map(|t| dcas_core::catalog::GddMatrixEntry {
                    crop_id: 3,
                    crop_stage_type_id: 1,
                    config_id: 1,
                    growth_stage_id: t.growth_stage_id,
                    gdd_threshold: t.gdd_threshold,
                })
                .collect(),
            ..RunCatalogs::default()
        };
        let cache = GrowthStageMatrixCache::preload(&catalogs);

        apply(&mut row, &cache, &epoch_list);
        assert_eq!(row.growth_stage_id, Some(2));
        assert_eq!(row.growth_stage_start_date, Some(epoch_list[3]));
    }

    #[test]
    fn apply_with_empty_matrix_inherits_previous_state() {
        let (mut row, epoch_list) = scenario_row();
        row.prev_growth_stage_id = Some(9);
        row.prev_growth_stage_start_date = Some(epoch_list[1]);

        let cache = GrowthStageMatrixCache::preload(&RunCatalogs::default());
        apply(&mut row, &cache, &epoch_list);
        assert_eq!(row.growth_stage_id, Some(9));
        assert_eq!(row.growth_stage_start_date, Some(epoch_list[1]));
    }
}
