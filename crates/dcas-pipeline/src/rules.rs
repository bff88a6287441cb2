//! Rule engine and message priority service.
//!
//! Rules are indexed by (config, crop, stage type, growth stage); a rule
//! fires when the row's parameter value lies in its `[min, max]` interval,
//! both ends inclusive, compared as exact doubles. Fired codes are ordered
//! by priority descending then code ascending, and the first five populate
//! the message columns.

use std::collections::HashMap;

use dcas_core::catalog::{Parameter, RunCatalogs};

use crate::grid_crop::GridCropRow;

/// Sentinel for positive-infinity parameter values, matching the value
/// normalization applied upstream of the rule tables.
const INF_SENTINEL: f64 = 999_999.0;

/// Normalizes a raw parameter value before interval comparison.
///
/// Missing values and NaN become 0; positive infinity becomes the 999999
/// sentinel the rule tables use for unbounded intervals.
#[must_use]
pub fn normalize_value(value: Option<f64>) -> f64 {
    match value {
        None => 0.0,
        Some(v) if v.is_nan() => 0.0,
        Some(v) if v == f64::INFINITY => INF_SENTINEL,
        Some(v) => v,
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
struct IndexedRule {
    parameter: Parameter,
    min_range: f64,
    max_range: f64,
    code: u32,
}

/// Run-scoped rule index keyed by (config, crop, stage type, growth stage).
#[derive(Debug, Default)]
pub struct RuleIndex {
    rules: HashMap<(u32, u32, u32, u32), Vec<IndexedRule>>,
}

impl RuleIndex {
    /// Builds the index from the run catalogs.
    #[must_use]
    pub fn preload(catalogs: &RunCatalogs) -> Self {
        let mut rules: HashMap<(u32, u32, u32, u32), Vec<IndexedRule>> = HashMap::new();
        for rule in &catalogs.rules {
            rules
                .entry((
                    rule.config_id,
                    rule.crop_id,
                    rule.crop_stage_type_id,
                    rule.crop_growth_stage_id,
                ))
                .or_default()
                .push(IndexedRule {
                    parameter: rule.parameter,
                    min_range: rule.min_range,
                    max_range: rule.max_range,
                    code: rule.code,
                });
        }
        Self { rules }
    }

    /// Evaluates the rule set against a row, returning the deduplicated set
    /// of fired codes in rule order.
    #[must_use]
    pub fn evaluate(&self, row: &GridCropRow) -> Vec<u32> {
        let Some(growth_stage_id) = row.growth_stage_id else {
            return Vec::new();
        };
        let key = (
            row.config_id,
            row.crop_id,
            row.crop_stage_type_id,
            growth_stage_id,
        );
        let Some(rules) = self.rules.get(&key) else {
            return Vec::new();
        };

        let mut fired = Vec::new();
        for rule in rules {
            let value = normalize_value(parameter_value(row, rule.parameter));
            if value >= rule.min_range && value <= rule.max_range && !fired.contains(&rule.code) {
                fired.push(rule.code);
            }
        }
        fired
    }
}

fn parameter_value(row: &GridCropRow, parameter: Parameter) -> Option<f64> {
    match parameter {
        Parameter::Temperature => row.temperature,
        Parameter::Humidity => row.humidity,
        Parameter::PPet => row.p_pet,
        Parameter::GrowthStagePrecipitation => row.growth_stage_precipitation,
        Parameter::SeasonalPrecipitation => row.seasonal_precipitation,
    }
}

/// Run-scoped message priority cache. Unknown (config, code) pairs rank 0.
#[derive(Debug, Default)]
pub struct PriorityIndex {
    priorities: HashMap<(u32, u32), i32>,
}

impl PriorityIndex {
    /// Builds the index from the run catalogs.
    #[must_use]
    pub fn preload(catalogs: &RunCatalogs) -> Self {
        let priorities = catalogs
            .priorities
            .iter()
            .map(|p| ((p.config_id, p.code), p.priority))
            .collect();
        Self { priorities }
    }

    /// Returns the priority of a code within a config, defaulting to 0.
    #[must_use]
    pub fn priority(&self, config_id: u32, code: u32) -> i32 {
        self.priorities
            .get(&(config_id, code))
            .copied()
            .unwrap_or(0)
    }

    /// Sorts candidate codes by priority descending, code ascending.
    pub fn sort(&self, config_id: u32, codes: &mut [u32]) {
        codes.sort_by(|a, b| {
            self.priority(config_id, *b)
                .cmp(&self.priority(config_id, *a))
                .then(a.cmp(b))
        });
    }
}

/// Fills the message columns from the sorted candidate list and selects the
/// final message.
///
/// With no candidates the row is flagged empty. When the top candidate
/// repeats last week's final message and another candidate exists, the
/// second candidate is selected instead and the repetition flag is set.
pub fn emit_messages(row: &mut GridCropRow, sorted_codes: &[u32]) {
    row.messages = [None; 5];
    for (slot, code) in row.messages.iter_mut().zip(sorted_codes.iter()) {
        *slot = Some(*code);
    }

    if sorted_codes.is_empty() {
        row.is_empty_message = true;
        row.final_message = None;
        row.has_repetitive_message = false;
        return;
    }

    row.is_empty_message = false;
    row.has_repetitive_message = false;
    row.final_message = Some(sorted_codes[0]);
    if row.prev_week_message == Some(sorted_codes[0]) && sorted_codes.len() > 1 {
        row.final_message = Some(sorted_codes[1]);
        row.has_repetitive_message = true;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use dcas_core::catalog::{MessagePriority, Rule};
    use dcas_core::keys::GridCropKey;

    fn base_row() -> GridCropRow {
        let mut row = GridCropRow::new(
            GridCropKey {
                crop_id: 3,
                crop_stage_type_id: 1,
                grid_id: 7,
                planting_date_epoch: 1_736_380_800,
            },
            1,
        );
        row.growth_stage_id = Some(2);
        row.temperature = Some(25.0);
        row.humidity = Some(70.0);
        row.p_pet = Some(0.8);
        row.seasonal_precipitation = Some(110.0);
        row.growth_stage_precipitation = Some(40.0);
        row
    }

    fn rule(parameter: Parameter, min: f64, max: f64, code: u32) -> Rule {
        Rule {
            config_id: 1,
            crop_id: 3,
            crop_stage_type_id: 1,
            crop_growth_stage_id: 2,
            parameter,
            min_range: min,
            max_range: max,
            code,
        }
    }

    fn catalogs(rules: Vec<Rule>, priorities: Vec<(u32, i32)>) -> RunCatalogs {
        RunCatalogs {
            rules,
            priorities: priorities
                .into_iter()
                .map(|(code, priority)| MessagePriority {
                    config_id: 1,
                    code,
                    priority,
                })
                .collect(),
            ..RunCatalogs::default()
        }
    }

    #[test]
    fn interval_bounds_are_inclusive() {
        let cats = catalogs(
            vec![
                rule(Parameter::Temperature, 25.0, 30.0, 101),
                rule(Parameter::Temperature, 20.0, 25.0, 102),
                rule(Parameter::Temperature, 26.0, 30.0, 103),
            ],
            vec![],
        );
        let index = RuleIndex::preload(&cats);
        let fired = index.evaluate(&base_row());
        // 25.0 sits on both boundaries; the open interval above does not fire.
        assert_eq!(fired, vec![101, 102]);
    }

    #[test]
    fn nan_and_infinity_normalize() {
        assert_eq!(normalize_value(None), 0.0);
        assert_eq!(normalize_value(Some(f64::NAN)), 0.0);
        assert_eq!(normalize_value(Some(f64::INFINITY)), 999_999.0);
        assert_eq!(normalize_value(Some(3.5)), 3.5);
    }

    #[test]
    fn ties_break_by_code_ascending() {
        let cats = catalogs(
            vec![
                rule(Parameter::Humidity, 0.0, 100.0, 202),
                rule(Parameter::Humidity, 0.0, 100.0, 201),
            ],
            vec![(201, 5), (202, 5)],
        );
        let index = RuleIndex::preload(&cats);
        let priorities = PriorityIndex::preload(&cats);

        let mut row = base_row();
        let mut fired = index.evaluate(&row);
        priorities.sort(1, &mut fired);
        emit_messages(&mut row, &fired);

        assert_eq!(row.final_message, Some(201));
        assert_eq!(row.messages[0], Some(201));
        assert_eq!(row.messages[1], Some(202));
    }

    #[test]
    fn priority_beats_code_order() {
        let cats = catalogs(
            vec![
                rule(Parameter::Humidity, 0.0, 100.0, 201),
                rule(Parameter::Humidity, 0.0, 100.0, 202),
            ],
            vec![(201, 1), (202, 9)],
        );
        let index = RuleIndex::preload(&cats);
        let priorities = PriorityIndex::preload(&cats);

        let mut fired = index.evaluate(&base_row());
        priorities.sort(1, &mut fired);
        assert_eq!(fired, vec![202, 201]);
    }

    #[test]
    fn unknown_code_defaults_to_priority_zero() {
        let priorities = PriorityIndex::preload(&catalogs(vec![], vec![(300, 2)]));
        assert_eq!(priorities.priority(1, 300), 2);
        assert_eq!(priorities.priority(1, 999), 0);
        assert_eq!(priorities.priority(2, 300), 0);
    }

    #[test]
    fn empty_candidates_flag_empty_message() {
        let mut row = base_row();
        emit_messages(&mut row, &[]);
        assert!(row.is_empty_message);
        assert_eq!(row.final_message, None);
        assert!(!row.has_repetitive_message);
    }

    #[test]
    fn repetition_falls_back_to_second_candidate() {
        let mut row = base_row();
        row.prev_week_message = Some(101);
        emit_messages(&mut row, &[101, 102, 103]);
        assert_eq!(row.final_message, Some(102));
        assert!(row.has_repetitive_message);
    }

    #[test]
    fn repetition_without_alternative_keeps_top() {
        let mut row = base_row();
        row.prev_week_message = Some(101);
        emit_messages(&mut row, &[101]);
        assert_eq!(row.final_message, Some(101));
        assert!(!row.has_repetitive_message);
    }

    #[test]
    fn at_most_five_codes_are_emitted() {
        let mut row = base_row();
        emit_messages(&mut row, &[1, 2, 3, 4, 5, 6, 7]);
        assert_eq!(
            row.messages,
            [Some(1), Some(2), Some(3), Some(4), Some(5)]
        );
        assert_eq!(row.final_message, Some(1));
    }
}
