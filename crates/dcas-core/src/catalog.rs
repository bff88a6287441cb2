//! Catalog entities consumed by the pipeline stages.
//!
//! These are the relational inputs of a run: crops, growth stages, GDD
//! parameters, advisory rules, message priorities and localized templates,
//! plus the country-to-config mapping. All of them are immutable within a
//! run; `RunCatalogs` is loaded once during setup and passed into the stages
//! explicitly.

use std::collections::HashMap;
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// A crop in the catalog.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Crop {
    /// Crop identifier.
    pub id: u32,
    /// Human-readable crop name (e.g. "Cassava").
    pub name: String,
}

/// Crop stage type (Early/Mid/Late). Immutable catalog.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CropStageType {
    /// Stage type identifier.
    pub id: u32,
    /// Human-readable name (e.g. "Early").
    pub name: String,
}

/// A named phase in a crop's life cycle.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GrowthStage {
    /// Growth stage identifier.
    pub id: u32,
    /// Human label (e.g. "Germination").
    pub label: String,
}

/// GDD base/cap temperatures per (crop, stage type, config).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GddConfig {
    /// Crop identifier.
    pub crop_id: u32,
    /// Crop stage type identifier.
    pub crop_stage_type_id: u32,
    /// DCAS configuration identifier.
    pub config_id: u32,
    /// Base temperature in degrees Celsius.
    pub base_temperature: f64,
    /// Cap temperature in degrees Celsius.
    pub cap_temperature: f64,
}

/// One row of the GDD matrix: the cumulative-GDD upper bound of a stage.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GddMatrixEntry {
    /// Crop identifier.
    pub crop_id: u32,
    /// Crop stage type identifier.
    pub crop_stage_type_id: u32,
    /// DCAS configuration identifier.
    pub config_id: u32,
    /// Growth stage this threshold resolves to.
    pub growth_stage_id: u32,
    /// Cumulative-GDD upper bound defining the stage.
    pub gdd_threshold: f64,
}

/// Message priority per (config, code). Higher wins; unknown codes are 0.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MessagePriority {
    /// DCAS configuration identifier.
    pub config_id: u32,
    /// Advisory message code.
    pub code: u32,
    /// Priority value, higher wins.
    pub priority: i32,
}

/// Named weather-derived parameter evaluated by the rule engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Parameter {
    /// Mean temperature around the processing date.
    Temperature,
    /// Relative humidity around the processing date.
    Humidity,
    /// Precipitation over potential evapotranspiration.
    PPet,
    /// Rainfall accumulated since the current growth stage began.
    GrowthStagePrecipitation,
    /// Rainfall accumulated since planting.
    SeasonalPrecipitation,
}

impl Parameter {
    /// Returns the snake_case name used in configuration and logging.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Temperature => "temperature",
            Self::Humidity => "humidity",
            Self::PPet => "p_pet",
            Self::GrowthStagePrecipitation => "growth_stage_precipitation",
            Self::SeasonalPrecipitation => "seasonal_precipitation",
        }
    }
}

impl fmt::Display for Parameter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// An advisory rule: a parameter interval mapped to a message code.
///
/// The rule fires when the row's value for `parameter` lies in
/// `[min_range, max_range]`, both ends inclusive.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Rule {
    /// DCAS configuration identifier.
    pub config_id: u32,
    /// Crop identifier.
    pub crop_id: u32,
    /// Crop stage type identifier.
    pub crop_stage_type_id: u32,
    /// Growth stage the rule applies to.
    pub crop_growth_stage_id: u32,
    /// Parameter evaluated by the rule.
    pub parameter: Parameter,
    /// Inclusive lower bound.
    pub min_range: f64,
    /// Inclusive upper bound.
    pub max_range: f64,
    /// Message code emitted when the rule fires.
    pub code: u32,
}

/// Localized advisory message template.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MessageTemplate {
    /// Advisory message code.
    pub code: u32,
    /// English template text.
    pub template_en: String,
    /// Swahili template text, when available.
    pub template_sw: Option<String>,
}

/// All catalog tables needed by one run.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RunCatalogs {
    /// Crop catalog.
    pub crops: Vec<Crop>,
    /// Crop stage type catalog.
    pub crop_stage_types: Vec<CropStageType>,
    /// Growth stage catalog.
    pub growth_stages: Vec<GrowthStage>,
    /// GDD base/cap configuration rows.
    pub gdd_configs: Vec<GddConfig>,
    /// GDD matrix rows.
    pub gdd_matrix: Vec<GddMatrixEntry>,
    /// Advisory rules.
    pub rules: Vec<Rule>,
    /// Message priorities.
    pub priorities: Vec<MessagePriority>,
    /// Localized message templates.
    pub templates: Vec<MessageTemplate>,
    /// Country ISO A3 code to DCAS configuration id.
    pub country_configs: HashMap<String, u32>,
}

impl RunCatalogs {
    /// Returns the DCAS configuration id for a country.
    ///
    /// # Errors
    /// Missing mapping is fatal for the run.
    pub fn config_for_country(&self, iso_a3: &str) -> Result<u32> {
        self.country_configs
            .get(iso_a3)
            .copied()
            .ok_or_else(|| Error::Config(format!("no DCAS config mapped for country {iso_a3}")))
    }

    /// Returns a `growth_stage_id -> label` dictionary for the fan-out stage.
    #[must_use]
    pub fn growth_stage_labels(&self) -> HashMap<u32, String> {
        self.growth_stages
            .iter()
            .map(|stage| (stage.id, stage.label.clone()))
            .collect()
    }

    /// Returns the display label `"{crop}_{stage_type}"` for a registry row.
    #[must_use]
    pub fn crop_label(&self, crop_id: u32, crop_stage_type_id: u32) -> Option<String> {
        let crop = self.crops.iter().find(|c| c.id == crop_id)?;
        let stage_type = self
            .crop_stage_types
            .iter()
            .find(|s| s.id == crop_stage_type_id)?;
        Some(format!("{}_{}", crop.name, stage_type.name))
    }

    /// Returns the GDD base/cap pair for a (crop, stage type, config) key.
    ///
    /// # Errors
    /// A missing pair is fatal: the GDD accumulation cannot proceed.
    pub fn gdd_bounds(
        &self,
        crop_id: u32,
        crop_stage_type_id: u32,
        config_id: u32,
    ) -> Result<(f64, f64)> {
        self.gdd_configs
            .iter()
            .find(|c| {
                c.crop_id == crop_id
                    && c.crop_stage_type_id == crop_stage_type_id
                    && c.config_id == config_id
            })
            .map(|c| (c.base_temperature, c.cap_temperature))
            .ok_or_else(|| {
                Error::Config(format!(
                    "no GDD config for crop {crop_id} stage type {crop_stage_type_id} \
                     config {config_id}"
                ))
            })
    }
}
