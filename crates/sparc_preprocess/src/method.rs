//! Background correction methods and their resolved parameters.

use std::fmt;
use std::str::FromStr;

use ndarray::{Array2, ArrayView2, Zip};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::adaptive::local_threshold;
use crate::engine::CorrectedPlane;
use crate::error::PreprocessError;
use crate::morphology::{grey_opening_disk, rolling_ball};
use crate::polynomial::polynomial_surface;

pub const DEFAULT_ROLLING_BALL_RADIUS: i64 = 50;
pub const DEFAULT_POLYNOMIAL_ORDER: i64 = 2;
pub const MIN_POLYNOMIAL_ORDER: i64 = 1;
pub const MAX_POLYNOMIAL_ORDER: i64 = 5;
pub const DEFAULT_OPENING_RADIUS: i64 = 15;
pub const DEFAULT_BLOCK_SIZE: i64 = 35;

/// Registered background correction methods.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackgroundMethod {
    /// Rolling-ball background estimate.
    Basic,
    /// Global polynomial surface fit.
    Polynomial,
    /// Grayscale opening with a disk footprint.
    Morphological,
    /// Local (block) threshold surface.
    Adaptive,
}

impl BackgroundMethod {
    pub const ALL: [BackgroundMethod; 4] = [
        BackgroundMethod::Basic,
        BackgroundMethod::Polynomial,
        BackgroundMethod::Morphological,
        BackgroundMethod::Adaptive,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            BackgroundMethod::Basic => "basic",
            BackgroundMethod::Polynomial => "polynomial",
            BackgroundMethod::Morphological => "morphological",
            BackgroundMethod::Adaptive => "adaptive",
        }
    }
}

impl fmt::Display for BackgroundMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for BackgroundMethod {
    type Err = PreprocessError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        BackgroundMethod::ALL
            .into_iter()
            .find(|m| m.as_str() == s)
            .ok_or_else(|| PreprocessError::UnknownMethod(s.to_string()))
    }
}

/// Weighting used by the adaptive local threshold.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LocalWeighting {
    #[default]
    Gaussian,
    Mean,
}

impl LocalWeighting {
    pub fn as_str(&self) -> &'static str {
        match self {
            LocalWeighting::Gaussian => "gaussian",
            LocalWeighting::Mean => "mean",
        }
    }

    fn parse(value: &str) -> Option<Self> {
        match value {
            "gaussian" => Some(LocalWeighting::Gaussian),
            "mean" => Some(LocalWeighting::Mean),
            _ => None,
        }
    }
}

/// Fully resolved parameters for one method run.
///
/// Construction applies the method's defaults and clamps, so any value
/// here can be executed directly.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum MethodParams {
    Basic { radius: usize },
    Polynomial { order: usize },
    Morphological { radius: usize },
    Adaptive { block_size: usize, offset: f64, weighting: LocalWeighting },
}

/// Integer view of a JSON parameter, truncating toward zero.
fn integer(values: &Map<String, Value>, key: &str) -> Option<i64> {
    let value = values.get(key)?;
    let number = match value {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse::<f64>().ok(),
        _ => None,
    }?;
    number.is_finite().then(|| number.trunc() as i64)
}

fn float(values: &Map<String, Value>, key: &str) -> Option<f64> {
    match values.get(key)? {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse::<f64>().ok(),
        _ => None,
    }
}

impl MethodParams {
    pub fn defaults(method: BackgroundMethod) -> Self {
        Self::from_values(method, &Map::new())
    }

    /// Resolve `values` for `method`. Missing or unusable values fall back
    /// to defaults; out-of-range values are clamped.
    pub fn from_values(method: BackgroundMethod, values: &Map<String, Value>) -> Self {
        match method {
            BackgroundMethod::Basic => {
                let radius = integer(values, "rolling_ball_radius").unwrap_or(DEFAULT_ROLLING_BALL_RADIUS);
                MethodParams::Basic {
                    radius: radius.max(1) as usize,
                }
            }
            BackgroundMethod::Polynomial => {
                let order = integer(values, "order").unwrap_or(DEFAULT_POLYNOMIAL_ORDER);
                MethodParams::Polynomial {
                    order: order.clamp(MIN_POLYNOMIAL_ORDER, MAX_POLYNOMIAL_ORDER) as usize,
                }
            }
            BackgroundMethod::Morphological => {
                let radius = integer(values, "opening_radius").unwrap_or(DEFAULT_OPENING_RADIUS);
                MethodParams::Morphological {
                    radius: radius.max(1) as usize,
                }
            }
            BackgroundMethod::Adaptive => {
                let mut block_size = integer(values, "block_size").unwrap_or(DEFAULT_BLOCK_SIZE).max(1);
                if block_size % 2 == 0 {
                    block_size += 1;
                }
                let offset = float(values, "offset").filter(|v| v.is_finite()).unwrap_or(0.0);
                let weighting = values
                    .get("method")
                    .and_then(Value::as_str)
                    .and_then(LocalWeighting::parse)
                    .unwrap_or_default();
                MethodParams::Adaptive {
                    block_size: block_size as usize,
                    offset,
                    weighting,
                }
            }
        }
    }

    pub fn method(&self) -> BackgroundMethod {
        match self {
            MethodParams::Basic { .. } => BackgroundMethod::Basic,
            MethodParams::Polynomial { .. } => BackgroundMethod::Polynomial,
            MethodParams::Morphological { .. } => BackgroundMethod::Morphological,
            MethodParams::Adaptive { .. } => BackgroundMethod::Adaptive,
        }
    }

    /// The effective parameters as a JSON object, for result metadata.
    pub fn to_values(&self) -> Map<String, Value> {
        let mut map = Map::new();
        match *self {
            MethodParams::Basic { radius } => {
                map.insert("rolling_ball_radius".into(), radius.into());
            }
            MethodParams::Polynomial { order } => {
                map.insert("order".into(), order.into());
            }
            MethodParams::Morphological { radius } => {
                map.insert("opening_radius".into(), radius.into());
            }
            MethodParams::Adaptive {
                block_size,
                offset,
                weighting,
            } => {
                map.insert("block_size".into(), block_size.into());
                map.insert("offset".into(), offset.into());
                map.insert("method".into(), weighting.as_str().into());
            }
        }
        map
    }

    /// Background surface for one 2-D plane.
    pub fn estimate_background(&self, plane: ArrayView2<f64>) -> Array2<f64> {
        match *self {
            MethodParams::Basic { radius } => rolling_ball(plane, radius),
            MethodParams::Polynomial { order } => polynomial_surface(plane, order),
            MethodParams::Morphological { radius } => grey_opening_disk(plane, radius),
            MethodParams::Adaptive {
                block_size,
                offset,
                weighting,
            } => local_threshold(plane, block_size, offset, weighting),
        }
    }

    /// Background plus `max(plane - background, 0)`.
    pub fn correct_plane(&self, plane: ArrayView2<f64>) -> CorrectedPlane {
        let background = self.estimate_background(plane);
        let mut corrected = Array2::<f64>::zeros(plane.raw_dim());
        Zip::from(&mut corrected)
            .and(plane)
            .and(&background)
            .for_each(|c, &raw, &bg| {
                let diff = raw - bg;
                *c = if diff < 0.0 { 0.0 } else { diff };
            });
        CorrectedPlane {
            background,
            corrected,
        }
    }
}
