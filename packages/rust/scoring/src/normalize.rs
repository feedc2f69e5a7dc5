//! Per-tool confidence normalization.
//!
//! A tool's native confidence is first mapped from its declared range onto
//! [0,1], then bent by the tool's curve so scores from different tools are
//! comparable.

use zoneflow_shared::{CurveConfig, ToolConfig};

#[derive(Debug, Clone, PartialEq)]
pub struct Normalizer {
    min: f64,
    max: f64,
    curve: CurveConfig,
}

impl Default for Normalizer {
    fn default() -> Self {
        Self::linear()
    }
}

impl Normalizer {
    /// Identity over [0,1].
    pub fn linear() -> Self {
        Self {
            min: 0.0,
            max: 1.0,
            curve: CurveConfig::Linear,
        }
    }

    pub fn new(range: [f64; 2], curve: CurveConfig) -> Self {
        Self {
            min: range[0],
            max: range[1],
            curve,
        }
    }

    pub fn from_tool(tool: &ToolConfig) -> Self {
        Self::new(tool.confidence_range, tool.curve.clone())
    }

    /// Map a native value onto [0,1] without applying the curve.
    pub fn to_unit(&self, raw: f64) -> f64 {
        let span = self.max - self.min;
        if !raw.is_finite() || span <= 0.0 {
            return 0.0;
        }
        ((raw - self.min) / span).clamp(0.0, 1.0)
    }

    /// Full normalization: range mapping followed by the curve.
    pub fn normalize(&self, raw: f64) -> f64 {
        let x = self.to_unit(raw);
        let y = match &self.curve {
            CurveConfig::Linear => x,
            CurveConfig::Power { exponent } => x.powf(*exponent),
            CurveConfig::Logistic {
                midpoint,
                steepness,
            } => logistic(x, *midpoint, *steepness),
            CurveConfig::Piecewise { points } => piecewise(x, points),
        };
        if y.is_finite() { y.clamp(0.0, 1.0) } else { 0.0 }
    }
}

/// Logistic curve rescaled so that 0 maps to 0 and 1 maps to 1.
fn logistic(x: f64, midpoint: f64, steepness: f64) -> f64 {
    let f = |v: f64| 1.0 / (1.0 + (-steepness * (v - midpoint)).exp());
    let (lo, hi) = (f(0.0), f(1.0));
    if hi - lo <= f64::EPSILON {
        return x;
    }
    (f(x) - lo) / (hi - lo)
}

/// Linear interpolation between monotone control points; flat outside them.
fn piecewise(x: f64, points: &[[f64; 2]]) -> f64 {
    let (Some(first), Some(last)) = (points.first(), points.last()) else {
        return x;
    };
    if x <= first[0] {
        return first[1];
    }
    if x >= last[0] {
        return last[1];
    }
    for w in points.windows(2) {
        let ([x0, y0], [x1, y1]) = (w[0], w[1]);
        if x <= x1 {
            let t = (x - x0) / (x1 - x0);
            return y0 + t * (y1 - y0);
        }
    }
    last[1]
}
