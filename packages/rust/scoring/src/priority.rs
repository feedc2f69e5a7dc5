//! Zone priority scoring.
//!
//! [`PriorityCalculator::priority`] maps a zone's scheduling inputs onto a
//! single value in [0,1]. The combination rule is a [`PriorityStrategy`] so a
//! different scorer can be swapped in without touching the queue or controller.

use zoneflow_shared::{PriorityConfig, PriorityStrategyKind, PriorityWeights};

/// Floor applied to factors before a geometric mean so a single zero does not
/// erase every other input.
const GEOMETRIC_FLOOR: f64 = 0.01;

/// Scheduling inputs for one zone. Every field is expected in [0,1].
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PriorityInputs {
    /// 0 = simple text, 1 = complex diagram.
    pub complexity: f64,
    /// Free capacity for the zone's assigned tool.
    pub availability: f64,
    /// User-assigned priority (0.5 when unset).
    pub user_priority: f64,
    /// How much other work blocks on this zone.
    pub dependency_weight: f64,
    /// Expected duration relative to the slowest known tool (1 = slowest).
    pub time_estimate: f64,
}

impl PriorityInputs {
    fn clamped(&self) -> Self {
        let c = |v: f64| if v.is_finite() { v.clamp(0.0, 1.0) } else { 0.0 };
        Self {
            complexity: c(self.complexity),
            availability: c(self.availability),
            user_priority: c(self.user_priority),
            dependency_weight: c(self.dependency_weight),
            time_estimate: c(self.time_estimate),
        }
    }

    /// Terms in the order of [`PriorityWeights`]. Short jobs rank higher, so the
    /// time term is inverted.
    fn terms(&self) -> [f64; 5] {
        [
            self.complexity,
            self.availability,
            self.user_priority,
            self.dependency_weight,
            1.0 - self.time_estimate,
        ]
    }
}

fn weight_array(w: &PriorityWeights) -> [f64; 5] {
    [w.complexity, w.availability, w.user, w.dependency, w.time]
}

// ---------------------------------------------------------------------------
// Strategies
// ---------------------------------------------------------------------------

/// Combines clamped inputs into a priority.
pub trait PriorityStrategy: Send + Sync {
    /// Name used in logs.
    fn name(&self) -> &'static str;

    /// Score already-clamped inputs. The result is clamped by the caller.
    fn score(&self, inputs: &PriorityInputs) -> f64;
}

/// `Σ weight × term`.
#[derive(Debug, Clone)]
pub struct WeightedSum {
    weights: PriorityWeights,
}

impl WeightedSum {
    pub fn new(weights: PriorityWeights) -> Self {
        Self { weights }
    }
}

impl PriorityStrategy for WeightedSum {
    fn name(&self) -> &'static str {
        "weighted_sum"
    }

    fn score(&self, inputs: &PriorityInputs) -> f64 {
        weight_array(&self.weights)
            .iter()
            .zip(inputs.terms())
            .map(|(w, t)| w * t)
            .sum()
    }
}

/// Weighted geometric mean `Π term^weight`: one weak term drags the whole
/// score down instead of being averaged away.
#[derive(Debug, Clone)]
pub struct Multiplicative {
    weights: PriorityWeights,
}

impl Multiplicative {
    pub fn new(weights: PriorityWeights) -> Self {
        Self { weights }
    }
}

impl PriorityStrategy for Multiplicative {
    fn name(&self) -> &'static str {
        "multiplicative"
    }

    fn score(&self, inputs: &PriorityInputs) -> f64 {
        weight_array(&self.weights)
            .iter()
            .zip(inputs.terms())
            .map(|(w, t)| t.max(GEOMETRIC_FLOOR).powf(*w))
            .product()
    }
}

// ---------------------------------------------------------------------------
// Calculator
// ---------------------------------------------------------------------------

/// Stateless priority calculator.
pub struct PriorityCalculator {
    strategy: Box<dyn PriorityStrategy>,
    dependency_saturation: u32,
}

impl PriorityCalculator {
    pub fn from_config(config: &PriorityConfig) -> Self {
        let strategy: Box<dyn PriorityStrategy> = match config.strategy {
            PriorityStrategyKind::WeightedSum => Box::new(WeightedSum::new(config.weights)),
            PriorityStrategyKind::Multiplicative => Box::new(Multiplicative::new(config.weights)),
        };
        Self::with_strategy(strategy, config.dependency_saturation)
    }

    pub fn with_strategy(strategy: Box<dyn PriorityStrategy>, dependency_saturation: u32) -> Self {
        Self {
            strategy,
            dependency_saturation: dependency_saturation.max(1),
        }
    }

    pub fn strategy_name(&self) -> &'static str {
        self.strategy.name()
    }

    /// Priority in [0,1]. Pure; safe to call concurrently.
    pub fn priority(&self, inputs: &PriorityInputs) -> f64 {
        let score = self.strategy.score(&inputs.clamped());
        if score.is_finite() {
            score.clamp(0.0, 1.0)
        } else {
            0.0
        }
    }

    /// Dependency weight for a zone that `dependents` other zones wait on:
    /// proportional to fan-out, saturating at 1.
    pub fn dependency_weight(&self, dependents: usize) -> f64 {
        (dependents as f64 / self.dependency_saturation as f64).min(1.0)
    }
}

/// Normalize an expected duration against the slowest known one.
pub fn normalize_time(expected_secs: f64, slowest_secs: f64) -> f64 {
    if slowest_secs <= 0.0 || !expected_secs.is_finite() {
        return 0.0;
    }
    (expected_secs / slowest_secs).clamp(0.0, 1.0)
}
