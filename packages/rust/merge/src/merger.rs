//! Result merger.
//!
//! Pairwise similarity decides between three outcomes:
//! - an agreeing pair whose merge quality clears the threshold yields a
//!   [`MergedResult`] built on the higher-confidence candidate;
//! - otherwise the configured policy applies (`best_single_tool`,
//!   `weighted_average` for tabular content, `consensus`);
//! - anything discarded or disagreeing is recorded as a [`Conflict`].

use tracing::debug;

use zoneflow_shared::{
    Conflict, ContentType, MergeCandidate, MergeConfig, MergePolicy, MergedResult, Result,
    ZoneflowError,
};

use crate::similarity::similarity;

/// What the merger decided for one zone.
#[derive(Debug, Clone, PartialEq)]
pub enum MergeOutcome {
    Merged(MergedResult),
    /// No acceptable merge; the best single attempt stands.
    Single {
        attempt_index: u32,
        tool: String,
        confidence: f64,
        policy: MergePolicy,
        conflicts: Vec<Conflict>,
    },
}

impl MergeOutcome {
    pub fn conflicts(&self) -> &[Conflict] {
        match self {
            Self::Merged(m) => &m.conflicts,
            Self::Single { conflicts, .. } => conflicts,
        }
    }

    pub fn confidence(&self) -> f64 {
        match self {
            Self::Merged(m) => m.confidence,
            Self::Single { confidence, .. } => *confidence,
        }
    }

    pub fn is_merged(&self) -> bool {
        matches!(self, Self::Merged(_))
    }
}

#[derive(Debug, Clone)]
pub struct ResultMerger {
    config: MergeConfig,
}

impl ResultMerger {
    pub fn new(config: MergeConfig) -> Self {
        Self { config }
    }

    pub fn agreement_threshold(&self) -> f64 {
        self.config.agreement_threshold
    }

    /// Reconcile two or more completed attempts.
    pub fn merge(
        &self,
        candidates: &[MergeCandidate],
        content_type: ContentType,
    ) -> Result<MergeOutcome> {
        if candidates.len() < 2 {
            return Err(ZoneflowError::validation(format!(
                "merge needs at least two candidates, got {}",
                candidates.len()
            )));
        }

        let policy = self.config.policy_for(content_type);
        let threshold = self.config.agreement_threshold;
        let sims = similarity_matrix(candidates);

        // Highest-similarity pair; first pair wins ties.
        let mut best_pair = (0, 1, f64::MIN);
        for i in 0..candidates.len() {
            for j in (i + 1)..candidates.len() {
                if sims[i][j] > best_pair.2 {
                    best_pair = (i, j, sims[i][j]);
                }
            }
        }
        let (i, j, best_sim) = best_pair;

        if best_sim >= threshold {
            let kept = if rank(&candidates[j], &candidates[i]) { j } else { i };
            let agreeing: Vec<usize> = (0..candidates.len())
                .filter(|&k| k == kept || sims[kept][k] >= threshold)
                .collect();

            let consensus_met = agreeing.len() >= self.config.consensus_min_agreeing as usize;
            if policy != MergePolicy::Consensus || consensus_met {
                let similarity = agreeing
                    .iter()
                    .filter(|&&k| k != kept)
                    .map(|&k| sims[kept][k])
                    .fold(1.0_f64, f64::min);
                let min_confidence = agreeing
                    .iter()
                    .map(|&k| candidates[k].confidence)
                    .fold(1.0_f64, f64::min);
                let merge_quality = (similarity * min_confidence).clamp(0.0, 1.0);

                if merge_quality >= self.config.quality_threshold {
                    let conflicts = (0..candidates.len())
                        .filter(|k| !agreeing.contains(k))
                        .map(|k| conflict(candidates, &sims, kept, k))
                        .collect::<Vec<_>>();
                    debug!(
                        kept = candidates[kept].attempt_index,
                        contributors = agreeing.len(),
                        merge_quality,
                        conflicts = conflicts.len(),
                        "candidates agree"
                    );
                    let confidence = candidates[kept].confidence;
                    return Ok(MergeOutcome::Merged(MergedResult {
                        content: candidates[kept].content.clone(),
                        confidence,
                        contributors: agreeing
                            .iter()
                            .map(|&k| candidates[k].attempt_index)
                            .collect(),
                        merge_quality,
                        policy: if policy == MergePolicy::Consensus {
                            MergePolicy::Consensus
                        } else {
                            MergePolicy::BestSingleTool
                        },
                        conflicts,
                    }));
                }
                debug!(merge_quality, "agreement below quality threshold");
            } else {
                debug!(
                    agreeing = agreeing.len(),
                    required = self.config.consensus_min_agreeing,
                    "consensus not reached"
                );
            }
        } else if policy == MergePolicy::WeightedAverage && content_type.is_numeric() {
            if let Some(merged) = self.weighted_average(candidates, &sims) {
                return Ok(MergeOutcome::Merged(merged));
            }
        }

        Ok(self.best_single(candidates, &sims, policy))
    }

    /// Highest final confidence wins; all disagreeing candidates become conflicts.
    fn best_single(
        &self,
        candidates: &[MergeCandidate],
        sims: &[Vec<f64>],
        policy: MergePolicy,
    ) -> MergeOutcome {
        let best = best_index(candidates);
        let conflicts = (0..candidates.len())
            .filter(|&k| k != best && sims[best][k] < self.config.agreement_threshold)
            .map(|k| conflict(candidates, sims, best, k))
            .collect();
        MergeOutcome::Single {
            attempt_index: candidates[best].attempt_index,
            tool: candidates[best].tool.clone(),
            confidence: candidates[best].confidence,
            policy,
            conflicts,
        }
    }

    /// Confidence-weighted mean of numeric cells across candidates that share
    /// the best candidate's table shape.
    fn weighted_average(
        &self,
        candidates: &[MergeCandidate],
        sims: &[Vec<f64>],
    ) -> Option<MergedResult> {
        let template_idx = best_index(candidates);
        let template = Grid::parse(&candidates[template_idx].content)?;

        let mut contributors = vec![(template_idx, template.clone())];
        for (k, c) in candidates.iter().enumerate() {
            if k == template_idx {
                continue;
            }
            if let Some(grid) = Grid::parse(&c.content).filter(|g| g.same_shape(&template)) {
                contributors.push((k, grid));
            }
        }
        if contributors.len() < 2 {
            return None;
        }

        let mut merged = template.clone();
        let mut averaged_cells = 0usize;
        for (r, row) in template.rows.iter().enumerate() {
            for c in 0..row.len() {
                let cells: Vec<(f64, &str, f64)> = contributors
                    .iter()
                    .filter_map(|(k, g)| {
                        let cell = g.rows[r][c].as_str();
                        cell.parse::<f64>()
                            .ok()
                            .map(|v| (v, cell, candidates[*k].confidence))
                    })
                    .collect();
                if cells.len() != contributors.len() {
                    continue;
                }
                let total: f64 = cells.iter().map(|(_, _, w)| w).sum();
                if total <= 0.0 {
                    continue;
                }
                let avg = cells.iter().map(|(v, _, w)| v * w).sum::<f64>() / total;
                let decimals = cells.iter().map(|(_, s, _)| decimal_places(s)).max().unwrap_or(0);
                merged.rows[r][c] = format!("{avg:.decimals$}");
                averaged_cells += 1;
            }
        }
        if averaged_cells == 0 {
            return None;
        }

        let others = &contributors[1..];
        let mean_similarity =
            others.iter().map(|(k, _)| sims[template_idx][*k]).sum::<f64>() / others.len() as f64;
        let min_confidence = contributors
            .iter()
            .map(|(k, _)| candidates[*k].confidence)
            .fold(1.0_f64, f64::min);
        let merge_quality = (mean_similarity * min_confidence).clamp(0.0, 1.0);
        if merge_quality < self.config.quality_threshold {
            debug!(merge_quality, "weighted average below quality threshold");
            return None;
        }

        let confidence = contributors
            .iter()
            .map(|(k, _)| candidates[*k].confidence)
            .sum::<f64>()
            / contributors.len() as f64;

        // Every other candidate disagreed with the template by construction.
        let conflicts = (0..candidates.len())
            .filter(|&k| k != template_idx)
            .map(|k| conflict(candidates, sims, template_idx, k))
            .collect();

        debug!(averaged_cells, merge_quality, "weighted average merge");
        Some(MergedResult {
            content: merged.render(),
            confidence: confidence.clamp(0.0, 1.0),
            contributors: contributors
                .iter()
                .map(|(k, _)| candidates[*k].attempt_index)
                .collect(),
            merge_quality,
            policy: MergePolicy::WeightedAverage,
            conflicts,
        })
    }
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

fn similarity_matrix(candidates: &[MergeCandidate]) -> Vec<Vec<f64>> {
    let n = candidates.len();
    let mut sims = vec![vec![1.0; n]; n];
    for i in 0..n {
        for j in (i + 1)..n {
            let s = similarity(&candidates[i].content, &candidates[j].content);
            sims[i][j] = s;
            sims[j][i] = s;
        }
    }
    sims
}

/// Whether `a` outranks `b`: higher confidence, then earlier attempt.
fn rank(a: &MergeCandidate, b: &MergeCandidate) -> bool {
    a.confidence > b.confidence
        || (a.confidence == b.confidence && a.attempt_index < b.attempt_index)
}

fn best_index(candidates: &[MergeCandidate]) -> usize {
    (1..candidates.len()).fold(0, |best, k| {
        if rank(&candidates[k], &candidates[best]) { k } else { best }
    })
}

fn conflict(candidates: &[MergeCandidate], sims: &[Vec<f64>], kept: usize, discarded: usize) -> Conflict {
    Conflict {
        kept: candidates[kept].attempt_index,
        discarded: candidates[discarded].attempt_index,
        kept_tool: candidates[kept].tool.clone(),
        discarded_tool: candidates[discarded].tool.clone(),
        similarity: sims[kept][discarded],
        discarded_content: candidates[discarded].content.clone(),
    }
}

fn decimal_places(s: &str) -> usize {
    s.split_once('.').map(|(_, frac)| frac.len()).unwrap_or(0)
}

/// Delimited table parsed into trimmed cells.
#[derive(Debug, Clone)]
struct Grid {
    sep: char,
    bordered: bool,
    rows: Vec<Vec<String>>,
}

impl Grid {
    fn parse(content: &str) -> Option<Self> {
        let lines: Vec<&str> = content.lines().map(str::trim).filter(|l| !l.is_empty()).collect();
        let first = lines.first()?;
        let sep = ['|', '\t', ','].into_iter().find(|c| first.contains(*c))?;
        let bordered = sep == '|' && first.starts_with('|') && first.ends_with('|');

        let rows = lines
            .iter()
            .map(|line| {
                let line = if bordered {
                    line.trim_start_matches('|').trim_end_matches('|')
                } else {
                    line
                };
                line.split(sep).map(|c| c.trim().to_string()).collect()
            })
            .collect();
        Some(Self {
            sep,
            bordered,
            rows,
        })
    }

    fn same_shape(&self, other: &Grid) -> bool {
        self.rows.len() == other.rows.len()
            && self
                .rows
                .iter()
                .zip(&other.rows)
                .all(|(a, b)| a.len() == b.len())
    }

    fn render(&self) -> String {
        let joiner = match self.sep {
            '|' => " | ".to_string(),
            other => other.to_string(),
        };
        self.rows
            .iter()
            .map(|row| {
                let line = row.join(&joiner);
                if self.bordered {
                    format!("| {line} |")
                } else {
                    line
                }
            })
            .collect::<Vec<_>>()
            .join("\n")
    }
}
