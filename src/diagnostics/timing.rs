use serde::{Deserialize, Serialize};
use std::time::Instant;

/// Timed phase of a fit.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "camelCase")]
pub enum Stage {
    /// One E-step plus M-step, 1-based.
    EmIteration { index: usize },
    /// The joint rounds of the layered refinement, IDF and blending included.
    Layers,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StageTiming {
    pub stage: Stage,
    pub elapsed_ms: f64,
}

/// Wall-clock trace of a fit: one entry per EM iteration, then the layers.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TimingBreakdown {
    pub total_ms: f64,
    pub stages: Vec<StageTiming>,
}

impl TimingBreakdown {
    /// Records the time elapsed since `start` for `stage`.
    pub fn record_since(&mut self, stage: Stage, start: Instant) {
        self.stages.push(StageTiming {
            stage,
            elapsed_ms: elapsed_ms(start),
        });
    }

    /// Time spent in EM iterations.
    pub fn em_ms(&self) -> f64 {
        self.stages
            .iter()
            .filter(|s| matches!(s.stage, Stage::EmIteration { .. }))
            .map(|s| s.elapsed_ms)
            .sum()
    }

    pub fn layers_ms(&self) -> Option<f64> {
        self.stages
            .iter()
            .find(|s| s.stage == Stage::Layers)
            .map(|s| s.elapsed_ms)
    }

    /// Slowest EM iteration as `(index, ms)`.
    pub fn slowest_iteration(&self) -> Option<(usize, f64)> {
        self.stages
            .iter()
            .filter_map(|s| match s.stage {
                Stage::EmIteration { index } => Some((index, s.elapsed_ms)),
                Stage::Layers => None,
            })
            .fold(None, |best, cur| match best {
                Some((_, ms)) if ms >= cur.1 => best,
                _ => Some(cur),
            })
    }
}

pub(crate) fn elapsed_ms(start: Instant) -> f64 {
    start.elapsed().as_secs_f64() * 1000.0
}
