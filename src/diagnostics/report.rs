use super::timing::TimingBreakdown;
use crate::params::BackendKind;
use serde::{Deserialize, Serialize};

/// Summary of one `fit` call.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FitReport {
    pub backend: BackendKind,
    pub documents: usize,
    pub vocab: usize,
    pub cells: usize,
    pub iterations: usize,
    pub layers: usize,
    pub pseudocounts: f64,
    /// Sum of squared differences between consecutive emission tensors, one
    /// entry per iteration. Empty unless change tracking was requested.
    #[serde(skip_serializing_if = "Vec::is_empty", default)]
    pub pi_ssd: Vec<f64>,
    pub timing: TimingBreakdown,
}

impl FitReport {
    /// Last recorded π change, if tracking was on.
    pub fn final_pi_change(&self) -> Option<f64> {
        self.pi_ssd.last().copied()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn report(pi_ssd: Vec<f64>) -> FitReport {
        FitReport {
            backend: BackendKind::Dense,
            documents: 4,
            vocab: 3,
            cells: 9,
            iterations: pi_ssd.len(),
            layers: 1,
            pseudocounts: 0.5,
            pi_ssd,
            timing: TimingBreakdown::default(),
        }
    }

    #[test]
    fn final_change_is_the_last_iteration() {
        assert_eq!(report(vec![0.4, 0.1, 0.02]).final_pi_change(), Some(0.02));
        assert_eq!(report(Vec::new()).final_pi_change(), None);
    }

    #[test]
    fn untracked_change_is_left_out_of_json() {
        let json = serde_json::to_string(&report(Vec::new())).unwrap();
        assert!(!json.contains("piSsd"));
        let back: FitReport = serde_json::from_str(&json).unwrap();
        assert!(back.pi_ssd.is_empty());
    }
}
