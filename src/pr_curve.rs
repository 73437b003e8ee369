use serde::{Deserialize, Serialize};

pub const DEFAULT_NUM_THRESHOLDS: usize = 127;

// Precision/recall of a one-vs-rest classifier swept over evenly spaced probability thresholds.
// Entry `i` of every vector belongs to threshold `i / (num_thresholds - 1)`; a prediction counts
// as positive when its probability is at least the threshold.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PrCurve {
    pub thresholds: Vec<f32>,
    pub true_positives: Vec<usize>,
    pub false_positives: Vec<usize>,
    pub true_negatives: Vec<usize>,
    pub false_negatives: Vec<usize>,
    pub precision: Vec<f64>,
    pub recall: Vec<f64>,
}

impl PrCurve {
    pub fn compute(labels: &[bool], probs: &[f32], num_thresholds: usize) -> PrCurve {
        assert_eq!(labels.len(), probs.len(), "one label per probability");
        let num_thresholds = num_thresholds.max(2);

        let thresholds: Vec<f32> = (0..num_thresholds)
            .map(|i| i as f32 / (num_thresholds - 1) as f32)
            .collect();

        let mut curve = PrCurve {
            thresholds: Vec::with_capacity(num_thresholds),
            true_positives: Vec::with_capacity(num_thresholds),
            false_positives: Vec::with_capacity(num_thresholds),
            true_negatives: Vec::with_capacity(num_thresholds),
            false_negatives: Vec::with_capacity(num_thresholds),
            precision: Vec::with_capacity(num_thresholds),
            recall: Vec::with_capacity(num_thresholds),
        };

        for threshold in thresholds {
            let (mut tp, mut fp, mut tn, mut fn_) = (0, 0, 0, 0);
            for (&label, &prob) in labels.iter().zip(probs) {
                match (prob >= threshold, label) {
                    (true, true) => tp += 1,
                    (true, false) => fp += 1,
                    (false, false) => tn += 1,
                    (false, true) => fn_ += 1,
                }
            }
            curve.thresholds.push(threshold);
            curve.true_positives.push(tp);
            curve.false_positives.push(fp);
            curve.true_negatives.push(tn);
            curve.false_negatives.push(fn_);
            curve.precision.push(tp as f64 / (tp + fp).max(1) as f64);
            curve.recall.push(tp as f64 / (tp + fn_).max(1) as f64);
        }
        curve
    }

    // Sum of precision weighted by each drop in recall as the threshold rises. Recall never
    // increases along the curve, and after the last threshold it is taken to be zero.
    pub fn average_precision(&self) -> f64 {
        (0..self.recall.len())
            .map(|i| {
                let next_recall = self.recall.get(i + 1).copied().unwrap_or(0.0);
                (self.recall[i] - next_recall) * self.precision[i]
            })
            .sum()
    }
}
