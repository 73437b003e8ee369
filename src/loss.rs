use ndarray::{Array2, ArrayView2, Axis};

// Row-wise softmax. Each row is shifted by its maximum first so large logits cannot overflow.
pub fn softmax(logits: ArrayView2<f32>) -> Array2<f32> {
    let mut probs = logits.to_owned();
    for mut row in probs.axis_iter_mut(Axis(0)) {
        let max = row.fold(f32::NEG_INFINITY, |acc, &x| acc.max(x));
        row.mapv_inplace(|x| (x - max).exp());
        let sum = row.sum();
        row.mapv_inplace(|x| x / sum);
    }
    probs
}

// Index of the largest logit in every row. Ties resolve to the lowest index.
pub fn argmax_rows(values: ArrayView2<f32>) -> Vec<usize> {
    values
        .axis_iter(Axis(0))
        .map(|row| {
            row.iter()
                .enumerate()
                .fold((0, f32::NEG_INFINITY), |best, (index, &value)| {
                    if value > best.1 { (index, value) } else { best }
                })
                .0
        })
        .collect()
}

// Softmax cross-entropy averaged over the batch.
#[derive(Debug, Default, Clone, Copy)]
pub struct CrossEntropyLoss;

impl CrossEntropyLoss {
    // Returns the mean loss and its gradient w.r.t. the logits, `(softmax - one_hot) / batch`.
    pub fn forward(&self, logits: ArrayView2<f32>, targets: &[usize]) -> (f32, Array2<f32>) {
        assert_eq!(logits.nrows(), targets.len(), "one target per row of logits");
        let batch = targets.len() as f32;
        let mut grad = softmax(logits);

        let mut loss = 0.0;
        for (mut row, &target) in grad.axis_iter_mut(Axis(0)).zip(targets) {
            // Clamp so a vanishing probability yields a large but finite loss.
            loss -= row[target].max(1e-12).ln();
            row[target] -= 1.0;
        }
        grad.mapv_inplace(|g| g / batch);

        (loss / batch, grad)
    }
}
