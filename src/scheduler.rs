// Reduce-on-plateau learning rate scheduling.

use crate::optim::Optimizer;

// Whether a larger or a smaller monitored value counts as progress.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PlateauMode {
    Min,
    Max,
}

// Reduce-on-plateau scheduler.
//
// Watches a metric once per epoch. When it has not improved for more than `patience` epochs the
// learning rate is multiplied by `factor`.
//
// Improvement is relative: in `Max` mode a value must exceed `best * (1 + threshold)`, in `Min`
// mode it must fall below `best * (1 - threshold)`.
#[derive(Debug, Clone)]
pub struct ReduceLrOnPlateau {
    mode: PlateauMode,
    factor: f32,
    patience: usize,
    threshold: f64,
    cooldown: usize,
    min_lr: f32,
    eps: f32,
    best: f64,
    num_bad_epochs: usize,
    cooldown_counter: usize,
}

impl ReduceLrOnPlateau {
    // Create a scheduler with factor 0.1, patience 10, threshold 1e-4 and no cooldown.
    pub fn new(mode: PlateauMode) -> Self {
        Self {
            mode,
            factor: 0.1,
            patience: 10,
            threshold: 1e-4,
            cooldown: 0,
            min_lr: 0.0,
            eps: 1e-8,
            best: match mode {
                PlateauMode::Min => f64::INFINITY,
                PlateauMode::Max => f64::NEG_INFINITY,
            },
            num_bad_epochs: 0,
            cooldown_counter: 0,
        }
    }

    pub fn with_factor(mut self, factor: f32) -> Self {
        self.factor = factor;
        self
    }

    pub fn with_patience(mut self, patience: usize) -> Self {
        self.patience = patience;
        self
    }

    pub fn with_threshold(mut self, threshold: f64) -> Self {
        self.threshold = threshold;
        self
    }

    pub fn with_cooldown(mut self, cooldown: usize) -> Self {
        self.cooldown = cooldown;
        self
    }

    pub fn with_min_lr(mut self, min_lr: f32) -> Self {
        self.min_lr = min_lr;
        self
    }

    pub fn best(&self) -> f64 {
        self.best
    }

    pub fn num_bad_epochs(&self) -> usize {
        self.num_bad_epochs
    }

    fn is_better(&self, value: f64) -> bool {
        match self.mode {
            PlateauMode::Min => value < self.best * (1.0 - self.threshold),
            PlateauMode::Max => value > self.best * (1.0 + self.threshold),
        }
    }

    // Feed one epoch's metric. Returns `true` when the optimizer's learning rate was lowered.
    pub fn step<O: Optimizer + ?Sized>(&mut self, metric: f64, optimizer: &mut O) -> bool {
        if self.is_better(metric) {
            self.best = metric;
            self.num_bad_epochs = 0;
        } else {
            self.num_bad_epochs += 1;
        }

        if self.cooldown_counter > 0 {
            self.cooldown_counter -= 1;
            self.num_bad_epochs = 0;
        }

        if self.num_bad_epochs > self.patience {
            self.cooldown_counter = self.cooldown;
            self.num_bad_epochs = 0;
            return self.reduce_lr(optimizer);
        }
        false
    }

    fn reduce_lr<O: Optimizer + ?Sized>(&self, optimizer: &mut O) -> bool {
        let old_lr = optimizer.lr();
        let new_lr = (old_lr * self.factor).max(self.min_lr);
        if old_lr - new_lr > self.eps {
            tracing::info!("reducing learning rate from {old_lr:.4e} to {new_lr:.4e}");
            optimizer.set_lr(new_lr);
            true
        } else {
            false
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::optim::Sgd;
    use approx::assert_abs_diff_eq;

    #[test]
    fn reduces_after_patience_is_exceeded() {
        let mut sgd = Sgd::new(0.1, 0.9, 0.0);
        let mut scheduler = ReduceLrOnPlateau::new(PlateauMode::Max).with_patience(2);

        assert!(!scheduler.step(50.0, &mut sgd));
        // Two stale epochs are tolerated.
        assert!(!scheduler.step(50.0, &mut sgd));
        assert!(!scheduler.step(49.0, &mut sgd));
        // The third one triggers the reduction.
        assert!(scheduler.step(50.0, &mut sgd));
        assert_abs_diff_eq!(sgd.lr(), 0.01, epsilon = 1e-7);
        assert_eq!(scheduler.num_bad_epochs(), 0);
    }

    #[test]
    fn improvement_resets_the_counter() {
        let mut sgd = Sgd::new(0.1, 0.0, 0.0);
        let mut scheduler = ReduceLrOnPlateau::new(PlateauMode::Max).with_patience(1);

        scheduler.step(10.0, &mut sgd);
        scheduler.step(10.0, &mut sgd);
        scheduler.step(20.0, &mut sgd);
        assert_eq!(scheduler.num_bad_epochs(), 0);
        assert_abs_diff_eq!(scheduler.best(), 20.0);
        assert_abs_diff_eq!(sgd.lr(), 0.1);
    }

    #[test]
    fn tiny_gains_below_threshold_do_not_count() {
        let mut sgd = Sgd::new(0.1, 0.0, 0.0);
        let mut scheduler = ReduceLrOnPlateau::new(PlateauMode::Max)
            .with_patience(0)
            .with_threshold(0.01);

        scheduler.step(100.0, &mut sgd);
        // 100.5 < 100 * 1.01, so this is a bad epoch and patience 0 reduces immediately.
        assert!(scheduler.step(100.5, &mut sgd));
    }

    #[test]
    fn min_mode_tracks_decreasing_metric() {
        let mut sgd = Sgd::new(1.0, 0.0, 0.0);
        let mut scheduler = ReduceLrOnPlateau::new(PlateauMode::Min)
            .with_patience(0)
            .with_factor(0.5);

        assert!(!scheduler.step(3.0, &mut sgd));
        assert!(!scheduler.step(2.0, &mut sgd));
        assert!(scheduler.step(2.5, &mut sgd));
        assert_abs_diff_eq!(sgd.lr(), 0.5);
    }

    #[test]
    fn cooldown_suppresses_bad_epochs() {
        let mut sgd = Sgd::new(1.0, 0.0, 0.0);
        let mut scheduler = ReduceLrOnPlateau::new(PlateauMode::Max)
            .with_patience(0)
            .with_cooldown(2);

        scheduler.step(1.0, &mut sgd);
        assert!(scheduler.step(1.0, &mut sgd));
        // Two cooldown epochs swallow the stale metric.
        assert!(!scheduler.step(1.0, &mut sgd));
        assert!(!scheduler.step(1.0, &mut sgd));
        assert!(scheduler.step(1.0, &mut sgd));
        assert_abs_diff_eq!(sgd.lr(), 0.01, epsilon = 1e-7);
    }

    #[test]
    fn respects_min_lr() {
        let mut sgd = Sgd::new(0.001, 0.0, 0.0);
        let mut scheduler = ReduceLrOnPlateau::new(PlateauMode::Max)
            .with_patience(0)
            .with_min_lr(0.001);

        scheduler.step(1.0, &mut sgd);
        assert!(!scheduler.step(1.0, &mut sgd));
        assert_abs_diff_eq!(sgd.lr(), 0.001);
    }
}
