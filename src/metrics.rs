use std::{
    fmt,
    io::{IsTerminal, Write},
    time::{Duration, Instant},
};

use crate::config::{CLASSES, NUM_CLASSES};

// Loss and accuracy accumulated over the batches of one phase (training or testing) of an epoch.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct RunningStats {
    pub loss_sum: f64,
    pub batches: usize,
    pub correct: usize,
    pub total: usize,
}

impl RunningStats {
    pub fn update(&mut self, loss: f32, predictions: &[usize], labels: &[usize]) {
        self.loss_sum += f64::from(loss);
        self.batches += 1;
        self.total += labels.len();
        self.correct += predictions
            .iter()
            .zip(labels)
            .filter(|(prediction, label)| prediction == label)
            .count();
    }

    pub fn avg_loss(&self) -> f64 {
        if self.batches == 0 {
            0.0
        } else {
            self.loss_sum / self.batches as f64
        }
    }

    // Accuracy in percent.
    pub fn accuracy(&self) -> f64 {
        if self.total == 0 {
            0.0
        } else {
            100.0 * self.correct as f64 / self.total as f64
        }
    }

    pub fn summary(&self) -> String {
        format!(
            "Loss: {:.3} | Acc: {:.3}% ({}/{})",
            self.avg_loss(),
            self.accuracy(),
            self.correct,
            self.total
        )
    }
}

// Render a duration as its two most significant non-zero units out of days, hours, minutes,
// seconds and milliseconds, e.g. "1D2h", "3m20s", "450ms".
pub fn format_time(duration: Duration) -> String {
    let total_millis = duration.as_millis();
    let units = [
        (total_millis / 86_400_000, "D"),
        (total_millis / 3_600_000 % 24, "h"),
        (total_millis / 60_000 % 60, "m"),
        (total_millis / 1000 % 60, "s"),
        (total_millis % 1000, "ms"),
    ];

    let formatted: String = units
        .iter()
        .filter(|(value, _)| *value > 0)
        .take(2)
        .map(|(value, unit)| format!("{value}{unit}"))
        .collect();

    if formatted.is_empty() {
        "0ms".to_string()
    } else {
        formatted
    }
}

const BAR_LENGTH: usize = 40;

// One-line terminal progress indicator, redrawn in place for every batch. Nothing is drawn when
// stderr is not a terminal.
pub struct ProgressBar {
    total: usize,
    started: Instant,
    last_step: Instant,
    enabled: bool,
}

impl ProgressBar {
    pub fn new(total: usize) -> ProgressBar {
        let now = Instant::now();
        ProgressBar {
            total,
            started: now,
            last_step: now,
            enabled: std::io::stderr().is_terminal(),
        }
    }

    pub fn update(&mut self, current: usize, message: &str) {
        let now = Instant::now();
        let step = now - self.last_step;
        self.last_step = now;
        if !self.enabled {
            return;
        }

        let line = render_bar(current, self.total, step, now - self.started, message);
        let mut stderr = std::io::stderr().lock();
        // A failed write to the terminal only loses a progress line.
        let _ = write!(stderr, "\r{line}");
        if current + 1 >= self.total {
            let _ = writeln!(stderr);
        }
        let _ = stderr.flush();
    }
}

pub fn render_bar(
    current: usize,
    total: usize,
    step: Duration,
    elapsed: Duration,
    message: &str,
) -> String {
    let filled = if total == 0 {
        BAR_LENGTH
    } else {
        BAR_LENGTH * (current + 1).min(total) / total
    };
    let rest = BAR_LENGTH - filled;
    format!(
        "[{}>{}] Step: {} | Tot: {} | {} {}/{}",
        "=".repeat(filled.saturating_sub(1)),
        ".".repeat(rest),
        format_time(step),
        format_time(elapsed),
        message,
        current + 1,
        total
    )
}

// Per-class accuracy over a full evaluation.
#[derive(Debug, Clone, PartialEq)]
pub struct ClassReport {
    correct: [usize; NUM_CLASSES],
    total: [usize; NUM_CLASSES],
}

impl ClassReport {
    pub fn from_predictions(predictions: &[usize], labels: &[usize]) -> ClassReport {
        let mut correct = [0; NUM_CLASSES];
        let mut total = [0; NUM_CLASSES];
        for (&prediction, &label) in predictions.iter().zip(labels) {
            total[label] += 1;
            if prediction == label {
                correct[label] += 1;
            }
        }
        ClassReport { correct, total }
    }

    // Accuracy for one class in percent, or `None` when the class never occurred.
    pub fn accuracy(&self, class: usize) -> Option<f64> {
        let total = self.total[class];
        (total > 0).then(|| 100.0 * self.correct[class] as f64 / total as f64)
    }
}

impl fmt::Display for ClassReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (class, name) in CLASSES.iter().enumerate() {
            match self.accuracy(class) {
                Some(accuracy) => writeln!(
                    f,
                    "Accuracy of {name:>5} : {accuracy:5.1}% ({}/{})",
                    self.correct[class], self.total[class]
                )?,
                None => writeln!(f, "Accuracy of {name:>5} :   n/a")?,
            }
        }
        Ok(())
    }
}
