//! Structured logging for training with tracing.

use std::time::Duration;

use tracing::{error, info, span, Level};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use crate::config::TrainConfig;
use crate::metrics::RankMetrics;

/// Initialize logging.
///
/// Reads log level from RUST_LOG (defaults to "info"). `json` switches to
/// JSON-formatted lines for log collectors.
pub fn init_logging(json: bool) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| "info,visdial_train=info".into());
    let registry = tracing_subscriber::registry().with(filter);
    if json {
        registry.with(tracing_subscriber::fmt::layer().json()).init();
    } else {
        registry.with(tracing_subscriber::fmt::layer()).init();
    }
}

/// Format elapsed wall time as `H:MM:SS`.
pub fn format_elapsed(elapsed: Duration) -> String {
    let secs = elapsed.as_secs();
    format!("{}:{:02}:{:02}", secs / 3600, (secs % 3600) / 60, secs % 60)
}

/// Print every option, one per line, name padded to a fixed column.
pub fn log_config(config: &TrainConfig) {
    match serde_json::to_value(config) {
        Ok(serde_json::Value::Object(fields)) => {
            for (name, value) in fields {
                info!("{:<20}: {}", name, value);
            }
        }
        Ok(other) => info!("config: {}", other),
        Err(e) => error!("could not serialize config: {}", e),
    }
}

/// One periodic progress line.
#[derive(Debug, Clone)]
pub struct StepReport {
    pub elapsed: Duration,
    pub epoch: usize,
    pub iteration: usize,
    pub running_loss: f64,
    pub lr: f64,
}

/// Log a training progress line with structured fields.
pub fn log_training_step(report: &StepReport) {
    let span = span!(Level::INFO, "training_step", iteration = report.iteration);
    let _enter = span.enter();

    if !report.running_loss.is_finite() {
        error!(
            loss = report.running_loss,
            iteration = report.iteration,
            "Training diverged! NaN or infinite loss detected"
        );
        return;
    }

    info!(
        epoch = report.epoch,
        iteration = report.iteration,
        loss = report.running_loss,
        lr = report.lr,
        "[{}][Epoch: {:3}][Iter: {:6}][Loss: {:.6}][lr: {:.7}]",
        format_elapsed(report.elapsed),
        report.epoch,
        report.iteration,
        report.running_loss,
        report.lr,
    );
}

/// Log checkpoint save event.
pub fn log_checkpoint_save(epoch: usize, path: &str, lr: f64) {
    info!(
        epoch = epoch,
        path = path,
        lr = lr,
        event = "checkpoint_saved",
        "Checkpoint saved successfully"
    );
}

/// Log retrieval metrics.
pub fn log_evaluation(split: &str, metrics: &RankMetrics) {
    info!(
        split = split,
        count = metrics.count,
        r1 = metrics.r1,
        r5 = metrics.r5,
        r10 = metrics.r10,
        mean_rank = metrics.mean_rank,
        mrr = metrics.mrr,
        event = "evaluation",
        "Evaluation completed"
    );
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_format_elapsed() {
        assert_eq!(format_elapsed(Duration::from_secs(0)), "0:00:00");
        assert_eq!(format_elapsed(Duration::from_secs(65)), "0:01:05");
        assert_eq!(format_elapsed(Duration::from_secs(3 * 3600 + 7)), "3:00:07");
    }

    #[test]
    fn test_logging_does_not_panic() {
        let report = StepReport {
            elapsed: Duration::from_secs(12),
            epoch: 1,
            iteration: 100,
            running_loss: 4.2,
            lr: 1e-3,
        };
        log_training_step(&report);
        log_training_step(&StepReport {
            running_loss: f64::NAN,
            ..report
        });
        log_config(&TrainConfig::tiny_cpu());
        log_checkpoint_save(2, "/tmp/model_epoch_2", 9.9e-4);
        log_evaluation("val", &RankMetrics::from_ranks(&[1, 3, 12]));
    }
}
