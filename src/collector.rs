//! Folds classified log lines into the metric registry
//!
//! One `LogCollector` is shared by every per-instance tail task. Each task
//! pulls lines from its own [`LogSource`], classifies them, and applies the
//! result synchronously; the underlying vecs handle the concurrent updates.

use std::sync::Arc;

use log::{error, info};
use prometheus::HistogramVec;
use tokio::sync::watch;

use crate::classify::classify;
use crate::core::{Classification, Delay, LogEvent, LogSource, Outcome};
use crate::registry::LogMetrics;

pub struct LogCollector {
    metrics: Arc<LogMetrics>,
    log_unsupported: bool,
}

impl LogCollector {
    pub fn new(metrics: Arc<LogMetrics>, log_unsupported: bool) -> Self {
        Self {
            metrics,
            log_unsupported,
        }
    }

    /// Classifies one raw line and folds the result into the registry.
    pub fn collect_line(&self, instance: &str, line: &str) {
        let classification = classify(instance, line);
        self.record(instance, line, classification);
    }

    fn record(&self, instance: &str, line: &str, classification: Classification) {
        match classification.outcome {
            // A sibling instance's line. Not ours to count.
            Outcome::Foreign => {}
            Outcome::Unsupported => {
                if self.log_unsupported {
                    info!("unsupported line: {}", line);
                }
                self.metrics
                    .unsupported_log_entries
                    .with_label_values(&[instance, &classification.subprocess])
                    .inc();
            }
            Outcome::Event(event) => self.apply(instance, event),
        }
    }

    fn apply(&self, instance: &str, event: LogEvent) {
        let m = &self.metrics;
        match event {
            LogEvent::CleanupProcessed => {
                m.cleanup_processes.with_label_values(&[instance]).inc();
            }
            LogEvent::CleanupRejected => {
                m.cleanup_rejects.with_label_values(&[instance]).inc();
            }
            LogEvent::LmtpDelivery { delays } => {
                observe_delays(&m.lmtp_delays, &[instance], &delays);
            }
            LogEvent::PipeDelivery { relay, delays } => {
                observe_delays(&m.pipe_delays, &[instance, &relay], &delays);
            }
            LogEvent::QmgrInserted { size, nrcpt } => {
                m.qmgr_inserts_size
                    .with_label_values(&[instance])
                    .observe(size);
                m.qmgr_inserts_nrcpt
                    .with_label_values(&[instance])
                    .observe(nrcpt);
            }
            LogEvent::QmgrRemoved => {
                m.qmgr_removes.with_label_values(&[instance]).inc();
            }
            LogEvent::SmtpDelivery { delays, status } => {
                observe_delays(&m.smtp_delays, &[instance], &delays);
                if status.as_deref() == Some("deferred") {
                    m.smtp_status_deferred.with_label_values(&[instance]).inc();
                }
            }
            LogEvent::SmtpTlsConnect(tls) => {
                let tls_labels = tls.label_values();
                let mut labels = vec![instance];
                labels.extend_from_slice(&tls_labels);
                m.smtp_tls_connects.with_label_values(&labels).inc();
            }
            LogEvent::SmtpConnectionTimedOut => {
                m.smtp_connection_timed_out
                    .with_label_values(&[instance])
                    .inc();
            }
            LogEvent::SmtpdConnect => {
                m.smtpd_connects.with_label_values(&[instance]).inc();
            }
            LogEvent::SmtpdDisconnect => {
                m.smtpd_disconnects.with_label_values(&[instance]).inc();
            }
            LogEvent::SmtpdFcrdnsError => {
                m.smtpd_fcrdns_errors.with_label_values(&[instance]).inc();
            }
            LogEvent::SmtpdLostConnection { after_stage } => {
                m.smtpd_lost_connections
                    .with_label_values(&[instance, &after_stage])
                    .inc();
            }
            LogEvent::SmtpdProcessed { sasl_method } => {
                m.smtpd_processes
                    .with_label_values(&[instance, sasl_method.as_deref().unwrap_or("")])
                    .inc();
            }
            LogEvent::SmtpdRejected { code } => {
                m.smtpd_rejects.with_label_values(&[instance, &code]).inc();
            }
            LogEvent::SmtpdSaslAuthFailed => {
                m.smtpd_sasl_auth_failures
                    .with_label_values(&[instance])
                    .inc();
            }
            LogEvent::SmtpdTlsConnect(tls) => {
                let tls_labels = tls.label_values();
                let mut labels = vec![instance];
                labels.extend_from_slice(&tls_labels);
                m.smtpd_tls_connects.with_label_values(&labels).inc();
            }
        }
    }

    /// Continuously pulls lines from `source` on behalf of `instance` until
    /// the source ends, fails, or shutdown is signalled.
    ///
    /// The `up` gauge for this instance/path is set on every successfully
    /// read line and forced back to 0 on every exit path, including
    /// cancellation mid-read.
    pub async fn run(
        &self,
        instance: String,
        mut source: Box<dyn LogSource>,
        mut shutdown_rx: watch::Receiver<bool>,
    ) {
        let path = source.path();
        let up = self.metrics.up.with_label_values(&[&instance, &path]);
        let _guard = UpGuard(up.clone());

        info!("collecting logs for instance {} from {}", instance, path);
        loop {
            tokio::select! {
                biased;
                _ = shutdown_rx.changed() => {
                    info!("log collection for {} received shutdown signal", instance);
                    break;
                }
                line = source.read_line() => match line {
                    Ok(Some(line)) => {
                        self.collect_line(&instance, &line);
                        up.set(1.0);
                    }
                    Ok(None) => {
                        info!("log source {} reached end of stream", path);
                        break;
                    }
                    Err(err) => {
                        error!("couldn't read {}: {}", path, err);
                        break;
                    }
                }
            }
        }
    }
}

/// Zeroes the `up` gauge when the collection loop unwinds, however it
/// unwinds.
struct UpGuard(prometheus::Gauge);

impl Drop for UpGuard {
    fn drop(&mut self) {
        self.0.set(0.0);
    }
}

fn observe_delays(histogram: &HistogramVec, labels: &[&str], delays: &Delay) {
    for (stage, value) in delays.stages() {
        let mut label_values = labels.to_vec();
        label_values.push(stage);
        histogram.with_label_values(&label_values).observe(value);
    }
}
