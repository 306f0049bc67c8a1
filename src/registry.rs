//! Persistent metric families derived from log lines
//!
//! All families live in one `prometheus::Registry`, share the `postfix`
//! namespace, and carry the monitored instance name as their first label.
//! Registration is the usual block of boilerplate; the interesting part is
//! the fixed bucket sets, which are chosen to cover mail-queue time scales
//! (milliseconds through two days) and message sizes (kilobytes through a
//! gigabyte).

use prometheus::{CounterVec, GaugeVec, HistogramOpts, HistogramVec, Opts, Registry};

pub const NAMESPACE: &str = "postfix";

/// Buckets for delay measurements, in seconds: 1ms up to 2 days.
pub const TIME_BUCKETS: &[f64] = &[
    1e-3,
    1e-2,
    1e-1,
    1.0,
    10.0,
    60.0,
    60.0 * 60.0,
    24.0 * 60.0 * 60.0,
    2.0 * 24.0 * 60.0 * 60.0,
];

/// Buckets for message sizes, in bytes.
pub const SIZE_BUCKETS: &[f64] = &[1e3, 1e4, 1e5, 1e6, 1e7, 1e8, 1e9];

/// Buckets for recipients-per-message counts.
pub const NRCPT_BUCKETS: &[f64] = &[1.0, 2.0, 4.0, 8.0, 16.0, 32.0, 64.0, 128.0];

/// Buckets for queued-message ages, in seconds.
pub const AGE_BUCKETS: &[f64] = &[1e1, 1e2, 1e3, 1e4, 1e5, 1e6, 1e7, 1e8];

/// Handles to every persistent family. Cloneable vec children are fetched
/// per update via `with_label_values`; the vecs themselves are internally
/// synchronized, so one `LogMetrics` is shared by all tail tasks and the
/// scrape handler.
#[derive(Clone)]
pub struct LogMetrics {
    pub cleanup_processes: CounterVec,
    pub cleanup_rejects: CounterVec,
    pub lmtp_delays: HistogramVec,
    pub pipe_delays: HistogramVec,
    pub qmgr_inserts_nrcpt: HistogramVec,
    pub qmgr_inserts_size: HistogramVec,
    pub qmgr_removes: CounterVec,
    pub smtp_delays: HistogramVec,
    pub smtp_tls_connects: CounterVec,
    pub smtp_connection_timed_out: CounterVec,
    pub smtp_status_deferred: CounterVec,
    pub smtpd_connects: CounterVec,
    pub smtpd_disconnects: CounterVec,
    pub smtpd_fcrdns_errors: CounterVec,
    pub smtpd_lost_connections: CounterVec,
    pub smtpd_processes: CounterVec,
    pub smtpd_rejects: CounterVec,
    pub smtpd_sasl_auth_failures: CounterVec,
    pub smtpd_tls_connects: CounterVec,
    pub unsupported_log_entries: CounterVec,
    /// Liveness per instance: 1 while log collection (path = log location)
    /// or the latest showq scrape (path = socket) is healthy.
    pub up: GaugeVec,
}

impl LogMetrics {
    /// Creates every family and registers it with `registry`.
    pub fn register(registry: &Registry) -> prometheus::Result<Self> {
        Ok(Self {
            cleanup_processes: counter_vec(
                registry,
                "cleanup_messages_processed_total",
                "Total number of messages processed by cleanup.",
                &["name"],
            )?,
            cleanup_rejects: counter_vec(
                registry,
                "cleanup_messages_rejected_total",
                "Total number of messages rejected by cleanup.",
                &["name"],
            )?,
            lmtp_delays: histogram_vec(
                registry,
                "lmtp_delivery_delay_seconds",
                "LMTP message processing time in seconds.",
                &["name", "stage"],
                TIME_BUCKETS,
            )?,
            pipe_delays: histogram_vec(
                registry,
                "pipe_delivery_delay_seconds",
                "Pipe message processing time in seconds.",
                &["name", "relay", "stage"],
                TIME_BUCKETS,
            )?,
            qmgr_inserts_nrcpt: histogram_vec(
                registry,
                "qmgr_messages_inserted_recipients",
                "Number of recipients per message inserted into the mail queues.",
                &["name"],
                NRCPT_BUCKETS,
            )?,
            qmgr_inserts_size: histogram_vec(
                registry,
                "qmgr_messages_inserted_size_bytes",
                "Size of messages inserted into the mail queues in bytes.",
                &["name"],
                SIZE_BUCKETS,
            )?,
            qmgr_removes: counter_vec(
                registry,
                "qmgr_messages_removed_total",
                "Total number of messages removed from mail queues.",
                &["name"],
            )?,
            smtp_delays: histogram_vec(
                registry,
                "smtp_delivery_delay_seconds",
                "SMTP message processing time in seconds.",
                &["name", "stage"],
                TIME_BUCKETS,
            )?,
            smtp_tls_connects: counter_vec(
                registry,
                "smtp_tls_connections_total",
                "Total number of outgoing TLS connections.",
                &["name", "trust", "protocol", "cipher", "secret_bits", "algorithm_bits"],
            )?,
            smtp_connection_timed_out: counter_vec(
                registry,
                "smtp_connection_timed_out_total",
                "Total number of outbound connection attempts that timed out.",
                &["name"],
            )?,
            smtp_status_deferred: counter_vec(
                registry,
                "smtp_status_deferred",
                "Total number of messages deferred.",
                &["name"],
            )?,
            smtpd_connects: counter_vec(
                registry,
                "smtpd_connects_total",
                "Total number of incoming connections.",
                &["name"],
            )?,
            smtpd_disconnects: counter_vec(
                registry,
                "smtpd_disconnects_total",
                "Total number of incoming disconnections.",
                &["name"],
            )?,
            smtpd_fcrdns_errors: counter_vec(
                registry,
                "smtpd_forward_confirmed_reverse_dns_errors_total",
                "Total number of connections for which forward-confirmed DNS cannot be resolved.",
                &["name"],
            )?,
            smtpd_lost_connections: counter_vec(
                registry,
                "smtpd_connections_lost_total",
                "Total number of connections lost.",
                &["name", "after_stage"],
            )?,
            smtpd_processes: counter_vec(
                registry,
                "smtpd_messages_processed_total",
                "Total number of messages processed.",
                &["name", "sasl_method"],
            )?,
            smtpd_rejects: counter_vec(
                registry,
                "smtpd_messages_rejected_total",
                "Total number of NOQUEUE rejects.",
                &["name", "code"],
            )?,
            smtpd_sasl_auth_failures: counter_vec(
                registry,
                "smtpd_sasl_authentication_failures_total",
                "Total number of SASL authentication failures.",
                &["name"],
            )?,
            smtpd_tls_connects: counter_vec(
                registry,
                "smtpd_tls_connections_total",
                "Total number of incoming TLS connections.",
                &["name", "trust", "protocol", "cipher", "secret_bits", "algorithm_bits"],
            )?,
            unsupported_log_entries: counter_vec(
                registry,
                "unsupported_log_entries_total",
                "Log entries that could not be processed.",
                &["name", "service"],
            )?,
            up: gauge_vec(
                registry,
                "up",
                "Whether scraping Postfix's metrics was successful.",
                &["name", "path"],
            )?,
        })
    }
}

fn counter_vec(
    registry: &Registry,
    name: &str,
    help: &str,
    labels: &[&str],
) -> prometheus::Result<CounterVec> {
    let vec = CounterVec::new(Opts::new(name, help).namespace(NAMESPACE), labels)?;
    registry.register(Box::new(vec.clone()))?;
    Ok(vec)
}

fn gauge_vec(
    registry: &Registry,
    name: &str,
    help: &str,
    labels: &[&str],
) -> prometheus::Result<GaugeVec> {
    let vec = GaugeVec::new(Opts::new(name, help).namespace(NAMESPACE), labels)?;
    registry.register(Box::new(vec.clone()))?;
    Ok(vec)
}

fn histogram_vec(
    registry: &Registry,
    name: &str,
    help: &str,
    labels: &[&str],
    buckets: &[f64],
) -> prometheus::Result<HistogramVec> {
    let opts = HistogramOpts::new(name, help)
        .namespace(NAMESPACE)
        .buckets(buckets.to_vec());
    let vec = HistogramVec::new(opts, labels)?;
    registry.register(Box::new(vec.clone()))?;
    Ok(vec)
}
