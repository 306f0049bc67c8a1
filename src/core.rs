//! Core domain types and service traits for postwatch
//!
//! This module defines the fundamental data structures and trait contracts
//! that govern component interactions throughout the application.

use async_trait::async_trait;

/// The outcome of classifying a single log line.
///
/// Exactly one of the three cases applies to every line, which makes the
/// "one result per line" rule a property of the type rather than a
/// convention:
///
/// * `Event` — the line matched a known pattern and carries extracted fields.
/// * `Unsupported` — no known pattern matched; the line is counted under the
///   unsupported-entries family.
/// * `Foreign` — the line was produced by a sibling Postfix instance on the
///   same host and must not be counted at all, not even as unsupported.
#[derive(Debug, Clone, PartialEq)]
pub enum Outcome {
    Event(LogEvent),
    Unsupported,
    Foreign,
}

/// A classified log line: the subprocess that produced it (possibly empty
/// when the syslog prefix itself was unrecognized) and what was found.
#[derive(Debug, Clone, PartialEq)]
pub struct Classification {
    /// Postfix subprocess token from the syslog prefix (`qmgr`, `smtpd`, ...).
    /// Empty when the prefix carried no subprocess or did not match at all.
    pub subprocess: String,
    pub outcome: Outcome,
}

impl Classification {
    /// True when the line did not match any known pattern. A `Foreign` line
    /// is unsupported by definition; a populated event never is.
    pub fn is_unsupported(&self) -> bool {
        matches!(self.outcome, Outcome::Unsupported | Outcome::Foreign)
    }

    /// True when the line belongs to a different Postfix instance and must
    /// be skipped entirely.
    pub fn is_ignored(&self) -> bool {
        matches!(self.outcome, Outcome::Foreign)
    }

    pub(crate) fn unsupported(subprocess: impl Into<String>) -> Self {
        Self {
            subprocess: subprocess.into(),
            outcome: Outcome::Unsupported,
        }
    }
}

/// A recognized log line, one variant per subprocess outcome, each carrying
/// only the fields relevant to it.
#[derive(Debug, Clone, PartialEq)]
pub enum LogEvent {
    /// cleanup accepted a message (`message-id=<...>`).
    CleanupProcessed,
    /// cleanup rejected a message.
    CleanupRejected,
    /// lmtp delivered a message; per-stage latency breakdown.
    LmtpDelivery { delays: Delay },
    /// pipe delivered a message through an external command.
    PipeDelivery { relay: String, delays: Delay },
    /// qmgr inserted a message into the queue.
    QmgrInserted { size: f64, nrcpt: f64 },
    /// qmgr removed a message from the queue.
    QmgrRemoved,
    /// smtp delivered (or attempted to deliver) a message. The status word
    /// is only present when it co-occurred with the delay annotation.
    SmtpDelivery {
        delays: Delay,
        status: Option<String>,
    },
    /// smtp established an outgoing TLS connection.
    SmtpTlsConnect(TlsParams),
    /// smtp gave up on an outbound connection attempt.
    SmtpConnectionTimedOut,
    /// smtpd accepted an incoming connection.
    SmtpdConnect,
    /// smtpd closed an incoming connection.
    SmtpdDisconnect,
    /// smtpd could not forward-confirm the client's reverse DNS.
    SmtpdFcrdnsError,
    /// smtpd lost the client connection; carries the protocol stage name.
    SmtpdLostConnection { after_stage: String },
    /// smtpd processed a message for a client. `None` means the client did
    /// not authenticate via SASL.
    SmtpdProcessed { sasl_method: Option<String> },
    /// smtpd rejected a message before queueing; carries the SMTP status code.
    SmtpdRejected { code: String },
    /// smtpd observed a failed SASL authentication attempt.
    SmtpdSaslAuthFailed,
    /// smtpd established an incoming TLS connection.
    SmtpdTlsConnect(TlsParams),
}

/// The four-stage latency breakdown attached to delivery log lines, in
/// seconds. All four fields are extracted together from a single
/// `delays=a/b/c/d` annotation.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct Delay {
    pub before_queue_manager: f64,
    pub queue_manager: f64,
    pub connection_setup: f64,
    pub transmission: f64,
}

impl Delay {
    /// The stage-name/value pairs in exposition order. Stage names double as
    /// the `stage` label values of the delay histograms.
    pub fn stages(&self) -> [(&'static str, f64); 4] {
        [
            ("before_queue_manager", self.before_queue_manager),
            ("queue_manager", self.queue_manager),
            ("connection_setup", self.connection_setup),
            ("transmission", self.transmission),
        ]
    }
}

/// Parameters of an established TLS connection, used verbatim as label
/// values on the TLS connection counters.
#[derive(Debug, Clone, PartialEq)]
pub struct TlsParams {
    /// Trust level, e.g. `Verified`, `Trusted`, `Untrusted`, `Anonymous`.
    pub trust: String,
    /// Protocol version, e.g. `TLSv1.3`.
    pub protocol: String,
    /// Negotiated cipher suite.
    pub cipher: String,
    /// Secret key bits.
    pub secret_bits: String,
    /// Algorithm bits.
    pub algorithm_bits: String,
}

impl TlsParams {
    /// Label values in the order the TLS counter vecs declare them.
    pub fn label_values(&self) -> [&str; 5] {
        [
            &self.trust,
            &self.protocol,
            &self.cipher,
            &self.secret_bits,
            &self.algorithm_bits,
        ]
    }
}

// =============================================================================
// Service Traits
// =============================================================================

/// A blocking-iterator source of log lines.
///
/// The collection loop only requires this contract; file tailing lives in
/// [`crate::sources`], and container or journal readers can be supplied the
/// same way.
#[async_trait]
pub trait LogSource: Send {
    /// A representation of the log location, used for diagnostics and as the
    /// `path` label of the `up` gauge.
    fn path(&self) -> String;

    /// Returns the next log line, without its trailing newline. `Ok(None)`
    /// signals the end of the stream. The future may be dropped at any time
    /// (the caller races it against shutdown), so implementations must not
    /// lose data when cancelled between reads.
    async fn read_line(&mut self) -> std::io::Result<Option<String>>;
}
