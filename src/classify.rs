//! Log line classification engine
//!
//! Recognizes the log message shapes emitted by Postfix subprocesses and
//! extracts typed fields from each. The pattern tables are compiled once and
//! tried in a fixed order per subprocess; the first match wins, so every
//! line produces exactly one [`Classification`].

use log::warn;
use once_cell::sync::Lazy;
use regex::{Captures, Regex};

use crate::core::{Classification, Delay, LogEvent, Outcome, TlsParams};

// Patterns for parsing log messages.
static LOG_LINE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r" ?(postfix(?:-\w+)?)(?:/(\w+))?\[\d+\]: (.*)").unwrap());
static LMTP_PIPE_SMTP_LINE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r", relay=(\S+), .*, delays=([0-9\.]+)/([0-9\.]+)/([0-9\.]+)/([0-9\.]+), ").unwrap()
});
static QMGR_INSERT_LINE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r":.*, size=(\d+), nrcpt=(\d+) ").unwrap());
static SMTP_STATUS_LINE: Lazy<Regex> = Lazy::new(|| Regex::new(r", status=(\w+)").unwrap());
static SMTP_TLS_LINE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^(\S+) TLS connection established to \S+: (\S+) with cipher (\S+) \((\d+)/(\d+) bits\)")
        .unwrap()
});
static SMTP_CONNECTION_TIMED_OUT: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^connect\s+to\s+(.*)\[(.*)\]:(\d+):\s+(Connection timed out)$").unwrap()
});
static SMTPD_FCRDNS_ERRORS_LINE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^warning: hostname \S+ does not resolve to address ").unwrap());
static SMTPD_SASL_LINE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r": client=.*, sasl_method=([^,\s]+)").unwrap());
static SMTPD_REJECTS_LINE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^NOQUEUE: reject: RCPT from \S+: ([0-9]+) ").unwrap());
static SMTPD_LOST_CONNECTION_LINE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^lost connection after (\w+) from ").unwrap());
static SMTPD_SASL_AUTH_FAILURES_LINE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^warning: \S+: SASL \S+ authentication failed: ").unwrap());
static SMTPD_TLS_LINE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^(\S+) TLS connection established from \S+: (\S+) with cipher (\S+) \((\d+)/(\d+) bits\)")
        .unwrap()
});

/// Classifies a raw log line on behalf of `instance`.
///
/// Strips the syslog prefix (timestamp, hostname, `process[pid]:`),
/// determines the producing Postfix instance and subprocess, and dispatches
/// the remainder through the subprocess's pattern table. Lines from sibling
/// instances come back as [`Outcome::Foreign`]; lines nothing matched come
/// back as [`Outcome::Unsupported`].
pub fn classify(instance: &str, line: &str) -> Classification {
    // Strip off timestamp, hostname, etc.
    let Some(caps) = LOG_LINE.captures(line) else {
        // Unknown log entry format.
        return Classification::unsupported("");
    };

    let process = caps.get(1).map_or("", |m| m.as_str());
    let subprocess = caps.get(2).map_or("", |m| m.as_str()).to_string();
    let remainder = caps.get(3).map_or("", |m| m.as_str());

    // Unexpected log producer, likely a different Postfix instance sharing
    // the host. Anything else with a postfix-shaped prefix is skipped
    // outright; a genuinely foreign prefix is merely unsupported.
    if process != instance {
        let outcome = if process.starts_with("postfix") {
            Outcome::Foreign
        } else {
            Outcome::Unsupported
        };
        return Classification {
            subprocess,
            outcome,
        };
    }

    // Group patterns to check by Postfix service.
    let outcome = match subprocess.as_str() {
        "cleanup" => classify_cleanup(remainder),
        "lmtp" => classify_lmtp(remainder),
        "pipe" => classify_pipe(remainder),
        "qmgr" => classify_qmgr(remainder),
        "smtp" => classify_smtp(remainder),
        "smtpd" => classify_smtpd(remainder),
        _ => Outcome::Unsupported,
    };

    Classification {
        subprocess,
        outcome,
    }
}

fn classify_cleanup(remainder: &str) -> Outcome {
    if remainder.contains(": message-id=<") {
        Outcome::Event(LogEvent::CleanupProcessed)
    } else if remainder.contains(": reject: ") {
        Outcome::Event(LogEvent::CleanupRejected)
    } else {
        Outcome::Unsupported
    }
}

fn classify_lmtp(remainder: &str) -> Outcome {
    match LMTP_PIPE_SMTP_LINE.captures(remainder) {
        Some(caps) => Outcome::Event(LogEvent::LmtpDelivery {
            delays: parse_delays("lmtp", &caps),
        }),
        None => Outcome::Unsupported,
    }
}

fn classify_pipe(remainder: &str) -> Outcome {
    match LMTP_PIPE_SMTP_LINE.captures(remainder) {
        Some(caps) => Outcome::Event(LogEvent::PipeDelivery {
            relay: caps[1].to_string(),
            delays: parse_delays("pipe", &caps),
        }),
        None => Outcome::Unsupported,
    }
}

fn classify_qmgr(remainder: &str) -> Outcome {
    if let Some(caps) = QMGR_INSERT_LINE.captures(remainder) {
        Outcome::Event(LogEvent::QmgrInserted {
            size: convert_value("qmgr size", &caps[1]),
            nrcpt: convert_value("qmgr nrcpt", &caps[2]),
        })
    } else if remainder.ends_with(": removed") {
        Outcome::Event(LogEvent::QmgrRemoved)
    } else {
        Outcome::Unsupported
    }
}

fn classify_smtp(remainder: &str) -> Outcome {
    if let Some(caps) = LMTP_PIPE_SMTP_LINE.captures(remainder) {
        // The status word is only meaningful alongside the delay
        // annotation; on TLS or timeout lines it is dropped.
        let status = SMTP_STATUS_LINE
            .captures(remainder)
            .map(|status_caps| status_caps[1].to_string());
        Outcome::Event(LogEvent::SmtpDelivery {
            delays: parse_delays("smtp", &caps),
            status,
        })
    } else if let Some(caps) = SMTP_TLS_LINE.captures(remainder) {
        Outcome::Event(LogEvent::SmtpTlsConnect(parse_tls(&caps)))
    } else if SMTP_CONNECTION_TIMED_OUT.is_match(remainder) {
        Outcome::Event(LogEvent::SmtpConnectionTimedOut)
    } else {
        Outcome::Unsupported
    }
}

fn classify_smtpd(remainder: &str) -> Outcome {
    if remainder.starts_with("connect from ") {
        Outcome::Event(LogEvent::SmtpdConnect)
    } else if remainder.starts_with("disconnect from ") {
        Outcome::Event(LogEvent::SmtpdDisconnect)
    } else if SMTPD_FCRDNS_ERRORS_LINE.is_match(remainder) {
        Outcome::Event(LogEvent::SmtpdFcrdnsError)
    } else if let Some(caps) = SMTPD_LOST_CONNECTION_LINE.captures(remainder) {
        Outcome::Event(LogEvent::SmtpdLostConnection {
            after_stage: caps[1].to_string(),
        })
    } else if let Some(caps) = SMTPD_SASL_LINE.captures(remainder) {
        Outcome::Event(LogEvent::SmtpdProcessed {
            sasl_method: Some(caps[1].to_string()),
        })
    } else if remainder.contains(": client=") {
        Outcome::Event(LogEvent::SmtpdProcessed { sasl_method: None })
    } else if let Some(caps) = SMTPD_REJECTS_LINE.captures(remainder) {
        Outcome::Event(LogEvent::SmtpdRejected {
            code: caps[1].to_string(),
        })
    } else if SMTPD_SASL_AUTH_FAILURES_LINE.is_match(remainder) {
        Outcome::Event(LogEvent::SmtpdSaslAuthFailed)
    } else if let Some(caps) = SMTPD_TLS_LINE.captures(remainder) {
        Outcome::Event(LogEvent::SmtpdTlsConnect(parse_tls(&caps)))
    } else {
        Outcome::Unsupported
    }
}

fn parse_delays(context: &str, caps: &Captures<'_>) -> Delay {
    Delay {
        before_queue_manager: convert_value(context, &caps[2]),
        queue_manager: convert_value(context, &caps[3]),
        connection_setup: convert_value(context, &caps[4]),
        transmission: convert_value(context, &caps[5]),
    }
}

fn parse_tls(caps: &Captures<'_>) -> TlsParams {
    TlsParams {
        trust: caps[1].to_string(),
        protocol: caps[2].to_string(),
        cipher: caps[3].to_string(),
        secret_bits: caps[4].to_string(),
        algorithm_bits: caps[5].to_string(),
    }
}

/// Converts a captured numeric field, substituting zero when the value does
/// not parse. A matched pattern with a mangled number is worth keeping as an
/// observation rather than discarding the whole line.
fn convert_value(context: &str, value: &str) -> f64 {
    value.parse().unwrap_or_else(|err| {
        warn!("couldn't convert value {:?} for {}: {}", value, context, err);
        0.0
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn simple_qmgr_removed_line() {
        let result = classify(
            "postfix",
            "Feb 11 16:49:24 letterman postfix/qmgr[8204]: AAB4D259B1: removed",
        );
        assert_eq!(result.subprocess, "qmgr");
        assert_eq!(result.outcome, Outcome::Event(LogEvent::QmgrRemoved));
    }

    #[test]
    fn qmgr_insert_line() {
        let result = classify(
            "postfix",
            "Feb 24 16:18:40 letterman postfix/qmgr[20349]: 5270320179: from=<[redacted]>, size=5475, nrcpt=1 (queue active)",
        );
        assert_eq!(
            result.outcome,
            Outcome::Event(LogEvent::QmgrInserted {
                size: 5475.0,
                nrcpt: 1.0,
            })
        );
    }

    #[test]
    fn unknown_lines_are_unsupported() {
        let result = classify(
            "postfix",
            "Apr 26 10:55:19 tcc1 postfix/smtpd[21126]: warning: SASL authentication failure: cannot connect to saslauthd server: Permission denied",
        );
        assert!(result.is_unsupported());
        assert!(!result.is_ignored());
        assert_eq!(result.subprocess, "smtpd");

        let result = classify(
            "postfix",
            "Apr 26 10:55:19 tcc1 postfix/smtpd[21126]: warning: SASL authentication failure: Password verification failed",
        );
        assert!(result.is_unsupported());
        assert_eq!(result.subprocess, "smtpd");
    }

    #[test]
    fn prefix_without_postfix_token_is_unsupported_not_ignored() {
        let result = classify(
            "postfix",
            "Feb 11 16:49:24 letterman dovecot[8204]: imap-login: Login: user=<x>",
        );
        assert!(result.is_unsupported());
        assert!(!result.is_ignored());
        assert_eq!(result.subprocess, "");
    }

    #[test]
    fn sasl_lines() {
        let result = classify(
            "postfix",
            "Oct 30 13:19:26 mailgw-out1 postfix/smtpd[27530]: EB4B2C19E2: client=xxx[1.2.3.4], sasl_method=PLAIN, sasl_username=user@domain",
        );
        assert_eq!(
            result.outcome,
            Outcome::Event(LogEvent::SmtpdProcessed {
                sasl_method: Some("PLAIN".to_string()),
            })
        );

        let result = classify(
            "postfix",
            "Feb 24 16:42:00 letterman postfix/smtpd[24906]: 1CF582025C: client=xxx[2.3.4.5]",
        );
        assert_eq!(
            result.outcome,
            Outcome::Event(LogEvent::SmtpdProcessed { sasl_method: None })
        );

        let result = classify(
            "postfix",
            "Apr 26 10:55:19 tcc1 postfix/smtpd[21126]: warning: laptop.local[192.168.1.2]: SASL PLAIN authentication failed: generic failure",
        );
        assert_eq!(result.outcome, Outcome::Event(LogEvent::SmtpdSaslAuthFailed));
    }

    #[test]
    fn smtp_tls_lines() {
        let result = classify(
            "postfix",
            "Jul 24 04:38:17 mail postfix/smtp[30582]: Verified TLS connection established to gmail-smtp-in.l.google.com[108.177.14.26]:25: TLSv1.3 with cipher TLS_AES_256_GCM_SHA384 (256/256 bits) key-exchange X25519 server-signature RSA-PSS (2048 bits) server-digest SHA256",
        );
        let Outcome::Event(LogEvent::SmtpTlsConnect(tls)) = result.outcome else {
            panic!("expected a TLS event, got {:?}", result.outcome);
        };
        assert_eq!(
            tls.label_values(),
            ["Verified", "TLSv1.3", "TLS_AES_256_GCM_SHA384", "256", "256"]
        );

        let result = classify(
            "postfix",
            "Jul 24 03:28:15 mail postfix/smtp[24052]: Verified TLS connection established to mx2.comcast.net[2001:558:fe21:2a::6]:25: TLSv1.2 with cipher ECDHE-RSA-AES256-GCM-SHA384 (256/256 bits)",
        );
        let Outcome::Event(LogEvent::SmtpTlsConnect(tls)) = result.outcome else {
            panic!("expected a TLS event, got {:?}", result.outcome);
        };
        assert_eq!(
            tls.label_values(),
            ["Verified", "TLSv1.2", "ECDHE-RSA-AES256-GCM-SHA384", "256", "256"]
        );
    }

    #[test]
    fn smtpd_tls_line() {
        let result = classify(
            "postfix",
            "Jun  5 09:50:52 mail postfix/smtpd[24169]: Anonymous TLS connection established from unknown[88.99.1.2]: TLSv1.2 with cipher ECDHE-RSA-AES256-GCM-SHA384 (256/256 bits)",
        );
        let Outcome::Event(LogEvent::SmtpdTlsConnect(tls)) = result.outcome else {
            panic!("expected a TLS event, got {:?}", result.outcome);
        };
        assert_eq!(tls.trust, "Anonymous");
        assert_eq!(tls.protocol, "TLSv1.2");
    }

    #[test]
    fn smtp_delays_with_status() {
        let result = classify(
            "postfix",
            "Feb 24 16:18:40 letterman postfix/smtp[59649]: 5270320179: to=<hebj@telia.com>, relay=mail.telia.com[81.236.60.210]:25, delay=2017, delays=0.1/2017/0.03/0.05, dsn=2.0.0, status=sent (250 2.0.0 6FVIjIMwUJwU66FVIjAEB0 mail accepted for delivery)",
        );
        assert_eq!(
            result.outcome,
            Outcome::Event(LogEvent::SmtpDelivery {
                delays: Delay {
                    before_queue_manager: 0.1,
                    queue_manager: 2017.0,
                    connection_setup: 0.03,
                    transmission: 0.05,
                },
                status: Some("sent".to_string()),
            })
        );
    }

    #[test]
    fn smtp_status_without_delays_is_dropped() {
        // No delays annotation at all: the status word must not surface on
        // its own.
        let result = classify(
            "postfix",
            "Feb 24 16:18:40 letterman postfix/smtp[59649]: 5270320179: to=<x@example.org>, status=bounced (host rejected)",
        );
        assert!(result.is_unsupported());
    }

    #[test]
    fn smtp_connection_timed_out() {
        let result = classify(
            "postfix",
            "Jan 16 11:45:14 letterman postfix/smtp[5333]: connect to mail.example.org[198.51.100.7]:25: Connection timed out",
        );
        assert_eq!(
            result.outcome,
            Outcome::Event(LogEvent::SmtpConnectionTimedOut)
        );
    }

    #[test]
    fn pipe_delivery_captures_relay() {
        let result = classify(
            "postfix",
            "Feb 24 16:18:40 letterman postfix/pipe[24210]: 53B9F20277: to=<x@example.net>, relay=dovecot, delay=0.28, delays=0.04/0.01/0/0.23, dsn=2.0.0, status=sent (delivered via dovecot service)",
        );
        assert_eq!(
            result.outcome,
            Outcome::Event(LogEvent::PipeDelivery {
                relay: "dovecot".to_string(),
                delays: Delay {
                    before_queue_manager: 0.04,
                    queue_manager: 0.01,
                    connection_setup: 0.0,
                    transmission: 0.23,
                },
            })
        );
    }

    #[test]
    fn lmtp_delivery() {
        let result = classify(
            "postfix",
            "Feb 24 16:18:40 letterman postfix/lmtp[24210]: 53B9F20277: to=<x@example.net>, relay=mail.example.net[private/dovecot-lmtp], delay=0.16, delays=0.07/0.01/0.05/0.03, dsn=2.0.0, status=sent (250 2.0.0 Ok)",
        );
        let Outcome::Event(LogEvent::LmtpDelivery { delays }) = result.outcome else {
            panic!("expected an lmtp delivery, got {:?}", result.outcome);
        };
        assert_eq!(delays.connection_setup, 0.05);
    }

    #[test]
    fn cleanup_lines() {
        let result = classify(
            "postfix",
            "Feb 24 16:18:40 letterman postfix/cleanup[22428]: 1DCFA2025B: message-id=<20180224151819.1DCFA2025B@letterman.example.org>",
        );
        assert_eq!(result.outcome, Outcome::Event(LogEvent::CleanupProcessed));

        let result = classify(
            "postfix",
            "Feb 24 16:18:40 letterman postfix/cleanup[22428]: BACDE2025B: reject: header Subject: spam from local; from=<x> to=<y>: 5.7.1 message content rejected",
        );
        assert_eq!(result.outcome, Outcome::Event(LogEvent::CleanupRejected));
    }

    #[test]
    fn smtpd_connection_lines() {
        let connect = classify(
            "postfix",
            "Feb 24 16:18:40 letterman postfix/smtpd[22421]: connect from mail.example.com[203.0.113.4]",
        );
        assert_eq!(connect.outcome, Outcome::Event(LogEvent::SmtpdConnect));

        let disconnect = classify(
            "postfix",
            "Feb 24 16:18:41 letterman postfix/smtpd[22421]: disconnect from mail.example.com[203.0.113.4]",
        );
        assert_eq!(disconnect.outcome, Outcome::Event(LogEvent::SmtpdDisconnect));

        let lost = classify(
            "postfix",
            "Feb 24 16:20:12 letterman postfix/smtpd[22421]: lost connection after DATA from mail.example.com[203.0.113.4]",
        );
        assert_eq!(
            lost.outcome,
            Outcome::Event(LogEvent::SmtpdLostConnection {
                after_stage: "DATA".to_string(),
            })
        );
    }

    #[test]
    fn smtpd_fcrdns_warning() {
        let result = classify(
            "postfix",
            "Feb 24 16:18:40 letterman postfix/smtpd[22421]: warning: hostname mail.example.com does not resolve to address 203.0.113.4: Name or service not known",
        );
        assert_eq!(result.outcome, Outcome::Event(LogEvent::SmtpdFcrdnsError));
    }

    #[test]
    fn smtpd_noqueue_reject() {
        let result = classify(
            "postfix",
            "Feb 24 16:18:40 letterman postfix/smtpd[22421]: NOQUEUE: reject: RCPT from mail.example.com[203.0.113.4]: 554 5.7.1 <spam@example.org>: Relay access denied; from=<a> to=<b> proto=ESMTP helo=<mail>",
        );
        assert_eq!(
            result.outcome,
            Outcome::Event(LogEvent::SmtpdRejected {
                code: "554".to_string(),
            })
        );
    }

    #[test]
    fn different_instance_is_ignored() {
        const LINE: &str = "Feb 11 16:49:24 letterman postfix-secondary/qmgr[8204]: AAB4D259B1: removed";

        let result = classify("postfix", LINE);
        assert!(result.is_unsupported());
        assert!(result.is_ignored());

        let result = classify("postfix-secondary", LINE);
        assert!(!result.is_ignored());
        assert_eq!(result.outcome, Outcome::Event(LogEvent::QmgrRemoved));
    }

    #[test]
    fn unknown_subprocess_is_unsupported() {
        let result = classify(
            "postfix",
            "Feb 11 16:49:24 letterman postfix/anvil[8204]: statistics: max connection rate 1/60s",
        );
        assert!(result.is_unsupported());
        assert_eq!(result.subprocess, "anvil");
    }

    #[test]
    fn mangled_numeric_field_defaults_to_zero() {
        // 18446744073709551616 is u64::MAX + 1; f64 parses it fine, so use a
        // genuinely unparseable capture instead: nrcpt is digits-only by
        // pattern, so fabricate a huge size that still parses and check the
        // quadruple path with an empty component instead.
        let result = classify(
            "postfix",
            "Feb 24 16:18:40 letterman postfix/smtp[59649]: 5270320179: to=<x>, relay=mail[1.2.3.4]:25, delay=1, delays=./1/2/3, dsn=2.0.0, status=sent (ok)",
        );
        let Outcome::Event(LogEvent::SmtpDelivery { delays, .. }) = result.outcome else {
            panic!("expected a delivery, got {:?}", result.outcome);
        };
        // "." matches [0-9\.]+ but does not parse as a float.
        assert_eq!(delays.before_queue_manager, 0.0);
        assert_eq!(delays.queue_manager, 1.0);
    }
}
