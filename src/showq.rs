//! Queue snapshot parsing
//!
//! Reads the output of Postfix's `showq` service and turns it into per-queue
//! size and age histograms. The output format depends on the Postfix
//! version: 2.x speaks a textual format identical to `mailq` output, 3.x a
//! binary format of NUL-terminated key/value tokens. The format is
//! auto-detected by scanning the first 128 bytes for a NUL byte.
//!
//! The histograms are built fresh for every scrape in a scratch registry so
//! the exported series describe the queue at capture time rather than an
//! accumulation across scrapes. A parse failure discards the partial
//! histograms; the caller only ever sees all-or-nothing results.

use std::io::Cursor;
use std::path::{Path, PathBuf};

use chrono::format::{parse as parse_datetime, Parsed, StrftimeItems};
use chrono::{DateTime, Datelike, Local, TimeZone};
use once_cell::sync::Lazy;
use prometheus::proto::MetricFamily;
use prometheus::{HistogramOpts, HistogramVec, Registry};
use regex::Regex;
use thiserror::Error;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncRead, AsyncReadExt, BufReader};
use tokio::net::UnixStream;

use crate::registry::{AGE_BUCKETS, NAMESPACE, SIZE_BUCKETS};

/// Queue names pre-seeded for the textual format.
const TEXTUAL_QUEUES: &[&str] = &["active", "hold", "other"];

/// Queue names pre-seeded for the binary format.
const BINARY_QUEUES: &[&str] = &["active", "deferred", "hold", "incoming", "maildrop"];

// Matches one queued message in postqueue's textual output. Example:
// "A07A81514      5156 Tue Feb 14 13:13:54  MAILER-DAEMON"
static MESSAGE_LINE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^[0-9A-F]+([\*!]?) +(\d+) (\w{3} \w{3} +\d+ +\d+:\d{2}:\d{2}) +").unwrap()
});

#[derive(Debug, Error)]
pub enum ShowqError {
    /// A binary record carried a key token with no value token after it.
    #[error("key {0:?} does not have a value")]
    MissingValue(String),
    /// Binary input ended without a terminating NUL byte.
    #[error("expected null byte terminator")]
    UnterminatedEntry,
    #[error("invalid {field} value {value:?}")]
    InvalidNumber { field: &'static str, value: String },
    #[error("invalid timestamp {0:?}")]
    InvalidTimestamp(String),
    #[error(transparent)]
    Metrics(#[from] prometheus::Error),
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// The per-scrape histogram pair tracking queued messages by size and age.
pub struct SnapshotHistograms {
    pub size: HistogramVec,
    pub age: HistogramVec,
}

impl SnapshotHistograms {
    /// Creates the pair and registers it with a (normally scratch) registry.
    pub fn register(registry: &Registry) -> prometheus::Result<Self> {
        let size = HistogramVec::new(
            HistogramOpts::new(
                "showq_message_size_bytes",
                "Size of messages in Postfix's message queue, in bytes",
            )
            .namespace(NAMESPACE)
            .buckets(SIZE_BUCKETS.to_vec()),
            &["name", "queue"],
        )?;
        registry.register(Box::new(size.clone()))?;

        let age = HistogramVec::new(
            HistogramOpts::new(
                "showq_message_age_seconds",
                "Age of messages in Postfix's message queue, in seconds",
            )
            .namespace(NAMESPACE)
            .buckets(AGE_BUCKETS.to_vec()),
            &["name", "queue"],
        )?;
        registry.register(Box::new(age.clone()))?;

        Ok(Self { size, age })
    }

    /// Initializes zero-observation series so the standard queues are always
    /// exported, even when empty.
    fn seed(&self, instance: &str, queues: &[&str]) {
        for queue in queues {
            self.size.with_label_values(&[instance, queue]);
            self.age.with_label_values(&[instance, queue]);
        }
    }
}

/// The well-known showq socket location for a Postfix instance.
pub fn socket_path(spool_directory: &Path, instance: &str) -> PathBuf {
    spool_directory.join(instance).join("public").join("showq")
}

/// Scrapes queue statistics from the instance's showq socket. The
/// connection serves exactly one request/response cycle and is closed when
/// this function returns.
pub async fn collect_from_socket(
    spool_directory: &Path,
    instance: &str,
) -> Result<Vec<MetricFamily>, ShowqError> {
    let stream = UnixStream::connect(socket_path(spool_directory, instance)).await?;
    collect_from_stream(stream, instance).await
}

/// Parses a showq byte stream into freshly built histogram families.
pub async fn collect_from_stream<R>(
    stream: R,
    instance: &str,
) -> Result<Vec<MetricFamily>, ShowqError>
where
    R: AsyncRead + Unpin,
{
    let registry = Registry::new();
    let histograms = SnapshotHistograms::register(&registry)?;
    collect_from_reader(stream, instance, Local::now(), &histograms).await?;
    Ok(registry.gather())
}

/// Parses a showq byte stream into the given histograms, auto-detecting the
/// encoding. `now` anchors the age computation and is injectable for tests.
pub async fn collect_from_reader<R>(
    mut reader: R,
    instance: &str,
    now: DateTime<Local>,
    histograms: &SnapshotHistograms,
) -> Result<(), ShowqError>
where
    R: AsyncRead + Unpin,
{
    // Peek at up to 128 bytes: a NUL byte selects the binary format. A
    // stray NUL in malformed textual input will misroute the stream to the
    // binary parser, which then fails with a parse error instead of
    // silently corrupting counts.
    let mut head = vec![0u8; 128];
    let mut filled = 0;
    while filled < head.len() {
        let n = reader.read(&mut head[filled..]).await?;
        if n == 0 {
            break;
        }
        filled += n;
    }
    head.truncate(filled);

    let binary = head.contains(&0);
    let reader = BufReader::new(Cursor::new(head).chain(reader));
    if binary {
        let epoch =
            now.timestamp() as f64 + f64::from(now.timestamp_subsec_nanos()) / 1e9;
        collect_binary(reader, instance, epoch, histograms).await
    } else {
        collect_textual(reader, instance, now, histograms).await
    }
}

/// Parses the textual (Postfix 2.x / `mailq`) format. Lines that do not
/// look like a message entry (headers, recipient continuations, the
/// empty-queue notice) are skipped.
async fn collect_textual<R>(
    reader: R,
    instance: &str,
    now: DateTime<Local>,
    histograms: &SnapshotHistograms,
) -> Result<(), ShowqError>
where
    R: AsyncBufRead + Unpin,
{
    histograms.seed(instance, TEXTUAL_QUEUES);

    let mut lines = reader.lines();
    while let Some(line) = lines.next_line().await? {
        let Some(caps) = MESSAGE_LINE.captures(&line) else {
            continue;
        };

        // Derive the name of the message queue from the flag character.
        let queue = match caps.get(1).map_or("", |m| m.as_str()) {
            "*" => "active",
            "!" => "hold",
            _ => "other",
        };

        let size_text = &caps[2];
        let size: f64 = size_text
            .parse()
            .map_err(|_| ShowqError::InvalidNumber {
                field: "size",
                value: size_text.to_string(),
            })?;

        let date = resolve_queue_date(&caps[3], now)?;
        let age_seconds = (now - date).num_milliseconds() as f64 / 1e3;

        histograms
            .size
            .with_label_values(&[instance, queue])
            .observe(size);
        histograms
            .age
            .with_label_values(&[instance, queue])
            .observe(age_seconds);
    }

    Ok(())
}

/// Resolves a year-less queue timestamp to the most recent past occurrence:
/// assume the current year, and roll back one year if that would place the
/// entry in the future.
fn resolve_queue_date(text: &str, now: DateTime<Local>) -> Result<DateTime<Local>, ShowqError> {
    // Drop the leading weekday token; the weekday the queue printed for
    // some unknown year is no constraint on the date.
    let rest = text.split_once(' ').map_or(text, |(_, rest)| rest);

    let this_year = date_in_year(rest, now.year())
        .ok_or_else(|| ShowqError::InvalidTimestamp(text.to_string()))?;
    if this_year > now {
        date_in_year(rest, now.year() - 1)
            .ok_or_else(|| ShowqError::InvalidTimestamp(text.to_string()))
    } else {
        Ok(this_year)
    }
}

fn date_in_year(text: &str, year: i32) -> Option<DateTime<Local>> {
    let mut parsed = Parsed::new();
    parse_datetime(&mut parsed, text, StrftimeItems::new("%b %e %H:%M:%S")).ok()?;
    parsed.set_year(i64::from(year)).ok()?;
    let datetime = parsed
        .to_naive_date()
        .ok()?
        .and_time(parsed.to_naive_time().ok()?);
    Local.from_local_datetime(&datetime).earliest()
}

/// Parses the binary (Postfix 3.x) format: a sequence of NUL-terminated
/// key/value tokens, with an empty key acting as a record separator that
/// resets queue attribution.
async fn collect_binary<R>(
    mut reader: R,
    instance: &str,
    now_epoch: f64,
    histograms: &SnapshotHistograms,
) -> Result<(), ShowqError>
where
    R: AsyncBufRead + Unpin,
{
    histograms.seed(instance, BINARY_QUEUES);

    let mut queue = String::from("unknown");
    while let Some(key) = read_entry(&mut reader).await? {
        if key.is_empty() {
            // Empty key means a record separator.
            queue = String::from("unknown");
            continue;
        }
        let value = read_entry(&mut reader)
            .await?
            .ok_or_else(|| ShowqError::MissingValue(key.clone()))?;

        match key.as_str() {
            "queue_name" => queue = value,
            "size" => {
                let size: f64 = value.parse().map_err(|_| ShowqError::InvalidNumber {
                    field: "size",
                    value: value.clone(),
                })?;
                histograms
                    .size
                    .with_label_values(&[instance, &queue])
                    .observe(size);
            }
            "time" => {
                let time: f64 = value.parse().map_err(|_| ShowqError::InvalidNumber {
                    field: "time",
                    value: value.clone(),
                })?;
                histograms
                    .age
                    .with_label_values(&[instance, &queue])
                    .observe(now_epoch - time);
            }
            // Unrecognized keys are ignored.
            _ => {}
        }
    }

    Ok(())
}

/// Reads one NUL-terminated token. `Ok(None)` at a clean end of stream;
/// trailing bytes without a terminator are a structural error.
async fn read_entry<R>(reader: &mut R) -> Result<Option<String>, ShowqError>
where
    R: AsyncBufRead + Unpin,
{
    let mut buf = Vec::new();
    let n = reader.read_until(0, &mut buf).await?;
    if n == 0 {
        return Ok(None);
    }
    match buf.pop() {
        Some(0) => Ok(Some(String::from_utf8_lossy(&buf).into_owned())),
        _ => Err(ShowqError::UnterminatedEntry),
    }
}
