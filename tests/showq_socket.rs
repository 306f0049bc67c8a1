//! Queue snapshot scraping over a real unix socket, the way a live Postfix
//! spool directory exposes it.

use chrono::Local;
use postwatch::showq;
use std::path::Path;
use tokio::io::AsyncWriteExt;
use tokio::net::UnixListener;

fn spool_with_socket(dir: &Path, instance: &str) -> UnixListener {
    let public = dir.join(instance).join("public");
    std::fs::create_dir_all(&public).unwrap();
    UnixListener::bind(public.join("showq")).unwrap()
}

#[tokio::test]
async fn scrapes_a_binary_snapshot_from_the_socket() {
    let dir = tempfile::tempdir().unwrap();
    let listener = spool_with_socket(dir.path(), "postfix");

    let queued_at = (Local::now().timestamp() - 600).to_string();
    let server = tokio::spawn(async move {
        let (mut stream, _) = listener.accept().await.unwrap();
        let mut payload = Vec::new();
        for token in [
            "queue_name",
            "deferred",
            "size",
            "4096",
            "time",
            queued_at.as_str(),
        ] {
            payload.extend_from_slice(token.as_bytes());
            payload.push(0);
        }
        stream.write_all(&payload).await.unwrap();
    });

    let families = showq::collect_from_socket(dir.path(), "postfix")
        .await
        .unwrap();
    server.await.unwrap();

    let size_family = families
        .iter()
        .find(|f| f.get_name() == "postfix_showq_message_size_bytes")
        .expect("size family must be present");
    let deferred = size_family
        .get_metric()
        .iter()
        .find(|m| {
            m.get_label()
                .iter()
                .any(|l| l.get_name() == "queue" && l.get_value() == "deferred")
        })
        .expect("deferred series must be present");
    assert_eq!(deferred.get_histogram().get_sample_count(), 1);
    assert_eq!(deferred.get_histogram().get_sample_sum(), 4096.0);

    let age_family = families
        .iter()
        .find(|f| f.get_name() == "postfix_showq_message_age_seconds")
        .expect("age family must be present");
    let deferred_age = age_family
        .get_metric()
        .iter()
        .find(|m| {
            m.get_label()
                .iter()
                .any(|l| l.get_name() == "queue" && l.get_value() == "deferred")
        })
        .unwrap();
    let age = deferred_age.get_histogram().get_sample_sum();
    assert!((599.0..=602.0).contains(&age), "age was {}", age);
}

#[tokio::test]
async fn scrapes_a_textual_snapshot_from_the_socket() {
    let dir = tempfile::tempdir().unwrap();
    let listener = spool_with_socket(dir.path(), "postfix");

    let stamp = (Local::now() - chrono::Duration::hours(2)).format("%a %b %e %H:%M:%S");
    let payload = format!(
        "-Queue ID- --Size-- ----Arrival Time---- -Sender/Recipient-------\n\
         A07A81514*     5156 {stamp}  sender@example.org\n\
         \x20                                        recipient@example.org\n"
    );
    let server = tokio::spawn(async move {
        let (mut stream, _) = listener.accept().await.unwrap();
        stream.write_all(payload.as_bytes()).await.unwrap();
    });

    let families = showq::collect_from_socket(dir.path(), "postfix")
        .await
        .unwrap();
    server.await.unwrap();

    let size_family = families
        .iter()
        .find(|f| f.get_name() == "postfix_showq_message_size_bytes")
        .unwrap();
    let active = size_family
        .get_metric()
        .iter()
        .find(|m| {
            m.get_label()
                .iter()
                .any(|l| l.get_name() == "queue" && l.get_value() == "active")
        })
        .unwrap();
    assert_eq!(active.get_histogram().get_sample_count(), 1);
    assert_eq!(active.get_histogram().get_sample_sum(), 5156.0);
}

#[tokio::test]
async fn missing_socket_is_a_transport_error() {
    let dir = tempfile::tempdir().unwrap();
    let result = showq::collect_from_socket(dir.path(), "postfix").await;
    assert!(matches!(result, Err(showq::ShowqError::Io(_))));
}

#[tokio::test]
async fn malformed_binary_payload_fails_the_whole_scrape() {
    let dir = tempfile::tempdir().unwrap();
    let listener = spool_with_socket(dir.path(), "postfix");

    let server = tokio::spawn(async move {
        let (mut stream, _) = listener.accept().await.unwrap();
        // A key token with no value token after it.
        stream.write_all(b"queue_name\0active\0size\0").await.unwrap();
    });

    let result = showq::collect_from_socket(dir.path(), "postfix").await;
    server.await.unwrap();
    assert!(matches!(
        result,
        Err(showq::ShowqError::MissingValue(key)) if key == "size"
    ));
}
