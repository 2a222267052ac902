//! End-to-end audit pipeline: emission, queue, writer and dead letters.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use roster_audit::{AuditAction, AuditEvent, AuditFilter, DeadLetter, InMemoryDeadLetterSink};
use roster_core::PageRequest;
use roster_queue::{
    Delivery, InMemoryQueue, MessageId, MessageQueue, QueueConfig, QueueDepth, QueueError,
    QueueResult, ReceiptHandle,
};
use roster_service::{RequestContext, Roster, RosterConfig};
use serde_json::json;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};

/// A queue that refuses every send.
#[derive(Debug)]
struct DownQueue;

#[async_trait]
impl MessageQueue<AuditEvent> for DownQueue {
    async fn send(&self, _message: AuditEvent) -> QueueResult<MessageId> {
        Err(QueueError::Unavailable {
            reason: "queue endpoint unreachable".to_string(),
        })
    }

    async fn receive(
        &self,
        _max: usize,
        _wait: Duration,
    ) -> QueueResult<Vec<Delivery<AuditEvent>>> {
        Ok(Vec::new())
    }

    async fn ack(&self, receipt: &ReceiptHandle) -> QueueResult<()> {
        Err(QueueError::ReceiptNotFound {
            receipt: receipt.to_string(),
        })
    }

    async fn release(&self, receipt: &ReceiptHandle) -> QueueResult<()> {
        Err(QueueError::ReceiptNotFound {
            receipt: receipt.to_string(),
        })
    }

    async fn depth(&self) -> QueueResult<QueueDepth> {
        Ok(QueueDepth::default())
    }
}

async fn audit_count(roster: &Roster, filter: &AuditFilter) -> usize {
    roster
        .query()
        .list_audit_entries(filter, &PageRequest::default())
        .await
        .unwrap()
        .items
        .len()
}

#[tokio::test(start_paused = true)]
async fn test_queue_outage_does_not_fail_the_write() {
    let sink = Arc::new(InMemoryDeadLetterSink::new());
    let roster = Roster::builder(RosterConfig::default())
        .queue(Arc::new(DownQueue))
        .dead_letter_sink(sink.clone())
        .build()
        .unwrap();

    let record = roster
        .service()
        .create_student(&RequestContext::new("req-outage"), json!({ "name": "Asha" }))
        .await
        .unwrap();
    assert_eq!(record.version, 1);

    assert!(roster.service().emitter().drain(Duration::from_secs(60)).await);

    let letters: Vec<DeadLetter> = sink.letters();
    assert_eq!(letters.len(), 1);
    assert_eq!(letters[0].event.student_id, record.student_id);
    assert_eq!(letters[0].event.action, AuditAction::Create);
    assert_eq!(letters[0].event.request_id.as_deref(), Some("req-outage"));
    assert_eq!(letters[0].attempts, 5);
    assert!(letters[0].reason.contains("unreachable"));

    let stats = roster.service().emitter().stats();
    assert_eq!(stats.dead_lettered, 1);
    assert_eq!(stats.enqueued, 0);

    let fetched = roster.service().get_student(&record.student_id).await.unwrap();
    assert_eq!(fetched, record);
}

#[tokio::test(start_paused = true)]
async fn test_dead_letters_are_appended_to_the_configured_file() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("dead-letters.jsonl");
    let mut config = RosterConfig::default();
    config.emitter.dead_letter_file = Some(path.clone());

    let roster = Roster::builder(config)
        .queue(Arc::new(DownQueue))
        .build()
        .unwrap();

    let ctx = RequestContext::generate();
    let first = roster.service().create_student(&ctx, json!({})).await.unwrap();
    let second = roster.service().create_student(&ctx, json!({})).await.unwrap();
    assert!(roster.service().emitter().drain(Duration::from_secs(60)).await);

    let contents = std::fs::read_to_string(&path).unwrap();
    let mut ids: Vec<String> = contents
        .lines()
        .map(|line| serde_json::from_str::<DeadLetter>(line).unwrap())
        .map(|letter| letter.event.student_id.to_string())
        .collect();
    ids.sort();
    let mut expected = vec![first.student_id.to_string(), second.student_id.to_string()];
    expected.sort();
    assert_eq!(ids, expected);
}

#[tokio::test(start_paused = true)]
async fn test_redelivered_event_is_stored_once() {
    let queue = Arc::new(InMemoryQueue::new(QueueConfig::default()));
    let roster = Roster::builder(RosterConfig::default())
        .queue(queue.clone())
        .build()
        .unwrap();

    let record = roster
        .service()
        .create_student(&RequestContext::generate(), json!({ "name": "Bo" }))
        .await
        .unwrap();
    assert!(roster.service().emitter().drain(Duration::from_secs(5)).await);

    // A worker takes the message and dies before acknowledging it.
    let abandoned = queue.receive(10, Duration::ZERO).await.unwrap();
    assert_eq!(abandoned.len(), 1);

    tokio::time::advance(Duration::from_secs(31)).await;

    let report = roster.writer().process_batch().await.unwrap();
    assert_eq!(report.received, 1);
    assert_eq!(report.persisted, 1);

    // A duplicate send of the same event.
    queue.send(abandoned[0].body.clone()).await.unwrap();
    let report = roster.writer().process_batch().await.unwrap();
    assert_eq!(report.received, 1);
    assert_eq!(report.duplicates, 1);
    assert_eq!(report.persisted, 0);

    let filter = AuditFilter::for_student(record.student_id);
    assert_eq!(audit_count(&roster, &filter).await, 1);
    assert_eq!(queue.depth().await.unwrap(), QueueDepth::default());
}

#[tokio::test]
async fn test_every_mutation_yields_one_entry_in_order() {
    let roster = Roster::builder(RosterConfig::default()).build().unwrap();
    let ctx = RequestContext::generate();
    let service = roster.service();

    let record = service.create_student(&ctx, json!({ "v": 1 })).await.unwrap();
    let id = record.student_id.clone();
    service
        .update_student(&ctx, &id, json!({ "v": 2 }), Some(1))
        .await
        .unwrap();
    service
        .update_student(&ctx, &id, json!({ "v": 3 }), None)
        .await
        .unwrap();
    service.delete_student(&ctx, &id).await.unwrap();

    assert!(service.emitter().drain(Duration::from_secs(5)).await);
    let report = roster.writer().drain().await.unwrap();
    assert_eq!(report.persisted, 4);

    let page = roster
        .query()
        .list_audit_entries(&AuditFilter::for_student(id), &PageRequest::default())
        .await
        .unwrap();
    let actions: Vec<AuditAction> = page.items.iter().map(|e| e.event.action).collect();
    assert_eq!(
        actions,
        [
            AuditAction::Create,
            AuditAction::Update,
            AuditAction::Update,
            AuditAction::Delete
        ]
    );
}

async fn http_request(addr: std::net::SocketAddr, raw: &str) -> String {
    let mut stream = TcpStream::connect(addr).await.unwrap();
    stream.write_all(raw.as_bytes()).await.unwrap();
    let mut response = String::new();
    stream.read_to_string(&mut response).await.unwrap();
    response
}

#[tokio::test]
async fn test_serve_runs_writers_and_shuts_down_cleanly() {
    let roster = Roster::builder(RosterConfig::default()).build().unwrap();
    let probe = roster.clone();

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let (stop_tx, stop_rx) = tokio::sync::oneshot::channel::<()>();
    let server = tokio::spawn(roster.serve(listener, async move {
        let _ = stop_rx.await;
    }));

    let body = r#"{"name":"Asha"}"#;
    let response = http_request(
        addr,
        &format!(
            "POST /students HTTP/1.1\r\nHost: roster\r\nContent-Type: application/json\r\n\
             Content-Length: {}\r\nConnection: close\r\n\r\n{body}",
            body.len()
        ),
    )
    .await;
    assert!(response.starts_with("HTTP/1.1 201"), "{response}");

    let mut stored = 0;
    for _ in 0..50 {
        stored = audit_count(&probe, &AuditFilter::all()).await;
        if stored == 1 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(100)).await;
    }
    assert_eq!(stored, 1);

    let health = http_request(
        addr,
        "GET /health HTTP/1.1\r\nHost: roster\r\nConnection: close\r\n\r\n",
    )
    .await;
    assert!(health.starts_with("HTTP/1.1 200"), "{health}");

    stop_tx.send(()).unwrap();
    server.await.unwrap().unwrap();
}
