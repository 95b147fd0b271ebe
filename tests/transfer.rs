mod common;

use axum::http::StatusCode;
use common::{Seen, TestServer, event_log, is_error, is_finish, payload, wait_for};
use rangeload::{
    CallbackContext, PersistenceType, PriorityScheduler, TransferConfigBuilder, TransferError,
    TransferManager, TransferRecord, TransferRecordStore, TransferRequest, TransferStatus,
    TransferTable,
};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;

const LEN: usize = 10_000;

fn manager_with_store(dir: &Path, store: TransferRecordStore) -> Arc<TransferManager> {
    let config = TransferConfigBuilder::new()
        .folder(dir)
        .worker_threads(2)
        .chunk_size(1024)
        .persistence_type(PersistenceType::Memory)
        .build()
        .unwrap();
    TransferManager::new(
        config,
        store,
        Arc::new(PriorityScheduler::new(2)),
        CallbackContext::new(64),
    )
    .unwrap()
}

fn harness() -> (TempDir, TransferRecordStore, Arc<TransferManager>) {
    let dir = tempfile::tempdir().unwrap();
    let store = TransferRecordStore::memory(TransferTable::Download);
    let manager = manager_with_store(dir.path(), store.clone());
    (dir, store, manager)
}

/// A paused record that already holds `current` bytes of `name`.
fn partial_record(server: &TestServer, dir: &Path, name: &str, current: i64) -> TransferRecord {
    let mut record = TransferRecord::new(name, TransferRequest::get(server.url(name)));
    record.folder = Some(dir.to_string_lossy().into_owned());
    record.file_name = Some(name.to_string());
    record.file_path = Some(dir.join(name).to_string_lossy().into_owned());
    record.current_size = current;
    record.total_size = LEN as i64;
    record.status = TransferStatus::Pause;
    record.extra1 = Some(server.etag(name));
    record
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn fresh_download_finishes() {
    let server = TestServer::spawn().await;
    server.put("f.bin", payload(LEN));
    let (dir, store, manager) = harness();
    let (listener, mut rx) = event_log();

    let task = manager
        .request("f", TransferRequest::get(server.url("f.bin")))
        .unwrap();
    task.register("log", listener);
    task.save().await.unwrap();
    task.start().await.unwrap();

    let seen = wait_for(&mut rx, is_finish).await;
    let expected = dir.path().join("f.bin");
    assert!(matches!(seen.first(), Some(Seen::Start)));
    assert!(matches!(seen.get(1), Some(Seen::Progress(TransferStatus::Waiting, 0))));
    assert!(
        seen.iter()
            .any(|e| matches!(e, Seen::Progress(TransferStatus::Loading, n) if *n == LEN as i64))
    );
    match seen.last() {
        Some(Seen::Finish(path)) => assert_eq!(path, &expected),
        other => panic!("expected finish, got {:?}", other),
    }

    assert_eq!(std::fs::read(&expected).unwrap(), payload(LEN));
    let record = store.get("f").await.unwrap().unwrap();
    assert_eq!(record.status, TransferStatus::Finish);
    assert_eq!(record.current_size, LEN as i64);
    assert_eq!(record.total_size, LEN as i64);
    assert_eq!(record.extra1, Some(server.etag("f.bin")));
    assert_eq!(record.file_name.as_deref(), Some("f.bin"));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn unknown_length_is_learned_at_stream_end() {
    let server = TestServer::spawn().await;
    server.put("chunked.bin", payload(LEN));
    server.omit_length(true);
    let (_dir, _store, manager) = harness();
    let (listener, mut rx) = event_log();

    let task = manager
        .request("chunked", TransferRequest::get(server.url("chunked.bin")))
        .unwrap();
    task.register("log", listener);
    task.save().await.unwrap();
    task.start().await.unwrap();
    wait_for(&mut rx, is_finish).await;

    let record = task.record();
    assert_eq!(record.total_size, LEN as i64);
    assert_eq!(record.current_size, LEN as i64);
    assert_eq!(record.fraction, 1.0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn temp_file_is_renamed_on_finish() {
    let server = TestServer::spawn().await;
    server.put("t.bin", payload(LEN));
    let (dir, _store, manager) = harness();
    let (listener, mut rx) = event_log();

    let task = manager
        .request("t", TransferRequest::get(server.url("t.bin")))
        .unwrap();
    task.file_name("final.bin")
        .temp_file_name("final.part")
        .register("log", listener);
    task.save().await.unwrap();
    task.start().await.unwrap();

    let seen = wait_for(&mut rx, is_finish).await;
    let final_path = dir.path().join("final.bin");
    assert!(matches!(seen.last(), Some(Seen::Finish(p)) if *p == final_path));
    assert_eq!(std::fs::read(&final_path).unwrap(), payload(LEN));
    assert!(!dir.path().join("final.part").exists());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn resume_sends_range_and_if_range() {
    let server = TestServer::spawn().await;
    let body = payload(LEN);
    server.put("r.bin", body.clone());
    let (dir, store, manager) = harness();
    std::fs::write(dir.path().join("r.bin"), &body[..4000]).unwrap();
    store
        .replace(&partial_record(&server, dir.path(), "r.bin", 4000))
        .await
        .unwrap();

    let restored = manager.restore().await.unwrap();
    assert_eq!(restored.len(), 1);
    let (listener, mut rx) = event_log();
    let task = manager.get_task("r.bin").unwrap();
    task.register("log", listener);
    task.start().await.unwrap();
    wait_for(&mut rx, is_finish).await;

    let requests = server.requests_for("r.bin");
    assert_eq!(requests.len(), 1);
    assert_eq!(requests[0].range.as_deref(), Some("bytes=4000-"));
    assert_eq!(requests[0].if_range, Some(server.etag("r.bin")));
    assert_eq!(std::fs::read(dir.path().join("r.bin")).unwrap(), body);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn restored_temp_file_task_resumes_into_the_temp_file() {
    let server = TestServer::spawn().await;
    let body = payload(LEN);
    server.put("tmp.bin", body.clone());
    let (dir, store, manager) = harness();
    std::fs::write(dir.path().join("tmp.bin.part"), &body[..4000]).unwrap();
    let mut record = partial_record(&server, dir.path(), "tmp.bin", 4000);
    record.temp_file_name = Some("tmp.bin.part".into());
    store.replace(&record).await.unwrap();

    manager.restore().await.unwrap();
    let (listener, mut rx) = event_log();
    let task = manager.get_task("tmp.bin").unwrap();
    assert_eq!(task.record().temp_file_name.as_deref(), Some("tmp.bin.part"));
    task.register("log", listener);
    task.start().await.unwrap();

    let seen = wait_for(&mut rx, is_finish).await;
    let final_path = dir.path().join("tmp.bin");
    assert!(matches!(seen.last(), Some(Seen::Finish(p)) if *p == final_path));
    let requests = server.requests_for("tmp.bin");
    assert_eq!(requests.len(), 1);
    assert_eq!(requests[0].range.as_deref(), Some("bytes=4000-"));
    assert_eq!(std::fs::read(&final_path).unwrap(), body);
    assert!(!dir.path().join("tmp.bin.part").exists());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn body_longer_than_the_recorded_total_expires() {
    let server = TestServer::spawn().await;
    let body = payload(LEN);
    server.put("o.bin", body.clone());
    let (dir, store, manager) = harness();
    let recorded_total = 8000i64;
    std::fs::write(dir.path().join("o.bin"), &body[..4000]).unwrap();
    let mut record = partial_record(&server, dir.path(), "o.bin", 4000);
    record.total_size = recorded_total;
    store.replace(&record).await.unwrap();

    manager.restore().await.unwrap();
    let (listener, mut rx) = event_log();
    let task = manager.get_task("o.bin").unwrap();
    task.register("log", listener);
    task.start().await.unwrap();

    let seen = wait_for(&mut rx, is_error).await;
    assert!(matches!(
        seen.last(),
        Some(Seen::Error(Some(TransferError::ProtocolExpiry(_))))
    ));
    assert!(
        seen.iter()
            .all(|e| !matches!(e, Seen::Progress(_, n) if *n > recorded_total))
    );
    assert_eq!(
        server.requests_for("o.bin")[0].range.as_deref(),
        Some("bytes=4000-")
    );

    let record = task.record();
    assert_eq!(record.total_size, recorded_total);
    assert!(record.current_size <= recorded_total);
    let stored = store.get("o.bin").await.unwrap().unwrap();
    assert!(stored.current_size <= stored.total_size);
    assert!(std::fs::metadata(dir.path().join("o.bin")).unwrap().len() as i64 <= recorded_total);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn stale_token_downloads_the_whole_file_again() {
    let server = TestServer::spawn().await;
    server.put("s.bin", payload(LEN));
    let (dir, store, manager) = harness();
    std::fs::write(dir.path().join("s.bin"), vec![0xFFu8; 4000]).unwrap();
    let mut record = partial_record(&server, dir.path(), "s.bin", 4000);
    record.extra1 = Some("\"v0\"".into());
    store.replace(&record).await.unwrap();

    manager.restore().await.unwrap();
    let (listener, mut rx) = event_log();
    let task = manager.get_task("s.bin").unwrap();
    task.register("log", listener);
    task.start().await.unwrap();
    wait_for(&mut rx, is_finish).await;

    assert_eq!(std::fs::read(dir.path().join("s.bin")).unwrap(), payload(LEN));
    let record = task.record();
    assert_eq!(record.total_size, LEN as i64);
    assert_eq!(record.extra1, Some(server.etag("s.bin")));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn missing_partial_file_restarts_from_zero() {
    let server = TestServer::spawn().await;
    server.put("m.bin", payload(LEN));
    let (dir, store, manager) = harness();
    store
        .replace(&partial_record(&server, dir.path(), "m.bin", 4000))
        .await
        .unwrap();

    manager.restore().await.unwrap();
    let (listener, mut rx) = event_log();
    let task = manager.get_task("m.bin").unwrap();
    task.register("log", listener);
    task.start().await.unwrap();
    wait_for(&mut rx, is_finish).await;

    let requests = server.requests_for("m.bin");
    assert_eq!(requests.len(), 1);
    assert_eq!(requests[0].range, None);
    assert_eq!(std::fs::read(dir.path().join("m.bin")).unwrap(), payload(LEN));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn missing_partial_file_without_path_expires() {
    let server = TestServer::spawn().await;
    server.put("n.bin", payload(LEN));
    let (dir, store, manager) = harness();
    let mut record = partial_record(&server, dir.path(), "n.bin", 4000);
    record.file_name = None;
    record.file_path = None;
    store.replace(&record).await.unwrap();

    manager.restore().await.unwrap();
    let (listener, mut rx) = event_log();
    let task = manager.get_task("n.bin").unwrap();
    task.register("log", listener);
    task.start().await.unwrap();

    let seen = wait_for(&mut rx, is_error).await;
    assert!(matches!(
        seen.last(),
        Some(Seen::Error(Some(TransferError::ProtocolExpiry(_))))
    ));
    assert_eq!(task.status(), TransferStatus::Error);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn unsatisfiable_range_expires_the_breakpoint() {
    let server = TestServer::spawn().await;
    server.put("e.bin", payload(LEN));
    let (dir, store, manager) = harness();
    std::fs::write(dir.path().join("e.bin"), payload(LEN + 2000)).unwrap();
    store
        .replace(&partial_record(&server, dir.path(), "e.bin", (LEN + 2000) as i64))
        .await
        .unwrap();

    manager.restore().await.unwrap();
    let (listener, mut rx) = event_log();
    let task = manager.get_task("e.bin").unwrap();
    task.register("log", listener);
    task.start().await.unwrap();

    let seen = wait_for(&mut rx, is_error).await;
    assert!(matches!(
        seen.last(),
        Some(Seen::Error(Some(TransferError::ProtocolExpiry(_))))
    ));
    let record = task.record();
    assert_eq!(record.extra1, None);
    assert_eq!(record.current_size, 0);
    let stored = store.get("e.bin").await.unwrap().unwrap();
    assert_eq!(stored.status, TransferStatus::Error);
    assert_eq!(stored.extra1, None);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn server_refusals_are_network_errors() {
    let server = TestServer::spawn().await;
    server.put("broken.bin", payload(LEN));
    server.force_status("broken.bin", StatusCode::INTERNAL_SERVER_ERROR);
    let (_dir, _store, manager) = harness();

    for (tag, name) in [("missing", "nothing-here.bin"), ("broken", "broken.bin")] {
        let (listener, mut rx) = event_log();
        let task = manager
            .request(tag, TransferRequest::get(server.url(name)))
            .unwrap();
        task.register("log", listener);
        task.save().await.unwrap();
        task.start().await.unwrap();

        let seen = wait_for(&mut rx, is_error).await;
        assert!(
            matches!(seen.last(), Some(Seen::Error(Some(TransferError::Network(_))))),
            "{}: {:?}",
            tag,
            seen
        );
        assert_eq!(task.status(), TransferStatus::Error);
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn pause_then_resume_continues_with_range() {
    let server = TestServer::spawn().await;
    let len = 64 * 1024;
    server.put("p.bin", payload(len));
    server.slow_down(Duration::from_millis(20));
    let (dir, _store, manager) = harness();
    let (listener, mut rx) = event_log();

    let task = manager
        .request("p", TransferRequest::get(server.url("p.bin")))
        .unwrap();
    task.register("log", listener);
    task.save().await.unwrap();
    task.start().await.unwrap();

    wait_for(&mut rx, |e| {
        matches!(e, Seen::Progress(TransferStatus::Loading, n) if *n >= 4096)
    })
    .await;
    task.pause().await.unwrap();
    wait_for(&mut rx, |e| matches!(e, Seen::Progress(TransferStatus::Pause, _))).await;

    let paused_at = task.record().current_size;
    assert!(paused_at > 0 && paused_at < len as i64);
    // the body flushes after it stops reading
    let part = dir.path().join("p.bin");
    tokio::time::timeout(Duration::from_secs(5), async {
        while std::fs::metadata(&part).map(|m| m.len() as i64).unwrap_or(-1) != paused_at {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .unwrap();

    server.slow_down(Duration::ZERO);
    task.start().await.unwrap();
    wait_for(&mut rx, is_finish).await;

    let requests = server.requests_for("p.bin");
    assert_eq!(requests.len(), 2);
    assert_eq!(requests[1].range, Some(format!("bytes={}-", paused_at)));
    assert_eq!(std::fs::read(dir.path().join("p.bin")).unwrap(), payload(len));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn start_while_queued_or_running_is_ignored() {
    let server = TestServer::spawn().await;
    server.put("i.bin", payload(16 * 1024));
    server.slow_down(Duration::from_millis(10));
    let (_dir, _store, manager) = harness();
    let (listener, mut rx) = event_log();

    let task = manager
        .request("i", TransferRequest::get(server.url("i.bin")))
        .unwrap();
    task.register("log", listener);
    task.save().await.unwrap();
    task.start().await.unwrap();
    task.start().await.unwrap();

    let seen = wait_for(&mut rx, is_finish).await;
    assert_eq!(seen.iter().filter(|e| matches!(e, Seen::Start)).count(), 1);
    assert_eq!(server.requests_for("i.bin").len(), 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn finished_task_is_verified_restarted_and_checked_for_damage() {
    let server = TestServer::spawn().await;
    server.put("d.bin", payload(LEN));
    let (dir, _store, manager) = harness();
    let (listener, mut rx) = event_log();
    let file = dir.path().join("d.bin");

    let task = manager
        .request("d", TransferRequest::get(server.url("d.bin")))
        .unwrap();
    task.register("log", listener);
    task.save().await.unwrap();
    task.start().await.unwrap();
    wait_for(&mut rx, is_finish).await;

    // starting a finished task re-delivers the finish without a request
    task.start().await.unwrap();
    let seen = wait_for(&mut rx, is_finish).await;
    assert!(matches!(seen.last(), Some(Seen::Finish(p)) if *p == file));
    assert_eq!(server.requests_for("d.bin").len(), 1);

    // restart downloads again from zero
    task.restart().await.unwrap();
    wait_for(&mut rx, is_finish).await;
    let requests = server.requests_for("d.bin");
    assert_eq!(requests.len(), 2);
    assert_eq!(requests[1].range, None);
    assert_eq!(std::fs::read(&file).unwrap(), payload(LEN));

    // a finished file that disappeared is reported as damaged
    std::fs::remove_file(&file).unwrap();
    task.start().await.unwrap();
    let seen = wait_for(&mut rx, is_error).await;
    assert!(matches!(
        seen.last(),
        Some(Seen::Error(Some(TransferError::Storage(_))))
    ));
    assert_eq!(task.status(), TransferStatus::Error);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn remove_deletes_file_and_record() {
    let server = TestServer::spawn().await;
    server.put("x.bin", payload(LEN));
    let (dir, store, manager) = harness();
    let (first, mut first_rx) = event_log();
    let (second, mut second_rx) = event_log();

    let task = manager
        .request("x", TransferRequest::get(server.url("x.bin")))
        .unwrap();
    task.register("first", first).register("second", second);
    task.save().await.unwrap();
    task.start().await.unwrap();
    wait_for(&mut first_rx, is_finish).await;
    wait_for(&mut second_rx, is_finish).await;

    task.remove(true).await.unwrap();
    manager.flush_callbacks().await;
    for rx in [&mut first_rx, &mut second_rx] {
        wait_for(&mut *rx, |e| matches!(e, Seen::Remove)).await;
        assert!(rx.try_recv().is_err(), "nothing follows the removal");
    }
    assert!(task.listener_ids().is_empty());
    assert!(!dir.path().join("x.bin").exists());
    assert!(store.get("x").await.unwrap().is_none());
    assert!(!manager.has_task("x"));
    assert!(task.is_removed());

    task.remove(true).await.unwrap();
    manager.flush_callbacks().await;
    assert!(first_rx.try_recv().is_err());
    assert_eq!(task.start().await, Err(TransferError::NotSaved("x".into())));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn remove_while_loading_stops_the_transfer() {
    let server = TestServer::spawn().await;
    let len = 64 * 1024;
    server.put("l.bin", payload(len));
    server.slow_down(Duration::from_millis(20));
    let (dir, store, manager) = harness();
    let (listener, mut rx) = event_log();

    let task = manager
        .request("l", TransferRequest::get(server.url("l.bin")))
        .unwrap();
    task.register("log", listener);
    task.save().await.unwrap();
    task.start().await.unwrap();
    wait_for(&mut rx, |e| {
        matches!(e, Seen::Progress(TransferStatus::Loading, n) if *n >= 2048)
    })
    .await;

    task.remove(true).await.unwrap();
    let seen = wait_for(&mut rx, |e| matches!(e, Seen::Remove)).await;
    assert!(!seen.iter().any(is_finish));

    manager.flush_callbacks().await;
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert!(!dir.path().join("l.bin").exists());
    assert!(store.get("l").await.unwrap().is_none());
    assert!(!manager.has_task("l"));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn sqlite_store_keeps_the_finished_state() {
    let server = TestServer::spawn().await;
    server.put("q.bin", payload(LEN));
    let dir = tempfile::tempdir().unwrap();
    let store = TransferRecordStore::open(
        &PersistenceType::Sqlite(dir.path().join("transfers.db")),
        TransferTable::Download,
    )
    .await
    .unwrap();
    let manager = manager_with_store(&dir.path().join("files"), store.clone());
    let (listener, mut rx) = event_log();

    let task = manager
        .request("q", TransferRequest::get(server.url("q.bin")))
        .unwrap();
    task.priority(5).extra2(vec![1, 2, 3]).register("log", listener);
    task.save().await.unwrap();
    task.start().await.unwrap();
    wait_for(&mut rx, is_finish).await;

    let record = store.get("q").await.unwrap().unwrap();
    assert_eq!(record.status, TransferStatus::Finish);
    assert_eq!(record.current_size, LEN as i64);
    assert_eq!(record.priority, 5);
    assert_eq!(record.extra2, Some(vec![1, 2, 3]));
    assert_eq!(record.fraction, 1.0);
}
