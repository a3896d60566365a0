//! End-to-end replication tests against the in-memory remote.

use ferrydb_core::{Event, UnsavedAttachment};
use ferrydb_sync_engine::{
    Fault, FaultOp, HttpClient, HttpInterceptor, HttpRemoteDatabase, HttpRequest, HttpResponse,
    MemoryRemoteDatabase, RemoteDatabase, Replicator, ReplicatorConfig, ReplicatorState,
    RequestContext, ResponseContext, RetryConfig, SyncResult,
};
use ferrydb_sync_protocol::{BulkDocsRequest, CheckpointDoc, RevsDiffRequest};
use ferrydb_testkit::{person_doc, populate, TestStore};
use std::io::Read;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::mpsc::Receiver;
use std::sync::Arc;
use std::time::Duration;

fn config() -> ReplicatorConfig {
    ReplicatorConfig::default().with_retry(RetryConfig::no_retry())
}

/// Drains the event receiver and returns
/// `(started, completed, errored)` counts.
fn replication_events(rx: &Receiver<Event>) -> (usize, usize, usize) {
    let mut counts = (0, 0, 0);
    while let Ok(event) = rx.try_recv() {
        match event {
            Event::ReplicationStarted { .. } => counts.0 += 1,
            Event::ReplicationCompleted { .. } => counts.1 += 1,
            Event::ReplicationErrored { .. } => counts.2 += 1,
            _ => {}
        }
    }
    counts
}

#[test]
fn push_two_documents_to_empty_remote() {
    let local = TestStore::new();
    local.create("tom", person_doc("Tom", 31), Vec::new()).unwrap();
    local.create("jerry", person_doc("Jerry", 52), Vec::new()).unwrap();

    let remote = Arc::new(MemoryRemoteDatabase::new());
    let events = local.subscribe();
    let replicator = Replicator::push(
        local.handle(),
        Arc::clone(&remote) as Arc<dyn RemoteDatabase>,
        config(),
    );

    assert_eq!(replicator.state(), ReplicatorState::Pending);
    replicator.start().unwrap();
    assert_eq!(replicator.wait(), ReplicatorState::Complete);

    assert_eq!(remote.changes(0, 100).unwrap().results.len(), 2);
    assert_eq!(replicator.documents_replicated(), 2);

    let (started, completed, errored) = replication_events(&events);
    assert_eq!(started, 1);
    assert_eq!(completed, 1);
    assert_eq!(errored, 0);
}

/// A remote decorator that slows every call down, so a stop request
/// reliably lands mid-run.
struct SlowRemote {
    inner: Arc<MemoryRemoteDatabase>,
    delay: Duration,
}

impl SlowRemote {
    fn pause(&self) {
        std::thread::sleep(self.delay);
    }
}

impl RemoteDatabase for SlowRemote {
    fn uri(&self) -> String {
        self.inner.uri()
    }

    fn changes(
        &self,
        since: u64,
        limit: usize,
    ) -> SyncResult<ferrydb_sync_protocol::ChangesResponse> {
        self.pause();
        self.inner.changes(since, limit)
    }

    fn revs_diff(
        &self,
        request: &RevsDiffRequest,
    ) -> SyncResult<ferrydb_sync_protocol::RevsDiffResponse> {
        self.pause();
        self.inner.revs_diff(request)
    }

    fn open_revs(
        &self,
        id: &str,
        revs: &[String],
        atts_since: &[String],
    ) -> SyncResult<Vec<ferrydb_sync_engine::OpenRevision>> {
        self.pause();
        self.inner.open_revs(id, revs, atts_since)
    }

    fn bulk_docs(
        &self,
        docs: &[ferrydb_sync_protocol::DocumentRevs],
    ) -> SyncResult<Vec<ferrydb_sync_protocol::BulkDocsResponseItem>> {
        self.pause();
        self.inner.bulk_docs(docs)
    }

    fn put_doc_with_attachments(
        &self,
        doc: &ferrydb_sync_protocol::DocumentRevs,
        attachments: &[(String, Vec<u8>)],
    ) -> SyncResult<()> {
        self.pause();
        self.inner.put_doc_with_attachments(doc, attachments)
    }

    fn get_checkpoint(&self, replication_id: &str) -> SyncResult<Option<u64>> {
        self.inner.get_checkpoint(replication_id)
    }

    fn put_checkpoint(&self, replication_id: &str, last_seq: u64) -> SyncResult<()> {
        self.pause();
        self.inner.put_checkpoint(replication_id, last_seq)
    }
}

#[test]
fn push_stopped_mid_run_settles_at_stopped() {
    let local = TestStore::new();
    populate(&local, 1000);

    let remote = Arc::new(MemoryRemoteDatabase::new());
    let slow = Arc::new(SlowRemote {
        inner: Arc::clone(&remote),
        delay: Duration::from_millis(2),
    });
    let events = local.subscribe();
    let replicator = Replicator::push(
        local.handle(),
        slow as Arc<dyn RemoteDatabase>,
        config().with_batch_size(20),
    );

    replicator.start().unwrap();
    assert_eq!(replicator.state(), ReplicatorState::Started);
    std::thread::sleep(Duration::from_millis(50));
    replicator.stop();
    // stop() is idempotent while draining.
    replicator.stop();

    assert_eq!(replicator.wait(), ReplicatorState::Stopped);
    let pushed = remote.changes(0, 10_000).unwrap().results.len();
    assert!(pushed < 1000, "stop landed too late: {pushed} docs pushed");

    let (_, completed, errored) = replication_events(&events);
    assert_eq!(completed, 1);
    assert_eq!(errored, 0);
}

/// Routes the engine's HTTP requests straight into a
/// [`MemoryRemoteDatabase`], covering the URL and JSON codepaths without
/// sockets.
struct LoopbackClient {
    remote: Arc<MemoryRemoteDatabase>,
}

fn json_response<T: serde::Serialize>(status: u16, value: &T) -> SyncResult<HttpResponse> {
    let body = serde_json::to_vec(value).expect("serialize response");
    Ok(HttpResponse {
        status,
        headers: vec![("Content-Type".into(), "application/json".into())],
        body: Box::new(std::io::Cursor::new(body)),
    })
}

fn empty_response(status: u16) -> SyncResult<HttpResponse> {
    Ok(HttpResponse {
        status,
        headers: Vec::new(),
        body: Box::new(std::io::empty()),
    })
}

fn query_param(query: &str, name: &str) -> Option<u64> {
    query
        .split('&')
        .find_map(|pair| pair.strip_prefix(&format!("{name}=")))
        .and_then(|value| value.parse().ok())
}

fn request_body(request: &HttpRequest) -> Vec<u8> {
    let mut bytes = Vec::new();
    if let Some(body) = &request.body {
        body.open().read_to_end(&mut bytes).expect("read body");
    }
    bytes
}

impl HttpClient for LoopbackClient {
    fn execute(&self, request: &HttpRequest) -> SyncResult<HttpResponse> {
        let path_query = request
            .url
            .strip_prefix("http://remote.example/db/")
            .unwrap_or(&request.url);
        let (path, query) = path_query.split_once('?').unwrap_or((path_query, ""));

        match (request.method, path) {
            ("GET", "_changes") => {
                let since = query_param(query, "since").unwrap_or(0);
                let limit = query_param(query, "limit").unwrap_or(u64::MAX) as usize;
                json_response(200, &self.remote.changes(since, limit)?)
            }
            ("POST", "_revs_diff") => {
                let diff: RevsDiffRequest =
                    serde_json::from_slice(&request_body(request)).expect("revs_diff body");
                json_response(200, &self.remote.revs_diff(&diff)?)
            }
            ("POST", "_bulk_docs") => {
                let bulk: BulkDocsRequest =
                    serde_json::from_slice(&request_body(request)).expect("bulk_docs body");
                assert!(!bulk.new_edits);
                json_response(201, &self.remote.bulk_docs(&bulk.docs)?)
            }
            ("GET", local) if local.starts_with("_local/") => {
                match self.remote.get_checkpoint(&local["_local/".len()..])? {
                    Some(last_seq) => json_response(200, &CheckpointDoc::new(last_seq)),
                    None => empty_response(404),
                }
            }
            ("PUT", local) if local.starts_with("_local/") => {
                let doc: CheckpointDoc =
                    serde_json::from_slice(&request_body(request)).expect("checkpoint body");
                self.remote
                    .put_checkpoint(&local["_local/".len()..], doc.last_seq)?;
                json_response(201, &serde_json::json!({"ok": true}))
            }
            _ => empty_response(404),
        }
    }
}

#[derive(Default)]
struct CountingInterceptor {
    requests: AtomicU32,
    responses: AtomicU32,
}

impl HttpInterceptor for CountingInterceptor {
    fn intercept_request(&self, _ctx: &mut RequestContext<'_>) -> SyncResult<()> {
        self.requests.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn intercept_response(&self, _ctx: &mut ResponseContext<'_>) -> SyncResult<()> {
        self.responses.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

#[test]
fn interceptors_observe_push_over_http() {
    let local = TestStore::new();
    local.create("tom", person_doc("Tom", 31), Vec::new()).unwrap();

    let memory = Arc::new(MemoryRemoteDatabase::new());
    let counter = Arc::new(CountingInterceptor::default());
    let remote = HttpRemoteDatabase::new(
        "http://remote.example/db/",
        Arc::new(LoopbackClient {
            remote: Arc::clone(&memory),
        }),
        vec![Arc::clone(&counter) as Arc<dyn HttpInterceptor>],
        &config(),
    );

    let replicator = Replicator::push(local.handle(), Arc::new(remote), config());
    replicator.start().unwrap();
    assert_eq!(replicator.wait(), ReplicatorState::Complete);

    assert_eq!(memory.changes(0, 10).unwrap().results.len(), 1);
    assert!(counter.requests.load(Ordering::SeqCst) >= 1);
    assert!(counter.responses.load(Ordering::SeqCst) >= 1);
}

#[test]
fn pull_preserves_remote_conflict_branches() {
    let local = TestStore::new();
    let r1 = local.create("d", person_doc("d", 1), Vec::new()).unwrap();
    let root = r1.rev_id.to_string();

    let remote = Arc::new(MemoryRemoteDatabase::new());
    remote.seed_doc("unrelated", person_doc("x", 0));
    let b1 = format!("2-{}", "1".repeat(32));
    let b2 = format!("2-{}", "2".repeat(32));
    remote.insert_branch("d", &[root.clone(), b1.clone()], person_doc("d", 21), false);
    remote.insert_branch("d", &[root, b2.clone()], person_doc("d", 22), false);

    let replicator = Replicator::pull(
        local.handle(),
        Arc::clone(&remote) as Arc<dyn RemoteDatabase>,
        config(),
    );
    replicator.start().unwrap();
    assert_eq!(replicator.wait(), ReplicatorState::Complete);

    let leaves = local.leaves("d").unwrap();
    assert_eq!(leaves.len(), 2);

    // Same generation: the lexicographically greater digest wins.
    let winner = local.get("d").unwrap();
    assert_eq!(winner.rev_id.to_string(), b2);

    let conflicts = local.conflicts("d").unwrap();
    assert_eq!(conflicts.len(), 1);
    assert_eq!(conflicts[0].rev_id.to_string(), b1);
}

fn blob_file_count(store: &TestStore) -> usize {
    std::fs::read_dir(store.path().join("blobs"))
        .expect("blob dir")
        .count()
}

#[test]
fn identical_attachments_share_one_blob() {
    let payload = vec![0x5au8; 1024 * 1024];

    let local = TestStore::new();
    for id in ["first", "second"] {
        local
            .create(
                id,
                person_doc(id, 1),
                vec![UnsavedAttachment::from_bytes(
                    "blob.bin",
                    "application/octet-stream",
                    payload.clone(),
                )],
            )
            .unwrap();
    }
    assert_eq!(blob_file_count(&local), 1);

    let remote = Arc::new(MemoryRemoteDatabase::new());
    let push = Replicator::push(
        local.handle(),
        Arc::clone(&remote) as Arc<dyn RemoteDatabase>,
        config(),
    );
    push.start().unwrap();
    assert_eq!(push.wait(), ReplicatorState::Complete);

    // The remote received both documents with the full payload.
    assert_eq!(remote.document_count(), 2);
    for id in ["first", "second"] {
        let rev = remote.revs_of(id).pop().unwrap();
        assert_eq!(
            remote.attachment_of(id, &rev, "blob.bin").unwrap(),
            payload
        );
    }

    // Pulling into a fresh store dedups back to a single blob file.
    let fresh = TestStore::new();
    let pull = Replicator::pull(
        fresh.handle(),
        Arc::clone(&remote) as Arc<dyn RemoteDatabase>,
        config(),
    );
    pull.start().unwrap();
    assert_eq!(pull.wait(), ReplicatorState::Complete);

    assert_eq!(fresh.document_count().unwrap(), 2);
    assert_eq!(blob_file_count(&fresh), 1);
    let first = fresh.get("first").unwrap();
    let second = fresh.get("second").unwrap();
    assert_eq!(first.attachments[0].key, second.attachments[0].key);

    let mut restored = Vec::new();
    fresh
        .attachment_reader(&first.attachments[0])
        .unwrap()
        .read_to_end(&mut restored)
        .unwrap();
    assert_eq!(restored, payload);
}

#[test]
fn pull_resumes_from_checkpoint_without_refetching() {
    let remote = Arc::new(MemoryRemoteDatabase::new());
    remote.seed_docs(1000);

    let local = TestStore::new();
    let batch = 100;

    // First run dies on the second changes batch, after batch one was
    // fetched, inserted, and checkpointed.
    remote.set_fault(
        FaultOp::Changes,
        Fault {
            after_calls: 1,
            failures: u64::MAX,
            retryable: false,
        },
    );
    let first = Replicator::pull(
        local.handle(),
        Arc::clone(&remote) as Arc<dyn RemoteDatabase>,
        config().with_batch_size(batch),
    );
    first.start().unwrap();
    assert_eq!(first.wait(), ReplicatorState::Error);
    assert!(first.error().is_some());
    assert_eq!(remote.change_rows_served(), 100);
    assert_eq!(local.document_count().unwrap(), 100);

    let replication_id = first.replication_id().to_string();
    assert_eq!(remote.checkpoint(&replication_id), Some(100));

    // The restarted replicator resumes past the checkpoint; across both
    // runs each of the 1000 changes is fetched exactly once.
    remote.clear_faults();
    let second = Replicator::pull(
        local.handle(),
        Arc::clone(&remote) as Arc<dyn RemoteDatabase>,
        config().with_batch_size(batch),
    );
    assert_eq!(second.replication_id(), replication_id);
    second.start().unwrap();
    assert_eq!(second.wait(), ReplicatorState::Complete);

    assert_eq!(remote.change_rows_served(), 1000);
    assert_eq!(local.document_count().unwrap(), 1000);
}

#[test]
fn push_then_pull_of_identical_databases_is_a_noop() {
    let local = TestStore::new();
    populate(&local, 25);

    let remote = Arc::new(MemoryRemoteDatabase::new());
    let push = Replicator::push(
        local.handle(),
        Arc::clone(&remote) as Arc<dyn RemoteDatabase>,
        config(),
    );
    push.start().unwrap();
    assert_eq!(push.wait(), ReplicatorState::Complete);
    assert_eq!(remote.docs_written(), 25);

    let checkpoint_writes = remote.checkpoint_writes();
    let local_seq = local.last_sequence().unwrap();

    // A second push finds nothing missing and rewrites no checkpoint.
    let repush = Replicator::push(
        local.handle(),
        Arc::clone(&remote) as Arc<dyn RemoteDatabase>,
        config(),
    );
    repush.start().unwrap();
    assert_eq!(repush.wait(), ReplicatorState::Complete);
    assert_eq!(repush.documents_replicated(), 0);
    assert_eq!(remote.docs_written(), 25);
    assert_eq!(remote.checkpoint_writes(), checkpoint_writes);

    // Pulling the same content back inserts nothing locally.
    let pull = Replicator::pull(
        local.handle(),
        Arc::clone(&remote) as Arc<dyn RemoteDatabase>,
        config(),
    );
    pull.start().unwrap();
    assert_eq!(pull.wait(), ReplicatorState::Complete);
    assert_eq!(pull.documents_replicated(), 0);
    assert_eq!(local.last_sequence().unwrap(), local_seq);
}

#[test]
fn deletions_replicate_as_tombstones() {
    let local = TestStore::new();
    let rev = local.create("gone", person_doc("Gone", 1), Vec::new()).unwrap();
    local.delete("gone", &rev.rev_id).unwrap();
    local.create("kept", person_doc("Kept", 2), Vec::new()).unwrap();

    let remote = Arc::new(MemoryRemoteDatabase::new());
    let push = Replicator::push(
        local.handle(),
        Arc::clone(&remote) as Arc<dyn RemoteDatabase>,
        config(),
    );
    push.start().unwrap();
    assert_eq!(push.wait(), ReplicatorState::Complete);

    // The tombstone arrived: only "kept" counts as live.
    assert_eq!(remote.document_count(), 1);

    let fresh = TestStore::new();
    let pull = Replicator::pull(
        fresh.handle(),
        Arc::clone(&remote) as Arc<dyn RemoteDatabase>,
        config(),
    );
    pull.start().unwrap();
    assert_eq!(pull.wait(), ReplicatorState::Complete);

    assert_eq!(fresh.document_count().unwrap(), 1);
    assert!(fresh.get("gone").unwrap().deleted);
    assert!(!fresh.get("kept").unwrap().deleted);
}
