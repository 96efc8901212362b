//! Integration tests for the backlog service
//!
//! These drive the public API end to end: queue while "offline", persist
//! across a simulated restart, then replay against a scripted transport and
//! check ordering, reconciliation, and what remains on disk afterwards.

use std::collections::VecDeque;
use std::path::Path;
use std::sync::{Arc, Mutex};

use serde_json::{json, Map};

use backhaul::{
    ApiMethod, BacklogConfig, BacklogEvent, BacklogService, ClientInfo, Codec, Error, HttpMethod,
    PendingRequest, PersistentStore, RequestsDocument, SessionsDocument, SqliteStore, Transport,
    TransportRequest, REQUESTS_KEY, SESSIONS_KEY,
};

/// Scripted transport that hands out canned responses in order and records
/// everything sent through it.
#[derive(Clone)]
struct ScriptedTransport {
    responses: Arc<Mutex<VecDeque<backhaul::Result<String>>>>,
    sent: Arc<Mutex<Vec<TransportRequest>>>,
}

impl ScriptedTransport {
    fn new(responses: Vec<backhaul::Result<String>>) -> Self {
        ScriptedTransport {
            responses: Arc::new(Mutex::new(responses.into())),
            sent: Arc::new(Mutex::new(Vec::new())),
        }
    }

    fn sent(&self) -> Vec<TransportRequest> {
        self.sent.lock().unwrap().clone()
    }
}

#[async_trait::async_trait]
impl Transport for ScriptedTransport {
    async fn send(&self, request: &TransportRequest) -> backhaul::Result<String> {
        self.sent.lock().unwrap().push(request.clone());
        self.responses
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_else(|| Err(Error::Transport("no canned response".to_string())))
    }
}

fn client() -> ClientInfo {
    ClientInfo {
        device_uuid: "device-uuid-1".to_string(),
        app_version: "2.3.0".to_string(),
    }
}

fn purchase(item: &str, amount: i64) -> PendingRequest {
    let mut post_data = Map::new();
    post_data.insert("item".to_string(), json!(item));
    post_data.insert("amount".to_string(), json!(amount));
    PendingRequest {
        method: ApiMethod::PurchaseItem,
        http_method: HttpMethod::Post,
        url: "https://hyperbees.dataspin.io/api/v1/purchase/".to_string(),
        post_data,
    }
}

fn read_documents(path: &Path) -> (SessionsDocument, RequestsDocument) {
    let store = SqliteStore::open(path).unwrap();
    let codec = Codec::legacy();
    let sessions = codec
        .decode(&store.get(SESSIONS_KEY).unwrap().unwrap())
        .unwrap();
    let requests = codec
        .decode(&store.get(REQUESTS_KEY).unwrap().unwrap())
        .unwrap();
    (sessions, requests)
}

#[tokio::test]
async fn test_offline_cycle_survives_restart_and_replays_in_order() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("backlog.db");

    // First run: offline. Open a session, queue two purchases, shut down.
    let placeholder = {
        let transport = ScriptedTransport::new(vec![]);
        let (service, handle, _events) = BacklogService::new(
            SqliteStore::open(&path).unwrap(),
            Codec::legacy(),
            transport,
            client(),
            &BacklogConfig::default(),
        );
        let worker = tokio::spawn(service.run());

        let placeholder = handle
            .open_offline_session(
                "https://hyperbees.dataspin.io/api/v1/register_old_session/".to_string(),
            )
            .await
            .unwrap();
        handle.track(purchase("coin_pack_10", 3)).unwrap();
        handle.track(purchase("gem_pouch", 1)).unwrap();
        handle.shutdown().unwrap();
        worker.await.unwrap().unwrap();
        placeholder
    };
    assert!(placeholder < 0);

    // The shutdown flush persisted everything, still placeholder-tagged.
    let (sessions, requests) = read_documents(&path);
    assert_eq!(sessions.sessions.len(), 1);
    assert_eq!(sessions.sessions[0].fake_id, placeholder);
    assert_eq!(requests.requests.len(), 2);
    assert_eq!(
        requests.requests[0].post_data["session"],
        json!(placeholder)
    );

    // Second run: connectivity is back. Replay everything.
    let transport = ScriptedTransport::new(vec![
        Ok(r#"{"id": 991}"#.to_string()),
        Ok("{}".to_string()),
        Ok("{}".to_string()),
    ]);
    let (service, handle, mut events) = BacklogService::new(
        SqliteStore::open(&path).unwrap(),
        Codec::legacy(),
        transport.clone(),
        client(),
        &BacklogConfig::default(),
    );
    let worker = tokio::spawn(service.run());
    handle.replay().unwrap();
    handle.shutdown().unwrap();
    worker.await.unwrap().unwrap();

    // Session registration first, then the requests in queue order, with
    // the placeholder rewritten to the server-assigned ID before they fire.
    let sent = transport.sent();
    assert_eq!(sent.len(), 3);
    assert!(sent[0].url.contains("register_old_session"));
    assert_eq!(sent[0].payload["end_user_device"], "device-uuid-1");
    assert_eq!(sent[0].payload["app_version"], "2.3.0");
    assert_eq!(sent[1].payload["item"], "coin_pack_10");
    assert_eq!(sent[1].payload["amount"], json!(3));
    assert_eq!(sent[1].payload["session"], json!(991));
    assert_eq!(sent[2].payload["item"], "gem_pouch");
    assert_eq!(sent[2].payload["session"], json!(991));

    assert_eq!(
        events.recv().await,
        Some(BacklogEvent::SessionReplayed {
            placeholder_id: placeholder,
            session_id: 991
        })
    );

    // Nothing pending on disk afterwards, and the pid counter kept its
    // position so future pids stay unique.
    let (sessions, requests) = read_documents(&path);
    assert!(sessions.sessions.is_empty());
    assert!(requests.requests.is_empty());
    assert_eq!(sessions.last_pid, -1);
}

#[tokio::test]
async fn test_failed_replay_leaves_records_for_the_next_attempt() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("backlog.db");

    let transport = ScriptedTransport::new(vec![
        Err(Error::Transport("API error (502): bad gateway".to_string())),
        Ok("{}".to_string()),
    ]);
    let (service, handle, mut events) = BacklogService::new(
        SqliteStore::open(&path).unwrap(),
        Codec::legacy(),
        transport,
        client(),
        &BacklogConfig::default(),
    );
    let worker = tokio::spawn(service.run());

    handle.set_live_session(77, 0.0).unwrap();
    handle.track(purchase("a", 1)).unwrap();
    handle.track(purchase("b", 1)).unwrap();
    handle.replay().unwrap();
    handle.shutdown().unwrap();
    worker.await.unwrap().unwrap();

    match events.recv().await.unwrap() {
        BacklogEvent::TaskFailed { task_pid, reason } => {
            assert_eq!(task_pid, 1);
            assert!(reason.contains("502"));
        }
        other => panic!("unexpected event: {:?}", other),
    }
    assert!(matches!(
        events.recv().await,
        Some(BacklogEvent::RequestReplayed { task_pid: 0 })
    ));

    // The failed record is the only one left on disk.
    let (_, requests) = read_documents(&path);
    assert_eq!(requests.requests.len(), 1);
    assert_eq!(requests.requests[0].task_pid, 1);
    assert_eq!(requests.requests[0].post_data["item"], "a");
}

#[tokio::test]
async fn test_corrupted_backlog_resets_and_keeps_serving() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("backlog.db");

    {
        let mut store = SqliteStore::open(&path).unwrap();
        store.set(SESSIONS_KEY, "not base64 ciphertext at all").unwrap();
    }

    let transport = ScriptedTransport::new(vec![Ok("{}".to_string())]);
    let (service, handle, mut events) = BacklogService::new(
        SqliteStore::open(&path).unwrap(),
        Codec::legacy(),
        transport.clone(),
        client(),
        &BacklogConfig::default(),
    );
    let worker = tokio::spawn(service.run());

    // Queue and replay to prove the service recovered into a working state.
    handle.set_live_session(5, 0.0).unwrap();
    handle.track(purchase("a", 1)).unwrap();
    handle.replay().unwrap();
    handle.shutdown().unwrap();
    worker.await.unwrap().unwrap();

    match events.recv().await.unwrap() {
        BacklogEvent::BacklogCorrupted { key, .. } => assert_eq!(key, SESSIONS_KEY),
        other => panic!("unexpected event: {:?}", other),
    }
    assert!(matches!(
        events.recv().await,
        Some(BacklogEvent::RequestReplayed { .. })
    ));
    assert_eq!(transport.sent().len(), 1);

    // The corrupted document was replaced by a valid empty one.
    let (sessions, _) = read_documents(&path);
    assert!(sessions.sessions.is_empty());
}

#[tokio::test]
async fn test_legacy_encrypted_document_is_readable() {
    // A requests document produced by an older client: AES-128-ECB with the
    // embedded key, PKCS7 padding, base64. The codec must keep decoding it.
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("backlog.db");

    let legacy_doc = RequestsDocument {
        requests: vec![backhaul::QueuedRequest {
            url: "https://hyperbees.dataspin.io/api/v1/register_event/".to_string(),
            dataspin_method: ApiMethod::RegisterEvent,
            http_method: HttpMethod::Post,
            post_data: {
                let mut m = Map::new();
                m.insert("event".to_string(), json!("level_up"));
                m.insert("session".to_string(), json!(-4821));
                m
            },
            task_pid: 0,
        }],
    };
    {
        let mut store = SqliteStore::open(&path).unwrap();
        let blob = Codec::legacy().encode(&legacy_doc).unwrap();
        store.set(REQUESTS_KEY, &blob).unwrap();
    }

    let transport = ScriptedTransport::new(vec![Ok("{}".to_string())]);
    let (service, handle, mut events) = BacklogService::new(
        SqliteStore::open(&path).unwrap(),
        Codec::legacy(),
        transport.clone(),
        client(),
        &BacklogConfig::default(),
    );
    let worker = tokio::spawn(service.run());
    handle.replay().unwrap();
    handle.shutdown().unwrap();
    worker.await.unwrap().unwrap();

    assert!(matches!(
        events.recv().await,
        Some(BacklogEvent::RequestReplayed { task_pid: 0 })
    ));
    let sent = transport.sent();
    assert_eq!(sent.len(), 1);
    assert_eq!(sent[0].payload["event"], "level_up");
}
