//! End-to-end scenarios for TSDB Writer
//!
//! Sessions here run over the real `BufferedWriteApi`, so the failure and
//! success hooks fire exactly as they do against InfluxDB.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use brivas_influx_sdk::{
    BufferedWriteApi, InfluxClient, InfluxConfig, InfluxError, LineTransport, Precision, WriteApi,
    WriteBatch, WriteOptions,
};
use parking_lot::Mutex;
use serde_json::{json, Value};
use tokio::net::TcpListener;

use crate::buffer::content_hash;
use crate::encoder::PointEncoder;
use crate::session::WriteSession;
use crate::store::{FileStore, KvStore, MemoryStore, StoreError, StoreResult};
use crate::{routes, AppState, Config, Error};

/// Records every batch; rejects batches whose body contains `reject`
#[derive(Default)]
struct ScriptedTransport {
    sent: Mutex<Vec<WriteBatch>>,
    calls: AtomicUsize,
    reject: Mutex<Option<String>>,
}

impl ScriptedTransport {
    fn reject_all(&self) {
        *self.reject.lock() = Some(String::new());
    }

    fn reject_containing(&self, pattern: &str) {
        *self.reject.lock() = Some(pattern.to_string());
    }

    fn accept_all(&self) {
        *self.reject.lock() = None;
    }

    fn sent(&self) -> Vec<WriteBatch> {
        self.sent.lock().clone()
    }
}

#[async_trait]
impl LineTransport for ScriptedTransport {
    async fn send(&self, batch: &WriteBatch) -> brivas_influx_sdk::Result<()> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if let Some(pattern) = self.reject.lock().as_deref() {
            if batch.body().contains(pattern) {
                return Err(InfluxError::Http {
                    status: 503,
                    message: "service unavailable".into(),
                });
            }
        }
        self.sent.lock().push(batch.clone());
        Ok(())
    }
}

/// Store whose writes and listings fail, as on a full or read-only disk
struct BrokenStore;

#[async_trait]
impl KvStore for BrokenStore {
    async fn list_keys(&self) -> StoreResult<Vec<String>> {
        Err(StoreError::Io(std::io::Error::other("disk unavailable")))
    }

    async fn get(&self, _key: &str) -> StoreResult<Option<Value>> {
        Ok(None)
    }

    async fn set(&self, _key: &str, _value: Option<Value>) -> StoreResult<()> {
        Err(StoreError::Io(std::io::Error::other("disk full")))
    }
}

/// First send waits for the gate and succeeds; every later send fails
struct GatedTransport {
    gate: tokio::sync::Semaphore,
    entered: tokio::sync::Notify,
    calls: AtomicUsize,
}

#[async_trait]
impl LineTransport for GatedTransport {
    async fn send(&self, _batch: &WriteBatch) -> brivas_influx_sdk::Result<()> {
        if self.calls.fetch_add(1, Ordering::SeqCst) > 0 {
            return Err(InfluxError::Connection("refused".into()));
        }
        self.entered.notify_one();
        let _open = self
            .gate
            .acquire()
            .await
            .map_err(|e| InfluxError::Connection(e.to_string()))?;
        Ok(())
    }
}

fn build_session(
    transport: &Arc<ScriptedTransport>,
    store: Arc<dyn KvStore>,
    default_measurement: Option<&str>,
) -> WriteSession {
    let transport: Arc<dyn LineTransport> = transport.clone();
    session_over(transport, store, default_measurement)
}

fn session_over(
    transport: Arc<dyn LineTransport>,
    store: Arc<dyn KvStore>,
    default_measurement: Option<&str>,
) -> WriteSession {
    let options = WriteOptions {
        precision: Precision::Milliseconds,
        batch_size: 100,
        flush_interval: None,
    };

    WriteSession::new(
        move |hooks| BufferedWriteApi::new(transport, hooks, options) as Arc<dyn WriteApi>,
        store,
        PointEncoder::new(default_measurement.map(str::to_string), Precision::Milliseconds),
    )
}

async fn wait_for_idle(session: &WriteSession) {
    let deadline = Instant::now() + Duration::from_secs(5);
    while session.coordinator().is_draining() {
        assert!(Instant::now() < deadline, "drain pass did not finish");
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}

fn lines(batch: &[&str]) -> WriteBatch {
    WriteBatch::new(batch.iter().map(|l| l.to_string()).collect())
}

#[tokio::test]
async fn test_failed_batch_is_replayed_after_next_success() {
    let transport = Arc::new(ScriptedTransport::default());
    let session = build_session(&transport, Arc::new(MemoryStore::new()), None);

    transport.reject_all();
    let err = session
        .submit(Some("room"), &json!({"temp": 21.5, "time": 1000}))
        .await
        .unwrap_err();
    assert!(matches!(err, Error::SinkFlush(_)));

    let failed = lines(&["room temp=21.5 1000"]);
    assert_eq!(
        session.buffer().list_keys().await.unwrap(),
        vec![content_hash(&failed)]
    );

    transport.accept_all();
    tokio_test::assert_ok!(session.submit(Some("door"), &json!({"open": true})).await);
    wait_for_idle(&session).await;

    assert_eq!(
        transport.sent(),
        vec![lines(&["door open=true"]), failed]
    );
    assert_eq!(session.buffer().len().await.unwrap(), 0);

    let resend = session.snapshot().resend;
    assert_eq!(resend.passes, 1);
    assert_eq!(resend.replayed_batches, 1);
    // the closing flush of the pass succeeds while the guard is still held
    assert_eq!(resend.skipped_triggers, 1);
    let report = resend.last_pass.unwrap();
    assert_eq!(report.keys, 1);
    assert!(report.flushed);
}

#[tokio::test]
async fn test_replay_failure_rebuffers_under_same_key() {
    let transport = Arc::new(ScriptedTransport::default());
    let session = build_session(&transport, Arc::new(MemoryStore::new()), None);

    transport.reject_all();
    let _ = session.submit(Some("cpu"), &json!({"load": 0.9})).await;
    let key = content_hash(&lines(&["cpu load=0.9"]));

    // healthy for new writes, still failing for the buffered content
    transport.reject_containing("cpu");
    tokio_test::assert_ok!(session.submit(Some("mem"), &json!({"used": 0.5})).await);
    wait_for_idle(&session).await;

    assert_eq!(session.buffer().list_keys().await.unwrap(), vec![key]);
    let report = session.snapshot().resend.last_pass.unwrap();
    assert_eq!(report.replayed, 1);
    assert!(!report.flushed);
}

#[tokio::test]
async fn test_missing_measurement_makes_no_network_calls() {
    let transport = Arc::new(ScriptedTransport::default());
    let session = build_session(&transport, Arc::new(MemoryStore::new()), None);

    let err = session.submit(None, &json!({"v": 1})).await.unwrap_err();

    assert!(matches!(err, Error::MissingMeasurement));
    assert_eq!(transport.calls.load(Ordering::SeqCst), 0);
    assert_eq!(session.snapshot().pending_lines, 0);
}

#[tokio::test]
async fn test_pair_list_is_written_as_one_batch() {
    let transport = Arc::new(ScriptedTransport::default());
    let session = build_session(&transport, Arc::new(MemoryStore::new()), Some("climate"));

    let payload = json!([
        [{"temp": 20}, {"room": "kitchen"}],
        [{"temp": "18i"}, {"room": "garage"}]
    ]);
    assert_eq!(session.submit(None, &payload).await.unwrap(), 2);
    wait_for_idle(&session).await;

    assert_eq!(
        transport.sent(),
        vec![lines(&[
            "climate,room=kitchen temp=20",
            "climate,room=garage temp=18i"
        ])]
    );
}

#[tokio::test]
async fn test_buffer_survives_restart() {
    let dir = tempfile::tempdir().unwrap();
    let failed = lines(&["boiler pressure=2.5"]);

    {
        let transport = Arc::new(ScriptedTransport::default());
        transport.reject_all();
        let store = Arc::new(FileStore::open(dir.path()).await.unwrap());
        let session = build_session(&transport, store, None);

        let _ = session.submit(Some("boiler"), &json!({"pressure": 2.5})).await;
        session.close().await.unwrap();
    }

    let transport = Arc::new(ScriptedTransport::default());
    let store = Arc::new(FileStore::open(dir.path()).await.unwrap());
    let session = build_session(&transport, store, None);
    assert_eq!(session.buffer().len().await.unwrap(), 1);

    assert!(session.signal_healthy());
    wait_for_idle(&session).await;

    assert_eq!(transport.sent(), vec![failed]);
    assert_eq!(session.buffer().len().await.unwrap(), 0);
}

#[tokio::test]
async fn test_concurrent_submissions_report_their_own_outcome() {
    let transport = Arc::new(GatedTransport {
        gate: tokio::sync::Semaphore::new(0),
        entered: tokio::sync::Notify::new(),
        calls: AtomicUsize::new(0),
    });
    let session = Arc::new(session_over(
        transport.clone(),
        Arc::new(MemoryStore::new()),
        Some("m"),
    ));

    let submit = |v: i64| {
        let session = Arc::clone(&session);
        tokio::spawn(async move { session.submit(None, &json!({"v": v})).await })
    };

    let first = submit(0);
    transport.entered.notified().await;
    let second = submit(1);
    let third = submit(2);
    tokio::time::sleep(Duration::from_millis(20)).await;
    transport.gate.add_permits(1);

    assert_eq!(first.await.unwrap().unwrap(), 1);
    assert!(matches!(second.await.unwrap(), Err(Error::SinkFlush(_))));
    assert!(matches!(third.await.unwrap(), Err(Error::SinkFlush(_))));
    wait_for_idle(&session).await;

    // a replay pass may merge entries, but no failed line goes missing
    let mut buffered = Vec::new();
    for key in session.buffer().list_keys().await.unwrap() {
        let batch = session.buffer().take(&key).await.unwrap().unwrap();
        buffered.extend(batch.into_lines());
    }
    buffered.sort();
    assert_eq!(buffered, vec!["m v=1".to_string(), "m v=2".to_string()]);
}

#[tokio::test]
async fn test_unbufferable_batch_is_counted_and_still_reported() {
    let transport = Arc::new(ScriptedTransport::default());
    transport.reject_all();
    let session = build_session(&transport, Arc::new(BrokenStore), None);

    let err = session
        .submit(Some("m"), &json!({"v": 1}))
        .await
        .unwrap_err();

    assert!(matches!(err, Error::SinkFlush(_)));
    let snapshot = session.snapshot();
    assert_eq!(snapshot.failed_batches, 1);
    assert_eq!(snapshot.buffer_errors, 1);
    assert_eq!(snapshot.buffered_batches, 0);
}

async fn spawn_app(session: Arc<WriteSession>) -> String {
    let config = Config::from_lookup(|_| None).unwrap();
    let influx = InfluxClient::new(
        &InfluxConfig {
            url: "http://127.0.0.1:1".to_string(),
            ..InfluxConfig::default()
        },
        Precision::Milliseconds,
    )
    .unwrap();

    let state = AppState {
        session,
        influx: Arc::new(influx),
        config: Arc::new(config),
        start_time: Instant::now(),
    };

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let app = routes::create_router(state);
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });

    format!("http://{}", addr)
}

#[tokio::test]
async fn test_http_write_annotates_failed_record() {
    let transport = Arc::new(ScriptedTransport::default());
    let session = Arc::new(build_session(&transport, Arc::new(MemoryStore::new()), None));
    let base = spawn_app(Arc::clone(&session)).await;
    let client = reqwest::Client::new();

    let resp = client
        .post(format!("{}/api/v1/write", base))
        .json(&json!({"payload": {"v": 1}, "topic": "sensors/1"}))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 400);
    let body: Value = resp.json().await.unwrap();
    assert_eq!(body["topic"], "sensors/1");
    assert!(body["failureInfo"]["message"]
        .as_str()
        .unwrap()
        .contains("measurement"));

    transport.reject_all();
    let resp = client
        .post(format!("{}/api/v1/write", base))
        .json(&json!({"measurement": "m", "payload": 3}))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 502);
    let body: Value = resp.json().await.unwrap();
    assert_eq!(body["measurement"], "m");
    assert!(body.get("failureInfo").is_some());

    transport.accept_all();
    let record = json!({"measurement": "m", "payload": {"v": 2}});
    let resp = client
        .post(format!("{}/api/v1/write", base))
        .json(&record)
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 200);
    assert_eq!(resp.json::<Value>().await.unwrap(), record);
    wait_for_idle(&session).await;

    let stats: Value = client
        .get(format!("{}/stats", base))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(stats["submissions"], 3);
    assert_eq!(stats["rejected"], 1);
    assert_eq!(stats["flush_failures"], 1);
    assert_eq!(stats["buffered_entries"], 0);
}

#[tokio::test]
async fn test_http_resend_and_ready() {
    let transport = Arc::new(ScriptedTransport::default());
    let session = Arc::new(build_session(&transport, Arc::new(MemoryStore::new()), None));
    let base = spawn_app(Arc::clone(&session)).await;
    let client = reqwest::Client::new();

    let resp: Value = client
        .post(format!("{}/api/v1/resend", base))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(resp["started"], true);
    wait_for_idle(&session).await;

    // nothing listens on the configured sink address
    let resp = client.get(format!("{}/ready", base)).send().await.unwrap();
    assert_eq!(resp.status(), 503);
    let body: Value = resp.json().await.unwrap();
    assert_eq!(body["sink"], false);
    assert_eq!(body["buffer_store"], true);

    let resp = client.get(format!("{}/health", base)).send().await.unwrap();
    assert_eq!(resp.status(), 200);
}

#[tokio::test]
async fn test_http_stats_reports_buffer_store_failure() {
    let transport = Arc::new(ScriptedTransport::default());
    let session = Arc::new(build_session(&transport, Arc::new(BrokenStore), None));
    let base = spawn_app(session).await;
    let client = reqwest::Client::new();

    let resp = client.get(format!("{}/stats", base)).send().await.unwrap();
    assert_eq!(resp.status(), 500);
    let body: Value = resp.json().await.unwrap();
    assert_eq!(body["code"], "BUFFER_STORE_ERROR");

    let resp = client.get(format!("{}/ready", base)).send().await.unwrap();
    assert_eq!(resp.status(), 503);
    let body: Value = resp.json().await.unwrap();
    assert_eq!(body["buffer_store"], false);
}
