//! Integration tests for web hook delivery
//!
//! - HTTP client against a throwaway TCP responder
//! - Resend rules of the retry loop
//! - Failed deliveries landing in the retry set

use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use parking_lot::Mutex;
use prometheus_jobservice::config::{HookConfig, LifecycleConfig};
use prometheus_jobservice::core::{
    JobServiceError, JobStats, LifecycleController, Result, Status, StatusChange,
};
use prometheus_jobservice::hook::{Event, HookAgent, HookClient, HttpHookClient, ResendOutcome};
use prometheus_jobservice::infra::{InMemoryStore, Keys, SharedStore, Store};
use prometheus_jobservice::runtime::SystemContext;
use prometheus_jobservice::util::ManualClock;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;

const T0: i64 = 1_704_067_200;

// ============================================================================
// HELPER FUNCTIONS
// ============================================================================

/// Serve `responses` in order, one per connection, returning the request
/// bodies received.
async fn responder(responses: Vec<&'static str>) -> (String, tokio::task::JoinHandle<Vec<String>>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let url = format!("http://{}/hook", listener.local_addr().unwrap());
    let handle = tokio::spawn(async move {
        let mut bodies = Vec::new();
        for response in responses {
            let (mut socket, _) = listener.accept().await.unwrap();
            bodies.push(read_request_body(&mut socket).await);
            socket.write_all(response.as_bytes()).await.unwrap();
            socket.shutdown().await.ok();
        }
        bodies
    });
    (url, handle)
}

async fn read_request_body(socket: &mut tokio::net::TcpStream) -> String {
    let mut buf = Vec::new();
    let mut chunk = [0_u8; 1024];
    loop {
        let n = socket.read(&mut chunk).await.unwrap();
        if n == 0 {
            break;
        }
        buf.extend_from_slice(&chunk[..n]);
        let text = String::from_utf8_lossy(&buf).to_string();
        if let Some(head_end) = text.find("\r\n\r\n") {
            let length = text[..head_end]
                .lines()
                .find_map(|line| {
                    let (name, value) = line.split_once(':')?;
                    name.eq_ignore_ascii_case("content-length")
                        .then(|| value.trim().parse::<usize>().ok())
                        .flatten()
                })
                .unwrap_or(0);
            if buf.len() >= head_end + 4 + length {
                return text[head_end + 4..head_end + 4 + length].to_string();
            }
        }
    }
    String::new()
}

const OK: &str = "HTTP/1.1 200 OK\r\ncontent-length: 0\r\nconnection: close\r\n\r\n";
const FAIL: &str =
    "HTTP/1.1 500 Internal Server Error\r\ncontent-length: 4\r\nconnection: close\r\n\r\nboom";

fn change(job_id: &str, status: Status, check_in: Option<&str>) -> StatusChange {
    StatusChange {
        job_id: job_id.into(),
        status,
        check_in: check_in.map(ToString::to_string),
        metadata: None,
    }
}

/// Hook client that accepts everything.
#[derive(Default)]
struct RecordingHook {
    events: Mutex<Vec<Event>>,
}

#[async_trait]
impl HookClient for RecordingHook {
    async fn send_event(&self, event: &Event) -> Result<()> {
        self.events.lock().push(event.clone());
        Ok(())
    }
}

struct Fixture {
    store: SharedStore,
    keys: Keys,
    controller: Arc<LifecycleController>,
    agent: Arc<HookAgent>,
}

fn fixture(namespace: &str, client: Arc<dyn HookClient>) -> Fixture {
    let store: SharedStore = Arc::new(InMemoryStore::new());
    let keys = Keys::new(namespace);
    let clock = Arc::new(ManualClock::at_unix(T0));
    let controller = Arc::new(LifecycleController::new(
        Arc::clone(&store),
        keys.clone(),
        clock.clone(),
        None,
        LifecycleConfig::default(),
    ));
    let agent = Arc::new(HookAgent::new(
        HookConfig::default(),
        Arc::clone(&store),
        keys.clone(),
        clock,
        client,
    ));
    Fixture {
        store,
        keys,
        controller,
        agent,
    }
}

// ============================================================================
// TESTS
// ============================================================================

#[tokio::test]
async fn test_http_client_posts_status_change() {
    let (url, server) = responder(vec![OK]).await;
    let client = HttpHookClient::new(Duration::from_secs(5)).unwrap();
    let event = Event::for_change(&url, change("j1", Status::Running, None), T0);

    client.send_event(&event).await.unwrap();

    let bodies = server.await.unwrap();
    let body: serde_json::Value = serde_json::from_str(&bodies[0]).unwrap();
    assert_eq!(body["job_id"], "j1");
    assert_eq!(body["status"], "Running");
}

#[tokio::test]
async fn test_http_client_non_200_is_error() {
    let (url, server) = responder(vec![FAIL]).await;
    let client = HttpHookClient::new(Duration::from_secs(5)).unwrap();
    let event = Event::for_change(&url, change("j1", Status::Error, None), T0);

    let err = client.send_event(&event).await.unwrap_err();
    assert!(matches!(&err, JobServiceError::Backend(body) if body == "boom"), "{err}");
    server.await.unwrap();
}

#[tokio::test]
async fn test_resend_rules() {
    let fx = fixture("hk-resend", Arc::new(RecordingHook::default()));
    fx.controller
        .new_tracker(JobStats {
            job_id: "j1".into(),
            job_name: "scan-image".into(),
            status: Status::Running,
            enqueue_time: T0,
            ..JobStats::default()
        })
        .await
        .unwrap();

    let url = "http://hooks.local/x";
    let max_age = i64::try_from(HookConfig::default().max_event_age().as_secs()).unwrap();
    let events = [
        // Tracked status is newer.
        Event::for_change(url, change("j1", Status::Pending, None), T0),
        // Same status, different check-in.
        Event::for_change(url, change("j1", Status::Running, Some("half way")), T0),
        // Same status, same check-in.
        Event::for_change(url, change("j1", Status::Running, None), T0),
        // Too old.
        Event::for_change(url, change("j1", Status::Pending, None), T0 - max_age - 1),
        // Unknown job.
        Event::for_change(url, change("gone", Status::Pending, None), T0),
    ];
    for (score, event) in (1_i64..).zip(events.iter()) {
        fx.store
            .zadd(
                &fx.keys.hook_events(),
                score,
                &serde_json::to_string(event).unwrap(),
            )
            .await
            .unwrap();
    }

    let mut outcomes = Vec::new();
    loop {
        let outcome = fx.agent.resend_once(&fx.controller).await.unwrap();
        if outcome == ResendOutcome::Empty {
            break;
        }
        outcomes.push(outcome);
    }
    assert_eq!(
        outcomes,
        vec![
            ResendOutcome::Resubmitted,
            ResendOutcome::Resubmitted,
            ResendOutcome::Dropped,
            ResendOutcome::Dropped,
            ResendOutcome::Dropped,
        ]
    );
    assert_eq!(fx.agent.queued_events(), 2);
}

#[tokio::test]
async fn test_failed_delivery_goes_to_retry_set() {
    let (url, server) = responder(vec![FAIL]).await;
    let client = Arc::new(HttpHookClient::new(Duration::from_secs(5)).unwrap());
    let fx = fixture("hk-failed", client);
    let system = SystemContext::new();
    fx.agent
        .serve(Arc::clone(&fx.controller), &system)
        .unwrap();
    assert!(fx.agent.serve(Arc::clone(&fx.controller), &system).is_err());

    fx.agent
        .trigger(Event::for_change(&url, change("j1", Status::Success, None), T0))
        .await
        .unwrap();

    let deadline = Instant::now() + Duration::from_secs(10);
    while fx
        .store
        .zcount(&fx.keys.hook_events(), i64::MIN, i64::MAX)
        .await
        .unwrap()
        == 0
    {
        assert!(Instant::now() < deadline, "failed event was not queued for retry");
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    server.await.unwrap();
    assert!(system.shutdown(Duration::from_secs(5)).await);
}

#[tokio::test]
async fn test_trigger_rejects_invalid_event() {
    let fx = fixture("hk-invalid", Arc::new(RecordingHook::default()));
    let err = fx
        .agent
        .trigger(Event::for_change("not a url", change("j1", Status::Running, None), T0))
        .await
        .unwrap_err();
    assert!(matches!(err, JobServiceError::BadRequest(_)));
}
