//! Supervision scenarios driven end to end with scripted collaborators.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use axum::http::StatusCode;
use axum::routing::get;
use axum::Router;
use tokio_util::sync::CancellationToken;

use promptdock_runtime::llm::testing::ScriptedModel;
use promptdock_runtime::routes::testing::RecordingRouteTable;
use promptdock_runtime::{
    LanguageModel, LlmError, RecordStore, Runtime, RuntimeError, RuntimeRegistry, RuntimeState,
    Supervisor, SupervisorTimings,
};
use promptdock_sandbox::testing::{ScriptedBehavior, ScriptedFactory};
use promptdock_sandbox::EvaluatorFactory;

const PROGRAM: &str = r#"```go
package main

import (
	"fmt"
	"net/http"
)

func main() {
	mux := http.NewServeMux()
	mux.HandleFunc("/", func(w http.ResponseWriter, r *http.Request) {
		fmt.Fprintln(w, "ok")
	})
	fmt.Println("ready")
}

func Shutdown() {}
```"#;

fn short_timings() -> SupervisorTimings {
    SupervisorTimings {
        log_poll: Duration::from_millis(5),
        health_poll: Duration::from_millis(20),
        settle: Duration::from_millis(30),
        stop_drain: Duration::from_millis(40),
        port_watchdog: Duration::from_millis(250),
    }
}

async fn spawn_health_endpoint(status: StatusCode) -> String {
    let app = Router::new().route("/runtime/:id", get(move || async move { status }));
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
        .await
        .expect("bind health endpoint");
    let addr = listener.local_addr().expect("local addr");
    tokio::spawn(async move {
        let _ = axum::serve(listener, app).await;
    });
    format!("http://{addr}")
}

struct Harness {
    supervisor: Arc<Supervisor>,
    factory: Arc<ScriptedFactory>,
    routes: Arc<RecordingRouteTable>,
    store_dir: tempfile::TempDir,
}

fn harness(
    model: Arc<dyn LanguageModel>,
    factory: ScriptedFactory,
    base_url: &str,
    retry_limit: u32,
    candidates: usize,
) -> Harness {
    harness_with_timings(model, factory, base_url, retry_limit, candidates, short_timings())
}

fn harness_with_timings(
    model: Arc<dyn LanguageModel>,
    factory: ScriptedFactory,
    base_url: &str,
    retry_limit: u32,
    candidates: usize,
    timings: SupervisorTimings,
) -> Harness {
    let factory = Arc::new(factory);
    let routes = Arc::new(RecordingRouteTable::new());
    let store_dir = tempfile::tempdir().expect("store dir");
    let supervisor = Arc::new(
        Supervisor::new(
            RuntimeRegistry::new(),
            model,
            factory.clone(),
            routes.clone(),
            RecordStore::new(store_dir.path()),
            base_url,
        )
        .with_timings(timings)
        .with_retry_limit(retry_limit)
        .with_candidates(candidates),
    );
    Harness {
        supervisor,
        factory,
        routes,
        store_dir,
    }
}

async fn wait_until(timeout: Duration, mut check: impl FnMut() -> bool) -> bool {
    let deadline = tokio::time::Instant::now() + timeout;
    while tokio::time::Instant::now() < deadline {
        if check() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    false
}

#[tokio::test]
async fn happy_path_reaches_running_and_healthy() {
    let base_url = spawn_health_endpoint(StatusCode::OK).await;
    let model = Arc::new(ScriptedModel::repeating(PROGRAM));
    let h = harness(
        model,
        ScriptedFactory::repeating(ScriptedBehavior::serving(12345)),
        &base_url,
        2,
        1,
    );

    let root = CancellationToken::new();
    let id = h
        .supervisor
        .new_execution(&root, "an echo server")
        .await
        .expect("execution starts");

    let registry = h.supervisor.registry().clone();
    let healthy = wait_until(Duration::from_secs(5), || {
        registry
            .load(&id)
            .map(|r| r.passed_health_check)
            .unwrap_or(false)
    })
    .await;
    assert!(healthy, "runtime never passed its health check");

    let runtime = registry.load(&id).expect("record exists");
    assert_eq!(runtime.state, RuntimeState::Running);
    assert_eq!(runtime.port, 12345);
    assert_eq!(h.routes.port_of(&id), Some(12345));
    assert!(h.store_dir.path().join(format!("{id}.json")).exists());
}

#[tokio::test]
async fn port_never_logged_fires_watchdog_and_rebuilds() {
    let base_url = spawn_health_endpoint(StatusCode::OK).await;
    let model = Arc::new(ScriptedModel::repeating(PROGRAM));
    let h = harness(
        model.clone(),
        ScriptedFactory::repeating(ScriptedBehavior::silent()),
        &base_url,
        1,
        1,
    );

    let root = CancellationToken::new();
    let id = h
        .supervisor
        .new_execution(&root, "a web app that never boots")
        .await
        .expect("execution starts");

    // Initial attempt + one rebuild + the last-chance attempt all time out.
    tokio::time::sleep(Duration::from_millis(1500)).await;

    let runtime = h.supervisor.registry().load(&id).expect("record exists");
    assert_eq!(runtime.state, RuntimeState::Failed);
    assert_eq!(runtime.last_error_msg, "runtime never logged a port");
    assert_eq!(runtime.rebuild_count, 1);
    assert_eq!(h.routes.active_count(), 0);
    assert!(model.prompts_matching("ERROR:") >= 1, "no rebuild prompt was sent");
}

#[tokio::test]
async fn failing_health_check_is_an_error_and_deregisters() {
    let base_url = spawn_health_endpoint(StatusCode::INTERNAL_SERVER_ERROR).await;
    let model = Arc::new(ScriptedModel::repeating(PROGRAM));
    let h = harness(
        model,
        ScriptedFactory::repeating(ScriptedBehavior::serving(40000)),
        &base_url,
        0,
        1,
    );

    let root = CancellationToken::new();
    let id = h
        .supervisor
        .new_execution(&root, "an app with a broken root page")
        .await
        .expect("execution starts");

    tokio::time::sleep(Duration::from_millis(1500)).await;

    let runtime = h.supervisor.registry().load(&id).expect("record exists");
    assert_eq!(runtime.state, RuntimeState::Failed);
    assert_eq!(
        runtime.last_error_msg,
        "runtime root endpoint was inaccessible"
    );
    assert!(!runtime.passed_health_check);
    assert_eq!(h.routes.active_count(), 0);
    assert!(h
        .routes
        .events()
        .iter()
        .any(|event| event.starts_with("deregister:")));
}

#[tokio::test]
async fn validation_failures_exhaust_the_retry_budget() {
    let base_url = spawn_health_endpoint(StatusCode::OK).await;
    let model = Arc::new(ScriptedModel::repeating("I cannot help with that."));
    let h = harness(
        model,
        ScriptedFactory::repeating(ScriptedBehavior::silent()),
        &base_url,
        2,
        1,
    );

    let root = CancellationToken::new();
    let err = h
        .supervisor
        .new_execution(&root, "anything")
        .await
        .expect_err("prose is not a program");
    assert!(matches!(err, RuntimeError::Validation(_)));

    tokio::time::sleep(Duration::from_millis(1000)).await;

    let registry = h.supervisor.registry();
    let mut failed = None;
    registry.range(|r| {
        failed = Some((r.state, r.rebuild_count));
        false
    });
    let (state, rebuild_count) = failed.expect("a record was staged");
    assert_eq!(state, RuntimeState::Failed);
    assert_eq!(rebuild_count, 2);
    assert_eq!(h.routes.active_count(), 0);
    // No evaluator was ever started for invalid code.
    for evaluator in h.factory.created() {
        assert!(evaluator.sources().is_empty());
    }
}

struct SlowModel {
    delay: Duration,
    calls: AtomicUsize,
}

impl SlowModel {
    fn new(delay: Duration) -> Self {
        Self {
            delay,
            calls: AtomicUsize::new(0),
        }
    }
}

#[async_trait::async_trait]
impl LanguageModel for SlowModel {
    async fn complete(&self, _prompt: &str) -> Result<String, LlmError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        tokio::time::sleep(self.delay).await;
        Ok(PROGRAM.to_string())
    }
}

fn staged_error_record(h: &Harness, id: &str) {
    let (evaluator, logs) = h.factory.create();
    let mut runtime = Runtime::new(id.to_string(), "wrapped prompt".into(), "package main".into());
    runtime.state = RuntimeState::Error;
    runtime.last_error_msg = "runtime panicked: boom".into();
    runtime.evaluator = Some(evaluator);
    runtime.logs = Some(logs);
    h.supervisor.registry().store(runtime);
}

#[tokio::test]
async fn concurrent_failure_handling_rebuilds_once() {
    let base_url = spawn_health_endpoint(StatusCode::OK).await;
    let model = Arc::new(SlowModel::new(Duration::from_millis(150)));
    let h = harness(
        model.clone(),
        ScriptedFactory::repeating(ScriptedBehavior::serving(23456)),
        &base_url,
        5,
        1,
    );
    let id = "3".repeat(32);
    staged_error_record(&h, &id);

    let parent = CancellationToken::new();
    let (first, second) = tokio::join!(
        h.supervisor.handle_runtime_failure(&id, &parent),
        h.supervisor.handle_runtime_failure(&id, &parent),
    );
    first.expect("rebuild succeeds");
    second.expect("duplicate is a no-op");

    assert_eq!(model.calls.load(Ordering::SeqCst), 1);
    // One evaluator staged by the test, one created by the single rebuild.
    assert_eq!(h.factory.created_count(), 2);
    assert_eq!(
        h.supervisor.registry().load(&id).unwrap().rebuild_count,
        1
    );
}

#[tokio::test]
async fn stop_during_rebuild_prevents_further_attempts() {
    let base_url = spawn_health_endpoint(StatusCode::OK).await;
    let model = Arc::new(SlowModel::new(Duration::from_millis(400)));
    let h = harness(
        model.clone(),
        ScriptedFactory::repeating(ScriptedBehavior::serving(34567)),
        &base_url,
        5,
        1,
    );
    let id = "4".repeat(32);
    staged_error_record(&h, &id);

    let parent = CancellationToken::new();
    let supervisor = h.supervisor.clone();
    let rebuild_id = id.clone();
    let rebuild = tokio::spawn(async move {
        supervisor
            .handle_runtime_failure(&rebuild_id, &parent)
            .await
    });

    tokio::time::sleep(Duration::from_millis(50)).await;
    h.supervisor.stop(&id).await.expect("stop succeeds");

    rebuild
        .await
        .expect("task joins")
        .expect("aborted rebuild is not an error");

    let runtime = h.supervisor.registry().load(&id).expect("record exists");
    assert_eq!(runtime.state, RuntimeState::Stopped);
    // The rebuild saw the terminal state after its model round-trip and never
    // staged a replacement evaluator.
    assert_eq!(h.factory.created_count(), 1);
    assert!(h.factory.created()[0]
        .invoked()
        .contains(&"Shutdown".to_string()));
    assert_eq!(h.routes.active_count(), 0);
}

#[tokio::test]
async fn speculative_launch_commits_to_first_healthy_candidate() {
    let base_url = spawn_health_endpoint(StatusCode::OK).await;
    let model = Arc::new(ScriptedModel::repeating(PROGRAM).with_title("Echo Server"));
    let mut timings = short_timings();
    timings.port_watchdog = Duration::from_secs(5);
    let factory = ScriptedFactory::new(
        vec![
            ScriptedBehavior::silent(),
            ScriptedBehavior::silent(),
            ScriptedBehavior::serving(45678),
        ],
        ScriptedBehavior::silent(),
    );
    let h = harness_with_timings(model.clone(), factory, &base_url, 2, 3, timings);

    let root = CancellationToken::new();
    let winner = h
        .supervisor
        .new_concurrent_execution(&root, "an echo server")
        .await
        .expect("one candidate becomes healthy");

    let registry = h.supervisor.registry();
    let record = registry.load(&winner).expect("winner exists");
    assert!(record.passed_health_check);
    assert_eq!(record.state, RuntimeState::Running);
    assert_eq!(record.title, "Echo Server");
    assert_eq!(record.port, 45678);

    let mut losers = Vec::new();
    registry.range(|r| {
        if r.id != winner {
            losers.push((r.id.clone(), r.state));
        }
        true
    });
    assert_eq!(losers.len(), 2);
    for (loser, state) in &losers {
        assert_eq!(*state, RuntimeState::Stopped, "loser {loser} not stopped");
        assert!(!h.routes.has_route(loser));
    }
    assert_eq!(h.routes.active_count(), 1);
    assert_eq!(model.prompts_matching("title generator"), 1);
}

#[tokio::test]
async fn restore_rehydrates_inert_records() {
    let base_url = spawn_health_endpoint(StatusCode::OK).await;
    let model = Arc::new(ScriptedModel::repeating(PROGRAM));
    let h = harness(
        model,
        ScriptedFactory::repeating(ScriptedBehavior::silent()),
        &base_url,
        2,
        1,
    );

    let store = RecordStore::new(h.store_dir.path());
    let mut record = Runtime::new("5".repeat(32), "prompt".into(), "code".into());
    record.state = RuntimeState::Running;
    record.port = 40123;
    store.save(&record).await.expect("save");

    let restored = h.supervisor.restore().await.expect("restore");
    assert_eq!(restored, 1);
    let loaded = h
        .supervisor
        .registry()
        .load(&record.id)
        .expect("record restored");
    assert!(loaded.cancel.is_none());
    assert!(loaded.evaluator.is_none());
    assert_eq!(loaded.state, RuntimeState::Running);

    // A restored record has no interpreter and cannot be executed.
    let err = h
        .supervisor
        .execute(&record.id, &CancellationToken::new())
        .await
        .expect_err("inert records do not resume");
    assert!(matches!(err, RuntimeError::NotExecutable(_)));
}
