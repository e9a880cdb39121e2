// Sandbox provisioning, leases and command routing against the fake engine.
include!("common/http.rs");

use desktop_agent::executor::{ActionExecutor, DisplayCommand};
use desktop_agent_error::DesktopError;

const NAME: &str = "computer_use_agent";

fn manager(runtime: &Arc<FakeRuntime>) -> SandboxManager {
    SandboxManager::new(
        runtime.clone(),
        SandboxConfig {
            settle_delay: Duration::ZERO,
            ..SandboxConfig::default()
        },
    )
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn ensure_running_is_idempotent() {
    let runtime = FakeRuntime::new();
    let sandboxes = manager(&runtime);

    let first = sandboxes.ensure_running(NAME).await.expect("first start");
    let second = sandboxes.ensure_running(NAME).await.expect("second start");

    assert_eq!(runtime.creates(), 1);
    assert_eq!(first.container_id, second.container_id);
    assert_eq!(first.vnc_port, 5900);
    assert_eq!(first.api_port, 8000);
    assert!(sandboxes.is_running(NAME).await);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn concurrent_starts_create_one_container() {
    let runtime = FakeRuntime::new();
    let sandboxes = Arc::new(manager(&runtime));

    let mut tasks = Vec::new();
    for _ in 0..4 {
        let sandboxes = sandboxes.clone();
        tasks.push(tokio::spawn(async move {
            sandboxes.ensure_running(NAME).await
        }));
    }
    for task in tasks {
        task.await.expect("join").expect("start");
    }
    assert_eq!(runtime.creates(), 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn stopped_container_is_restarted_not_recreated() {
    let runtime = FakeRuntime::new();
    runtime.insert_container(NAME, false);
    let sandboxes = manager(&runtime);

    let handle = sandboxes.ensure_running(NAME).await.expect("start");
    assert_eq!(handle.container_id, format!("{NAME}-id"));
    assert_eq!(runtime.creates(), 0);
    assert!(sandboxes.is_running(NAME).await);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn missing_image_is_pulled_before_create() {
    let runtime = FakeRuntime::new();
    runtime.set_image_cached(false);
    runtime.fail_next_pulls(1);
    let sandboxes = manager(&runtime);

    sandboxes.ensure_running(NAME).await.expect("start after retry");
    assert_eq!(runtime.pulls(), 2);
    assert_eq!(runtime.creates(), 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn unavailable_image_is_a_provisioning_error() {
    let runtime = FakeRuntime::new();
    runtime.set_image_cached(false);
    runtime.fail_next_pulls(2);
    let sandboxes = manager(&runtime);

    let err = sandboxes.ensure_running(NAME).await.expect_err("no image");
    assert!(matches!(err, DesktopError::Provisioning { ref name, .. } if name == NAME));
    assert!(!sandboxes.is_running(NAME).await);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn stop_removes_the_container_and_tolerates_absence() {
    let runtime = FakeRuntime::new();
    let sandboxes = manager(&runtime);

    sandboxes.stop(NAME).await.expect("absent sandbox");

    sandboxes.ensure_running(NAME).await.expect("start");
    sandboxes.stop(NAME).await.expect("stop");
    assert!(!sandboxes.is_running(NAME).await);
    sandboxes.stop(NAME).await.expect("second stop");

    sandboxes.ensure_running(NAME).await.expect("restart");
    assert_eq!(runtime.creates(), 2);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn shutdown_stops_started_sandboxes() {
    let runtime = FakeRuntime::new();
    let sandboxes = manager(&runtime);
    sandboxes.ensure_running(NAME).await.expect("start");

    sandboxes.shutdown().await;
    assert!(!sandboxes.is_running(NAME).await);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn leases_are_exclusive_per_sandbox() {
    let runtime = FakeRuntime::new();
    let sandboxes = manager(&runtime);

    sandboxes.acquire(NAME, "session-a").await.expect("first lease");
    sandboxes.acquire(NAME, "session-a").await.expect("re-acquire");
    let err = sandboxes
        .acquire(NAME, "session-b")
        .await
        .expect_err("busy");
    assert!(matches!(err, DesktopError::SandboxBusy { ref session_id, .. } if session_id == "session-a"));

    // only the holder can release
    sandboxes.release(NAME, "session-b").await;
    assert_eq!(sandboxes.lease_holder(NAME).await.as_deref(), Some("session-a"));
    sandboxes.release(NAME, "session-a").await;
    sandboxes.acquire(NAME, "session-b").await.expect("free again");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn display_commands_run_inside_the_container() {
    let runtime = FakeRuntime::new();
    let sandboxes = manager(&runtime);
    let executor = ActionExecutor::new(sandboxes.channel(NAME));

    executor
        .dispatch(&Action::Type {
            text: "hello world".to_string(),
        })
        .await
        .expect("type");
    executor
        .dispatch(&Action::Navigate {
            url: "https://example.com".to_string(),
        })
        .await
        .expect("navigate");
    let screenshot = executor.screenshot().await;

    let execs = runtime.execs();
    assert_eq!(
        execs[0],
        DisplayCommand::xdotool(["type", "--clearmodifiers", "--", "hello world"]).argv()
    );
    // detached launches go through a shell so exec returns immediately
    assert_eq!(
        execs[1],
        vec![
            "/bin/sh",
            "-c",
            "\"$@\" >/dev/null 2>&1 &",
            "sh",
            "firefox-esr",
            "-new-tab",
            "https://example.com"
        ]
        .into_iter()
        .map(String::from)
        .collect::<Vec<_>>()
    );
    assert_eq!(screenshot.screenshot(), Some("UE5HREFUQQ=="));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn failing_display_command_surfaces_stderr() {
    let runtime = FakeRuntime::new();
    runtime.fail_on("key");
    let sandboxes = manager(&runtime);
    let executor = ActionExecutor::new(sandboxes.channel(NAME));

    let err = executor
        .dispatch(&Action::Keypress {
            keys: vec!["Return".to_string()],
        })
        .await
        .expect_err("keypress fails");
    match err {
        DesktopError::ActionExecution { action, message } => {
            assert_eq!(action, "keypress");
            assert!(message.contains("command failed"), "{message}");
        }
        other => panic!("unexpected error {other:?}"),
    }
}
