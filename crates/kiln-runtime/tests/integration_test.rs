//! End-to-end runtime tests: configuration, compilation, execution, batches
//! and hot reload wired together through `RuntimeIntegration`.
//!
//! Set `KILN_LOG=debug` to see the runtime's tracing output.

use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use kiln_pipeline::config::CacheConfig;
use kiln_pipeline::{KilnConfig, LibraryDescriptor};
use kiln_runtime::{
    BatchExecutionConfig, BatchMode, BatchScript, ExecutionOutcome, ExecutionResult,
    ExecutionStatus, RuntimeIntegration,
};
use tempfile::TempDir;
use tracing_subscriber::EnvFilter;

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_env("KILN_LOG"))
        .with_test_writer()
        .try_init();
}

fn config(root: &Path) -> KilnConfig {
    let mut config = KilnConfig::default();
    config.cache = CacheConfig {
        root: root.join("cache"),
        ..CacheConfig::default()
    };
    config.build.program = "sh".into();
    config
}

async fn runtime(root: &Path) -> Arc<RuntimeIntegration> {
    init_tracing();
    let runtime = Arc::new(RuntimeIntegration::new(&config(root)));
    runtime.start().await.unwrap();
    runtime
}

#[tokio::test]
async fn sequential_batch_stops_after_first_failure() {
    let tmp = TempDir::new().unwrap();
    let runtime = runtime(tmp.path()).await;

    let scripts = vec![
        BatchScript::new("A", "echo a"),
        BatchScript::new("B", "fail boom"),
        BatchScript::new("C", "echo c"),
    ];
    let result = runtime
        .execute_batch(scripts, &BatchExecutionConfig::sequential(true))
        .await
        .unwrap();

    let names: Vec<_> = result.execution_results.keys().cloned().collect();
    assert_eq!(names, vec!["A", "B"]);
    assert_eq!(result.success_count, 1);
    assert_eq!(result.failure_count, 1);
    match &result.execution_results["B"].outcome {
        ExecutionOutcome::RuntimeFailed { message, .. } => assert_eq!(message, "line 1: boom"),
        other => panic!("unexpected outcome {other:?}"),
    }
    runtime.shutdown().await;
}

#[tokio::test]
async fn sequential_batch_without_stop_runs_everything() {
    let tmp = TempDir::new().unwrap();
    let runtime = runtime(tmp.path()).await;

    let scripts = vec![
        BatchScript::new("A", "echo a"),
        BatchScript::new("B", "fail boom"),
        BatchScript::new("C", "echo c"),
    ];
    let result = runtime
        .execute_batch(scripts, &BatchExecutionConfig::sequential(false))
        .await
        .unwrap();
    assert_eq!(result.execution_results.len(), 3);
    assert_eq!(result.success_count, 2);
    assert_eq!(result.failure_count, 1);
    runtime.shutdown().await;
}

#[tokio::test]
async fn parallel_batch_runs_every_script() {
    let tmp = TempDir::new().unwrap();
    let runtime = runtime(tmp.path()).await;

    let scripts: Vec<_> = (0..6)
        .map(|i| BatchScript::new(format!("job{i}"), format!("sleep 20\necho {i}")))
        .collect();
    let mut config = BatchExecutionConfig::parallel(2);
    config.stop_on_first_failure = true;

    let result = runtime.execute_batch(scripts, &config).await.unwrap();
    assert_eq!(config.mode, BatchMode::Parallel);
    assert_eq!(result.success_count, 6);
    assert_eq!(result.execution_results["job3"].output().unwrap()["output"][0], "3");
    assert!(result.total_duration >= Duration::from_millis(60));
    runtime.shutdown().await;
}

#[tokio::test]
async fn dependency_ordered_batch_runs_in_input_order() {
    let tmp = TempDir::new().unwrap();
    let runtime = runtime(tmp.path()).await;

    let config = BatchExecutionConfig {
        mode: BatchMode::DependencyOrdered,
        stop_on_first_failure: true,
        max_concurrency: 1,
    };
    let scripts = vec![
        BatchScript::new("second", "fail stop here"),
        BatchScript::new("first", "echo never"),
    ];
    let result = runtime.execute_batch(scripts, &config).await.unwrap();
    assert_eq!(result.execution_results.len(), 1);
    assert!(result.execution_results.contains_key("second"));
    runtime.shutdown().await;
}

#[tokio::test]
async fn dependency_ordered_batch_resolves_the_library_graph() {
    let tmp = TempDir::new().unwrap();
    let runtime = runtime(tmp.path()).await;

    let missing = LibraryDescriptor::new("x", "/does/not/exist", "1.0");
    let scripts = vec![
        BatchScript::new("uses-x", "echo hi").with_libraries(vec![missing.clone()]),
        BatchScript::new("plain", "echo plain"),
    ];
    let config = BatchExecutionConfig {
        mode: BatchMode::DependencyOrdered,
        stop_on_first_failure: false,
        max_concurrency: 1,
    };
    let result = runtime.execute_batch(scripts, &config).await.unwrap();

    assert_eq!(result.success_count, 1);
    assert_eq!(result.failure_count, 1);
    let graph = runtime
        .cache()
        .get_cached_dependency_graph(&[missing.identity()])
        .await
        .unwrap();
    assert_eq!(graph.order, vec![missing.identity()]);
    runtime.shutdown().await;
}

#[tokio::test]
async fn compile_failure_is_reported_not_raised() {
    let tmp = TempDir::new().unwrap();
    let runtime = runtime(tmp.path()).await;

    let result = runtime.execute_script("broken", "ech hi", &[]).await;
    match &result.outcome {
        ExecutionOutcome::CompilationFailed { diagnostics, .. } => {
            assert_eq!(diagnostics[0].message, "unknown statement 'ech'");
        }
        other => panic!("unexpected outcome {other:?}"),
    }
    let statuses: Vec<_> = runtime
        .execution_timeline(&result.execution_id)
        .await
        .into_iter()
        .map(|u| u.status)
        .collect();
    assert_eq!(statuses, vec![ExecutionStatus::Compiling, ExecutionStatus::Failed]);
    runtime.shutdown().await;
}

#[tokio::test]
async fn missing_library_fails_compilation() {
    let tmp = TempDir::new().unwrap();
    let runtime = runtime(tmp.path()).await;

    let result = runtime
        .execute_script(
            "needs-lib",
            "echo hi",
            &[LibraryDescriptor::new("x", "/does/not/exist", "1.0")],
        )
        .await;
    match &result.outcome {
        ExecutionOutcome::CompilationFailed { message, diagnostics } => {
            assert!(message.contains("not found"), "{message}");
            assert!(diagnostics.is_empty());
        }
        other => panic!("unexpected outcome {other:?}"),
    }
    runtime.shutdown().await;
}

#[tokio::test]
async fn execution_timeout_is_reported_as_timed_out() {
    let tmp = TempDir::new().unwrap();
    init_tracing();
    let runtime = RuntimeIntegration::new(&config(tmp.path()))
        .with_execution_timeout(Duration::from_millis(30));

    let result = runtime.execute_script("slow", "sleep 2000", &[]).await;
    match &result.outcome {
        ExecutionOutcome::TimedOut { operation, after } => {
            assert_eq!(operation, "execution of slow");
            assert_eq!(*after, Duration::from_millis(30));
        }
        other => panic!("unexpected outcome {other:?}"),
    }
    assert!(!result.is_success());
    assert_eq!(
        runtime.execution_status(&result.execution_id).await,
        Some(ExecutionStatus::Failed)
    );
}

#[cfg(unix)]
#[tokio::test]
async fn isolated_execution_sees_staged_libraries() {
    let tmp = TempDir::new().unwrap();
    let project = tmp.path().join("util");
    std::fs::create_dir_all(project.join("src")).unwrap();
    std::fs::write(project.join("Cargo.toml"), "[package]\nname = \"util\"\n").unwrap();
    std::fs::write(project.join("src/lib.rs"), "pub fn util() {}\n").unwrap();
    let descriptor = LibraryDescriptor::new("util", &project, "0.1.0").with_build_args([
        "-c",
        "mkdir -p target/release && printf x > target/release/libutil.rlib",
    ]);

    let runtime = runtime(tmp.path()).await;
    let result = runtime
        .execute_in_isolated_environment("uses-util", "require util\necho ok", &[descriptor])
        .await;

    assert!(result.is_success(), "{:?}", result.outcome);
    assert!(result.isolated);
    assert_eq!(result.output().unwrap()["libraries"][0], "util");
    assert_eq!(result.metrics.unwrap().library_count, 1);
    runtime.shutdown().await;
}

#[tokio::test]
async fn script_hot_reload_reruns_on_change() {
    let tmp = TempDir::new().unwrap();
    init_tracing();
    let script = tmp.path().join("watch.kiln");
    std::fs::write(&script, "echo one").unwrap();

    let runtime = Arc::new(
        RuntimeIntegration::new(&config(tmp.path()))
            .with_script_poll_interval(Duration::from_millis(25)),
    );
    let seen: Arc<Mutex<Vec<ExecutionResult>>> = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&seen);
    runtime
        .enable_hot_reload(
            "watched",
            &script,
            Vec::new(),
            Arc::new(move |result: &ExecutionResult| sink.lock().unwrap().push(result.clone())),
        )
        .await
        .unwrap();

    tokio::time::sleep(Duration::from_millis(100)).await;
    assert!(seen.lock().unwrap().is_empty(), "unchanged script must not re-run");

    // rename so the poller never reads a half-written file
    let staged = tmp.path().join("watch.kiln.new");
    std::fs::write(&staged, "echo two").unwrap();
    std::fs::rename(&staged, &script).unwrap();
    let mut waited = Duration::ZERO;
    while seen.lock().unwrap().is_empty() && waited < Duration::from_secs(5) {
        tokio::time::sleep(Duration::from_millis(25)).await;
        waited += Duration::from_millis(25);
    }

    {
        let seen = seen.lock().unwrap();
        assert_eq!(seen.len(), 1);
        assert_eq!(seen[0].output().unwrap()["output"][0], "two");
    }
    assert!(runtime.script_watch("watched").await.unwrap().last_reload.is_some());
    assert_eq!(runtime.metrics().snapshot().hot_reloads, 1);

    assert!(runtime.disable_hot_reload("watched").await);
    assert!(!runtime.disable_hot_reload("watched").await);
    runtime.shutdown().await;
}

#[tokio::test]
async fn script_hot_reload_recovers_after_the_file_disappears() {
    let tmp = TempDir::new().unwrap();
    init_tracing();
    let script = tmp.path().join("flaky.kiln");
    std::fs::write(&script, "echo one").unwrap();

    let runtime = Arc::new(
        RuntimeIntegration::new(&config(tmp.path()))
            .with_script_poll_interval(Duration::from_millis(20)),
    );
    let seen: Arc<Mutex<Vec<ExecutionResult>>> = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&seen);
    runtime
        .enable_hot_reload(
            "flaky",
            &script,
            Vec::new(),
            Arc::new(move |result: &ExecutionResult| sink.lock().unwrap().push(result.clone())),
        )
        .await
        .unwrap();

    // polls fail while the file is gone
    std::fs::remove_file(&script).unwrap();
    tokio::time::sleep(Duration::from_millis(120)).await;
    assert!(seen.lock().unwrap().is_empty());

    let staged = tmp.path().join("flaky.kiln.new");
    std::fs::write(&staged, "echo back").unwrap();
    std::fs::rename(&staged, &script).unwrap();
    let mut waited = Duration::ZERO;
    while seen.lock().unwrap().is_empty() && waited < Duration::from_secs(5) {
        tokio::time::sleep(Duration::from_millis(20)).await;
        waited += Duration::from_millis(20);
    }

    {
        let seen = seen.lock().unwrap();
        assert_eq!(seen.len(), 1);
        assert_eq!(seen[0].output().unwrap()["output"][0], "back");
    }
    runtime.shutdown().await;
}

#[tokio::test]
async fn hot_reload_of_missing_file_is_an_error() {
    let tmp = TempDir::new().unwrap();
    let runtime = runtime(tmp.path()).await;
    let err = runtime
        .enable_hot_reload(
            "ghost",
            tmp.path().join("ghost.kiln"),
            Vec::new(),
            Arc::new(|_: &ExecutionResult| {}),
        )
        .await
        .unwrap_err();
    assert!(err.to_string().contains("ghost"), "{err}");
    runtime.shutdown().await;
}
