//! Integration tests for the driver-backed bridge: custom marshallers
//! over a real byte round-trip through the in-memory broker and backend,
//! and report parity between the local and default bridges.

use conveyor::bridge::{Bridge, DefaultBridge, Roles};
use conveyor::driver::{MemoryBackend, MemoryBroker};
use conveyor::marshaller::{CustomMarshaller, MarshalError};
use conveyor::registry::{Codec, MarshallerRegistry, MARSHALLER_JSON};
use conveyor::report::{Report, Status, TaskError};
use conveyor::runtime::{Runtime, RuntimeConfig};
use conveyor::task::{TaskOptions, Value};
use conveyor::DefaultInvoker;
use serde_json::json;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// A runtime whose bridge round-trips every task and report through
/// encoded frames over in-memory drivers.
fn driver_runtime(config: RuntimeConfig) -> Runtime {
    let registry = Arc::new(MarshallerRegistry::new());
    let bridge = DefaultBridge::new(Arc::clone(&registry), &config);
    let broker = Arc::new(MemoryBroker::new(32));
    let backend = Arc::new(MemoryBackend::new(32));
    bridge.attach_producer(broker.clone()).unwrap();
    bridge.attach_consumer(broker.clone()).unwrap();
    bridge.attach_named_consumer(broker).unwrap();
    bridge.attach_reporter(backend.clone()).unwrap();
    bridge.attach_store(backend).unwrap();
    assert!(bridge.exists(Roles::ALL));
    Runtime::new(config, registry, Arc::new(bridge))
}

/// JSON hooks for a user-supplied marshaller: one chunk per value in
/// both directions.
fn json_hooks() -> CustomMarshaller {
    CustomMarshaller::new(
        |_output, values| {
            values
                .iter()
                .map(|v| serde_json::to_vec(v).map_err(|e| MarshalError::Encode(e.to_string())))
                .collect()
        },
        |_output, chunks| {
            chunks
                .iter()
                .map(|c| serde_json::from_slice(c).map_err(|e| MarshalError::Decode(e.to_string())))
                .collect()
        },
    )
}

async fn drain(mut reports: tokio::sync::mpsc::Receiver<Report>) -> Vec<Report> {
    let mut all = Vec::new();
    loop {
        let report = tokio::select! {
            report = reports.recv() => report,
            _ = tokio::time::sleep(Duration::from_secs(5)) => panic!("report stream stalled"),
        };
        match report {
            Some(report) => all.push(report),
            None => break,
        }
    }
    all
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_custom_marshaller_typed_round_trip() {
    let runtime = driver_runtime(RuntimeConfig::default());
    runtime
        .add_marshaller(
            101,
            Codec::new(Arc::new(json_hooks()), Arc::new(DefaultInvoker)),
        )
        .unwrap();
    runtime
        .register(
            "Greet",
            |n: i64, name: String| -> (String, i64) { (format!("{}_'s message", name), n + 1) },
            1,
            1,
            101,
            101,
        )
        .unwrap();

    let reports = runtime
        .call(
            "Greet",
            TaskOptions::new().set_only_result(true),
            vec![json!(12345), json!("mission")],
        )
        .await
        .unwrap()
        .expect("report stream");
    let all = drain(reports).await;

    assert_eq!(all.len(), 1);
    let terminal = &all[0];
    assert_eq!(terminal.status(), Status::Success);
    assert_eq!(
        terminal.returns(),
        &[json!("mission_'s message"), json!(12346)]
    );

    runtime.close().await.unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_custom_marshaller_full_stream() {
    let runtime = driver_runtime(RuntimeConfig::default());
    runtime
        .add_marshaller(
            102,
            Codec::new(Arc::new(json_hooks()), Arc::new(DefaultInvoker)),
        )
        .unwrap();
    runtime
        .register(
            "GreetStream",
            |n: i64, name: String| -> (String, i64) { (format!("{}_'s message", name), n + 1) },
            1,
            1,
            102,
            102,
        )
        .unwrap();

    let reports = runtime
        .call(
            "GreetStream",
            TaskOptions::new(),
            vec![json!(12345), json!("mission")],
        )
        .await
        .unwrap()
        .expect("report stream");
    let all = drain(reports).await;

    for report in &all {
        assert_ne!(report.status(), Status::Fail, "unexpected failure");
    }
    let terminal = all.last().unwrap();
    assert!(terminal.is_ok());
    assert_eq!(
        terminal.returns(),
        &[json!("mission_'s message"), json!(12346)]
    );

    runtime.close().await.unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_custom_marshaller_minimal_function() {
    let runtime = driver_runtime(RuntimeConfig::default());
    // Hooks that emit nothing: a zero-arg, zero-return function needs no
    // value chunks at all.
    runtime
        .add_marshaller(
            103,
            Codec::new(
                Arc::new(CustomMarshaller::new(
                    |_output, _values| Ok(Vec::new()),
                    |_output, _chunks| Ok(Vec::new()),
                )),
                Arc::new(DefaultInvoker),
            ),
        )
        .unwrap();

    let called = Arc::new(AtomicBool::new(false));
    let called_inner = Arc::clone(&called);
    runtime
        .register(
            "Minimal",
            move || {
                called_inner.store(true, Ordering::SeqCst);
            },
            1,
            1,
            103,
            103,
        )
        .unwrap();

    let reports = runtime
        .call("Minimal", TaskOptions::new(), vec![])
        .await
        .unwrap()
        .expect("report stream");
    let all = drain(reports).await;

    let terminal = all.last().unwrap();
    assert!(terminal.is_ok());
    assert!(terminal.returns().is_empty());
    assert!(called.load(Ordering::SeqCst));

    runtime.close().await.unwrap();
}

/// The decoded report sequence observed through the default bridge and
/// in-memory drivers matches the sequence observed through the local
/// bridge for the same invocation.
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_local_and_default_bridge_parity() {
    fn fingerprint(reports: &[Report]) -> Vec<(Status, Option<TaskError>, Vec<Value>)> {
        reports
            .iter()
            .map(|r| {
                (
                    r.status(),
                    r.error().cloned(),
                    r.returns().to_vec(),
                )
            })
            .collect()
    }

    let local = Runtime::local(RuntimeConfig::default());
    let remote = driver_runtime(RuntimeConfig::default());
    for runtime in [&local, &remote] {
        runtime
            .register(
                "Parity",
                |n: i64| -> (i64,) { (n * 3,) },
                1,
                1,
                MARSHALLER_JSON,
                MARSHALLER_JSON,
            )
            .unwrap();
    }

    let local_reports = drain(
        local
            .call("Parity", TaskOptions::new(), vec![json!(14)])
            .await
            .unwrap()
            .expect("report stream"),
    )
    .await;
    let remote_reports = drain(
        remote
            .call("Parity", TaskOptions::new(), vec![json!(14)])
            .await
            .unwrap()
            .expect("report stream"),
    )
    .await;

    assert_eq!(fingerprint(&local_reports), fingerprint(&remote_reports));
    assert_eq!(
        local_reports.last().unwrap().returns(),
        &[json!(42)]
    );

    local.close().await.unwrap();
    remote.close().await.unwrap();
}

/// Same parity through a failing function: error payloads survive the
/// byte round-trip unchanged.
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_panic_parity_across_bridges() {
    let local = Runtime::local(RuntimeConfig::default());
    let remote = driver_runtime(RuntimeConfig::default());
    for runtime in [&local, &remote] {
        runtime
            .register::<_, _, ()>(
                "Bang",
                || panic!("boom"),
                1,
                1,
                MARSHALLER_JSON,
                MARSHALLER_JSON,
            )
            .unwrap();
    }

    let locals = drain(
        local
            .call("Bang", TaskOptions::new(), vec![])
            .await
            .unwrap()
            .expect("report stream"),
    )
    .await;
    let remotes = drain(
        remote
            .call("Bang", TaskOptions::new(), vec![])
            .await
            .unwrap()
            .expect("report stream"),
    )
    .await;

    let local_terminal = locals.last().unwrap();
    let remote_terminal = remotes.last().unwrap();
    assert_eq!(local_terminal.status(), Status::Panic);
    assert_eq!(remote_terminal.status(), Status::Panic);
    assert_eq!(local_terminal.error(), remote_terminal.error());

    local.close().await.unwrap();
    remote.close().await.unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_ignore_report_through_drivers() {
    let runtime = driver_runtime(RuntimeConfig::default());
    let called = Arc::new(AtomicBool::new(false));
    let called_inner = Arc::clone(&called);
    runtime
        .register(
            "Silent",
            move || {
                called_inner.store(true, Ordering::SeqCst);
            },
            1,
            1,
            MARSHALLER_JSON,
            MARSHALLER_JSON,
        )
        .unwrap();

    let stream = runtime
        .call("Silent", TaskOptions::new().set_ignore_report(true), vec![])
        .await
        .unwrap();
    assert!(stream.is_none());

    for _ in 0..100 {
        if called.load(Ordering::SeqCst) {
            break;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    assert!(called.load(Ordering::SeqCst));

    runtime.close().await.unwrap();
}
