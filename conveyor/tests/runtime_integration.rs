//! Integration tests for the local runtime: report stream contract,
//! ignored reports, panic capture and parallel saturation, all through
//! the in-process bridge.

use conveyor::invoker::{InvokeError, Invoker, TaskFn};
use conveyor::marshaller::ValueMarshaller;
use conveyor::registry::{Codec, MARSHALLER_JSON};
use conveyor::report::Status;
use conveyor::runtime::{Runtime, RuntimeConfig};
use conveyor::task::{TaskOptions, Value};
use serde_json::json;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{mpsc as std_mpsc, Arc, Mutex};
use std::time::Duration;

async fn drain_statuses(
    mut reports: tokio::sync::mpsc::Receiver<conveyor::report::Report>,
) -> Vec<conveyor::report::Report> {
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
async fn test_ignore_report_returns_no_stream() {
    let runtime = Runtime::local(RuntimeConfig::default());
    let called = Arc::new(AtomicBool::new(false));
    let called_inner = Arc::clone(&called);
    runtime
        .register(
            "TestIgnoreReport",
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
        .call(
            "TestIgnoreReport",
            TaskOptions::new().set_ignore_report(true),
            vec![],
        )
        .await
        .unwrap();
    assert!(stream.is_none());

    // The function still runs even though nothing is reported.
    for _ in 0..100 {
        if called.load(Ordering::SeqCst) {
            break;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    assert!(called.load(Ordering::SeqCst));

    runtime.close().await.unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_zero_arg_zero_return_success() {
    let runtime = Runtime::local(RuntimeConfig::default());
    let called = Arc::new(AtomicBool::new(false));
    let called_inner = Arc::clone(&called);
    runtime
        .register(
            "SideEffect",
            move || {
                called_inner.store(true, Ordering::SeqCst);
            },
            1,
            1,
            MARSHALLER_JSON,
            MARSHALLER_JSON,
        )
        .unwrap();

    let reports = runtime
        .call("SideEffect", TaskOptions::new(), vec![])
        .await
        .unwrap()
        .expect("report stream");
    let all = drain_statuses(reports).await;

    let statuses: Vec<_> = all.iter().map(|r| r.status()).collect();
    assert_eq!(
        statuses,
        vec![Status::Sent, Status::Progress, Status::Success]
    );
    assert!(all.last().unwrap().returns().is_empty());
    assert!(called.load(Ordering::SeqCst));

    runtime.close().await.unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_panic_captured_no_success() {
    let runtime = Runtime::local(RuntimeConfig::default());
    runtime
        .register::<_, _, ()>(
            "Explodes",
            || panic!("x"),
            1,
            1,
            MARSHALLER_JSON,
            MARSHALLER_JSON,
        )
        .unwrap();

    let reports = runtime
        .call("Explodes", TaskOptions::new(), vec![])
        .await
        .unwrap()
        .expect("report stream");
    let all = drain_statuses(reports).await;

    let terminal = all.last().unwrap();
    assert_eq!(terminal.status(), Status::Panic);
    assert!(terminal.error().unwrap().message().contains("x"));
    assert!(all.iter().all(|r| r.status() != Status::Success));

    runtime.close().await.unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_exactly_one_terminal_and_it_is_last() {
    let runtime = Runtime::local(RuntimeConfig::default());
    runtime
        .register(
            "Incr",
            |n: i64| -> (i64,) { (n + 1,) },
            1,
            1,
            MARSHALLER_JSON,
            MARSHALLER_JSON,
        )
        .unwrap();

    let reports = runtime
        .call("Incr", TaskOptions::new(), vec![json!(41)])
        .await
        .unwrap()
        .expect("report stream");
    let all = drain_statuses(reports).await;

    let terminal_count = all.iter().filter(|r| r.is_done()).count();
    assert_eq!(terminal_count, 1);
    assert!(all.last().unwrap().is_done());
    assert_eq!(all.last().unwrap().returns(), &[json!(42)]);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_only_result_emits_single_terminal_report() {
    let runtime = Runtime::local(RuntimeConfig::default());
    runtime
        .register(
            "Quiet",
            |n: i64| -> (i64,) { (n * 2,) },
            1,
            1,
            MARSHALLER_JSON,
            MARSHALLER_JSON,
        )
        .unwrap();

    let reports = runtime
        .call(
            "Quiet",
            TaskOptions::new().set_only_result(true),
            vec![json!(21)],
        )
        .await
        .unwrap()
        .expect("report stream");
    let all = drain_statuses(reports).await;

    assert_eq!(all.len(), 1);
    assert_eq!(all[0].status(), Status::Success);
    assert_eq!(all[0].returns(), &[json!(42)]);

    runtime.close().await.unwrap();
}

/// Three workers plus the ingress path absorb eight blocking tasks
/// without back-pressuring the submitter; releasing one worker admits
/// exactly one more task into execution.
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_parallel_saturation() {
    let config = RuntimeConfig {
        task_channel_capacity: 3,
        mapper_count: 1,
        ..RuntimeConfig::default()
    };
    let runtime = Runtime::local(config);

    let (step_in_tx, step_in_rx) = std_mpsc::channel::<i64>();
    let (step_out_tx, step_out_rx) = std_mpsc::channel::<i64>();
    let step_in_tx = Mutex::new(step_in_tx);
    let step_out_rx = Mutex::new(step_out_rx);
    runtime
        .register(
            "Saturate",
            move |i: i64| {
                step_in_tx.lock().unwrap().send(i).unwrap();
                // Hold the worker until the test releases it.
                step_out_rx.lock().unwrap().recv().unwrap();
            },
            3,
            1,
            MARSHALLER_JSON,
            MARSHALLER_JSON,
        )
        .unwrap();

    // Eight submissions: three execute, the rest queue; none block.
    let mut streams = Vec::new();
    for i in 0..8 {
        let stream = tokio::select! {
            called = runtime.call("Saturate", TaskOptions::new(), vec![json!(i)]) => {
                called.unwrap().expect("report stream")
            }
            _ = tokio::time::sleep(Duration::from_secs(2)) => panic!("submit {} blocked", i),
        };
        streams.push(stream);
    }

    for _ in 0..3 {
        step_in_rx.recv_timeout(Duration::from_secs(2)).unwrap();
    }
    // No fourth task may start while all workers are held.
    assert!(step_in_rx.recv_timeout(Duration::from_millis(300)).is_err());

    // Releasing one worker admits exactly one queued task.
    step_out_tx.send(1).unwrap();
    step_in_rx.recv_timeout(Duration::from_secs(2)).unwrap();
    assert!(step_in_rx.recv_timeout(Duration::from_millis(300)).is_err());

    for _ in 0..7 {
        step_out_tx.send(1).unwrap();
    }

    for stream in streams {
        let all = drain_statuses(stream).await;
        assert_eq!(all.last().unwrap().status(), Status::Success);
    }

    runtime.close().await.unwrap();
}

/// A custom invoker registered under a fresh marshaller ID sits in the
/// invocation path.
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_custom_invoker_in_call_path() {
    struct CountingInvoker(Arc<AtomicUsize>);

    impl Invoker for CountingInvoker {
        fn call(&self, func: &TaskFn, args: Vec<Value>) -> Result<Vec<Value>, InvokeError> {
            self.0.fetch_add(1, Ordering::SeqCst);
            func.invoke(args)
        }

        fn fix_returns(
            &self,
            func: &TaskFn,
            returns: Vec<Value>,
        ) -> Result<Vec<Value>, InvokeError> {
            func.coerce_returns(returns)
        }
    }

    let runtime = Runtime::local(RuntimeConfig::default());
    let calls = Arc::new(AtomicUsize::new(0));
    runtime
        .add_marshaller(
            101,
            Codec::new(
                Arc::new(ValueMarshaller),
                Arc::new(CountingInvoker(Arc::clone(&calls))),
            ),
        )
        .unwrap();
    runtime
        .register(
            "Counted",
            |n: i64, name: String| -> (String, i64) { (format!("{}_'s message", name), n + 1) },
            1,
            1,
            101,
            101,
        )
        .unwrap();

    let reports = runtime
        .call(
            "Counted",
            TaskOptions::new(),
            vec![json!(12345), json!("mission")],
        )
        .await
        .unwrap()
        .expect("report stream");
    let all = drain_statuses(reports).await;

    let terminal = all.last().unwrap();
    assert_eq!(terminal.status(), Status::Success);
    assert_eq!(
        terminal.returns(),
        &[json!("mission_'s message"), json!(12346)]
    );
    assert_eq!(calls.load(Ordering::SeqCst), 1);

    runtime.close().await.unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_runtime_close_is_idempotent() {
    let runtime = Runtime::local(RuntimeConfig::default());
    runtime
        .register("Noop", || (), 2, 2, MARSHALLER_JSON, MARSHALLER_JSON)
        .unwrap();

    runtime.close().await.unwrap();
    runtime.close().await.unwrap();
}
