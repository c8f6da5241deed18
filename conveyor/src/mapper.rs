//! The mapper pool: routes tasks by function name to worker routines and
//! publishes per-task reports.
//!
//! Two kinds of routines run here:
//!
//! - **mapper routines** ([`MapperPool::more`]) pull tasks off a shared
//!   ingress channel, publish a [`Receipt`] for each, and route it into
//!   the per-name dispatch channel of the worker set registered for the
//!   task's function name;
//! - **worker routines** ([`MapperPool::allocate_workers`]) pull tasks
//!   off their name's dispatch channel, emit `Sent` and `Progress`
//!   reports, invoke the function with panic capture, and emit the
//!   terminal report on their own report channel.
//!
//! The receipt for a task is always published before its `Sent` report:
//! the mapper routine acknowledges on pickup, the worker reports on
//! dequeue.
//!
//! With `W` workers for a name and an ingress buffer of `B`, at least
//! `W + B` in-flight tasks are accepted before the submitter feels
//! back-pressure; once every worker is busy the ingress channel
//! back-pressures the broker naturally.

use crate::config::{REPORT_CHANNEL_HEADROOM, STRAY_REPORT_CAPACITY};
use crate::invoker::{Invoker, TaskFn};
use crate::report::{Receipt, Report, TaskError, ERR_INVOKE, ERR_PANIC, ERR_UNKNOWN_FUNCTION};
use crate::task::Task;
use std::collections::HashMap;
use std::sync::{Arc, Mutex as StdMutex, RwLock};
use thiserror::Error;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// Errors returned synchronously by pool operations.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum MapperError {
    /// A worker set already exists for the function name.
    #[error("workers already allocated for {0:?}")]
    AlreadyAllocated(String),

    /// The pool has been closed.
    #[error("mapper pool closed")]
    Closed,
}

/// A task ingress channel shared by several mapper routines.
pub type SharedTasks = Arc<Mutex<mpsc::Receiver<Task>>>;

/// Wraps a task channel for sharing across mapper routines.
pub fn share_tasks(rx: mpsc::Receiver<Task>) -> SharedTasks {
    Arc::new(Mutex::new(rx))
}

/// Everything a worker set needs to execute one function: the erased
/// function, the invoker adapting values to it, and the marshaller ID
/// reports for this function are framed with.
pub struct WorkerBinding {
    /// The registered function.
    pub func: TaskFn,
    /// The invoker used for both the call and return coercion.
    pub invoker: Arc<dyn Invoker>,
    /// Marshaller ID stamped into report headers.
    pub report_mid: u16,
}

#[derive(Clone)]
struct WorkerSet {
    dispatch_tx: mpsc::Sender<Task>,
}

/// The pool of mapper and worker routines.
pub struct MapperPool {
    bindings: Arc<RwLock<HashMap<String, WorkerSet>>>,
    shutdown: CancellationToken,
    routines: StdMutex<Vec<JoinHandle<()>>>,
    stray_tx: mpsc::Sender<Report>,
    stray_rx: StdMutex<Option<mpsc::Receiver<Report>>>,
}

impl MapperPool {
    /// Creates an empty pool.
    pub fn new() -> Self {
        let (stray_tx, stray_rx) = mpsc::channel(STRAY_REPORT_CAPACITY);
        Self {
            bindings: Arc::new(RwLock::new(HashMap::new())),
            shutdown: CancellationToken::new(),
            routines: StdMutex::new(Vec::new()),
            stray_tx,
            stray_rx: StdMutex::new(Some(stray_rx)),
        }
    }

    /// Takes the channel carrying reports that have no worker set, such
    /// as `Fail` reports for unknown function names. Hand it to the
    /// bridge's report path like any worker report channel. Returns
    /// `None` after the first call.
    pub fn stray_reports(&self) -> Option<mpsc::Receiver<Report>> {
        self.stray_rx
            .lock()
            .expect("stray report lock poisoned")
            .take()
    }

    /// Spawns one mapper routine reading the shared ingress channel.
    ///
    /// Each pulled task is acknowledged on `receipts` — accepted when a
    /// worker set exists for its name, rejected otherwise — and then
    /// routed. Rejected tasks produce a `Fail` report carrying an
    /// unknown-function error on the stray channel.
    pub fn more(&self, tasks: SharedTasks, receipts: mpsc::Sender<Receipt>) {
        let bindings = Arc::clone(&self.bindings);
        let stray_tx = self.stray_tx.clone();
        let token = self.shutdown.clone();

        let handle = tokio::spawn(async move {
            loop {
                let task = tokio::select! {
                    biased;

                    _ = token.cancelled() => break,
                    task = async { tasks.lock().await.recv().await } => match task {
                        Some(task) => task,
                        None => break,
                    },
                };
                route_task(&bindings, &receipts, &stray_tx, &token, task).await;
            }

            // Teardown: tasks still buffered on the ingress channel never
            // reached a worker, so mark them shut down.
            loop {
                let task = { tasks.lock().await.try_recv().ok() };
                let Some(task) = task else { break };
                abandon_task(&stray_tx, task);
            }
        });

        self.routines
            .lock()
            .expect("pool routine lock poisoned")
            .push(handle);
    }

    /// Registers `func` under `name` with `count` worker routines.
    ///
    /// The per-name dispatch channel buffers up to `queue_size` tasks
    /// (minimum one); each worker gets a report channel with headroom for
    /// a full report sequence on top of `queue_size`. Returns the report
    /// receivers and the count of workers that could not be spawned
    /// (zero on full allocation).
    pub fn allocate_workers(
        &self,
        name: &str,
        binding: WorkerBinding,
        count: usize,
        queue_size: usize,
    ) -> Result<(Vec<mpsc::Receiver<Report>>, usize), MapperError> {
        if self.shutdown.is_cancelled() {
            return Err(MapperError::Closed);
        }

        let mut bindings = self.bindings.write().expect("pool binding lock poisoned");
        if bindings.contains_key(name) {
            return Err(MapperError::AlreadyAllocated(name.to_string()));
        }

        let (dispatch_tx, dispatch_rx) = mpsc::channel(queue_size.max(1));
        let dispatch_rx = Arc::new(Mutex::new(dispatch_rx));
        let binding = Arc::new(binding);

        let mut report_rxs = Vec::with_capacity(count);
        let mut routines = self.routines.lock().expect("pool routine lock poisoned");
        for worker in 0..count {
            let (report_tx, report_rx) =
                mpsc::channel(queue_size + REPORT_CHANNEL_HEADROOM);
            routines.push(tokio::spawn(worker_loop(
                worker,
                name.to_string(),
                Arc::clone(&dispatch_rx),
                Arc::clone(&binding),
                report_tx,
                self.shutdown.clone(),
            )));
            report_rxs.push(report_rx);
        }

        bindings.insert(name.to_string(), WorkerSet { dispatch_tx });
        Ok((report_rxs, 0))
    }

    /// Signals every routine to drain and waits for all of them to exit.
    ///
    /// Tasks still queued when the signal lands get a terminal `Shutdown`
    /// report; an invocation already running completes and reports its
    /// own terminal status. All report channels close as their workers
    /// exit. Safe to call more than once.
    pub async fn close(&self) {
        self.shutdown.cancel();
        self.bindings
            .write()
            .expect("pool binding lock poisoned")
            .clear();

        let routines: Vec<_> = {
            let mut guard = self.routines.lock().expect("pool routine lock poisoned");
            guard.drain(..).collect()
        };
        for routine in routines {
            if let Err(e) = routine.await {
                if e.is_panic() {
                    std::panic::resume_unwind(e.into_panic());
                }
            }
        }
    }
}

impl Default for MapperPool {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for MapperPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let names = self.bindings.read().expect("pool binding lock poisoned");
        f.debug_struct("MapperPool")
            .field("worker_sets", &names.len())
            .field("closed", &self.shutdown.is_cancelled())
            .finish()
    }
}

async fn route_task(
    bindings: &RwLock<HashMap<String, WorkerSet>>,
    receipts: &mpsc::Sender<Receipt>,
    stray_tx: &mpsc::Sender<Report>,
    token: &CancellationToken,
    task: Task,
) {
    let set = bindings
        .read()
        .expect("pool binding lock poisoned")
        .get(task.name())
        .cloned();

    let Some(set) = set else {
        warn!(task = %task.header(), "no worker set for function");
        let _ = receipts.send(Receipt::rejected(task.id())).await;
        if !task.options().ignore_report() {
            let (header, options, _) = task.into_parts();
            let error = TaskError::new(
                ERR_UNKNOWN_FUNCTION,
                format!("no function registered under {:?}", header.name()),
            );
            if stray_tx
                .send(Report::fail(header, options, error))
                .await
                .is_err()
            {
                debug!("stray report channel gone");
            }
        }
        return;
    };

    let _ = receipts.send(Receipt::accepted(task.id())).await;

    tokio::select! {
        _ = token.cancelled() => abandon_task(stray_tx, task),
        permit = set.dispatch_tx.reserve() => match permit {
            Ok(permit) => permit.send(task),
            Err(_) => abandon_task(stray_tx, task),
        },
    }
}

/// Emits a best-effort `Shutdown` report for a task that will never run.
fn abandon_task(stray_tx: &mpsc::Sender<Report>, task: Task) {
    if task.options().ignore_report() {
        return;
    }
    let (header, options, _) = task.into_parts();
    if stray_tx
        .try_send(Report::shutdown(header, options))
        .is_err()
    {
        warn!("stray report channel full, dropping shutdown report");
    }
}

async fn worker_loop(
    worker: usize,
    name: String,
    tasks: SharedTasks,
    binding: Arc<WorkerBinding>,
    reports: mpsc::Sender<Report>,
    token: CancellationToken,
) {
    debug!(worker, name = %name, "worker started");

    loop {
        let task = tokio::select! {
            biased;

            _ = token.cancelled() => break,
            task = async { tasks.lock().await.recv().await } => match task {
                Some(task) => task,
                None => break,
            },
        };
        execute_task(&binding, &reports, task).await;
    }

    // Drain: everything still queued for this name is shut down.
    loop {
        let task = { tasks.lock().await.try_recv().ok() };
        let Some(task) = task else { break };
        if task.options().ignore_report() {
            continue;
        }
        let (header, options, _) = task.into_parts();
        let header = header.with_marshaller(binding.report_mid);
        if reports.send(Report::shutdown(header, options)).await.is_err() {
            break;
        }
    }

    debug!(worker, name = %name, "worker stopped");
}

async fn execute_task(binding: &Arc<WorkerBinding>, reports: &mpsc::Sender<Report>, task: Task) {
    let (header, options, args) = task.into_parts();
    let header = header.with_marshaller(binding.report_mid);

    if options.ignore_report() {
        match run_invocation(binding, args).await {
            Invocation::Returned(_) => {}
            Invocation::Failed(err) => warn!(task = %header, %err, "ignored task failed"),
            Invocation::Panicked(text) => warn!(task = %header, text, "ignored task panicked"),
        }
        return;
    }

    if !options.only_result() {
        if reports.send(Report::sent(header.clone(), options)).await.is_err() {
            return;
        }
        if reports
            .send(Report::progress(header.clone(), options))
            .await
            .is_err()
        {
            return;
        }
    }

    let report = match run_invocation(binding, args).await {
        Invocation::Panicked(text) => {
            Report::panicked(header, options, TaskError::new(ERR_PANIC, text))
        }
        Invocation::Failed(err) => {
            Report::fail(header, options, TaskError::new(ERR_INVOKE, err.to_string()))
        }
        Invocation::Returned(returns) => {
            match binding.invoker.fix_returns(&binding.func, returns) {
                Ok(fixed) => Report::success(header, options, fixed),
                Err(err) => {
                    Report::fail(header, options, TaskError::new(ERR_INVOKE, err.to_string()))
                }
            }
        }
    };
    let _ = reports.send(report).await;
}

enum Invocation {
    Returned(Vec<crate::task::Value>),
    Failed(crate::invoker::InvokeError),
    Panicked(String),
}

/// Runs the registered function on the blocking pool, converting a panic
/// of the invokee into a captured outcome. Panics in the runtime itself
/// are not caught.
async fn run_invocation(binding: &Arc<WorkerBinding>, args: Vec<crate::task::Value>) -> Invocation {
    let func = binding.func.clone();
    let invoker = Arc::clone(&binding.invoker);
    let joined = tokio::task::spawn_blocking(move || invoker.call(&func, args)).await;

    match joined {
        Ok(Ok(returns)) => Invocation::Returned(returns),
        Ok(Err(err)) => Invocation::Failed(err),
        Err(join_err) if join_err.is_panic() => {
            Invocation::Panicked(panic_text(join_err.into_panic()))
        }
        Err(join_err) => Invocation::Panicked(join_err.to_string()),
    }
}

fn panic_text(payload: Box<dyn std::any::Any + Send>) -> String {
    if let Some(text) = payload.downcast_ref::<&str>() {
        (*text).to_string()
    } else if let Some(text) = payload.downcast_ref::<String>() {
        text.clone()
    } else {
        "panic payload of unknown type".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame::Header;
    use crate::invoker::DefaultInvoker;
    use crate::mux::Mux;
    use crate::report::Status;
    use crate::registry::MARSHALLER_JSON;
    use crate::task::{TaskOptions, Value};
    use serde_json::json;
    use std::sync::mpsc as std_mpsc;
    use std::time::Duration;

    fn binding_for(func: TaskFn) -> WorkerBinding {
        WorkerBinding {
            func,
            invoker: Arc::new(DefaultInvoker),
            report_mid: MARSHALLER_JSON,
        }
    }

    fn task_for(name: &str, seq: usize, args: Vec<Value>) -> Task {
        Task::new(
            Header::new(format!("task-{}", seq), name, MARSHALLER_JSON),
            TaskOptions::new(),
            args,
        )
    }

    /// Mapper routines and the ingress buffer absorb tasks while the
    /// single worker is blocked; every accepted task later completes.
    #[tokio::test(flavor = "multi_thread", worker_threads = 8)]
    async fn test_parallel_mapping() {
        let pool = MapperPool::new();
        let mapper_count = 3;
        let (tasks_tx, tasks_rx) = mpsc::channel(5);
        let tasks = share_tasks(tasks_rx);

        // Fan receipts from every mapper routine into one collector.
        let receipts_mux = Mux::new();
        let (collect_tx, mut collect_rx) = mpsc::unbounded_channel();
        receipts_mux.handle(move |receipt: Receipt, _| {
            let _ = collect_tx.send(receipt);
        });
        for _ in 0..mapper_count {
            let (receipt_tx, receipt_rx) = mpsc::channel(10);
            pool.more(Arc::clone(&tasks), receipt_tx);
            receipts_mux.register(receipt_rx, 0).unwrap();
        }
        receipts_mux.more(mapper_count);

        let (step_in_tx, step_in_rx) = std_mpsc::channel::<i64>();
        let (step_out_tx, step_out_rx) = std_mpsc::channel::<i64>();
        let step_in_tx = StdMutex::new(step_in_tx);
        let step_out_rx = StdMutex::new(step_out_rx);
        let func = TaskFn::from_handler(move |i: i64| {
            step_in_tx.lock().unwrap().send(i).unwrap();
            // The worker blocks here until the test releases it.
            step_out_rx.lock().unwrap().recv().unwrap();
        });

        let (mut reports, remain) = pool
            .allocate_workers("ParallelMapping", binding_for(func), 1, 0)
            .unwrap();
        assert_eq!(remain, 0);
        assert_eq!(reports.len(), 1);
        let mut report_rx = reports.remove(0);

        // Fill the worker, the mapper routines and the ingress buffer;
        // none of these sends may block.
        let count = mapper_count + 5;
        for i in 0..count {
            let task = task_for("ParallelMapping", i, vec![json!(i as i64)]);
            tokio::select! {
                sent = tasks_tx.send(task) => sent.unwrap(),
                _ = tokio::time::sleep(Duration::from_secs(2)) => {
                    panic!("submit {} blocked", i)
                }
            }
        }

        let mut released = Vec::new();
        for _ in 0..count {
            // One receipt per task.
            collect_rx.recv().await.unwrap();

            // Sent and Progress arrive while the worker is blocked.
            assert_eq!(report_rx.recv().await.unwrap().status(), Status::Sent);
            assert_eq!(report_rx.recv().await.unwrap().status(), Status::Progress);

            // Release the worker, collect the terminal report.
            step_out_tx.send(1).unwrap();
            let terminal = report_rx.recv().await.unwrap();
            assert_eq!(terminal.status(), Status::Success);

            released.push(step_in_rx.recv().unwrap());
        }
        assert_eq!(released.len(), count);

        pool.close().await;
        receipts_mux.close().await;
    }

    #[tokio::test]
    async fn test_unknown_function_rejected_with_fail_report() {
        let pool = MapperPool::new();
        let mut stray = pool.stray_reports().unwrap();
        let (tasks_tx, tasks_rx) = mpsc::channel(2);
        let (receipt_tx, mut receipt_rx) = mpsc::channel(2);
        pool.more(share_tasks(tasks_rx), receipt_tx);

        tasks_tx
            .send(task_for("Nope", 0, vec![]))
            .await
            .unwrap();

        let receipt = receipt_rx.recv().await.unwrap();
        assert!(!receipt.is_accepted());

        let report = stray.recv().await.unwrap();
        assert_eq!(report.status(), Status::Fail);
        assert_eq!(report.error().unwrap().code(), ERR_UNKNOWN_FUNCTION);

        pool.close().await;
    }

    #[tokio::test]
    async fn test_panic_captured_as_panic_report() {
        let pool = MapperPool::new();
        let func = TaskFn::from_handler::<_, _, ()>(|| panic!("x"));
        let (mut reports, _) = pool
            .allocate_workers("Explodes", binding_for(func), 1, 1)
            .unwrap();
        let mut report_rx = reports.remove(0);

        let (tasks_tx, tasks_rx) = mpsc::channel(2);
        let (receipt_tx, _receipt_rx) = mpsc::channel(2);
        pool.more(share_tasks(tasks_rx), receipt_tx);

        tasks_tx.send(task_for("Explodes", 0, vec![])).await.unwrap();

        assert_eq!(report_rx.recv().await.unwrap().status(), Status::Sent);
        assert_eq!(report_rx.recv().await.unwrap().status(), Status::Progress);
        let terminal = report_rx.recv().await.unwrap();
        assert_eq!(terminal.status(), Status::Panic);
        assert!(terminal.error().unwrap().message().contains("x"));

        pool.close().await;
    }

    #[tokio::test]
    async fn test_only_result_emits_single_terminal() {
        let pool = MapperPool::new();
        let func = TaskFn::from_handler(|n: i64| -> (i64,) { (n + 1,) });
        let (mut reports, _) = pool
            .allocate_workers("Incr", binding_for(func), 1, 1)
            .unwrap();
        let mut report_rx = reports.remove(0);

        let (tasks_tx, tasks_rx) = mpsc::channel(2);
        let (receipt_tx, _receipt_rx) = mpsc::channel(2);
        pool.more(share_tasks(tasks_rx), receipt_tx);

        let task = Task::new(
            Header::new("only-1", "Incr", MARSHALLER_JSON),
            TaskOptions::new().set_only_result(true),
            vec![json!(41)],
        );
        tasks_tx.send(task).await.unwrap();

        let report = report_rx.recv().await.unwrap();
        assert_eq!(report.status(), Status::Success);
        assert_eq!(report.returns(), &[json!(42)]);

        pool.close().await;
        // Channel closed after the terminal report.
        assert!(report_rx.recv().await.is_none());
    }

    #[tokio::test]
    async fn test_allocate_twice_is_an_error() {
        let pool = MapperPool::new();
        pool.allocate_workers("Dup", binding_for(TaskFn::from_handler(|| ())), 1, 1)
            .unwrap();
        let err = pool
            .allocate_workers("Dup", binding_for(TaskFn::from_handler(|| ())), 1, 1)
            .unwrap_err();
        assert_eq!(err, MapperError::AlreadyAllocated("Dup".to_string()));

        pool.close().await;
    }

    #[tokio::test]
    async fn test_close_is_idempotent() {
        let pool = MapperPool::new();
        pool.allocate_workers("Idle", binding_for(TaskFn::from_handler(|| ())), 2, 1)
            .unwrap();
        pool.close().await;
        pool.close().await;
    }

    #[tokio::test]
    async fn test_queued_tasks_get_shutdown_reports_on_close() {
        let pool = MapperPool::new();
        let (step_tx, step_rx) = std_mpsc::channel::<()>();
        let step_rx = StdMutex::new(step_rx);
        let func = TaskFn::from_handler(move || {
            step_rx.lock().unwrap().recv().unwrap();
        });

        let (mut reports, _) = pool
            .allocate_workers("Slow", binding_for(func), 1, 2)
            .unwrap();
        let mut report_rx = reports.remove(0);

        let (tasks_tx, tasks_rx) = mpsc::channel(4);
        let (receipt_tx, _receipt_rx) = mpsc::channel(4);
        pool.more(share_tasks(tasks_rx), receipt_tx);

        // First task occupies the worker; the second stays queued.
        tasks_tx.send(task_for("Slow", 0, vec![])).await.unwrap();
        tasks_tx.send(task_for("Slow", 1, vec![])).await.unwrap();

        assert_eq!(report_rx.recv().await.unwrap().status(), Status::Sent);
        assert_eq!(report_rx.recv().await.unwrap().status(), Status::Progress);

        // Close while one task executes and one is queued; release the
        // worker so close can finish.
        let closer = tokio::spawn(async move { pool.close().await });
        step_tx.send(()).unwrap();
        closer.await.unwrap();

        let mut statuses = Vec::new();
        while let Some(report) = report_rx.recv().await {
            statuses.push(report.status());
        }
        assert!(statuses.contains(&Status::Success));
        assert!(statuses.contains(&Status::Shutdown));
    }
}
