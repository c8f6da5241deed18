//! Fan-in multiplexer.
//!
//! Funnels values from many channel sources into a single consumer
//! callback. Reader routines take one source at a time off a ready ring,
//! receive one value, deliver it, and requeue the source — so per-source
//! order is always preserved while cross-source order stays arbitrary,
//! regardless of how many readers run.
//!
//! A source whose sending half is dropped is unregistered without
//! affecting its peers. Install the callback with [`Mux::handle`] before
//! data flows; values received while no callback is installed are
//! dropped.

use futures::future::BoxFuture;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex as StdMutex, RwLock};
use thiserror::Error;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::trace;

/// Errors returned by [`Mux`] operations.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum MuxError {
    /// The mux has been closed.
    #[error("mux closed")]
    Closed,
}

/// Anything the mux can read values from.
///
/// Implemented for both bounded and unbounded tokio receivers; other
/// sources can implement it to join a fan-in.
pub trait MuxSource<T>: Send {
    /// Receives the next value, or `None` once the source is closed.
    fn recv(&mut self) -> BoxFuture<'_, Option<T>>;
}

impl<T: Send> MuxSource<T> for mpsc::Receiver<T> {
    fn recv(&mut self) -> BoxFuture<'_, Option<T>> {
        Box::pin(mpsc::Receiver::recv(self))
    }
}

impl<T: Send> MuxSource<T> for mpsc::UnboundedReceiver<T> {
    fn recv(&mut self) -> BoxFuture<'_, Option<T>> {
        Box::pin(mpsc::UnboundedReceiver::recv(self))
    }
}

struct SourceSlot<T> {
    source: Box<dyn MuxSource<T>>,
    tag: u32,
}

type Handler<T> = Arc<dyn Fn(T, u32) + Send + Sync>;

/// Fan-in of N channel sources into one callback.
pub struct Mux<T: Send + 'static> {
    ring_tx: mpsc::UnboundedSender<SourceSlot<T>>,
    ring_rx: Arc<Mutex<mpsc::UnboundedReceiver<SourceSlot<T>>>>,
    handler: Arc<RwLock<Option<Handler<T>>>>,
    shutdown: CancellationToken,
    readers: StdMutex<Vec<JoinHandle<()>>>,
    next_handle: AtomicUsize,
}

impl<T: Send + 'static> Mux<T> {
    /// Creates an empty mux with no readers.
    pub fn new() -> Self {
        let (ring_tx, ring_rx) = mpsc::unbounded_channel();
        Self {
            ring_tx,
            ring_rx: Arc::new(Mutex::new(ring_rx)),
            handler: Arc::new(RwLock::new(None)),
            shutdown: CancellationToken::new(),
            readers: StdMutex::new(Vec::new()),
            next_handle: AtomicUsize::new(0),
        }
    }

    /// Registers a source under a tag and returns its handle.
    ///
    /// The tag is passed to the callback with every value from this
    /// source; several sources may share a tag.
    pub fn register(
        &self,
        source: impl MuxSource<T> + 'static,
        tag: u32,
    ) -> Result<usize, MuxError> {
        if self.shutdown.is_cancelled() {
            return Err(MuxError::Closed);
        }
        self.ring_tx
            .send(SourceSlot {
                source: Box::new(source),
                tag,
            })
            .map_err(|_| MuxError::Closed)?;
        Ok(self.next_handle.fetch_add(1, Ordering::Relaxed))
    }

    /// Installs the single consumer callback.
    ///
    /// The callback runs on reader routines and must be fast and
    /// non-blocking; push heavy work onto a channel instead.
    pub fn handle(&self, f: impl Fn(T, u32) + Send + Sync + 'static) {
        *self.handler.write().expect("mux handler lock poisoned") = Some(Arc::new(f));
    }

    /// Spawns `count` additional reader routines.
    pub fn more(&self, count: usize) {
        let mut readers = self.readers.lock().expect("mux reader lock poisoned");
        for _ in 0..count {
            readers.push(self.spawn_reader());
        }
    }

    fn spawn_reader(&self) -> JoinHandle<()> {
        let ring_rx = Arc::clone(&self.ring_rx);
        let ring_tx = self.ring_tx.clone();
        let handler = Arc::clone(&self.handler);
        let token = self.shutdown.clone();

        tokio::spawn(async move {
            loop {
                let slot = tokio::select! {
                    _ = token.cancelled() => break,
                    slot = async { ring_rx.lock().await.recv().await } => match slot {
                        Some(slot) => slot,
                        None => break,
                    },
                };

                let mut slot = slot;
                let value = tokio::select! {
                    _ = token.cancelled() => break,
                    value = slot.source.recv() => value,
                };

                match value {
                    Some(value) => {
                        let installed = handler
                            .read()
                            .expect("mux handler lock poisoned")
                            .clone();
                        if let Some(callback) = installed {
                            callback(value, slot.tag);
                        }
                        if ring_tx.send(slot).is_err() {
                            break;
                        }
                    }
                    None => {
                        // Source closed: drop the slot, peers keep going.
                        trace!(tag = slot.tag, "mux source closed");
                    }
                }
            }
        })
    }

    /// Stops all readers and drops every registered source.
    ///
    /// Safe to call more than once.
    pub async fn close(&self) {
        self.shutdown.cancel();
        let readers: Vec<_> = {
            let mut guard = self.readers.lock().expect("mux reader lock poisoned");
            guard.drain(..).collect()
        };
        for reader in readers {
            if let Err(e) = reader.await {
                if e.is_panic() {
                    std::panic::resume_unwind(e.into_panic());
                }
            }
        }
    }
}

impl<T: Send + 'static> Default for Mux<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: Send + 'static> std::fmt::Debug for Mux<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Mux")
            .field("closed", &self.shutdown.is_cancelled())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn test_fan_in_delivers_all_values() {
        let mux = Mux::new();
        let (out_tx, mut out_rx) = mpsc::unbounded_channel();
        mux.handle(move |value: i32, tag| {
            let _ = out_tx.send((value, tag));
        });

        let (tx_a, rx_a) = mpsc::channel(4);
        let (tx_b, rx_b) = mpsc::channel(4);
        mux.register(rx_a, 1).unwrap();
        mux.register(rx_b, 2).unwrap();
        mux.more(3);

        for i in 0..4 {
            tx_a.send(i).await.unwrap();
            tx_b.send(i + 100).await.unwrap();
        }

        let mut seen = Vec::new();
        for _ in 0..8 {
            seen.push(out_rx.recv().await.unwrap());
        }

        // Per-source order preserved; cross-source order arbitrary.
        let from_a: Vec<_> = seen.iter().filter(|(_, t)| *t == 1).map(|(v, _)| *v).collect();
        let from_b: Vec<_> = seen.iter().filter(|(_, t)| *t == 2).map(|(v, _)| *v).collect();
        assert_eq!(from_a, vec![0, 1, 2, 3]);
        assert_eq!(from_b, vec![100, 101, 102, 103]);

        mux.close().await;
    }

    #[tokio::test]
    async fn test_closed_source_unregisters_without_affecting_peers() {
        let mux = Mux::new();
        let (out_tx, mut out_rx) = mpsc::unbounded_channel();
        mux.handle(move |value: i32, tag| {
            let _ = out_tx.send((value, tag));
        });

        let (tx_a, rx_a) = mpsc::channel(2);
        let (tx_b, rx_b) = mpsc::channel(2);
        mux.register(rx_a, 1).unwrap();
        mux.register(rx_b, 2).unwrap();
        mux.more(2);

        drop(tx_a);
        tx_b.send(7).await.unwrap();

        assert_eq!(out_rx.recv().await, Some((7, 2)));
        mux.close().await;
    }

    #[tokio::test]
    async fn test_unbounded_source() {
        let mux = Mux::new();
        let (out_tx, mut out_rx) = mpsc::unbounded_channel();
        mux.handle(move |value: &'static str, _| {
            let _ = out_tx.send(value);
        });

        let (tx, rx) = mpsc::unbounded_channel();
        mux.register(rx, 0).unwrap();
        mux.more(1);

        tx.send("hello").unwrap();
        assert_eq!(out_rx.recv().await, Some("hello"));
        mux.close().await;
    }

    #[tokio::test]
    async fn test_close_is_idempotent() {
        let mux: Mux<i32> = Mux::new();
        mux.more(2);
        mux.close().await;
        mux.close().await;
    }

    #[tokio::test]
    async fn test_register_after_close_fails() {
        let mux: Mux<i32> = Mux::new();
        mux.close().await;

        let (_tx, rx) = mpsc::channel(1);
        assert_eq!(mux.register(rx, 0), Err(MuxError::Closed));
    }

    #[tokio::test]
    async fn test_all_sources_drain_under_close() {
        let mux = Mux::new();
        let (out_tx, mut out_rx) = mpsc::unbounded_channel();
        mux.handle(move |value: i32, _| {
            let _ = out_tx.send(value);
        });

        let mut senders = Vec::new();
        for tag in 0..5 {
            let (tx, rx) = mpsc::channel(4);
            mux.register(rx, tag).unwrap();
            senders.push(tx);
        }
        mux.more(2);

        for (i, tx) in senders.iter().enumerate() {
            tx.send(i as i32).await.unwrap();
        }

        let mut got = Vec::new();
        for _ in 0..5 {
            let value = tokio::select! {
                v = out_rx.recv() => v.unwrap(),
                _ = tokio::time::sleep(Duration::from_secs(2)) => panic!("mux stalled"),
            };
            got.push(value);
        }
        got.sort_unstable();
        assert_eq!(got, vec![0, 1, 2, 3, 4]);

        mux.close().await;
    }
}
