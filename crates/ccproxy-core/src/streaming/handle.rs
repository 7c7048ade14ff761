use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;

use bytes::Bytes;
use tokio::sync::{Mutex, Notify, mpsc};
use tracing::debug;

const LISTENER_CHANNEL_CAPACITY: usize = 32;

/// What a listener queue carries. `End` is the sentinel after the source is
/// exhausted; `Error` re-raises a producer failure to every listener.
#[derive(Debug, Clone, PartialEq)]
pub enum StreamItem {
    Chunk(Bytes),
    End,
    Error(String),
}

/// Broadcaster turning one upstream stream into N independent listener
/// queues.
///
/// A single producer task reads the source and fans each chunk out in
/// order. When the last listener detaches while the source is still live,
/// the handle interrupts the producer and waits for it, bounded by the
/// interrupt timeout.
pub struct StreamHandle {
    listeners: Mutex<HashMap<u64, mpsc::Sender<StreamItem>>>,
    next_listener_id: AtomicU64,
    active: Arc<AtomicBool>,
    error: Arc<Mutex<Option<String>>>,
    interrupt: Arc<Notify>,
    interrupt_timeout: Duration,
}

impl StreamHandle {
    /// Default bound on how long `remove_listener` waits for the producer
    /// after requesting an interrupt.
    pub const DEFAULT_INTERRUPT_TIMEOUT: Duration = Duration::from_secs(10);

    pub fn spawn(
        mut source: mpsc::Receiver<Result<Bytes, String>>,
        interrupt_timeout: Duration,
    ) -> Arc<Self> {
        let handle = Arc::new(Self {
            listeners: Mutex::new(HashMap::new()),
            next_listener_id: AtomicU64::new(0),
            active: Arc::new(AtomicBool::new(true)),
            error: Arc::new(Mutex::new(None)),
            interrupt: Arc::new(Notify::new()),
            interrupt_timeout,
        });

        let producer = Arc::clone(&handle);
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    item = source.recv() => match item {
                        Some(Ok(chunk)) => {
                            producer.fan_out(StreamItem::Chunk(chunk)).await;
                        }
                        Some(Err(message)) => {
                            *producer.error.lock().await = Some(message.clone());
                            producer.fan_out(StreamItem::Error(message)).await;
                            break;
                        }
                        None => {
                            producer.fan_out(StreamItem::End).await;
                            break;
                        }
                    },
                    _ = producer.interrupt.notified() => {
                        debug!(event = "stream_handle_interrupted");
                        producer.fan_out(StreamItem::End).await;
                        break;
                    }
                }
            }
            producer.active.store(false, Ordering::SeqCst);
        });

        handle
    }

    async fn fan_out(&self, item: StreamItem) {
        let listeners = self.listeners.lock().await;
        for sender in listeners.values() {
            let _ = sender.send(item.clone()).await;
        }
    }

    pub async fn add_listener(&self) -> (u64, mpsc::Receiver<StreamItem>) {
        let (tx, rx) = mpsc::channel(LISTENER_CHANNEL_CAPACITY);
        // A listener attaching after a failure still observes the error.
        if let Some(message) = self.error.lock().await.clone() {
            let _ = tx.send(StreamItem::Error(message)).await;
        } else if !self.active.load(Ordering::SeqCst) {
            let _ = tx.send(StreamItem::End).await;
        }
        let id = self.next_listener_id.fetch_add(1, Ordering::SeqCst);
        self.listeners.lock().await.insert(id, tx);
        (id, rx)
    }

    /// Detach a listener. The last one leaving while the source is still
    /// active asks the producer to interrupt and waits, bounded by the
    /// configured timeout.
    pub async fn remove_listener(&self, id: u64) {
        let now_empty = {
            let mut listeners = self.listeners.lock().await;
            listeners.remove(&id);
            listeners.is_empty()
        };
        if now_empty && self.active.load(Ordering::SeqCst) {
            // notify_one stores a permit, so the producer picks the
            // interrupt up even if it is mid-chunk rather than parked in
            // select.
            self.interrupt.notify_one();
            let deadline = tokio::time::Instant::now() + self.interrupt_timeout;
            while self.active.load(Ordering::SeqCst) && tokio::time::Instant::now() < deadline {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        }
    }

    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::SeqCst)
    }
}
