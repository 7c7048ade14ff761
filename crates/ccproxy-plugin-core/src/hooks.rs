use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio::sync::{RwLock, broadcast};

use crate::metrics::StreamMetrics;

/// Pipeline events observers can subscribe to.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum HookEvent {
    RequestStart {
        request_id: String,
        provider: String,
        endpoint: String,
    },
    RequestEnd {
        request_id: String,
        provider: String,
        status: u16,
        duration_ms: u64,
    },
    StreamStart {
        request_id: String,
        provider: String,
    },
    StreamChunk {
        request_id: String,
        bytes: usize,
    },
    StreamEnd {
        request_id: String,
        provider: String,
        metrics: StreamMetrics,
    },
    ProviderError {
        request_id: String,
        provider: String,
        message: String,
    },
}

pub trait HookSink: Send + Sync {
    fn write<'a>(&'a self, event: &'a HookEvent) -> Pin<Box<dyn Future<Output = ()> + Send + 'a>>;
}

/// Fan-out of pipeline events: a broadcast channel for in-process
/// subscribers plus dynamically registered sinks. Sink registration is
/// serialized; emission never blocks on a sink (each write is spawned).
#[derive(Clone)]
pub struct HookBus {
    inner: Arc<Inner>,
}

struct Inner {
    tx: broadcast::Sender<HookEvent>,
    sinks: RwLock<Vec<Arc<dyn HookSink>>>,
}

impl HookBus {
    pub fn new(buffer: usize) -> Self {
        let (tx, _) = broadcast::channel(buffer);
        Self {
            inner: Arc::new(Inner {
                tx,
                sinks: RwLock::new(Vec::new()),
            }),
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<HookEvent> {
        self.inner.tx.subscribe()
    }

    pub async fn add_sink(&self, sink: Arc<dyn HookSink>) {
        self.inner.sinks.write().await.push(sink);
    }

    pub async fn emit(&self, event: HookEvent) {
        let _ = self.inner.tx.send(event.clone());
        let sinks = self.inner.sinks.read().await.clone();
        for sink in sinks {
            let event = event.clone();
            tokio::spawn(async move {
                sink.write(&event).await;
            });
        }
    }
}

impl Default for HookBus {
    fn default() -> Self {
        Self::new(256)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn subscribers_see_emitted_events() {
        let bus = HookBus::new(8);
        let mut rx = bus.subscribe();
        bus.emit(HookEvent::StreamStart {
            request_id: "r1".into(),
            provider: "claude".into(),
        })
        .await;
        match rx.recv().await.unwrap() {
            HookEvent::StreamStart { request_id, .. } => assert_eq!(request_id, "r1"),
            other => panic!("unexpected event: {other:?}"),
        }
    }

    #[tokio::test]
    async fn sinks_receive_each_event() {
        struct CountingSink(tokio::sync::mpsc::Sender<()>);
        impl HookSink for CountingSink {
            fn write<'a>(
                &'a self,
                _event: &'a HookEvent,
            ) -> Pin<Box<dyn Future<Output = ()> + Send + 'a>> {
                let tx = self.0.clone();
                Box::pin(async move {
                    let _ = tx.send(()).await;
                })
            }
        }

        let bus = HookBus::new(8);
        let (tx, mut rx) = tokio::sync::mpsc::channel(4);
        bus.add_sink(Arc::new(CountingSink(tx))).await;
        bus.emit(HookEvent::StreamChunk {
            request_id: "r1".into(),
            bytes: 42,
        })
        .await;
        assert!(rx.recv().await.is_some());
    }
}
