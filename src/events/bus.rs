//! 事件总线
//!
//! 发布方在持有控制器锁时调用 `publish`，因此同一更新的事件按状态变化顺序送达；
//! 不同更新之间不保证顺序。
//!
//! 状态事件不会丢失。订阅方积压的进度事件超过 [`PROGRESS_BACKLOG`] 条时，
//! 新的进度事件被丢弃，直到订阅方读走积压。

use dashmap::DashMap;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Weak};
use tokio::sync::mpsc;
use tracing::debug;

use super::{EventFilter, UpdateEvent};

/// 每个订阅方最多积压的进度事件数
pub const PROGRESS_BACKLOG: usize = 256;

struct Subscriber {
    filter: EventFilter,
    tx: mpsc::UnboundedSender<UpdateEvent>,
    /// 已发送但尚未被读取的进度事件数
    pending_progress: Arc<AtomicUsize>,
}

#[derive(Default)]
struct BusInner {
    subscribers: DashMap<u64, Subscriber>,
    next_id: AtomicU64,
}

/// 发布/订阅事件总线
#[derive(Clone, Default)]
pub struct EventBus {
    inner: Arc<BusInner>,
}

impl EventBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// 订阅事件，返回的订阅句柄销毁时自动退订
    pub fn subscribe(&self, filter: EventFilter) -> EventSubscription {
        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = mpsc::unbounded_channel();
        let pending_progress = Arc::new(AtomicUsize::new(0));
        self.inner.subscribers.insert(
            id,
            Subscriber {
                filter,
                tx,
                pending_progress: pending_progress.clone(),
            },
        );
        debug!("新增事件订阅: id={}, filter={:?}", id, filter);

        EventSubscription {
            id,
            rx,
            pending_progress,
            bus: Arc::downgrade(&self.inner),
        }
    }

    /// 主动退订
    pub fn unsubscribe(&self, subscription_id: u64) -> bool {
        self.inner.subscribers.remove(&subscription_id).is_some()
    }

    pub fn subscriber_count(&self) -> usize {
        self.inner.subscribers.len()
    }

    pub fn publish(&self, event: UpdateEvent) {
        let progress = event.is_progress();
        let mut closed = Vec::new();

        for entry in self.inner.subscribers.iter() {
            if !entry.filter.accepts(&event) {
                continue;
            }
            if progress {
                let pending = entry.pending_progress.fetch_add(1, Ordering::AcqRel);
                if pending >= PROGRESS_BACKLOG {
                    entry.pending_progress.fetch_sub(1, Ordering::AcqRel);
                    continue;
                }
            }
            if entry.tx.send(event.clone()).is_err() {
                closed.push(*entry.key());
            }
        }

        // 迭代结束后再删除，避免持有分片读锁时写入
        for id in closed {
            self.inner.subscribers.remove(&id);
        }
    }
}

/// 事件订阅句柄
pub struct EventSubscription {
    id: u64,
    rx: mpsc::UnboundedReceiver<UpdateEvent>,
    pending_progress: Arc<AtomicUsize>,
    bus: Weak<BusInner>,
}

impl EventSubscription {
    pub fn id(&self) -> u64 {
        self.id
    }

    pub async fn recv(&mut self) -> Option<UpdateEvent> {
        let event = self.rx.recv().await;
        self.received(event)
    }

    pub fn try_recv(&mut self) -> Option<UpdateEvent> {
        let event = self.rx.try_recv().ok();
        self.received(event)
    }

    fn received(&self, event: Option<UpdateEvent>) -> Option<UpdateEvent> {
        if matches!(&event, Some(e) if e.is_progress()) {
            self.pending_progress.fetch_sub(1, Ordering::AcqRel);
        }
        event
    }
}

impl Drop for EventSubscription {
    fn drop(&mut self) {
        if let Some(bus) = self.bus.upgrade() {
            bus.subscribers.remove(&self.id);
        }
    }
}
