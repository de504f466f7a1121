//! 事件总线
//!
//! 核心对事件接收方（WebSocket 层、UI）只有一个要求：发布永不阻塞。
//! 这里用 `tokio::sync::broadcast` 实现：没有订阅者时发送直接丢弃，
//! 订阅者消费过慢时丢弃其最旧的事件。

pub mod throttle;
pub mod types;

pub use throttle::{ProgressThrottler, DEFAULT_THROTTLE_INTERVAL_MS};
pub use types::{EventPriority, TaskEvent};

use tokio::sync::broadcast;

/// 默认事件缓冲容量
const DEFAULT_CAPACITY: usize = 256;

/// 事件总线
#[derive(Debug, Clone)]
pub struct EventBus {
    tx: broadcast::Sender<TaskEvent>,
}

impl EventBus {
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_CAPACITY)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity);
        Self { tx }
    }

    /// 订阅事件流
    pub fn subscribe(&self) -> broadcast::Receiver<TaskEvent> {
        self.tx.subscribe()
    }

    /// 发布事件（非阻塞，无订阅者时丢弃）
    pub fn publish(&self, event: TaskEvent) {
        let _ = self.tx.send(event);
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}
