//! 通知总线：按事件类型 / 通配订阅，并发分发，隔离订阅者失败
//!
//! emit 解析出「类型订阅 ∪ 通配订阅」后并发调用全部 handler 并等待完成；
//! 单个 handler 返回错误或 panic 只记录 warn，不影响其它 handler，也不传给调用方。

use std::collections::HashMap;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use futures_util::future::{join_all, FutureExt};
use tokio::sync::RwLock;

use crate::notification::{Event, EventKind};

/// 事件订阅者
#[async_trait]
pub trait EventHandler: Send + Sync {
    async fn handle(&self, event: &Event) -> anyhow::Result<()>;

    /// 日志中使用的名称，默认是实现类型名
    fn name(&self) -> &'static str {
        std::any::type_name::<Self>()
    }
}

/// subscribe 返回的句柄，用于 unsubscribe
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionId(u64);

type Registration = (SubscriptionId, Arc<dyn EventHandler>);

#[derive(Default)]
pub struct NotificationBus {
    by_kind: RwLock<HashMap<EventKind, Vec<Registration>>>,
    wildcard: RwLock<Vec<Registration>>,
    next_id: AtomicU64,
}

impl NotificationBus {
    pub fn new() -> Self {
        Self::default()
    }

    fn next_id(&self) -> SubscriptionId {
        SubscriptionId(self.next_id.fetch_add(1, Ordering::Relaxed))
    }

    pub async fn subscribe(&self, kind: EventKind, handler: Arc<dyn EventHandler>) -> SubscriptionId {
        let id = self.next_id();
        self.by_kind
            .write()
            .await
            .entry(kind)
            .or_default()
            .push((id, handler));
        id
    }

    /// 订阅全部事件类型
    pub async fn subscribe_all(&self, handler: Arc<dyn EventHandler>) -> SubscriptionId {
        let id = self.next_id();
        self.wildcard.write().await.push((id, handler));
        id
    }

    /// 移除类型订阅；返回是否找到
    pub async fn unsubscribe(&self, id: SubscriptionId) -> bool {
        let mut by_kind = self.by_kind.write().await;
        let mut removed = false;
        for handlers in by_kind.values_mut() {
            let before = handlers.len();
            handlers.retain(|(sid, _)| *sid != id);
            removed |= handlers.len() != before;
        }
        by_kind.retain(|_, handlers| !handlers.is_empty());
        removed
    }

    /// 移除通配订阅；返回是否找到
    pub async fn unsubscribe_all(&self, id: SubscriptionId) -> bool {
        let mut wildcard = self.wildcard.write().await;
        let before = wildcard.len();
        wildcard.retain(|(sid, _)| *sid != id);
        wildcard.len() != before
    }

    /// 清空所有订阅（测试隔离）
    pub async fn clear(&self) {
        self.by_kind.write().await.clear();
        self.wildcard.write().await.clear();
    }

    pub async fn handler_count(&self, kind: EventKind) -> usize {
        let typed = self
            .by_kind
            .read()
            .await
            .get(&kind)
            .map(Vec::len)
            .unwrap_or(0);
        typed + self.wildcard.read().await.len()
    }

    /// 并发分发给全部匹配的 handler 并等待完成
    pub async fn emit(&self, event: Event) {
        let kind = event.kind();
        // 先复制 handler 列表再释放锁，handler 内部可以安全地订阅 / 退订
        let mut handlers: Vec<Arc<dyn EventHandler>> = self
            .by_kind
            .read()
            .await
            .get(&kind)
            .map(|hs| hs.iter().map(|(_, h)| Arc::clone(h)).collect())
            .unwrap_or_default();
        handlers.extend(self.wildcard.read().await.iter().map(|(_, h)| Arc::clone(h)));

        if handlers.is_empty() {
            return;
        }

        let event = &event;
        let calls = handlers.iter().map(|handler| async move {
            let outcome = AssertUnwindSafe(handler.handle(event)).catch_unwind().await;
            match outcome {
                Ok(Ok(())) => {}
                Ok(Err(e)) => tracing::warn!(
                    handler = handler.name(),
                    event = ?kind,
                    task_id = %event.task_id,
                    error = %e,
                    "Event handler failed"
                ),
                Err(_) => tracing::warn!(
                    handler = handler.name(),
                    event = ?kind,
                    task_id = %event.task_id,
                    "Event handler panicked"
                ),
            }
        });
        join_all(calls).await;
    }
}

/// 把事件收集到内存（测试与演示用）
#[derive(Default)]
pub struct EventCollector {
    events: std::sync::Mutex<Vec<Event>>,
}

impl EventCollector {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<Event> {
        self.events.lock().map(|e| e.clone()).unwrap_or_default()
    }

    pub fn kinds(&self) -> Vec<EventKind> {
        self.events().iter().map(Event::kind).collect()
    }

    pub fn count(&self, kind: EventKind) -> usize {
        self.kinds().into_iter().filter(|k| *k == kind).count()
    }
}

#[async_trait]
impl EventHandler for EventCollector {
    async fn handle(&self, event: &Event) -> anyhow::Result<()> {
        if let Ok(mut events) = self.events.lock() {
            events.push(event.clone());
        }
        Ok(())
    }
}

/// 以 info 级别记录每个事件
#[derive(Debug, Default)]
pub struct LoggingHandler;

#[async_trait]
impl EventHandler for LoggingHandler {
    async fn handle(&self, event: &Event) -> anyhow::Result<()> {
        tracing::info!(task_id = %event.task_id, event = ?event.kind(), "{}", serde_json::to_string(&event.payload)?);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::notification::EventPayload;
    use std::sync::atomic::AtomicUsize;

    #[derive(Default)]
    struct Counter(AtomicUsize);

    #[async_trait]
    impl EventHandler for Counter {
        async fn handle(&self, _event: &Event) -> anyhow::Result<()> {
            self.0.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    struct Failing;

    #[async_trait]
    impl EventHandler for Failing {
        async fn handle(&self, _event: &Event) -> anyhow::Result<()> {
            anyhow::bail!("subscriber exploded")
        }
    }

    struct Panicking;

    #[async_trait]
    impl EventHandler for Panicking {
        async fn handle(&self, _event: &Event) -> anyhow::Result<()> {
            panic!("subscriber panicked")
        }
    }

    fn passed() -> Event {
        Event::new(
            "t1",
            EventPayload::MilestonePassed {
                milestone_id: "m1".into(),
            },
        )
    }

    #[tokio::test]
    async fn test_failing_handler_is_isolated() {
        let bus = NotificationBus::new();
        let counters: Vec<Arc<Counter>> = (0..3).map(|_| Arc::new(Counter::default())).collect();
        for c in &counters {
            bus.subscribe(EventKind::MilestonePassed, c.clone()).await;
        }
        bus.subscribe(EventKind::MilestonePassed, Arc::new(Failing)).await;
        bus.subscribe_all(Arc::new(Panicking)).await;

        bus.emit(passed()).await;

        for c in &counters {
            assert_eq!(c.0.load(Ordering::SeqCst), 1);
        }
    }

    #[tokio::test]
    async fn test_typed_and_wildcard_subscribers() {
        let bus = NotificationBus::new();
        let typed = Arc::new(Counter::default());
        let all = Arc::new(Counter::default());
        bus.subscribe(EventKind::TaskCancelled, typed.clone()).await;
        bus.subscribe_all(all.clone()).await;

        bus.emit(passed()).await;
        bus.emit(Event::new("t1", EventPayload::TaskCancelled)).await;

        assert_eq!(typed.0.load(Ordering::SeqCst), 1);
        assert_eq!(all.0.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_emit_without_handlers_is_noop() {
        let bus = NotificationBus::new();
        bus.emit(passed()).await;
        assert_eq!(bus.handler_count(EventKind::MilestonePassed).await, 0);
    }

    #[tokio::test]
    async fn test_unsubscribe_and_clear() {
        let bus = NotificationBus::new();
        let counter = Arc::new(Counter::default());
        let id = bus.subscribe(EventKind::MilestonePassed, counter.clone()).await;
        let wid = bus.subscribe_all(counter.clone()).await;

        assert!(bus.unsubscribe(id).await);
        assert!(!bus.unsubscribe(id).await);
        bus.emit(passed()).await;
        assert_eq!(counter.0.load(Ordering::SeqCst), 1);

        assert!(bus.unsubscribe_all(wid).await);
        bus.emit(passed()).await;
        assert_eq!(counter.0.load(Ordering::SeqCst), 1);

        bus.subscribe(EventKind::MilestonePassed, counter.clone()).await;
        bus.subscribe_all(counter.clone()).await;
        bus.clear().await;
        assert_eq!(bus.handler_count(EventKind::MilestonePassed).await, 0);
    }

    #[tokio::test]
    async fn test_handlers_run_concurrently() {
        struct Slow(Arc<tokio::sync::Barrier>);

        #[async_trait]
        impl EventHandler for Slow {
            async fn handle(&self, _event: &Event) -> anyhow::Result<()> {
                // 两个 handler 都到达屏障才会继续；串行执行会死锁
                self.0.wait().await;
                Ok(())
            }
        }

        let bus = NotificationBus::new();
        let barrier = Arc::new(tokio::sync::Barrier::new(2));
        bus.subscribe(EventKind::MilestonePassed, Arc::new(Slow(barrier.clone()))).await;
        bus.subscribe_all(Arc::new(Slow(barrier))).await;

        tokio::time::timeout(std::time::Duration::from_secs(2), bus.emit(passed()))
            .await
            .expect("handlers should run concurrently");
    }
}
