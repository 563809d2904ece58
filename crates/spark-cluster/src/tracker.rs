//! # tracker：成员视图跟踪与监听者投递
//!
//! ## 角色定位（Why）
//! - 持有权威的当前视图，供分发器在路由时无锁读取；
//! - 把视图变更异步投递给监听者，通道的投递线程默认不会被监听者阻塞；
//! - 保留有界的视图历史，便于排查抖动与分区。
//!
//! ## 契约说明（What）
//! - [`MembershipTracker::on_view_change`] 原子替换视图并计算差异，按视图顺序入队；
//!   视图编号不大于当前视图的过期视图被忽略；
//! - 每个监听者拥有独立的单工作者队列：同一监听者内事件严格有序，不同监听者互不影响；
//! - 开启同步通知后，[`NotificationMode::Synchronous`] 监听者直接在投递线程上回调；
//! - 监听者 panic 被捕获并记录为 `error`，不会中断后续事件，也不会影响其他监听者；
//! - [`ListenerRegistration::close`] 注销并等待队列排空；直接丢弃注册句柄只注销、不等待。

use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::SystemTime;

use arc_swap::ArcSwap;
use parking_lot::Mutex;
use tokio::runtime::Handle;
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};
use tokio::task::JoinHandle;
use tracing::{Instrument, debug, error, info, trace, warn};

use crate::membership::{Membership, MembershipChange};
use crate::node::Node;

const DEFAULT_HISTORY_LIMIT: usize = 100;

/// 视图变更监听者。
///
/// 异步监听者的回调运行在阻塞线程池上，可以执行同步操作；同一监听者的回调不会并发。
pub trait MembershipListener: Send + Sync + 'static {
    fn membership_changed(&self, change: &MembershipChange);
}

impl<F> MembershipListener for F
where
    F: Fn(&MembershipChange) + Send + Sync + 'static,
{
    fn membership_changed(&self, change: &MembershipChange) {
        self(change)
    }
}

/// 监听者的通知方式。
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum NotificationMode {
    /// 经独立队列在阻塞线程池上回调。
    #[default]
    Asynchronous,
    /// 在视图投递线程上直接回调；跟踪器未开启同步通知时退化为异步。
    ///
    /// 回调期间视图投递被阻塞，回调内不得触发新的视图变更。
    Synchronous,
}

enum ListenerSink {
    Queue(UnboundedSender<Arc<MembershipChange>>),
    Inline(Arc<dyn MembershipListener>),
}

type ListenerTable = Mutex<HashMap<u64, ListenerSink>>;

/// 视图历史中的事件。
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum HistoryEvent {
    ViewInstalled {
        view_id: u64,
        members: Vec<Node>,
        previous: Vec<Node>,
    },
    Suspected {
        node: Node,
    },
}

impl fmt::Display for HistoryEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            HistoryEvent::ViewInstalled {
                view_id,
                members,
                previous,
            } => write!(
                f,
                "view {view_id} installed: [{}] (was [{}])",
                join_names(members),
                join_names(previous)
            ),
            HistoryEvent::Suspected { node } => write!(f, "member {node} suspected"),
        }
    }
}

fn join_names(nodes: &[Node]) -> String {
    nodes
        .iter()
        .map(Node::name)
        .collect::<Vec<_>>()
        .join(", ")
}

/// 带时间戳的历史记录。
#[derive(Clone, Debug)]
pub struct HistoryEntry {
    at: SystemTime,
    event: HistoryEvent,
}

impl HistoryEntry {
    pub fn at(&self) -> SystemTime {
        self.at
    }

    pub fn event(&self) -> &HistoryEvent {
        &self.event
    }
}

impl fmt::Display for HistoryEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let millis = self
            .at
            .duration_since(SystemTime::UNIX_EPOCH)
            .map(|elapsed| elapsed.as_millis())
            .unwrap_or_default();
        write!(f, "{millis} : {}", self.event)
    }
}

/// 成员视图跟踪器。
///
/// # 教案式说明
/// - **契约 (What)**：
///   - `current()` 无锁读取，写入方（视图变更）不会阻塞读取方；
///   - 视图变更由投递锁串行化，每个队列看到的事件顺序与视图顺序一致；
///   - 历史最多保留 `history_limit` 条，超出后丢弃最旧的记录；上限为 0 时不记录。
/// - **执行逻辑 (How)**：
///   1. 持有投递锁，过期视图直接忽略；
///   2. 加锁监听者表，`ArcSwap::swap` 替换视图并拿到旧视图，计算差异并记录 `info` 日志与历史；
///   3. 逐个入队；入队失败说明工作者已退出，记录 `trace` 后移除该队列；
///   4. 释放监听者表后依次回调同步监听者。
pub struct MembershipTracker {
    current: ArcSwap<Membership>,
    delivery: Mutex<()>,
    listeners: Arc<ListenerTable>,
    next_listener: AtomicU64,
    history: Mutex<VecDeque<HistoryEntry>>,
    history_limit: usize,
    synchronous_notifications: bool,
    runtime: Handle,
}

impl MembershipTracker {
    pub fn new(initial: Membership, runtime: Handle) -> Self {
        Self {
            current: ArcSwap::from_pointee(initial),
            delivery: Mutex::new(()),
            listeners: Arc::new(Mutex::new(HashMap::new())),
            next_listener: AtomicU64::new(1),
            history: Mutex::new(VecDeque::new()),
            history_limit: DEFAULT_HISTORY_LIMIT,
            synchronous_notifications: false,
            runtime,
        }
    }

    pub fn with_history_limit(mut self, limit: usize) -> Self {
        self.history_limit = limit;
        self
    }

    /// 允许 [`NotificationMode::Synchronous`] 监听者在投递线程上回调。
    pub fn with_synchronous_notifications(mut self, allow: bool) -> Self {
        self.synchronous_notifications = allow;
        self
    }

    /// 当前视图快照。
    pub fn current(&self) -> Arc<Membership> {
        self.current.load_full()
    }

    /// 安装新视图并通知所有监听者，返回本次变更；过期视图返回 `None`。
    pub fn on_view_change(
        &self,
        next: Membership,
        partitions: Vec<Vec<Node>>,
    ) -> Option<Arc<MembershipChange>> {
        let _delivery = self.delivery.lock();
        let installed = self.current.load().view_id();
        if next.view_id() <= installed {
            debug!(view_id = next.view_id(), installed, "stale membership view ignored");
            return None;
        }

        let mut listeners = self.listeners.lock();
        let next = Arc::new(next);
        let previous = self.current.swap(Arc::clone(&next));
        let change = Arc::new(MembershipChange::between(previous, next).with_partitions(partitions));

        info!(
            view_id = change.current().view_id(),
            members = change.current().len(),
            left = change.left().len(),
            joined = change.joined().len(),
            merge = change.is_merge(),
            "membership view changed"
        );
        self.record(HistoryEvent::ViewInstalled {
            view_id: change.current().view_id(),
            members: change.current().members().to_vec(),
            previous: change.previous().members().to_vec(),
        });

        let mut inline = Vec::new();
        listeners.retain(|id, sink| match sink {
            ListenerSink::Queue(queue) => match queue.send(Arc::clone(&change)) {
                Ok(()) => true,
                Err(_) => {
                    trace!(listener = id, "membership listener queue already closed, dropping event");
                    false
                }
            },
            ListenerSink::Inline(listener) => {
                inline.push((*id, Arc::clone(listener)));
                true
            }
        });
        drop(listeners);

        for (id, listener) in inline {
            let outcome = catch_unwind(AssertUnwindSafe(|| listener.membership_changed(&change)));
            if outcome.is_err() {
                error!(
                    listener = id,
                    view_id = change.current().view_id(),
                    "membership listener failed"
                );
            }
        }
        Some(change)
    }

    /// 以异步方式注册监听者；返回的句柄决定监听者的生命周期。
    pub fn register(&self, listener: Arc<dyn MembershipListener>) -> ListenerRegistration {
        self.register_with(listener, NotificationMode::Asynchronous)
    }

    /// 按指定方式注册监听者。
    pub fn register_with(
        &self,
        listener: Arc<dyn MembershipListener>,
        mode: NotificationMode,
    ) -> ListenerRegistration {
        let id = self.next_listener.fetch_add(1, Ordering::Relaxed);
        let table = Arc::downgrade(&self.listeners);
        if mode == NotificationMode::Synchronous {
            if self.synchronous_notifications {
                self.listeners.lock().insert(id, ListenerSink::Inline(listener));
                debug!(listener = id, "synchronous membership listener registered");
                return ListenerRegistration {
                    id,
                    table,
                    worker: None,
                };
            }
            debug!(listener = id, "synchronous notifications disabled, listener queued");
        }

        let (queue, events) = mpsc::unbounded_channel();
        self.listeners.lock().insert(id, ListenerSink::Queue(queue));
        let worker = self
            .runtime
            .spawn(drain_events(id, listener, events).in_current_span());
        debug!(listener = id, "membership listener registered");
        ListenerRegistration {
            id,
            table,
            worker: Some(worker),
        }
    }

    /// 记录通道对某成员的怀疑；视图本身要等通道发布新视图后才会变化。
    pub fn suspect(&self, node: &Node) {
        warn!(node = %node, address = %node.address(), "member suspected by group channel");
        self.record(HistoryEvent::Suspected { node: node.clone() });
    }

    pub fn listener_count(&self) -> usize {
        self.listeners.lock().len()
    }

    /// 按时间顺序返回保留的历史记录。
    pub fn history(&self) -> Vec<HistoryEntry> {
        self.history.lock().iter().cloned().collect()
    }

    pub fn history_limit(&self) -> usize {
        self.history_limit
    }

    fn record(&self, event: HistoryEvent) {
        if self.history_limit == 0 {
            return;
        }
        let mut history = self.history.lock();
        history.push_back(HistoryEntry {
            at: SystemTime::now(),
            event,
        });
        while history.len() > self.history_limit {
            history.pop_front();
        }
    }
}

async fn drain_events(
    id: u64,
    listener: Arc<dyn MembershipListener>,
    mut events: UnboundedReceiver<Arc<MembershipChange>>,
) {
    while let Some(change) = events.recv().await {
        let view_id = change.current().view_id();
        let listener = Arc::clone(&listener);
        let outcome =
            tokio::task::spawn_blocking(move || listener.membership_changed(&change)).await;
        if let Err(err) = outcome {
            error!(listener = id, view_id, error = %err, "membership listener failed");
        }
    }
}

/// 监听者注册句柄。
pub struct ListenerRegistration {
    id: u64,
    table: Weak<ListenerTable>,
    worker: Option<JoinHandle<()>>,
}

impl ListenerRegistration {
    pub fn id(&self) -> u64 {
        self.id
    }

    /// 注销监听者并等待已入队的事件处理完毕。
    pub async fn close(mut self) {
        self.unregister();
        if let Some(worker) = self.worker.take() {
            let _ = worker.await;
        }
    }

    fn unregister(&self) {
        if let Some(table) = self.table.upgrade()
            && table.lock().remove(&self.id).is_some()
        {
            debug!(listener = self.id, "membership listener unregistered");
        }
    }
}

impl Drop for ListenerRegistration {
    fn drop(&mut self) {
        self.unregister();
    }
}

impl std::fmt::Debug for ListenerRegistration {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ListenerRegistration")
            .field("id", &self.id)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::TransportAddress;
    use std::time::Duration;
    use tracing_test::traced_test;

    fn node(name: &str) -> Node {
        Node::new(name, TransportAddress::new(format!("addr-{name}")))
    }

    struct Exploding;

    impl MembershipListener for Exploding {
        fn membership_changed(&self, _: &MembershipChange) {
            panic!("listener exploded");
        }
    }

    fn membership(id: u64, names: &[&str]) -> Membership {
        Membership::new(id, node("local"), names.iter().map(|name| node(name)).collect())
    }

    #[tokio::test]
    async fn swap_is_visible_immediately_and_diff_is_reported() {
        let tracker = MembershipTracker::new(membership(1, &["A", "B", "C"]), Handle::current());
        let change = tracker
            .on_view_change(membership(2, &["B", "C", "D"]), Vec::new())
            .expect("newer view");
        assert_eq!(tracker.current().view_id(), 2);
        assert_eq!(change.left(), &[node("A")]);
        assert_eq!(change.joined(), &[node("D")]);
    }

    #[tokio::test]
    #[traced_test]
    async fn failing_listener_does_not_block_others() {
        let tracker = MembershipTracker::new(membership(1, &["A"]), Handle::current());
        let (seen, mut received) = mpsc::unbounded_channel();
        let good = tracker.register(Arc::new(move |change: &MembershipChange| {
            let _ = seen.send(change.current().view_id());
        }));
        let bad = tracker.register(Arc::new(Exploding));
        assert_eq!(tracker.listener_count(), 2);

        tracker.on_view_change(membership(2, &["A", "B"]), Vec::new());
        tracker.on_view_change(membership(3, &["B"]), Vec::new());

        for expected in [2, 3] {
            let view_id = tokio::time::timeout(Duration::from_secs(5), received.recv())
                .await
                .expect("good listener should keep receiving")
                .expect("queue open");
            assert_eq!(view_id, expected);
        }

        bad.close().await;
        assert!(logs_contain("membership listener failed"));
        good.close().await;
        assert_eq!(tracker.listener_count(), 0);
    }

    #[tokio::test]
    async fn dropped_registration_stops_delivery() {
        let tracker = MembershipTracker::new(membership(1, &["A"]), Handle::current());
        let registration = tracker.register(Arc::new(|_: &MembershipChange| {}));
        drop(registration);
        assert_eq!(tracker.listener_count(), 0);
        tracker.on_view_change(membership(2, &[]), Vec::new());
        assert!(tracker.current().is_empty());
    }

    #[tokio::test]
    async fn merge_partitions_are_carried_on_the_change() {
        let tracker = MembershipTracker::new(membership(1, &["A"]), Handle::current());
        let change = tracker
            .on_view_change(
                membership(2, &["A", "B"]),
                vec![vec![node("A")], vec![node("B")]],
            )
            .expect("newer view");
        assert!(change.is_merge());
        assert_eq!(change.partitions().len(), 2);
    }

    #[tokio::test]
    async fn stale_views_do_not_regress_the_current_view() {
        let tracker = MembershipTracker::new(membership(1, &["A"]), Handle::current());
        assert!(tracker.on_view_change(membership(3, &["A", "B", "C"]), Vec::new()).is_some());
        assert!(tracker.on_view_change(membership(2, &["A", "B"]), Vec::new()).is_none());
        assert!(tracker.on_view_change(membership(3, &["A"]), Vec::new()).is_none());
        assert_eq!(tracker.current().view_id(), 3);
        assert_eq!(tracker.current().len(), 3);
    }

    #[tokio::test]
    async fn history_keeps_only_the_latest_entries() {
        let tracker =
            MembershipTracker::new(membership(1, &["A"]), Handle::current()).with_history_limit(2);
        tracker.on_view_change(membership(2, &["A", "B"]), Vec::new());
        tracker.suspect(&node("B"));
        tracker.on_view_change(membership(3, &["A"]), Vec::new());

        let history = tracker.history();
        assert_eq!(history.len(), 2);
        assert_eq!(
            history[0].event(),
            &HistoryEvent::Suspected { node: node("B") }
        );
        match history[1].event() {
            HistoryEvent::ViewInstalled {
                view_id, previous, ..
            } => {
                assert_eq!(*view_id, 3);
                assert_eq!(previous.len(), 2);
            }
            other => panic!("unexpected history event: {other:?}"),
        }
        assert!(history[1].to_string().ends_with("view 3 installed: [A] (was [A, B])"));

        let silent =
            MembershipTracker::new(membership(1, &["A"]), Handle::current()).with_history_limit(0);
        silent.on_view_change(membership(2, &["A", "B"]), Vec::new());
        assert!(silent.history().is_empty());
    }

    #[tokio::test]
    #[traced_test]
    async fn synchronous_listener_runs_before_the_change_returns() {
        let tracker = MembershipTracker::new(membership(1, &["A"]), Handle::current())
            .with_synchronous_notifications(true);
        let seen = Arc::new(AtomicU64::new(0));
        let observed = Arc::clone(&seen);
        let _sync = tracker.register_with(
            Arc::new(move |change: &MembershipChange| {
                observed.store(change.current().view_id(), Ordering::SeqCst);
            }),
            NotificationMode::Synchronous,
        );
        let _bad = tracker.register_with(Arc::new(Exploding), NotificationMode::Synchronous);

        tracker.on_view_change(membership(2, &["A", "B"]), Vec::new());
        assert_eq!(seen.load(Ordering::SeqCst), 2);
        assert!(logs_contain("membership listener failed"));
    }

    #[tokio::test]
    async fn synchronous_mode_falls_back_to_queue_when_disabled() {
        let tracker = MembershipTracker::new(membership(1, &["A"]), Handle::current());
        let (seen, mut received) = mpsc::unbounded_channel();
        let registration = tracker.register_with(
            Arc::new(move |change: &MembershipChange| {
                let _ = seen.send(change.current().view_id());
            }),
            NotificationMode::Synchronous,
        );
        tracker.on_view_change(membership(2, &["A", "B"]), Vec::new());
        registration.close().await;
        assert_eq!(received.recv().await, Some(2));
    }

    #[test]
    #[traced_test]
    fn suspicion_is_logged() {
        let runtime = tokio::runtime::Builder::new_current_thread()
            .build()
            .expect("runtime");
        let tracker = MembershipTracker::new(membership(1, &["A"]), runtime.handle().clone());
        tracker.suspect(&node("A"));
        assert!(logs_contain("member suspected by group channel"));
    }
}
