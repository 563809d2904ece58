//! 引用计数的分发器共享。
//!
//! 多个彼此独立的所有者可以对同一标识调用 `create_dispatcher`，只要它们提供的是同一个上下文对象，
//! 就共享同一个真实分发器；最后一个所有者关闭时真实分发器才被关闭。
//!
//! # 锁顺序
//! 结构性变更（插入、移除）持有注册表锁，计数变更持有条目锁；两者同时需要时总是先注册表后条目。
//! 内部工厂的 `create_dispatcher` 与真实分发器的 `deregister` 都在注册表锁内调用，二者不得回调本包装。

use std::any::Any;
use std::collections::HashMap;
use std::marker::PhantomData;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};

use async_trait::async_trait;
use parking_lot::Mutex;
use tracing::{debug, warn};

use super::{
    ClusterResponses, CommandDispatcher, CommandFuture, DispatcherFactory, DispatcherId,
    DispatcherOptions,
};
use crate::command::Command;
use crate::error::DispatchError;
use crate::membership::Membership;
use crate::node::Node;

#[derive(Default)]
struct ManagedRegistry {
    entries: Mutex<HashMap<DispatcherId, Arc<dyn Any + Send + Sync>>>,
}

struct SharedEntry<D> {
    id: DispatcherId,
    dispatcher: D,
    references: Mutex<usize>,
}

/// 为任意 [`DispatcherFactory`] 增加按标识共享的能力。
///
/// # 教案式说明
/// - **契约 (What)**：
///   - 标识首次出现时委托内部工厂创建，计数为 1；
///   - 再次出现时要求上下文是同一个 `Arc`（指针相等）且命令类型一致，否则返回
///     [`DispatchError::ContextMismatch`]，既有条目不受影响；
///   - 后续所有者传入的 [`DispatcherOptions`] 被忽略，以首个所有者为准；
///   - 计数归零时在注册表锁内移除条目并同步注销真实分发器，随后关闭它，恰好一次；
///     因此平衡的创建/关闭之后立即以同一标识重新创建总能成功。
pub struct ManagedDispatcherFactory<F> {
    factory: F,
    registry: Arc<ManagedRegistry>,
}

impl<F: DispatcherFactory> ManagedDispatcherFactory<F> {
    pub fn new(factory: F) -> Self {
        Self {
            factory,
            registry: Arc::new(ManagedRegistry::default()),
        }
    }

    pub fn inner(&self) -> &F {
        &self.factory
    }

    /// 当前被共享的标识数量。
    pub fn shared_count(&self) -> usize {
        self.registry.entries.lock().len()
    }
}

impl<F: DispatcherFactory> DispatcherFactory for ManagedDispatcherFactory<F> {
    type Dispatcher<K: Command> = ManagedDispatcher<K, F::Dispatcher<K>>;

    fn create_dispatcher<K: Command>(
        &self,
        id: DispatcherId,
        context: Arc<K::Context>,
        options: DispatcherOptions,
    ) -> Result<Self::Dispatcher<K>, DispatchError> {
        let mut entries = self.registry.entries.lock();
        if let Some(existing) = entries.get(&id) {
            let entry = Arc::clone(existing)
                .downcast::<SharedEntry<F::Dispatcher<K>>>()
                .map_err(|_| {
                    warn!(dispatcher = %id, "shared dispatcher requested with a different command type");
                    DispatchError::ContextMismatch { id: id.clone() }
                })?;
            if !Arc::ptr_eq(entry.dispatcher.context(), &context) {
                warn!(dispatcher = %id, "shared dispatcher requested with a different context");
                return Err(DispatchError::ContextMismatch { id });
            }
            let references = {
                let mut references = entry.references.lock();
                *references += 1;
                *references
            };
            debug!(dispatcher = %id, references, "shared dispatcher acquired");
            return Ok(ManagedDispatcher::new(entry, Arc::downgrade(&self.registry)));
        }

        let dispatcher = self
            .factory
            .create_dispatcher::<K>(id.clone(), context, options)?;
        let entry = Arc::new(SharedEntry {
            id: id.clone(),
            dispatcher,
            references: Mutex::new(1),
        });
        entries.insert(id, Arc::clone(&entry) as Arc<dyn Any + Send + Sync>);
        Ok(ManagedDispatcher::new(entry, Arc::downgrade(&self.registry)))
    }

    fn membership(&self) -> Arc<Membership> {
        self.factory.membership()
    }
}

/// 共享分发器的一个所有者句柄。
///
/// 每个句柄恰好贡献一次计数：[`CommandDispatcher::close`] 或丢弃时释放，重复关闭无副作用。
/// 释放后的句柄对所有操作返回 [`DispatchError::Closed`]。
pub struct ManagedDispatcher<K: Command, D: CommandDispatcher<K> + 'static> {
    entry: Arc<SharedEntry<D>>,
    registry: Weak<ManagedRegistry>,
    released: AtomicBool,
    _command: PhantomData<fn() -> K>,
}

impl<K: Command, D: CommandDispatcher<K> + 'static> ManagedDispatcher<K, D> {
    fn new(entry: Arc<SharedEntry<D>>, registry: Weak<ManagedRegistry>) -> Self {
        Self {
            entry,
            registry,
            released: AtomicBool::new(false),
            _command: PhantomData,
        }
    }

    /// 两个句柄是否共享同一个真实分发器。
    pub fn shares_instance_with(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.entry, &other.entry)
    }

    /// 当前所有者数量。
    pub fn reference_count(&self) -> usize {
        *self.entry.references.lock()
    }

    pub fn is_released(&self) -> bool {
        self.released.load(Ordering::Acquire)
    }

    /// 释放本句柄的计数；返回 `true` 表示本次释放使计数归零。
    ///
    /// 归零时条目移除与真实分发器的同步注销在同一把注册表锁内完成，调用方只负责异步关闭。
    fn relinquish(&self) -> bool {
        if self.released.swap(true, Ordering::AcqRel) {
            return false;
        }
        let decrement = || {
            let mut references = self.entry.references.lock();
            *references = references.saturating_sub(1);
            *references
        };
        let remaining = match self.registry.upgrade() {
            Some(registry) => {
                let mut entries = registry.entries.lock();
                let remaining = decrement();
                if remaining == 0 {
                    entries.remove(&self.entry.id);
                    self.entry.dispatcher.deregister();
                }
                remaining
            }
            None => {
                let remaining = decrement();
                if remaining == 0 {
                    self.entry.dispatcher.deregister();
                }
                remaining
            }
        };
        debug!(dispatcher = %self.entry.id, references = remaining, "shared dispatcher released");
        remaining == 0
    }

    fn ensure_held(&self) -> Result<(), DispatchError> {
        if self.is_released() {
            return Err(DispatchError::Closed);
        }
        Ok(())
    }
}

#[async_trait]
impl<K: Command, D: CommandDispatcher<K> + 'static> CommandDispatcher<K> for ManagedDispatcher<K, D> {
    fn id(&self) -> &DispatcherId {
        self.entry.dispatcher.id()
    }

    fn context(&self) -> &Arc<K::Context> {
        self.entry.dispatcher.context()
    }

    fn membership(&self) -> Arc<Membership> {
        self.entry.dispatcher.membership()
    }

    async fn execute_on_node(&self, command: K, node: &Node) -> Result<K::Output, DispatchError> {
        self.ensure_held()?;
        self.entry.dispatcher.execute_on_node(command, node).await
    }

    fn submit_on_node(&self, command: K, node: &Node) -> CommandFuture<K::Output> {
        match self.ensure_held() {
            Ok(()) => self.entry.dispatcher.submit_on_node(command, node),
            Err(err) => CommandFuture::ready(Err(err)),
        }
    }

    async fn execute_on_cluster(
        &self,
        command: K,
        excluded: &[Node],
    ) -> Result<ClusterResponses<K::Output>, DispatchError> {
        self.ensure_held()?;
        self.entry.dispatcher.execute_on_cluster(command, excluded).await
    }

    fn submit_on_cluster(
        &self,
        command: K,
        excluded: &[Node],
    ) -> HashMap<Node, CommandFuture<K::Output>> {
        if self.is_released() {
            return HashMap::new();
        }
        self.entry.dispatcher.submit_on_cluster(command, excluded)
    }

    fn deregister(&self) {
        if self.relinquish() {
            self.close_detached();
        }
    }

    async fn close(&self) {
        if self.relinquish() {
            self.entry.dispatcher.close().await;
            debug!(dispatcher = %self.entry.id, "shared dispatcher closed");
        }
    }
}

impl<K: Command, D: CommandDispatcher<K> + 'static> Drop for ManagedDispatcher<K, D> {
    fn drop(&mut self) {
        if self.relinquish() {
            self.close_detached();
        }
    }
}

impl<K: Command, D: CommandDispatcher<K> + 'static> ManagedDispatcher<K, D> {
    /// 在当前运行时上异步关闭真实分发器；同步注销已在 `relinquish` 中完成。
    fn close_detached(&self) {
        match tokio::runtime::Handle::try_current() {
            Ok(runtime) => {
                let entry = Arc::clone(&self.entry);
                runtime.spawn(async move { entry.dispatcher.close().await });
            }
            Err(_) => warn!(
                dispatcher = %self.entry.id,
                "last shared handle released outside a runtime; dispatcher deregistered without close"
            ),
        }
    }
}
