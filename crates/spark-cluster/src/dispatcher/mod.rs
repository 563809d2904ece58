//! # dispatcher：命令分发门面与工厂契约
//!
//! ## 角色定位（Why）
//! - 多个互不相关的消费者共享同一条组通信通道，各自以 [`DispatcherId`] 区分；
//! - 消费者只面对 [`CommandDispatcher`]：在单个节点、协调者或整个集群上同步/异步执行命令。
//!
//! ## 模块结构（How）
//! - [`channel`]：基于 [`GroupChannel`](crate::transport::GroupChannel) 的默认实现，负责入站解复用；
//! - [`managed`]：引用计数包装，允许多个所有者共享同一标识的分发器实例；
//! - [`CommandFuture`]：`submit_*` 返回的可取消句柄。

pub mod channel;
mod future;
pub mod managed;

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;

use crate::command::{Command, CommandResponse};
use crate::error::DispatchError;
use crate::membership::Membership;
use crate::node::Node;
use crate::tracker::{MembershipListener, NotificationMode};

pub use channel::{ChannelDispatcher, ChannelDispatcherFactory};
pub use future::CommandFuture;
pub use managed::{ManagedDispatcher, ManagedDispatcherFactory};

/// 集群执行结果：每个应答节点对应一个执行结果。
pub type ClusterResponses<T> = HashMap<Node, CommandResponse<T>>;

/// 分发器标识，在同一工厂内唯一。
#[derive(Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct DispatcherId(Arc<str>);

impl DispatcherId {
    pub fn new(id: impl Into<Arc<str>>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for DispatcherId {
    fn from(id: &str) -> Self {
        Self::new(id)
    }
}

impl From<String> for DispatcherId {
    fn from(id: String) -> Self {
        Self::new(id)
    }
}

impl fmt::Display for DispatcherId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl fmt::Debug for DispatcherId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "DispatcherId({})", self.0)
    }
}

/// 创建分发器时的可选项。
#[derive(Clone, Default)]
pub struct DispatcherOptions {
    listener: Option<Arc<dyn MembershipListener>>,
    mode: NotificationMode,
}

impl DispatcherOptions {
    pub fn new() -> Self {
        Self::default()
    }

    /// 分发器存活期间接收视图变更通知。
    pub fn with_listener(mut self, listener: Arc<dyn MembershipListener>) -> Self {
        self.listener = Some(listener);
        self
    }

    /// 监听者的通知方式，默认异步。
    pub fn with_notification_mode(mut self, mode: NotificationMode) -> Self {
        self.mode = mode;
        self
    }

    pub(crate) fn into_listener(self) -> Option<(Arc<dyn MembershipListener>, NotificationMode)> {
        let mode = self.mode;
        self.listener.map(|listener| (listener, mode))
    }
}

impl fmt::Debug for DispatcherOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DispatcherOptions")
            .field("listener", &self.listener.is_some())
            .field("mode", &self.mode)
            .finish()
    }
}

/// 单个消费者的命令分发门面。
///
/// # 教案式说明
/// - **契约 (What)**：
///   - 目标为本地节点时直接在上下文上执行，不经过序列化与传输；
///   - 目标节点未注册该标识时，结果为 [`DispatchError::Cancelled`]，而不是普通错误；
///   - `execute_on_cluster` 的结果中不会出现被排除的节点，也不会出现被怀疑或未注册的节点；
///   - `submit_on_cluster` 只在发送前按排除列表过滤，视图抖动导致的失败体现在各自的 future 中；
/// - **风险提示 (Trade-offs)**：`execute_*` 在等待期间若所属工厂关闭，立即返回
///   [`DispatchError::Interrupted`]，远端可能仍在执行。
#[async_trait]
pub trait CommandDispatcher<K: Command>: Send + Sync {
    fn id(&self) -> &DispatcherId;

    fn context(&self) -> &Arc<K::Context>;

    /// 当前视图快照。
    fn membership(&self) -> Arc<Membership>;

    /// 在指定节点上执行并等待结果。
    async fn execute_on_node(&self, command: K, node: &Node) -> Result<K::Output, DispatchError>;

    /// 在指定节点上异步执行。
    fn submit_on_node(&self, command: K, node: &Node) -> CommandFuture<K::Output>;

    /// 在集群（除 `excluded` 外的全部成员）上执行并收集结果。
    async fn execute_on_cluster(
        &self,
        command: K,
        excluded: &[Node],
    ) -> Result<ClusterResponses<K::Output>, DispatchError>;

    /// 为每个未被排除的成员提交一次异步执行。
    fn submit_on_cluster(
        &self,
        command: K,
        excluded: &[Node],
    ) -> HashMap<Node, CommandFuture<K::Output>>;

    /// 在当前协调者上执行；视图为空时返回 [`DispatchError::NoCoordinator`]。
    async fn execute_on_coordinator(&self, command: K) -> Result<K::Output, DispatchError> {
        let membership = self.membership();
        let coordinator = membership
            .coordinator()
            .cloned()
            .ok_or(DispatchError::NoCoordinator)?;
        self.execute_on_node(command, &coordinator).await
    }

    /// 在当前协调者上异步执行；视图为空时句柄直接产出 [`DispatchError::NoCoordinator`]。
    fn submit_on_coordinator(&self, command: K) -> CommandFuture<K::Output> {
        let membership = self.membership();
        match membership.coordinator() {
            Some(coordinator) => self.submit_on_node(command, coordinator),
            None => CommandFuture::ready(Err(DispatchError::NoCoordinator)),
        }
    }

    /// 同步注销标识：返回后本节点对该标识的入站请求应答 not-found，异步收尾留给 [`Self::close`]。
    ///
    /// 重复调用无副作用。
    fn deregister(&self);

    /// 关闭分发器；重复调用无副作用。
    async fn close(&self);
}

/// 分发器工厂。
pub trait DispatcherFactory: Send + Sync {
    type Dispatcher<K: Command>: CommandDispatcher<K> + 'static;

    /// 以 `id` 注册上下文并返回绑定的分发器。
    fn create_dispatcher<K: Command>(
        &self,
        id: DispatcherId,
        context: Arc<K::Context>,
        options: DispatcherOptions,
    ) -> Result<Self::Dispatcher<K>, DispatchError>;

    fn membership(&self) -> Arc<Membership>;
}
