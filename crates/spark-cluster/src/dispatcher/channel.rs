//! 基于组通信通道的分发器工厂。
//!
//! # 教案式说明
//! - **入站流水线 (How)**，运行在通道的投递线程上，全程不阻塞：
//!   1. 解码信封；格式错误以 `spark.cluster.codec` 错误应答；
//!   2. 按标识查找注册的上下文（克隆后立即释放分片锁）；未找到则应答 not-found 哨兵；
//!   3. 把执行交给 [`WorkerPool`]；被拒绝同样应答 not-found 哨兵；
//!   4. 工作线程在 `dispatch` span 内解码命令、执行并写回响应。
//! - **出站 (How)**：本地目标在阻塞线程池上直接执行，不经序列化与传输；远端目标编码一次后单播或组播，等待期间监听工厂关闭信号。
//! - **生命周期 (What)**：[`ChannelDispatcherFactory::close`] 停止接收、中断所有等待、在超时内排空
//!   线程池、清空注册表并关闭通道；重复调用无副作用。

use std::collections::HashMap;
use std::future::Future;
use std::marker::PhantomData;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};

use async_trait::async_trait;
use bytes::Bytes;
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use tokio::runtime::Handle;
use tokio::sync::watch;
use tracing::{debug, info, info_span, trace, warn};

use super::{ClusterResponses, CommandDispatcher, CommandFuture, DispatcherFactory, DispatcherId, DispatcherOptions};
use crate::codec::{
    MarshallingVersion, RequestEnvelope, ResponseFrame, decode_request, decode_response,
    encode_failure, encode_not_found, encode_request, encode_response,
};
use crate::command::{Command, CommandError, run_command};
use crate::config::DispatcherConfig;
use crate::error::DispatchError;
use crate::membership::Membership;
use crate::node::{Node, NodeRegistry};
use crate::pool::WorkerPool;
use crate::tracker::{ListenerRegistration, MembershipTracker};
use crate::transport::{
    GroupChannel, GroupReceiver, GroupView, MemberReply, Responder, TransportAddress,
    TransportError,
};

/// 注册表中的类型擦除条目：持有上下文，知道如何解码并执行自己的命令类型。
trait InboundDispatch: Send + Sync {
    fn dispatch(&self, envelope: &RequestEnvelope) -> Bytes;
}

struct RegisteredContext<K: Command> {
    context: Arc<K::Context>,
    _listener: Option<ListenerRegistration>,
}

impl<K: Command> InboundDispatch for RegisteredContext<K> {
    fn dispatch(&self, envelope: &RequestEnvelope) -> Bytes {
        let format = envelope.version().format();
        let response = match envelope.decode_command::<K>() {
            Ok(command) => run_command(&command, &self.context),
            Err(err) => Err(CommandError::codec(err.to_string())),
        };
        encode_response(format, &response)
            .or_else(|err| encode_failure(format, &CommandError::codec(err.to_string())))
            .unwrap_or_else(|_| encode_not_found())
    }
}

fn same_registration(a: &Arc<dyn InboundDispatch>, b: &Arc<dyn InboundDispatch>) -> bool {
    std::ptr::addr_eq(Arc::as_ptr(a), Arc::as_ptr(b))
}

struct FactoryInner {
    channel: Arc<dyn GroupChannel>,
    config: DispatcherConfig,
    version: MarshallingVersion,
    registry: DashMap<DispatcherId, Arc<dyn InboundDispatch>>,
    nodes: NodeRegistry,
    tracker: MembershipTracker,
    pool: WorkerPool,
    runtime: Handle,
    shutdown: watch::Sender<bool>,
    closed: AtomicBool,
    local: Node,
}

impl FactoryInner {
    fn handle_request(&self, source: &TransportAddress, request: Bytes, responder: Responder) {
        let envelope = match decode_request(request) {
            Ok(envelope) => envelope,
            Err(err) => {
                warn!(%source, error = %err, "malformed dispatch request");
                let reply = encode_failure(
                    MarshallingVersion::CURRENT.format(),
                    &CommandError::codec(err.to_string()),
                )
                .unwrap_or_else(|_| encode_not_found());
                responder.respond(reply);
                return;
            }
        };

        let id = envelope.id().clone();
        let Some(target) = self.registry.get(&id).map(|entry| Arc::clone(entry.value())) else {
            debug!(dispatcher = %id, %source, "no dispatcher registered, answering not-found");
            responder.respond(encode_not_found());
            return;
        };

        let span = info_span!("dispatch", dispatcher = %id, %source);
        let job_responder = responder.clone();
        let submitted = self.pool.try_execute(move || {
            let _entered = span.enter();
            let reply = target.dispatch(&envelope);
            if !job_responder.respond(reply) {
                trace!("requester no longer waiting for response");
            }
        });
        if let Err(rejection) = submitted {
            warn!(dispatcher = %id, %source, reason = %rejection, "dispatch request rejected");
            responder.respond(encode_not_found());
        }
    }

    fn accept_view(&self, view: GroupView) {
        let membership = Membership::from_view(&view, &self.local, &self.nodes);
        let partitions = view
            .subgroups()
            .iter()
            .map(|group| group.iter().map(|member| self.nodes.resolve(member)).collect())
            .collect();
        self.tracker.on_view_change(membership, partitions);
        self.nodes.retain(&view);
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// 等待 `future`，工厂关闭时提前返回 [`DispatchError::Interrupted`]。
    async fn interruptible<F: Future>(&self, future: F) -> Result<F::Output, DispatchError> {
        let shutdown = self.shutdown.subscribe();
        tokio::select! {
            biased;
            () = shutdown_signalled(shutdown) => Err(DispatchError::Interrupted),
            output = future => Ok(output),
        }
    }
}

async fn shutdown_signalled(mut shutdown: watch::Receiver<bool>) {
    loop {
        if *shutdown.borrow_and_update() {
            return;
        }
        if shutdown.changed().await.is_err() {
            std::future::pending::<()>().await;
        }
    }
}

/// 通道回调入口；弱引用工厂，工厂释放后对所有请求应答 not-found。
struct InboundReceiver {
    inner: Weak<FactoryInner>,
}

impl GroupReceiver for InboundReceiver {
    fn handle_request(&self, source: &TransportAddress, request: Bytes, responder: Responder) {
        match self.inner.upgrade() {
            Some(inner) => inner.handle_request(source, request, responder),
            None => {
                responder.respond(encode_not_found());
            }
        }
    }

    fn view_accepted(&self, view: GroupView) {
        if let Some(inner) = self.inner.upgrade() {
            inner.accept_view(view);
        }
    }

    fn suspect(&self, address: &TransportAddress) {
        let Some(inner) = self.inner.upgrade() else {
            return;
        };
        match inner.nodes.get(address) {
            Some(node) => inner.tracker.suspect(&node),
            None => debug!(%address, "suspicion for unknown member ignored"),
        }
    }
}

/// 共享一条组通信通道的分发器工厂。
///
/// 克隆体共享同一个工厂实例。
#[derive(Clone)]
pub struct ChannelDispatcherFactory {
    inner: Arc<FactoryInner>,
}

impl ChannelDispatcherFactory {
    /// 在通道上安装入站接收者并构造工厂。
    ///
    /// 必须在 Tokio 运行时内调用；配置非法或编组版本未知时返回错误，通道保持原样。
    pub fn new(
        channel: Arc<dyn GroupChannel>,
        config: DispatcherConfig,
    ) -> Result<Self, DispatchError> {
        let runtime = Handle::try_current().map_err(|_| DispatchError::Runtime)?;
        config.validate()?;
        let version = MarshallingVersion::from_u8(config.marshalling_version())?;

        let view = channel.current_view();
        let nodes = NodeRegistry::new();
        let local_address = channel.local_address().clone();
        let local = view
            .members()
            .iter()
            .find(|member| member.address() == &local_address)
            .map(|member| nodes.resolve(member))
            .unwrap_or_else(|| Node::new(local_address.as_str(), local_address.clone()));
        let membership = Membership::from_view(&view, &local, &nodes);

        let tracker = MembershipTracker::new(membership, runtime.clone())
            .with_history_limit(config.view_history_length())
            .with_synchronous_notifications(config.synchronous_notifications());
        let pool = WorkerPool::new(
            format!("{}-dispatch", channel.cluster_name()),
            config.max_threads(),
            config.queue_capacity(),
            runtime.clone(),
        );
        let (shutdown, _) = watch::channel(false);

        let inner = Arc::new(FactoryInner {
            channel: Arc::clone(&channel),
            config,
            version,
            registry: DashMap::new(),
            nodes,
            tracker,
            pool,
            runtime,
            shutdown,
            closed: AtomicBool::new(false),
            local,
        });
        channel.set_receiver(Some(Arc::new(InboundReceiver {
            inner: Arc::downgrade(&inner),
        })));

        // 构造期间发布的视图不会经过接收者，这里补一次。
        let latest = channel.current_view();
        if latest.id() != view.id() {
            inner.accept_view(latest);
        }

        info!(
            cluster = channel.cluster_name(),
            local = %inner.local,
            version = version.as_u8(),
            "dispatcher factory started"
        );
        Ok(Self { inner })
    }

    pub fn local_node(&self) -> &Node {
        &self.inner.local
    }

    pub fn config(&self) -> &DispatcherConfig {
        &self.inner.config
    }

    /// 当前注册的分发器数量。
    pub fn registered(&self) -> usize {
        self.inner.registry.len()
    }

    pub fn tracker(&self) -> &MembershipTracker {
        &self.inner.tracker
    }

    pub fn is_closed(&self) -> bool {
        self.inner.is_closed()
    }

    /// 关闭工厂。
    pub async fn close(&self) {
        let inner = &self.inner;
        if inner.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        inner.shutdown.send_replace(true);
        let outcome = inner.pool.shutdown(inner.config.shutdown_timeout()).await;
        let released = inner.registry.len();
        inner.registry.clear();
        inner.channel.set_receiver(None);
        inner.channel.close().await;
        info!(
            cluster = inner.channel.cluster_name(),
            dispatchers = released,
            ?outcome,
            "dispatcher factory closed"
        );
    }
}

impl DispatcherFactory for ChannelDispatcherFactory {
    type Dispatcher<K: Command> = ChannelDispatcher<K>;

    fn create_dispatcher<K: Command>(
        &self,
        id: DispatcherId,
        context: Arc<K::Context>,
        options: DispatcherOptions,
    ) -> Result<ChannelDispatcher<K>, DispatchError> {
        let inner = &self.inner;
        if inner.is_closed() {
            return Err(DispatchError::Closed);
        }
        let registration = match inner.registry.entry(id.clone()) {
            Entry::Occupied(_) => {
                warn!(dispatcher = %id, "dispatcher identifier already registered");
                return Err(DispatchError::DuplicateIdentifier { id });
            }
            Entry::Vacant(slot) => {
                let listener = options
                    .into_listener()
                    .map(|(listener, mode)| inner.tracker.register_with(listener, mode));
                let registration: Arc<dyn InboundDispatch> = Arc::new(RegisteredContext::<K> {
                    context: Arc::clone(&context),
                    _listener: listener,
                });
                slot.insert(Arc::clone(&registration));
                registration
            }
        };
        debug!(dispatcher = %id, "dispatcher registered");

        Ok(ChannelDispatcher {
            shared: Arc::new(DispatcherShared {
                id,
                context,
                registration,
                factory: Arc::clone(inner),
                closed: AtomicBool::new(false),
                _command: PhantomData,
            }),
        })
    }

    fn membership(&self) -> Arc<Membership> {
        self.inner.tracker.current()
    }
}

struct DispatcherShared<K: Command> {
    id: DispatcherId,
    context: Arc<K::Context>,
    registration: Arc<dyn InboundDispatch>,
    factory: Arc<FactoryInner>,
    closed: AtomicBool,
    _command: PhantomData<fn() -> K>,
}

impl<K: Command> DispatcherShared<K> {
    fn ensure_open(&self) -> Result<(), DispatchError> {
        if self.closed.load(Ordering::Acquire) || self.factory.is_closed() {
            return Err(DispatchError::Closed);
        }
        Ok(())
    }

    fn release(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        let removed = self
            .factory
            .registry
            .remove_if(&self.id, |_, current| same_registration(current, &self.registration))
            .is_some();
        if removed {
            debug!(dispatcher = %self.id, "dispatcher deregistered");
        }
    }

    async fn execute_on_node(&self, command: K, node: Node) -> Result<K::Output, DispatchError> {
        self.ensure_open()?;
        let factory = &self.factory;
        if node == factory.local {
            let context = Arc::clone(&self.context);
            return CommandFuture::running(factory.runtime.spawn_blocking(move || {
                run_command(&command, &context).map_err(DispatchError::from)
            }))
            .await;
        }

        let request = encode_request(factory.version, &self.id, &command)?;
        let reply = factory
            .interruptible(factory.channel.send_request(
                node.address(),
                request,
                factory.config.response_timeout(),
            ))
            .await??;
        match decode_response::<K::Output>(factory.version.format(), reply)? {
            ResponseFrame::Response(Ok(output)) => Ok(output),
            ResponseFrame::Response(Err(error)) => Err(DispatchError::Execution(error)),
            ResponseFrame::NotFound => Err(DispatchError::target_not_found(&node, &self.id)),
        }
    }
}

/// [`ChannelDispatcherFactory`] 创建的分发器。丢弃即注销。
pub struct ChannelDispatcher<K: Command> {
    shared: Arc<DispatcherShared<K>>,
}

impl<K: Command> ChannelDispatcher<K> {
    pub fn local_node(&self) -> &Node {
        &self.shared.factory.local
    }

    pub fn is_closed(&self) -> bool {
        self.shared.closed.load(Ordering::Acquire)
    }
}

#[async_trait]
impl<K: Command> CommandDispatcher<K> for ChannelDispatcher<K> {
    fn id(&self) -> &DispatcherId {
        &self.shared.id
    }

    fn context(&self) -> &Arc<K::Context> {
        &self.shared.context
    }

    fn membership(&self) -> Arc<Membership> {
        self.shared.factory.tracker.current()
    }

    async fn execute_on_node(&self, command: K, node: &Node) -> Result<K::Output, DispatchError> {
        self.shared.execute_on_node(command, node.clone()).await
    }

    fn submit_on_node(&self, command: K, node: &Node) -> CommandFuture<K::Output> {
        if let Err(err) = self.shared.ensure_open() {
            return CommandFuture::ready(Err(err));
        }
        let shared = Arc::clone(&self.shared);
        let runtime = &self.shared.factory.runtime;
        if *node == self.shared.factory.local {
            return CommandFuture::running(runtime.spawn_blocking(move || {
                run_command(&command, &shared.context).map_err(DispatchError::from)
            }));
        }
        let node = node.clone();
        CommandFuture::running(
            runtime.spawn(async move { shared.execute_on_node(command, node).await }),
        )
    }

    async fn execute_on_cluster(
        &self,
        command: K,
        excluded: &[Node],
    ) -> Result<ClusterResponses<K::Output>, DispatchError> {
        let shared = &self.shared;
        shared.ensure_open()?;
        let factory = &shared.factory;
        let membership = factory.tracker.current();
        let targets: Vec<&Node> = membership
            .members()
            .iter()
            .filter(|node| !excluded.contains(node))
            .collect();
        if targets.is_empty() {
            return Ok(HashMap::new());
        }

        let request = encode_request(factory.version, &shared.id, &command)?;
        let addresses: Vec<TransportAddress> =
            targets.iter().map(|node| node.address().clone()).collect();
        let replies = factory
            .interruptible(factory.channel.cast_request(
                &addresses,
                request,
                factory.config.response_timeout(),
            ))
            .await??;

        let format = factory.version.format();
        let mut responses = HashMap::with_capacity(replies.len());
        for (address, reply) in replies {
            let Some(node) = targets.iter().find(|node| node.address() == &address) else {
                continue;
            };
            let response = match reply {
                MemberReply::Received(frame) => match decode_response::<K::Output>(format, frame) {
                    Ok(ResponseFrame::Response(response)) => response,
                    Ok(ResponseFrame::NotFound) => {
                        trace!(dispatcher = %shared.id, node = %node, "member has no such dispatcher");
                        continue;
                    }
                    Err(err) => Err(CommandError::codec(err.to_string())),
                },
                MemberReply::Suspected
                | MemberReply::Failed(TransportError::Suspected { .. })
                | MemberReply::Failed(TransportError::Unreachable { .. }) => {
                    debug!(dispatcher = %shared.id, node = %node, "dropping response of unavailable member");
                    continue;
                }
                MemberReply::Failed(err) => Err(CommandError::transport(err.to_string())),
            };
            responses.insert((*node).clone(), response);
        }
        Ok(responses)
    }

    fn submit_on_cluster(
        &self,
        command: K,
        excluded: &[Node],
    ) -> HashMap<Node, CommandFuture<K::Output>> {
        let membership = self.shared.factory.tracker.current();
        membership
            .members()
            .iter()
            .filter(|node| !excluded.contains(node))
            .map(|node| (node.clone(), self.submit_on_node(command.clone(), node)))
            .collect()
    }

    fn deregister(&self) {
        self.shared.release();
    }

    async fn close(&self) {
        self.shared.release();
    }
}

impl<K: Command> Drop for ChannelDispatcher<K> {
    fn drop(&mut self) {
        self.shared.release();
    }
}

impl<K: Command> std::fmt::Debug for ChannelDispatcher<K> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChannelDispatcher")
            .field("id", &self.shared.id)
            .field("closed", &self.is_closed())
            .finish()
    }
}
