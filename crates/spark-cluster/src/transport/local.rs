//! 进程内组通信实现。
//!
//! [`LocalGroup`] 模拟一个共享环回的组：成员通过 [`LocalGroup::join`] 获得各自的
//! [`LocalChannel`]，请求直接在发送方任务上投递给目标接收者（相当于通道的 I/O 线程），
//! 应答经 [`Responder`] 异步返回。
//!
//! 除正常的加入/离开外，还支持两种故障注入：
//! - [`LocalGroup::suspect`]：成员仍在视图中，但对它的请求以 `Suspected` 失败；
//! - [`LocalGroup::merge`]：发布带有分区信息的合并视图。

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::{Mutex, RwLock};
use tracing::{debug, trace};

use super::{
    GroupChannel, GroupMember, GroupReceiver, GroupView, Responder, TransportAddress,
    TransportError,
};

/// 进程内组。克隆体共享同一组状态。
#[derive(Clone)]
pub struct LocalGroup {
    inner: Arc<GroupInner>,
}

struct GroupInner {
    cluster: Arc<str>,
    next_address: AtomicU64,
    state: Mutex<GroupState>,
}

#[derive(Default)]
struct GroupState {
    view_id: u64,
    members: Vec<Arc<MemberSlot>>,
}

struct MemberSlot {
    member: GroupMember,
    receiver: RwLock<Option<Arc<dyn GroupReceiver>>>,
    suspected: AtomicBool,
}

impl MemberSlot {
    fn receiver(&self) -> Option<Arc<dyn GroupReceiver>> {
        self.receiver.read().clone()
    }
}

impl LocalGroup {
    pub fn new(cluster: impl Into<Arc<str>>) -> Self {
        Self {
            inner: Arc::new(GroupInner {
                cluster: cluster.into(),
                next_address: AtomicU64::new(1),
                state: Mutex::new(GroupState::default()),
            }),
        }
    }

    /// 以逻辑名 `name` 加入组，返回该成员的通道；所有成员随后收到新视图。
    pub fn join(&self, name: &str) -> Arc<LocalChannel> {
        let ordinal = self.inner.next_address.fetch_add(1, Ordering::Relaxed);
        let address = TransportAddress::new(format!("{}/{ordinal}", self.inner.cluster));
        let slot = Arc::new(MemberSlot {
            member: GroupMember::new(address, name),
            receiver: RwLock::new(None),
            suspected: AtomicBool::new(false),
        });
        self.inner.state.lock().members.push(Arc::clone(&slot));
        debug!(cluster = %self.inner.cluster, member = name, "member joined local group");
        self.inner.publish(Vec::new());

        Arc::new(LocalChannel {
            group: Arc::clone(&self.inner),
            slot,
            requests_sent: AtomicU64::new(0),
            closed: AtomicBool::new(false),
        })
    }

    /// 将成员移出视图并通知剩余成员。
    pub fn leave(&self, address: &TransportAddress) {
        self.inner.leave(address);
    }

    /// 标记成员失效：它仍在视图中，但请求会以 `Suspected` 失败，其余成员收到怀疑通知。
    pub fn suspect(&self, address: &TransportAddress) {
        let (target, observers) = {
            let state = self.inner.state.lock();
            let target = state
                .members
                .iter()
                .find(|slot| slot.member.address() == address)
                .cloned();
            let observers: Vec<_> = state
                .members
                .iter()
                .filter(|slot| slot.member.address() != address)
                .filter_map(|slot| slot.receiver())
                .collect();
            (target, observers)
        };
        if let Some(target) = target {
            target.suspected.store(true, Ordering::Release);
            for receiver in observers {
                receiver.suspect(address);
            }
        }
    }

    /// 发布合并视图：成员不变，`partitions` 描述合并前的各个分区。
    pub fn merge(&self, partitions: Vec<Vec<TransportAddress>>) {
        let subgroups = {
            let state = self.inner.state.lock();
            partitions
                .iter()
                .map(|partition| {
                    state
                        .members
                        .iter()
                        .filter(|slot| partition.contains(slot.member.address()))
                        .map(|slot| slot.member.clone())
                        .collect()
                })
                .collect()
        };
        self.inner.publish(subgroups);
    }

    pub fn view(&self) -> GroupView {
        self.inner.view()
    }
}

impl GroupInner {
    fn view(&self) -> GroupView {
        let state = self.state.lock();
        GroupView::new(
            state.view_id,
            state.members.iter().map(|slot| slot.member.clone()).collect(),
        )
    }

    fn leave(&self, address: &TransportAddress) {
        let removed = {
            let mut state = self.state.lock();
            let before = state.members.len();
            state.members.retain(|slot| slot.member.address() != address);
            before != state.members.len()
        };
        if removed {
            debug!(cluster = %self.cluster, %address, "member left local group");
            self.publish(Vec::new());
        }
    }

    fn find(&self, address: &TransportAddress) -> Option<Arc<MemberSlot>> {
        self.state
            .lock()
            .members
            .iter()
            .find(|slot| slot.member.address() == address)
            .cloned()
    }

    fn publish(&self, subgroups: Vec<Vec<GroupMember>>) {
        // 回调在锁外执行，接收者可在回调中读取视图。
        let (view, receivers) = {
            let mut state = self.state.lock();
            state.view_id += 1;
            let members = state.members.iter().map(|slot| slot.member.clone()).collect();
            let view = GroupView::merged(state.view_id, members, subgroups);
            let receivers: Vec<_> = state.members.iter().filter_map(|slot| slot.receiver()).collect();
            (view, receivers)
        };
        for receiver in receivers {
            receiver.view_accepted(view.clone());
        }
    }
}

/// [`LocalGroup`] 中单个成员的通道。
pub struct LocalChannel {
    group: Arc<GroupInner>,
    slot: Arc<MemberSlot>,
    requests_sent: AtomicU64,
    closed: AtomicBool,
}

impl LocalChannel {
    /// 本通道发出的请求数（单播与组播中的每个目标各计一次）。
    pub fn requests_sent(&self) -> u64 {
        self.requests_sent.load(Ordering::Relaxed)
    }

    pub fn name(&self) -> &str {
        self.slot.member.name()
    }
}

#[async_trait]
impl GroupChannel for LocalChannel {
    fn cluster_name(&self) -> &str {
        &self.group.cluster
    }

    fn local_address(&self) -> &TransportAddress {
        self.slot.member.address()
    }

    fn current_view(&self) -> GroupView {
        self.group.view()
    }

    fn set_receiver(&self, receiver: Option<Arc<dyn GroupReceiver>>) {
        *self.slot.receiver.write() = receiver;
    }

    async fn send_request(
        &self,
        target: &TransportAddress,
        request: Bytes,
        timeout: Duration,
    ) -> Result<Bytes, TransportError> {
        if self.closed.load(Ordering::Acquire) {
            return Err(TransportError::Closed);
        }
        self.requests_sent.fetch_add(1, Ordering::Relaxed);

        let slot = self
            .group
            .find(target)
            .ok_or_else(|| TransportError::Suspected {
                target: target.clone(),
            })?;
        if slot.suspected.load(Ordering::Acquire) {
            return Err(TransportError::Suspected {
                target: target.clone(),
            });
        }
        let receiver = slot.receiver().ok_or_else(|| TransportError::Unreachable {
            target: target.clone(),
        })?;

        let (responder, response) = Responder::channel();
        trace!(source = %self.local_address(), %target, bytes = request.len(), "delivering request");
        receiver.handle_request(self.local_address(), request, responder);

        match tokio::time::timeout(timeout, response).await {
            Ok(Ok(bytes)) => Ok(bytes),
            Ok(Err(_)) => Err(TransportError::NoResponse {
                target: target.clone(),
            }),
            Err(_) => Err(TransportError::Timeout {
                target: target.clone(),
                timeout,
            }),
        }
    }

    async fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        self.set_receiver(None);
        self.group.leave(self.local_address());
    }
}
