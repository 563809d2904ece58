//! # transport：组通信通道契约
//!
//! ## 角色定位（Why）
//! - 可靠组通信（有序投递、组播、视图变更通知、物理寻址）由外部协议栈提供，本模块只声明
//!   分发层依赖的最小契约；
//! - [`local`] 提供一个进程内实现，供测试与单进程部署使用。
//!
//! ## 契约要点（What）
//! - [`GroupChannel`]：单播/组播请求、当前视图、接收者注册与关闭；
//! - [`GroupReceiver`]：通道的入站回调。回调运行在通道的投递线程上，实现方**不得阻塞**；
//! - [`Responder`]：一次性应答句柄，可克隆，首个应答生效。

pub mod local;

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use futures::future::join_all;
use parking_lot::Mutex;
use thiserror::Error;
use tokio::sync::oneshot;

/// 不透明的传输层地址，节点身份由它派生。
#[derive(Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TransportAddress(Arc<str>);

impl TransportAddress {
    pub fn new(address: impl Into<Arc<str>>) -> Self {
        Self(address.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for TransportAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl fmt::Debug for TransportAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "TransportAddress({})", self.0)
    }
}

/// 视图中的一个成员：地址 + 逻辑名。
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct GroupMember {
    address: TransportAddress,
    name: Arc<str>,
}

impl GroupMember {
    pub fn new(address: TransportAddress, name: impl Into<Arc<str>>) -> Self {
        Self {
            address,
            name: name.into(),
        }
    }

    pub fn address(&self) -> &TransportAddress {
        &self.address
    }

    pub fn name(&self) -> &str {
        &self.name
    }
}

/// 通道上报的原始视图。
///
/// - `members` 有序，首个成员为协调者；
/// - `subgroups` 非空时表示这是一次合并视图，记录被调和的各个分区。
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct GroupView {
    id: u64,
    members: Vec<GroupMember>,
    subgroups: Vec<Vec<GroupMember>>,
}

impl GroupView {
    pub fn new(id: u64, members: Vec<GroupMember>) -> Self {
        Self {
            id,
            members,
            subgroups: Vec::new(),
        }
    }

    /// 构造合并视图。
    pub fn merged(id: u64, members: Vec<GroupMember>, subgroups: Vec<Vec<GroupMember>>) -> Self {
        Self {
            id,
            members,
            subgroups,
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn members(&self) -> &[GroupMember] {
        &self.members
    }

    pub fn subgroups(&self) -> &[Vec<GroupMember>] {
        &self.subgroups
    }

    pub fn is_merge(&self) -> bool {
        !self.subgroups.is_empty()
    }

    pub fn contains(&self, address: &TransportAddress) -> bool {
        self.members.iter().any(|member| member.address() == address)
    }
}

/// 传输层失败。
#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum TransportError {
    /// 在超时时间内未收到响应。
    #[error("no response from {target} within {timeout:?}")]
    Timeout {
        target: TransportAddress,
        timeout: Duration,
    },

    /// 目标被怀疑已失效或已不在视图中。
    #[error("member {target} is suspected")]
    Suspected { target: TransportAddress },

    /// 目标未注册请求处理者。
    #[error("member {target} does not accept requests")]
    Unreachable { target: TransportAddress },

    /// 目标丢弃了请求而未应答。
    #[error("member {target} dropped the request without responding")]
    NoResponse { target: TransportAddress },

    /// 本地通道已关闭。
    #[error("channel is closed")]
    Closed,
}

/// 组播时单个成员的应答结果。
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum MemberReply {
    Received(Bytes),
    /// 成员被怀疑失效，调用方应忽略该成员。
    Suspected,
    Failed(TransportError),
}

/// 一次性应答句柄。
///
/// 克隆体共享同一个槽位，首个 [`Self::respond`] 生效，其余调用返回 `false`。
/// 所有克隆体都被丢弃且未应答时，请求方观察到 [`TransportError::NoResponse`]。
#[derive(Clone, Debug)]
pub struct Responder {
    slot: Arc<Mutex<Option<oneshot::Sender<Bytes>>>>,
}

impl Responder {
    /// 创建应答句柄以及请求方持有的接收端。
    pub fn channel() -> (Self, oneshot::Receiver<Bytes>) {
        let (sender, receiver) = oneshot::channel();
        let responder = Self {
            slot: Arc::new(Mutex::new(Some(sender))),
        };
        (responder, receiver)
    }

    /// 写入应答；请求方已放弃等待或已有应答时返回 `false`。
    pub fn respond(&self, response: Bytes) -> bool {
        match self.slot.lock().take() {
            Some(sender) => sender.send(response).is_ok(),
            None => false,
        }
    }

    pub fn is_answered(&self) -> bool {
        self.slot.lock().is_none()
    }
}

/// 通道的入站回调。
///
/// 所有方法都在通道的投递线程上同步调用，必须快速返回。
pub trait GroupReceiver: Send + Sync + 'static {
    /// 处理一次请求；应答通过 `responder` 异步写回。
    fn handle_request(&self, source: &TransportAddress, request: Bytes, responder: Responder);

    /// 通道接受了新视图。
    fn view_accepted(&self, view: GroupView);

    /// 通道怀疑某成员已失效（视图尚未变更）。
    fn suspect(&self, _address: &TransportAddress) {}
}

/// 组通信通道。
#[async_trait]
pub trait GroupChannel: Send + Sync + 'static {
    fn cluster_name(&self) -> &str;

    fn local_address(&self) -> &TransportAddress;

    fn current_view(&self) -> GroupView;

    /// 安装（或以 `None` 卸载）入站接收者。
    fn set_receiver(&self, receiver: Option<Arc<dyn GroupReceiver>>);

    /// 单播请求并等待唯一应答。
    async fn send_request(
        &self,
        target: &TransportAddress,
        request: Bytes,
        timeout: Duration,
    ) -> Result<Bytes, TransportError>;

    /// 向多个成员发送同一请求，收集每个成员的应答。
    ///
    /// 默认实现并发地逐个单播；具备原生组播能力的通道应覆盖该方法。
    async fn cast_request(
        &self,
        targets: &[TransportAddress],
        request: Bytes,
        timeout: Duration,
    ) -> Result<Vec<(TransportAddress, MemberReply)>, TransportError> {
        let calls = targets.iter().map(|target| {
            let request = request.clone();
            async move {
                let reply = match self.send_request(target, request, timeout).await {
                    Ok(bytes) => MemberReply::Received(bytes),
                    Err(TransportError::Suspected { .. }) => MemberReply::Suspected,
                    Err(err) => MemberReply::Failed(err),
                };
                (target.clone(), reply)
            }
        });
        Ok(join_all(calls).await)
    }

    async fn close(&self);
}
