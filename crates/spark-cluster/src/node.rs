//! 集群节点值类型与地址缓存。

use std::cmp::Ordering;
use std::fmt;
use std::hash::{Hash, Hasher};
use std::sync::Arc;

use dashmap::DashMap;

use crate::transport::{GroupMember, GroupView, TransportAddress};

/// 集群中一个可寻址的成员。
///
/// 身份完全由传输地址决定：两个地址相同的 `Node` 相等，逻辑名只用于展示。
/// 实例不可变，克隆代价为两次引用计数递增。
#[derive(Clone)]
pub struct Node {
    name: Arc<str>,
    address: TransportAddress,
}

impl Node {
    pub fn new(name: impl Into<Arc<str>>, address: TransportAddress) -> Self {
        Self {
            name: name.into(),
            address,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn address(&self) -> &TransportAddress {
        &self.address
    }
}

impl PartialEq for Node {
    fn eq(&self, other: &Self) -> bool {
        self.address == other.address
    }
}

impl Eq for Node {}

impl Hash for Node {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.address.hash(state);
    }
}

impl PartialOrd for Node {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Node {
    fn cmp(&self, other: &Self) -> Ordering {
        self.address.cmp(&other.address)
    }
}

impl fmt::Display for Node {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.name)
    }
}

impl fmt::Debug for Node {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Node")
            .field("name", &self.name)
            .field("address", &self.address)
            .finish()
    }
}

/// 地址到 [`Node`] 的缓存。
///
/// # 契约说明（What）
/// - 首次观察到某地址时惰性创建节点，此后返回同一实例的克隆；
/// - 节点离开所有已观察视图后由 [`Self::retain`] 移出缓存；
/// - 并发安全，读取不阻塞其他分片的写入。
#[derive(Debug, Default)]
pub struct NodeRegistry {
    nodes: DashMap<TransportAddress, Node>,
}

impl NodeRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// 解析视图成员为节点，必要时创建。
    pub fn resolve(&self, member: &GroupMember) -> Node {
        self.nodes
            .entry(member.address().clone())
            .or_insert_with(|| Node::new(member.name(), member.address().clone()))
            .value()
            .clone()
    }

    pub fn get(&self, address: &TransportAddress) -> Option<Node> {
        self.nodes.get(address).map(|entry| entry.value().clone())
    }

    /// 只保留 `view` 中仍存在的节点。
    pub fn retain(&self, view: &GroupView) {
        self.nodes.retain(|address, _| view.contains(address));
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }
}
