//! # membership：视图快照与差异
//!
//! [`Membership`] 是某一时刻的有序成员快照，每次视图变更整体替换；
//! [`MembershipChange`] 描述两份快照之间的差异（离开、加入、合并分区）。

use std::collections::HashSet;
use std::sync::Arc;

use crate::node::{Node, NodeRegistry};
use crate::transport::GroupView;

/// 不可变的成员视图。
///
/// # 契约说明（What）
/// - `members` 保持通道给出的顺序，首个成员为协调者；
/// - `local` 为本节点，即使视图暂未包含它（例如尚未完成加入）也可访问；
/// - 空视图没有协调者。
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Membership {
    view_id: u64,
    local: Node,
    members: Vec<Node>,
}

impl Membership {
    pub fn new(view_id: u64, local: Node, members: Vec<Node>) -> Self {
        Self {
            view_id,
            local,
            members,
        }
    }

    /// 由通道视图构造，成员经 `nodes` 解析以复用缓存的节点实例。
    pub fn from_view(view: &GroupView, local: &Node, nodes: &NodeRegistry) -> Self {
        let members = view
            .members()
            .iter()
            .map(|member| nodes.resolve(member))
            .collect();
        Self::new(view.id(), local.clone(), members)
    }

    pub fn view_id(&self) -> u64 {
        self.view_id
    }

    pub fn members(&self) -> &[Node] {
        &self.members
    }

    pub fn local_node(&self) -> &Node {
        &self.local
    }

    pub fn coordinator(&self) -> Option<&Node> {
        self.members.first()
    }

    pub fn is_coordinator(&self) -> bool {
        self.coordinator() == Some(&self.local)
    }

    pub fn contains(&self, node: &Node) -> bool {
        self.members.contains(node)
    }

    pub fn len(&self) -> usize {
        self.members.len()
    }

    pub fn is_empty(&self) -> bool {
        self.members.is_empty()
    }
}

/// 一次视图变更。
///
/// - `left = previous − current`，`joined = current − previous`，两者均保持各自视图中的顺序；
/// - `partitions` 非空表示这是一次网络合并，记录被调和的各个分区。
#[derive(Clone, Debug)]
pub struct MembershipChange {
    previous: Arc<Membership>,
    current: Arc<Membership>,
    left: Vec<Node>,
    joined: Vec<Node>,
    partitions: Vec<Vec<Node>>,
}

impl MembershipChange {
    /// 计算两份快照的差异。
    pub fn between(previous: Arc<Membership>, current: Arc<Membership>) -> Self {
        let before: HashSet<&Node> = previous.members().iter().collect();
        let after: HashSet<&Node> = current.members().iter().collect();
        let left = previous
            .members()
            .iter()
            .filter(|node| !after.contains(node))
            .cloned()
            .collect();
        let joined = current
            .members()
            .iter()
            .filter(|node| !before.contains(node))
            .cloned()
            .collect();
        Self {
            previous,
            current,
            left,
            joined,
            partitions: Vec::new(),
        }
    }

    pub fn with_partitions(mut self, partitions: Vec<Vec<Node>>) -> Self {
        self.partitions = partitions;
        self
    }

    pub fn previous(&self) -> &Arc<Membership> {
        &self.previous
    }

    pub fn current(&self) -> &Arc<Membership> {
        &self.current
    }

    pub fn left(&self) -> &[Node] {
        &self.left
    }

    pub fn joined(&self) -> &[Node] {
        &self.joined
    }

    pub fn partitions(&self) -> &[Vec<Node>] {
        &self.partitions
    }

    pub fn is_merge(&self) -> bool {
        !self.partitions.is_empty()
    }

    /// 成员集合是否发生变化。
    pub fn is_membership_changed(&self) -> bool {
        !self.left.is_empty() || !self.joined.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::TransportAddress;
    use proptest::prelude::*;

    fn node(name: &str) -> Node {
        Node::new(name, TransportAddress::new(format!("addr-{name}")))
    }

    fn view(id: u64, names: &[&str]) -> Arc<Membership> {
        Arc::new(Membership::new(
            id,
            node("local"),
            names.iter().map(|name| node(name)).collect(),
        ))
    }

    #[test]
    fn diff_reports_left_and_joined() {
        let change = MembershipChange::between(view(1, &["A", "B", "C"]), view(2, &["B", "C", "D"]));
        assert_eq!(change.left(), &[node("A")]);
        assert_eq!(change.joined(), &[node("D")]);
        assert!(!change.is_merge());
        assert!(change.is_membership_changed());
    }

    #[test]
    fn coordinator_is_first_member() {
        let membership = Membership::new(3, node("B"), vec![node("B"), node("A")]);
        assert_eq!(membership.coordinator(), Some(&node("B")));
        assert!(membership.is_coordinator());

        let empty = Membership::new(0, node("B"), Vec::new());
        assert!(empty.coordinator().is_none());
        assert!(!empty.is_coordinator());
    }

    proptest! {
        #[test]
        fn diff_matches_set_difference(
            old in proptest::collection::btree_set(0u8..16, 0..10),
            new in proptest::collection::btree_set(0u8..16, 0..10),
        ) {
            let names = |set: &std::collections::BTreeSet<u8>| -> Vec<String> {
                set.iter().map(|n| format!("n{n}")).collect()
            };
            let old_names = names(&old);
            let new_names = names(&new);
            let old_refs: Vec<&str> = old_names.iter().map(String::as_str).collect();
            let new_refs: Vec<&str> = new_names.iter().map(String::as_str).collect();
            let change = MembershipChange::between(view(1, &old_refs), view(2, &new_refs));

            let expected_left: Vec<Node> = old.difference(&new).map(|n| node(&format!("n{n}"))).collect();
            let expected_joined: Vec<Node> = new.difference(&old).map(|n| node(&format!("n{n}"))).collect();
            prop_assert_eq!(change.left(), expected_left.as_slice());
            prop_assert_eq!(change.joined(), expected_joined.as_slice());
        }
    }
}
