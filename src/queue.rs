//! Queue identity and partition-tree math.
//!
//! A logical task queue is sharded into partitions. Partition 0 of the
//! normal kind is the root; the remaining partitions form a fan-in tree
//! whose degree is the configured children-per-node. Sticky queues sit
//! outside the tree and carry the name of their partner normal queue.

use std::fmt;

/// Partition index of the root of every queue's partition tree.
pub const ROOT_PARTITION: u32 = 0;

/// Prefix used in RPC names for non-root partitions. The root partition
/// addresses by its bare queue name.
const PARTITION_RPC_PREFIX: &str = "/_sys/";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum QueueType {
    Workflow,
    Activity,
}

impl QueueType {
    pub fn as_str(&self) -> &'static str {
        match self {
            QueueType::Workflow => "workflow",
            QueueType::Activity => "activity",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum QueueKind {
    Normal,
    /// A short-lived queue pinned to a specific worker. Carries the name
    /// of the normal queue it shares user data with.
    Sticky { normal_queue: String },
}

/// Identity of one physical partition of a named queue.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct QueueKey {
    pub namespace_id: String,
    pub name: String,
    pub queue_type: QueueType,
    pub partition: u32,
    pub kind: QueueKind,
}

impl QueueKey {
    pub fn normal(
        namespace_id: impl Into<String>,
        name: impl Into<String>,
        queue_type: QueueType,
        partition: u32,
    ) -> Self {
        Self {
            namespace_id: namespace_id.into(),
            name: name.into(),
            queue_type,
            partition,
            kind: QueueKind::Normal,
        }
    }

    /// A sticky queue is always a workflow queue with a single partition.
    pub fn sticky(
        namespace_id: impl Into<String>,
        sticky_name: impl Into<String>,
        normal_queue: impl Into<String>,
    ) -> Self {
        Self {
            namespace_id: namespace_id.into(),
            name: sticky_name.into(),
            queue_type: QueueType::Workflow,
            partition: ROOT_PARTITION,
            kind: QueueKind::Sticky {
                normal_queue: normal_queue.into(),
            },
        }
    }

    pub fn is_sticky(&self) -> bool {
        matches!(self.kind, QueueKind::Sticky { .. })
    }

    /// The root is the authoritative partition for user data and the
    /// terminus of upward forwarding.
    pub fn is_root(&self) -> bool {
        self.partition == ROOT_PARTITION && !self.is_sticky()
    }

    /// Name this partition is addressed by over RPC.
    pub fn rpc_name(&self) -> String {
        if self.partition == ROOT_PARTITION {
            self.name.clone()
        } else {
            format!("{PARTITION_RPC_PREFIX}{}/{}", self.name, self.partition)
        }
    }

    /// Inverse of [`rpc_name`](Self::rpc_name) for normal partitions.
    pub fn from_rpc_name(
        namespace_id: impl Into<String>,
        rpc_name: &str,
        queue_type: QueueType,
    ) -> Self {
        if let Some(rest) = rpc_name.strip_prefix(PARTITION_RPC_PREFIX) {
            if let Some((name, partition)) = rest.rsplit_once('/') {
                if let Ok(partition) = partition.parse() {
                    return Self::normal(namespace_id, name, queue_type, partition);
                }
            }
        }
        Self::normal(namespace_id, rpc_name, queue_type, ROOT_PARTITION)
    }

    /// The parent of this partition in the fan-in tree, or `None` for the
    /// root, for sticky queues, and when forwarding is disabled
    /// (`degree == 0`).
    pub fn parent(&self, degree: u32) -> Option<QueueKey> {
        if self.is_sticky() || self.partition == ROOT_PARTITION || degree == 0 {
            return None;
        }
        Some(QueueKey::normal(
            self.namespace_id.clone(),
            self.name.clone(),
            self.queue_type,
            (self.partition - 1) / degree,
        ))
    }

    /// The root workflow partition holding this queue's user data.
    pub fn user_data_root(&self) -> QueueKey {
        let name = match &self.kind {
            QueueKind::Sticky { normal_queue } => normal_queue.clone(),
            QueueKind::Normal => self.name.clone(),
        };
        QueueKey::normal(
            self.namespace_id.clone(),
            name,
            QueueType::Workflow,
            ROOT_PARTITION,
        )
    }

    /// Where this partition's user-data fetch loop long-polls from, or
    /// `None` when this partition is itself the owner.
    ///
    /// Sticky queues go to their partner normal root; activity partitions
    /// go to the workflow root of the same name (activity shares workflow
    /// user data); non-root workflow partitions walk one level up the
    /// tree so updates fan out instead of thundering the root.
    pub fn user_data_fetch_target(&self, degree: u32) -> Option<QueueKey> {
        match (&self.kind, self.queue_type) {
            (QueueKind::Sticky { .. }, _) => Some(self.user_data_root()),
            (QueueKind::Normal, QueueType::Activity) => Some(self.user_data_root()),
            (QueueKind::Normal, QueueType::Workflow) => {
                if self.partition == ROOT_PARTITION {
                    None
                } else {
                    self.parent(degree).or_else(|| Some(self.user_data_root()))
                }
            }
        }
    }
}

impl fmt::Display for QueueKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}/{}[{}]{}",
            self.namespace_id,
            self.rpc_name(),
            self.queue_type.as_str(),
            if self.is_sticky() { " (sticky)" } else { "" },
        )
    }
}
