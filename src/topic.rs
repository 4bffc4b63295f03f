use std::cmp::Ordering;
use std::fmt::{Display, Formatter};

#[derive(Debug, Clone, Eq, PartialEq)]
pub struct Topic {
    /// The name of this topic.
    pub name: String,

    /// Partition information, in canonical order.
    pub partitions: Vec<Partition>,
}

impl Topic {
    pub fn new(name: impl Into<String>, partitions: Vec<Partition>) -> Self {
        Self {
            name: name.into(),
            partitions: sort_partitions(partitions),
        }
    }
}

/// A partition snapshot as seen by one metadata refresh.
///
/// Ordered by leader address first and partition id second. Every member of a group
/// sorts the same metadata into the same sequence, which is what lets members agree
/// on an assignment without talking to each other.
#[derive(Debug, Clone, Eq, PartialEq, Hash)]
pub struct Partition {
    /// Address of the broker currently leading this partition.
    pub leader: String,

    /// Partition id within its topic.
    pub id: i32,
}

impl Partition {
    pub fn new(leader: impl Into<String>, id: i32) -> Self {
        Self {
            leader: leader.into(),
            id,
        }
    }
}

impl Ord for Partition {
    fn cmp(&self, other: &Self) -> Ordering {
        self.leader
            .cmp(&other.leader)
            .then_with(|| self.id.cmp(&other.id))
    }
}

impl PartialOrd for Partition {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Display for Partition {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}@{}", self.id, self.leader)
    }
}

/// Returns `partitions` in canonical order.
pub fn sort_partitions(mut partitions: Vec<Partition>) -> Vec<Partition> {
    partitions.sort();
    partitions
}

/// Key of everything that is tracked per partition: ownership, consumers and offsets.
#[derive(Debug, Clone, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct TopicPartition {
    pub topic: String,
    pub partition: i32,
}

impl TopicPartition {
    pub fn new(topic: impl Into<String>, partition: i32) -> Self {
        Self {
            topic: topic.into(),
            partition,
        }
    }
}

impl Display for TopicPartition {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.topic, self.partition)
    }
}
