//! Round-robin partition assignment.
//!
//! Every member runs the planner on its own. As long as they see the same sorted
//! member list and the same sorted partitions they compute the same plan, so the only
//! thing left to race on is the ownership record in the coordination store.

use std::collections::{BTreeMap, BTreeSet};

use crate::topic::{sort_partitions, Partition, Topic};

/// Partition at position `i` goes to member at position `i mod N`.
///
/// `members` and `partitions` are put into canonical order first. Members without a
/// partition map to an empty list.
pub fn round_robin(members: &[String], partitions: &[Partition]) -> BTreeMap<String, Vec<Partition>> {
    let members = canonical_members(members);
    let partitions = sort_partitions(partitions.to_vec());

    let mut plan = members
        .iter()
        .map(|member| (member.clone(), vec![]))
        .collect::<BTreeMap<_, _>>();
    if members.is_empty() {
        return plan;
    }

    for (i, partition) in partitions.into_iter().enumerate() {
        let member = &members[i % members.len()];
        if let Some(assigned) = plan.get_mut(member) {
            assigned.push(partition);
        }
    }

    plan
}

/// The slice of [`round_robin`] that belongs to `member_id`.
pub fn assigned_to(member_id: &str, members: &[String], partitions: &[Partition]) -> Vec<Partition> {
    let members = canonical_members(members);
    let Ok(index) = members.binary_search_by(|m| m.as_str().cmp(member_id)) else {
        return vec![];
    };

    sort_partitions(partitions.to_vec())
        .into_iter()
        .enumerate()
        .filter(|(i, _)| i % members.len() == index)
        .map(|(_, partition)| partition)
        .collect()
}

/// Per topic assignment of `member_id`, merged into one map keyed by topic name.
///
/// `subscriptions` maps every live member to its subscribed topics. A topic is only
/// split among the members subscribed to it.
pub fn plan_for_member(
    member_id: &str,
    subscriptions: &BTreeMap<String, BTreeSet<String>>,
    topics: &[Topic],
) -> BTreeMap<String, Vec<Partition>> {
    topics
        .iter()
        .map(|topic| {
            let members = subscribers(&topic.name, subscriptions);
            (
                topic.name.clone(),
                assigned_to(member_id, &members, &topic.partitions),
            )
        })
        .collect()
}

/// Members subscribed to `topic`, sorted.
pub fn subscribers(topic: &str, subscriptions: &BTreeMap<String, BTreeSet<String>>) -> Vec<String> {
    subscriptions
        .iter()
        .filter(|(_, topics)| topics.contains(topic))
        .map(|(member, _)| member.clone())
        .collect()
}

fn canonical_members(members: &[String]) -> Vec<String> {
    let mut members = members.to_vec();
    members.sort();
    members.dedup();
    members
}
