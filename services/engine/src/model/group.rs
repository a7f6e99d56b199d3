//! Resource groups and their allocation policy.

use serde::{Deserialize, Serialize};
use testfarm_id::GroupId;

/// Group-scoped allocation rules.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AllocationPolicy {
    /// Upper bound on active reservations across all members.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_concurrent_allocations: Option<u32>,

    /// Teams allowed to allocate; empty means everyone.
    #[serde(default)]
    pub reserved_for_teams: Vec<String>,

    /// Added to the requester's priority when waiting in the queue.
    #[serde(default)]
    pub priority_boost: i32,
}

/// A named set of resources sharing one policy.
///
/// Membership lives on the resource (`Resource::group_id`), so a resource
/// belongs to at most one group.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceGroup {
    pub id: GroupId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default)]
    pub policy: AllocationPolicy,
}

impl ResourceGroup {
    pub fn new(id: GroupId, policy: AllocationPolicy) -> Self {
        Self {
            id,
            description: None,
            policy,
        }
    }
}
