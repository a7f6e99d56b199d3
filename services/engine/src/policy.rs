//! Allocation policy enforcer.
//!
//! Group rules are evaluated in a fixed order and the first denial wins:
//!
//! 1. team restriction (`reserved_for_teams`, when non-empty)
//! 2. max concurrent allocations across the group's members
//! 3. priority boost, which never denies and only reorders the queue
//!
//! Every decision, allow or deny, is logged and emitted as a
//! `policy.decision` event for audit.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use testfarm_events::{event_types, AggregateType, EventEnvelope, PolicyDecisionPayload, Severity};
use testfarm_id::{GroupId, ResourceId};
use tracing::{info, warn};

use crate::alerts::AlertEmitter;
use crate::error::{EngineError, PolicyDenied};
use crate::model::ResourceGroup;
use crate::registry::Registry;
use crate::reservation::ReservationManager;

/// The rule that decided an authorization.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PolicyRule {
    /// The resource belongs to no group; nothing to enforce.
    Ungrouped,
    TeamRestriction,
    MaxConcurrent,
    PriorityBoost,
}

impl std::fmt::Display for PolicyRule {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            Self::Ungrouped => "ungrouped",
            Self::TeamRestriction => "team_restriction",
            Self::MaxConcurrent => "max_concurrent",
            Self::PriorityBoost => "priority_boost",
        })
    }
}

/// Who is asking.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Requester {
    /// Build job, VM request or test id.
    pub id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub team: Option<String>,
    /// Base queue priority; higher is served first.
    #[serde(default)]
    pub priority: i32,
}

impl Requester {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            team: None,
            priority: 0,
        }
    }

    pub fn with_team(mut self, team: impl Into<String>) -> Self {
        self.team = Some(team.into());
        self
    }

    pub fn with_priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }
}

/// What to authorize against.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PolicyTarget {
    Resource(ResourceId),
    Group(GroupId),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PolicyDecision {
    Allowed {
        group_id: Option<GroupId>,
        rule: PolicyRule,
        priority_boost: i32,
    },
    Denied(PolicyDenied),
}

impl PolicyDecision {
    pub fn is_allowed(&self) -> bool {
        matches!(self, Self::Allowed { .. })
    }
}

/// Evaluate a group's rules for one request.
///
/// `active` is the number of active reservations on the group's members.
pub fn evaluate(group: &ResourceGroup, requester: &Requester, active: u32) -> PolicyDecision {
    let policy = &group.policy;

    if !policy.reserved_for_teams.is_empty() {
        let allowed = requester
            .team
            .as_ref()
            .is_some_and(|team| policy.reserved_for_teams.contains(team));
        if !allowed {
            return PolicyDecision::Denied(PolicyDenied {
                group_id: group.id.clone(),
                rule: PolicyRule::TeamRestriction,
                reason: format!(
                    "group is reserved for teams [{}], requester team is {}",
                    policy.reserved_for_teams.join(", "),
                    requester.team.as_deref().unwrap_or("unset")
                ),
            });
        }
    }

    if let Some(max) = policy.max_concurrent_allocations {
        if active >= max {
            return PolicyDecision::Denied(PolicyDenied {
                group_id: group.id.clone(),
                rule: PolicyRule::MaxConcurrent,
                reason: format!("{active} of {max} concurrent allocations already active"),
            });
        }
    }

    PolicyDecision::Allowed {
        group_id: Some(group.id.clone()),
        rule: PolicyRule::PriorityBoost,
        priority_boost: policy.priority_boost,
    }
}

/// Applies group policy before reservations are granted.
pub struct AllocationPolicyEnforcer {
    registry: Arc<Registry>,
    reservations: Arc<ReservationManager>,
    alerts: AlertEmitter,
}

impl AllocationPolicyEnforcer {
    pub fn new(registry: Arc<Registry>, reservations: Arc<ReservationManager>, alerts: AlertEmitter) -> Self {
        Self {
            registry,
            reservations,
            alerts,
        }
    }

    /// Resolve the group governing `target`, if any.
    pub async fn group_of(&self, target: &PolicyTarget) -> Result<Option<ResourceGroup>, EngineError> {
        let group_id = match target {
            PolicyTarget::Group(id) => Some(id.clone()),
            PolicyTarget::Resource(id) => self
                .registry
                .get(id)
                .await
                .ok_or_else(|| EngineError::ResourceNotFound(id.clone()))?
                .group_id,
        };

        match group_id {
            None => Ok(None),
            Some(id) => self
                .registry
                .group(&id)
                .await
                .map(Some)
                .ok_or(EngineError::GroupNotFound(id)),
        }
    }

    pub async fn authorize(
        &self,
        target: &PolicyTarget,
        requester: &Requester,
    ) -> Result<PolicyDecision, EngineError> {
        let decision = match self.group_of(target).await? {
            None => PolicyDecision::Allowed {
                group_id: None,
                rule: PolicyRule::Ungrouped,
                priority_boost: 0,
            },
            Some(group) => {
                let members = self.registry.group_members(&group.id).await;
                let active = self.reservations.count_on(&members).await;
                evaluate(&group, requester, active)
            }
        };

        self.audit(requester, &decision);
        Ok(decision)
    }

    /// Effective queue priority: requester priority plus the group boost.
    pub async fn effective_priority(&self, group_id: Option<&GroupId>, requester: &Requester) -> i32 {
        let boost = match group_id {
            Some(id) => self
                .registry
                .group(id)
                .await
                .map(|g| g.policy.priority_boost)
                .unwrap_or(0),
            None => 0,
        };
        requester.priority.saturating_add(boost)
    }

    fn audit(&self, requester: &Requester, decision: &PolicyDecision) {
        let (group_id, allowed, rule, detail, severity) = match decision {
            PolicyDecision::Allowed {
                group_id,
                rule,
                priority_boost,
            } => {
                info!(
                    requester = %requester.id,
                    team = ?requester.team,
                    group_id = ?group_id,
                    rule = %rule,
                    priority_boost,
                    "Allocation allowed by policy"
                );
                (
                    group_id.clone(),
                    true,
                    *rule,
                    format!("allowed, priority boost {priority_boost}"),
                    Severity::Info,
                )
            }
            PolicyDecision::Denied(denied) => {
                warn!(
                    requester = %requester.id,
                    team = ?requester.team,
                    group_id = %denied.group_id,
                    rule = %denied.rule,
                    reason = %denied.reason,
                    "Allocation denied by policy"
                );
                (
                    Some(denied.group_id.clone()),
                    false,
                    denied.rule,
                    denied.reason.clone(),
                    Severity::Warning,
                )
            }
        };

        let aggregate_id = group_id
            .as_ref()
            .map(|g| g.to_string())
            .unwrap_or_else(|| "ungrouped".to_string());

        self.alerts.emit(
            EventEnvelope::builder()
                .aggregate(AggregateType::Group, aggregate_id)
                .event_type(event_types::POLICY_DECISION)
                .severity(severity)
                .payload(PolicyDecisionPayload {
                    group_id,
                    requester: requester.id.clone(),
                    team: requester.team.clone(),
                    allowed,
                    rule: rule.to_string(),
                    detail,
                }),
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::AllocationPolicy;

    fn group(policy: AllocationPolicy) -> ResourceGroup {
        ResourceGroup::new(GroupId::parse("kernel-boards").unwrap(), policy)
    }

    #[test]
    fn test_team_restriction_checked_first() {
        let g = group(AllocationPolicy {
            max_concurrent_allocations: Some(0),
            reserved_for_teams: vec!["kernel".to_string()],
            priority_boost: 0,
        });

        // Both rules would deny; the team rule fires first.
        let decision = evaluate(&g, &Requester::new("T9").with_team("graphics"), 5);
        let PolicyDecision::Denied(denied) = decision else {
            panic!("expected denial");
        };
        assert_eq!(denied.rule, PolicyRule::TeamRestriction);
    }

    #[test]
    fn test_missing_team_denied_when_restricted() {
        let g = group(AllocationPolicy {
            reserved_for_teams: vec!["kernel".to_string()],
            ..AllocationPolicy::default()
        });
        assert!(!evaluate(&g, &Requester::new("T1"), 0).is_allowed());
    }

    #[test]
    fn test_max_concurrent() {
        let g = group(AllocationPolicy {
            max_concurrent_allocations: Some(2),
            ..AllocationPolicy::default()
        });
        let r = Requester::new("T3").with_team("kernel");

        assert!(evaluate(&g, &r, 1).is_allowed());
        let PolicyDecision::Denied(denied) = evaluate(&g, &r, 2) else {
            panic!("expected denial");
        };
        assert_eq!(denied.rule, PolicyRule::MaxConcurrent);
        assert!(denied.reason.contains("2 of 2"));
    }

    #[test]
    fn test_priority_boost_never_denies() {
        let g = group(AllocationPolicy {
            priority_boost: 10,
            ..AllocationPolicy::default()
        });
        assert_eq!(
            evaluate(&g, &Requester::new("T1"), 100),
            PolicyDecision::Allowed {
                group_id: Some(g.id.clone()),
                rule: PolicyRule::PriorityBoost,
                priority_boost: 10,
            }
        );
    }
}
