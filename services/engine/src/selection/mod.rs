//! Selection strategies.
//!
//! A strategy is a pure function of the requirements and a registry
//! snapshot: it filters by hard constraints, ranks survivors by utilization
//! and returns the best one plus the ranked alternatives. It never reserves
//! anything and never mutates state, so identical inputs always pick the
//! same resource.
//!
//! The three strategies only differ in their kind-specific compatibility
//! predicate ([`SelectionStrategy::check_constraints`]); filtering, ranking
//! and the no-match answer are shared in [`select_with`].

mod board;
mod build_server;
mod host;
mod scoring;

use std::collections::{BTreeMap, BTreeSet};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use testfarm_events::{ResourceKind, ResourceStatus};
use testfarm_id::{GroupId, ResourceId};

use crate::clock;
use crate::config::ScoringWeights;
use crate::model::{Resource, ResourceSlice};

pub use board::BoardStrategy;
pub use build_server::BuildServerStrategy;
pub use host::HostStrategy;
pub use scoring::{utilization_score, MAX_SCORE};

// =============================================================================
// Requirements
// =============================================================================

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BuildConstraints {
    pub architecture: String,
    #[serde(default)]
    pub toolchains: BTreeSet<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct HostConstraints {
    pub architecture: String,
    #[serde(default)]
    pub kvm: bool,
    #[serde(default)]
    pub nested_virt: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BoardConstraints {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub board_type: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub architecture: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub soc: Option<String>,
    #[serde(default)]
    pub peripherals: BTreeSet<String>,
    #[serde(default)]
    pub power_control: bool,
}

/// Kind-specific hard constraints.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Constraints {
    BuildServer(BuildConstraints),
    Host(HostConstraints),
    Board(BoardConstraints),
}

impl Constraints {
    pub fn kind(&self) -> ResourceKind {
        match self {
            Self::BuildServer(_) => ResourceKind::BuildServer,
            Self::Host(_) => ResourceKind::Host,
            Self::Board(_) => ResourceKind::Board,
        }
    }
}

/// What a request needs from a resource.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Requirements {
    pub constraints: Constraints,

    /// Capacity to reserve. Ignored for boards, which are taken whole.
    #[serde(default)]
    pub slice: ResourceSlice,

    #[serde(default)]
    pub labels: BTreeMap<String, String>,

    /// Restrict to members of this group.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub group_id: Option<GroupId>,

    /// Only this resource will do.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pinned: Option<ResourceId>,

    /// Never pick these.
    #[serde(default)]
    pub exclude: BTreeSet<ResourceId>,
}

impl Requirements {
    pub fn new(constraints: Constraints) -> Self {
        Self {
            constraints,
            slice: ResourceSlice::default(),
            labels: BTreeMap::new(),
            group_id: None,
            pinned: None,
            exclude: BTreeSet::new(),
        }
    }

    pub fn build_server(architecture: impl Into<String>) -> Self {
        Self::new(Constraints::BuildServer(BuildConstraints {
            architecture: architecture.into(),
            toolchains: BTreeSet::new(),
        }))
    }

    pub fn host(architecture: impl Into<String>) -> Self {
        Self::new(Constraints::Host(HostConstraints {
            architecture: architecture.into(),
            kvm: false,
            nested_virt: false,
        }))
    }

    pub fn board() -> Self {
        Self::new(Constraints::Board(BoardConstraints::default()))
    }

    pub fn kind(&self) -> ResourceKind {
        self.constraints.kind()
    }

    pub fn with_slice(mut self, slice: ResourceSlice) -> Self {
        self.slice = slice;
        self
    }

    pub fn with_label(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.labels.insert(key.into(), value.into());
        self
    }

    pub fn in_group(mut self, group_id: GroupId) -> Self {
        self.group_id = Some(group_id);
        self
    }

    pub fn pinned_to(mut self, id: ResourceId) -> Self {
        self.pinned = Some(id);
        self
    }

    pub fn excluding(mut self, id: ResourceId) -> Self {
        self.exclude.insert(id);
        self
    }

    pub fn with_toolchain(mut self, toolchain: impl Into<String>) -> Self {
        if let Constraints::BuildServer(c) = &mut self.constraints {
            c.toolchains.insert(toolchain.into());
        }
        self
    }

    pub fn require_kvm(mut self) -> Self {
        if let Constraints::Host(c) = &mut self.constraints {
            c.kvm = true;
        }
        self
    }

    pub fn require_nested_virt(mut self) -> Self {
        if let Constraints::Host(c) = &mut self.constraints {
            c.kvm = true;
            c.nested_virt = true;
        }
        self
    }

    pub fn with_board_type(mut self, board_type: impl Into<String>) -> Self {
        if let Constraints::Board(c) = &mut self.constraints {
            c.board_type = Some(board_type.into());
        }
        self
    }

    pub fn with_architecture(mut self, architecture: impl Into<String>) -> Self {
        match &mut self.constraints {
            Constraints::BuildServer(c) => c.architecture = architecture.into(),
            Constraints::Host(c) => c.architecture = architecture.into(),
            Constraints::Board(c) => c.architecture = Some(architecture.into()),
        }
        self
    }

    pub fn with_peripheral(mut self, peripheral: impl Into<String>) -> Self {
        if let Constraints::Board(c) = &mut self.constraints {
            c.peripherals.insert(peripheral.into());
        }
        self
    }

    pub fn require_power_control(mut self) -> Self {
        if let Constraints::Board(c) = &mut self.constraints {
            c.power_control = true;
        }
        self
    }
}

// =============================================================================
// Results
// =============================================================================

/// Outcome of a selection.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SelectionResult {
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resource: Option<Resource>,
    /// Other selectable resources, best first; on failure, compatible
    /// resources the caller could be redirected to.
    #[serde(default)]
    pub alternatives: Vec<ResourceId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub estimated_wait: Option<Duration>,
    /// Human-readable explanation, always set on failure.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

impl SelectionResult {
    fn chosen(resource: Resource, alternatives: Vec<ResourceId>) -> Self {
        Self {
            success: true,
            resource: Some(resource),
            alternatives,
            estimated_wait: None,
            reason: None,
        }
    }

    fn no_match(reason: String, alternatives: Vec<ResourceId>, estimated_wait: Option<Duration>) -> Self {
        Self {
            success: false,
            resource: None,
            alternatives,
            estimated_wait,
            reason: Some(reason),
        }
    }
}

/// Read-only inputs of a selection.
#[derive(Debug, Clone, Copy)]
pub struct SelectionContext<'a> {
    /// Registry snapshot, ordered by id.
    pub resources: &'a [Resource],
    /// Earliest reservation expiry per reserved resource.
    pub busy_until: &'a BTreeMap<ResourceId, DateTime<Utc>>,
    pub now: DateTime<Utc>,
    pub weights: ScoringWeights,
}

// =============================================================================
// Strategy
// =============================================================================

/// Per-kind selection strategy.
pub trait SelectionStrategy: Send + Sync {
    fn kind(&self) -> ResourceKind;

    /// Kind-specific hard constraints. `Err` explains the first mismatch.
    fn check_constraints(&self, resource: &Resource, requirements: &Requirements) -> Result<(), String>;

    fn select(&self, requirements: &Requirements, ctx: &SelectionContext<'_>) -> SelectionResult {
        select_with(self, requirements, ctx)
    }
}

static BUILD_SERVER: BuildServerStrategy = BuildServerStrategy;
static HOST: HostStrategy = HostStrategy;
static BOARD: BoardStrategy = BoardStrategy;

/// The strategy for a resource kind.
pub fn strategy_for(kind: ResourceKind) -> &'static dyn SelectionStrategy {
    match kind {
        ResourceKind::BuildServer => &BUILD_SERVER,
        ResourceKind::Host => &HOST,
        ResourceKind::Board => &BOARD,
    }
}

/// Full compatibility check: kind, constraints, labels and group.
pub fn check_compatible<S: SelectionStrategy + ?Sized>(
    strategy: &S,
    resource: &Resource,
    requirements: &Requirements,
) -> Result<(), String> {
    if resource.kind() != strategy.kind() || requirements.kind() != strategy.kind() {
        return Err(format!("is a {}, not a {}", resource.kind(), requirements.kind()));
    }
    strategy.check_constraints(resource, requirements)?;
    if !resource.matches_labels(&requirements.labels) {
        return Err("missing required labels".to_string());
    }
    if let Some(group_id) = &requirements.group_id {
        if resource.group_id.as_ref() != Some(group_id) {
            return Err(format!("not in group {group_id}"));
        }
    }
    Ok(())
}

/// Why a compatible resource cannot take the request right now.
pub fn unavailable_reason(resource: &Resource, slice: &ResourceSlice) -> Option<String> {
    if resource.maintenance_mode || resource.status == ResourceStatus::Maintenance {
        return Some("in maintenance".to_string());
    }
    if resource.needs_intervention {
        return Some("needs manual intervention".to_string());
    }
    if !resource.status.is_allocatable(resource.kind()) {
        return Some(format!("status {}", resource.status));
    }
    if resource.active_reservations >= resource.slot_limit() {
        return Some(format!(
            "all {} reservation slots taken",
            resource.slot_limit()
        ));
    }
    if !resource.is_board() && !slice.fits_within(&resource.available()) {
        return Some(format!(
            "needs {slice}, only {} free",
            resource.available()
        ));
    }
    None
}

/// Shared selection algorithm.
pub fn select_with<S: SelectionStrategy + ?Sized>(
    strategy: &S,
    requirements: &Requirements,
    ctx: &SelectionContext<'_>,
) -> SelectionResult {
    let kind = strategy.kind();
    let mut mismatches = Vec::new();
    let mut compatible = Vec::new();

    for resource in ctx.resources.iter().filter(|r| r.kind() == kind) {
        if requirements.exclude.contains(&resource.id) {
            continue;
        }
        match check_compatible(strategy, resource, requirements) {
            Ok(()) => compatible.push(resource),
            Err(why) => mismatches.push(format!("{}: {}", resource.id, why)),
        }
    }

    let mut ranked: Vec<(u32, &Resource)> = compatible
        .iter()
        .copied()
        .filter(|r| unavailable_reason(r, &requirements.slice).is_none())
        .map(|r| (utilization_score(r, ctx.weights), r))
        .collect();
    ranked.sort_by(|(sa, a), (sb, b)| sa.cmp(sb).then_with(|| a.id.cmp(&b.id)));

    if let Some(pinned) = &requirements.pinned {
        return select_pinned(pinned, requirements, &compatible, &ranked, &mismatches, ctx);
    }

    if let Some(((_, best), rest)) = ranked.split_first() {
        let alternatives = rest.iter().map(|(_, r)| r.id.clone()).collect();
        return SelectionResult::chosen((*best).clone(), alternatives);
    }

    if compatible.is_empty() {
        let detail = if mismatches.is_empty() {
            "none registered".to_string()
        } else {
            mismatches.join("; ")
        };
        return SelectionResult::no_match(
            format!("no compatible {kind} ({detail})"),
            Vec::new(),
            None,
        );
    }

    let detail: Vec<String> = compatible
        .iter()
        .filter_map(|r| unavailable_reason(r, &requirements.slice).map(|why| format!("{}: {}", r.id, why)))
        .collect();
    SelectionResult::no_match(
        format!(
            "{} compatible {kind}(s), none free ({})",
            compatible.len(),
            detail.join("; ")
        ),
        Vec::new(),
        estimate_wait(&compatible, ctx),
    )
}

fn select_pinned(
    pinned: &ResourceId,
    requirements: &Requirements,
    compatible: &[&Resource],
    ranked: &[(u32, &Resource)],
    mismatches: &[String],
    ctx: &SelectionContext<'_>,
) -> SelectionResult {
    let others: Vec<ResourceId> = ranked
        .iter()
        .filter(|(_, r)| &r.id != pinned)
        .map(|(_, r)| r.id.clone())
        .collect();

    if let Some((_, resource)) = ranked.iter().find(|(_, r)| &r.id == pinned) {
        return SelectionResult::chosen((*resource).clone(), others);
    }

    if let Some(resource) = compatible.iter().find(|r| &r.id == pinned) {
        let why = unavailable_reason(resource, &requirements.slice).unwrap_or_default();
        return SelectionResult::no_match(
            format!("pinned {pinned} is not available ({why})"),
            others,
            estimate_wait(&[*resource], ctx),
        );
    }

    let why = mismatches
        .iter()
        .find(|m| m.starts_with(&format!("{pinned}: ")))
        .cloned()
        .unwrap_or_else(|| format!("{pinned}: not registered or excluded"));
    SelectionResult::no_match(format!("pinned resource unusable ({why})"), others, None)
}

/// Earliest expiry among compatible resources that are only busy.
///
/// Resources that are offline, in maintenance or waiting for a human do not
/// count: their reservations expiring frees nothing.
fn estimate_wait(compatible: &[&Resource], ctx: &SelectionContext<'_>) -> Option<Duration> {
    compatible
        .iter()
        .filter(|r| !r.maintenance_mode && !r.needs_intervention)
        .filter(|r| {
            matches!(
                r.status,
                ResourceStatus::Online
                    | ResourceStatus::Available
                    | ResourceStatus::InUse
                    | ResourceStatus::Flashing
            )
        })
        .filter_map(|r| ctx.busy_until.get(&r.id))
        .min()
        .map(|at| clock::until(ctx.now, *at))
}
