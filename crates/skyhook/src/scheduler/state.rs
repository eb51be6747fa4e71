use crate::common::error::SkyhookError;
use crate::Set;

/// One state flag of a compute node. Schedulers report these as a
/// comma-joined string and several may hold simultaneously (e.g.
/// `down,offline`), so nodes carry a set of them rather than a single value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum NodeState {
    Provisioning,
    Initializing,
    WaitProvisioning,
    Free,
    Busy,
    JobBusy,
    JobExclusive,
    ResvExclusive,
    Down,
    Offline,
    Stale,
    StaleUnknown,
    Unresolvable,
}

impl NodeState {
    pub fn parse(token: &str) -> crate::Result<NodeState> {
        Ok(match token {
            "provisioning" => NodeState::Provisioning,
            "initializing" => NodeState::Initializing,
            "wait-provisioning" => NodeState::WaitProvisioning,
            "free" => NodeState::Free,
            "busy" => NodeState::Busy,
            "job-busy" => NodeState::JobBusy,
            "job-exclusive" => NodeState::JobExclusive,
            "resv-exclusive" => NodeState::ResvExclusive,
            "down" => NodeState::Down,
            "offline" => NodeState::Offline,
            "stale" => NodeState::Stale,
            "stale-unknown" => NodeState::StaleUnknown,
            "unresolvable" => NodeState::Unresolvable,
            other => return Err(SkyhookError::UnknownStateToken(other.to_string())),
        })
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            NodeState::Provisioning => "provisioning",
            NodeState::Initializing => "initializing",
            NodeState::WaitProvisioning => "wait-provisioning",
            NodeState::Free => "free",
            NodeState::Busy => "busy",
            NodeState::JobBusy => "job-busy",
            NodeState::JobExclusive => "job-exclusive",
            NodeState::ResvExclusive => "resv-exclusive",
            NodeState::Down => "down",
            NodeState::Offline => "offline",
            NodeState::Stale => "stale",
            NodeState::StaleUnknown => "stale-unknown",
            NodeState::Unresolvable => "unresolvable",
        }
    }

    /// States in which the node is running a job.
    pub fn is_busy(&self) -> bool {
        matches!(
            self,
            NodeState::Busy | NodeState::JobBusy | NodeState::JobExclusive
        )
    }
}

/// Parses a comma-joined scheduler state string into a state set. An
/// unrecognized token is a hard error; silently dropping it would make a
/// node look healthier than it is.
pub fn parse_state_set(value: &str) -> crate::Result<Set<NodeState>> {
    let mut states = Set::default();
    for token in value.split(',') {
        let token = token.trim();
        if token.is_empty() {
            continue;
        }
        states.insert(NodeState::parse(token)?);
    }
    Ok(states)
}

/// Formats a state set back into the scheduler's comma-joined form, in
/// stable order.
pub fn format_state_set(states: &Set<NodeState>) -> String {
    let mut states: Vec<NodeState> = states.iter().copied().collect();
    states.sort();
    states
        .iter()
        .map(|s| s.as_str())
        .collect::<Vec<_>>()
        .join(",")
}
