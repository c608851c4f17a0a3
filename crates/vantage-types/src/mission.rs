use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// The specialized agent domains the platform dispatches to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Domain {
    Code,
    Architecture,
    Research,
    Trading,
    Creative,
}

impl std::fmt::Display for Domain {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Domain::Code => write!(f, "code"),
            Domain::Architecture => write!(f, "architecture"),
            Domain::Research => write!(f, "research"),
            Domain::Trading => write!(f, "trading"),
            Domain::Creative => write!(f, "creative"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Priority {
    Low,
    Normal,
    High,
    Critical,
}

impl Priority {
    /// Queue ordering rank. Higher dequeues first.
    pub fn rank(self) -> u8 {
        match self {
            Priority::Critical => 3,
            Priority::High => 2,
            Priority::Normal => 1,
            Priority::Low => 0,
        }
    }
}

/// Quality/latency/cost ceilings a mission imposes on planning and routing.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MissionRequirements {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub min_quality: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_latency_ms: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_cost: Option<f64>,
}

/// A bounded unit of agent work with its own budget, priority, and lifecycle.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Mission {
    pub id: String,
    pub domain: Domain,
    pub priority: Priority,
    pub budget: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub deadline: Option<DateTime<Utc>>,
    #[serde(default)]
    pub requirements: MissionRequirements,
    pub payload: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub idempotency_key: Option<String>,
}

impl Mission {
    pub fn new(domain: Domain, priority: Priority, budget: f64, payload: Value) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            domain,
            priority,
            budget,
            deadline: None,
            requirements: MissionRequirements::default(),
            payload,
            idempotency_key: None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MissionStatus {
    Queued,
    Running,
    Paused,
    Completed,
    Failed,
    Cancelled,
}

impl MissionStatus {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            MissionStatus::Completed | MissionStatus::Failed | MissionStatus::Cancelled
        )
    }
}

impl std::fmt::Display for MissionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            MissionStatus::Queued => "queued",
            MissionStatus::Running => "running",
            MissionStatus::Paused => "paused",
            MissionStatus::Completed => "completed",
            MissionStatus::Failed => "failed",
            MissionStatus::Cancelled => "cancelled",
        };
        write!(f, "{s}")
    }
}

/// What an agent can do and how loaded it currently is.
///
/// `current_load` is mutated only by the scheduler during dispatch and
/// completion.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentCapability {
    pub agent_id: String,
    pub capabilities: Vec<Domain>,
    pub cost_per_request: f64,
    pub avg_latency_ms: u64,
    pub quality_score: f64,
    pub max_concurrent: u32,
    #[serde(default)]
    pub current_load: u32,
}

/// Immutable plan produced at admission time. Regenerated on re-submission,
/// never mutated in place.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionPlan {
    pub mission_id: String,
    pub selected_agent: String,
    pub estimated_cost: f64,
    pub estimated_latency_ms: u64,
    pub estimated_quality: f64,
    pub fallback_agents: Vec<String>,
    #[serde(default)]
    pub steps: Vec<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn priority_rank_orders_critical_first() {
        assert!(Priority::Critical.rank() > Priority::High.rank());
        assert!(Priority::High.rank() > Priority::Normal.rank());
        assert!(Priority::Normal.rank() > Priority::Low.rank());
    }

    #[test]
    fn terminal_statuses() {
        assert!(MissionStatus::Completed.is_terminal());
        assert!(MissionStatus::Failed.is_terminal());
        assert!(MissionStatus::Cancelled.is_terminal());
        assert!(!MissionStatus::Paused.is_terminal());
        assert!(!MissionStatus::Queued.is_terminal());
        assert!(!MissionStatus::Running.is_terminal());
    }
}
