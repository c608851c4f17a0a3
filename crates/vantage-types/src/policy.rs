use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::Domain;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum RuleAction {
    Block,
    Warn,
    RequireApproval,
    Log,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    Low,
    Medium,
    High,
    Critical,
}

/// Which missions a rule applies to. `All` serializes as the string `"all"`,
/// a specific domain as `{"specific": "code"}`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RuleDomain {
    All,
    Specific(Domain),
}

impl RuleDomain {
    pub fn matches(self, domain: Domain) -> bool {
        match self {
            RuleDomain::All => true,
            RuleDomain::Specific(d) => d == domain,
        }
    }
}

/// A guardrail: blocks, warns, requires approval, or merely logs.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PolicyRule {
    pub id: String,
    pub name: String,
    pub domain: RuleDomain,
    pub rule_type: String,
    pub condition: String,
    pub action: RuleAction,
    pub message: String,
    pub severity: Severity,
    pub enabled: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UserRef {
    pub id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub plan: Option<String>,
    #[serde(default)]
    pub permissions: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkspaceRef {
    pub id: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HistoryItem {
    pub kind: String,
    pub at: DateTime<Utc>,
}

/// Everything the policy engine needs to judge one requested action.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PolicyContext {
    pub domain: Domain,
    pub action: String,
    pub tool: String,
    pub parameters: Value,
    pub user: UserRef,
    pub workspace: WorkspaceRef,
    #[serde(default)]
    pub history: Vec<HistoryItem>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PolicyViolation {
    pub rule_id: String,
    pub rule_name: String,
    pub severity: Severity,
    pub message: String,
    pub action: RuleAction,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RiskLevel {
    Low,
    Medium,
    High,
}

/// Returned as data, never thrown: callers present remediation instead of
/// crashing.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PolicyEvaluation {
    pub allowed: bool,
    pub requires_approval: bool,
    pub violations: Vec<PolicyViolation>,
    pub warnings: Vec<String>,
    pub estimated_cost: f64,
    pub estimated_risk: RiskLevel,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ApprovalStatus {
    Pending,
    Approved,
    Rejected,
    Expired,
}

impl ApprovalStatus {
    pub fn is_terminal(self) -> bool {
        !matches!(self, ApprovalStatus::Pending)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApprovalRequest {
    pub id: String,
    pub context: PolicyContext,
    pub violations: Vec<PolicyViolation>,
    pub estimated_cost: f64,
    pub estimated_risk: RiskLevel,
    pub requested_by: String,
    pub requested_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub status: ApprovalStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resolved_by: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resolved_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rejection_reason: Option<String>,
}

/// Subscription-tier ceilings, checked separately from user-defined rules.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlanLimits {
    pub plan: String,
    pub max_cost_per_day: f64,
    pub max_cost_per_month: f64,
    pub allowed_domains: Vec<Domain>,
    /// `["*"]` allows every tool.
    pub allowed_tools: Vec<String>,
    /// `["*"]` allows every model.
    pub allowed_models: Vec<String>,
    pub max_concurrent_missions: u32,
    pub requires_approval_above: f64,
}
