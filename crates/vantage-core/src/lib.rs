// Vantage Core
// Mission scheduling, policy enforcement, agent registry, and the
// configuration boundary.

pub mod agents;
pub mod config;
pub mod error;
pub mod policy;
pub mod scheduler;

pub use agents::{AgentHandler, AgentRegistry};
pub use config::{ConfigStore, CoreConfig};
pub use error::{PolicyError, PolicyResult, ScheduleError, ScheduleResult};
pub use policy::{builtin_rules, default_plan_limits, PolicyEngine};
pub use scheduler::{
    BudgetBreachPolicy, MissionScheduler, MissionStatusReport, SchedulerConfig,
};
