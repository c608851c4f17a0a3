// Mission scheduler.
//
// Admission control, capability-based planning, priority dispatch, and
// lifecycle tracking for missions. Every significant transition publishes a
// CoreEvent and writes a versioned snapshot to the context store.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tokio::sync::{Notify, RwLock};
use tokio_util::sync::CancellationToken;
use tracing::{warn, Level};

use vantage_context::ContextStore;
use vantage_observability::{emit_event, Component, EventBus, ObservabilityEvent};
use vantage_types::{
    ContextPatch, CoreEvent, ExecutionPlan, Mission, MissionStatus, NewContextEntry,
};

use crate::agents::AgentRegistry;
use crate::error::{ScheduleError, ScheduleResult};

/// What happens when a mission's actual cost crosses its budget.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BudgetBreachPolicy {
    #[default]
    Fail,
    Pause,
}

#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    pub queue_capacity: usize,
    pub tick_interval: Duration,
    pub budget_breach: BudgetBreachPolicy,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            queue_capacity: 1000,
            tick_interval: Duration::from_secs(1),
            budget_breach: BudgetBreachPolicy::default(),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct MissionStatusReport {
    pub mission_id: String,
    pub status: MissionStatus,
    pub progress: f64,
    pub actual_cost: f64,
    pub budget_limit: f64,
    pub budget_exceeded: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub eta: Option<DateTime<Utc>>,
    pub plan: ExecutionPlan,
    pub custom_state: Value,
}

struct MissionRecord {
    mission: Mission,
    status: MissionStatus,
    plan: ExecutionPlan,
    progress: f64,
    actual_cost: f64,
    budget_exceeded: bool,
    eta: Option<DateTime<Utc>>,
    custom_state: Value,
    started_at: Option<DateTime<Utc>>,
    dispatched_agent: Option<String>,
    result: Option<Value>,
    failure: Option<String>,
    snapshot_entry: Option<String>,
    seq: u64,
}

impl MissionRecord {
    fn report(&self) -> MissionStatusReport {
        MissionStatusReport {
            mission_id: self.mission.id.clone(),
            status: self.status,
            progress: self.progress,
            actual_cost: self.actual_cost,
            budget_limit: self.mission.budget,
            budget_exceeded: self.budget_exceeded,
            eta: self.eta,
            plan: self.plan.clone(),
            custom_state: self.custom_state.clone(),
        }
    }
}

struct QueueItem {
    mission_id: String,
    rank: u8,
    deadline: Option<DateTime<Utc>>,
    seq: u64,
}

#[derive(Default)]
struct SchedulerState {
    missions: HashMap<String, MissionRecord>,
    queue: Vec<QueueItem>,
    completed_keys: HashMap<String, ExecutionPlan>,
    pending_keys: HashMap<String, String>,
    next_seq: u64,
}

impl SchedulerState {
    fn sort_queue(&mut self) {
        self.queue.sort_by(|a, b| {
            b.rank
                .cmp(&a.rank)
                .then_with(|| match (a.deadline, b.deadline) {
                    (Some(da), Some(db)) => da.cmp(&db),
                    (Some(_), None) => std::cmp::Ordering::Less,
                    (None, Some(_)) => std::cmp::Ordering::Greater,
                    (None, None) => std::cmp::Ordering::Equal,
                })
                .then_with(|| a.seq.cmp(&b.seq))
        });
    }
}

#[derive(Clone)]
pub struct MissionScheduler {
    state: Arc<RwLock<SchedulerState>>,
    agents: AgentRegistry,
    bus: EventBus,
    context: Arc<ContextStore>,
    config: SchedulerConfig,
    notify: Arc<Notify>,
}

impl MissionScheduler {
    pub fn new(
        agents: AgentRegistry,
        bus: EventBus,
        context: Arc<ContextStore>,
        config: SchedulerConfig,
    ) -> Self {
        Self {
            state: Arc::new(RwLock::new(SchedulerState::default())),
            agents,
            bus,
            context,
            config,
            notify: Arc::new(Notify::new()),
        }
    }

    pub fn agents(&self) -> &AgentRegistry {
        &self.agents
    }

    /// Admit a mission: validate, plan, and enqueue. Re-submitting a
    /// completed idempotency key returns the recorded plan without a
    /// duplicate enqueue.
    pub async fn submit(&self, mission: Mission) -> ScheduleResult<ExecutionPlan> {
        if !mission.budget.is_finite() || mission.budget <= 0.0 {
            return Err(ScheduleError::Validation(format!(
                "mission budget must be positive, got {}",
                mission.budget
            )));
        }

        let mut state = self.state.write().await;

        if let Some(key) = &mission.idempotency_key {
            if let Some(plan) = state.completed_keys.get(key) {
                return Ok(plan.clone());
            }
            if let Some(existing_id) = state.pending_keys.get(key) {
                if let Some(record) = state.missions.get(existing_id) {
                    return Ok(record.plan.clone());
                }
            }
        }

        if state.queue.len() >= self.config.queue_capacity {
            return Err(ScheduleError::QueueFull(self.config.queue_capacity));
        }

        let plan = self.plan_mission(&mission).await?;

        let seq = state.next_seq;
        state.next_seq += 1;

        if let Some(key) = &mission.idempotency_key {
            state
                .pending_keys
                .insert(key.clone(), mission.id.clone());
        }
        state.queue.push(QueueItem {
            mission_id: mission.id.clone(),
            rank: mission.priority.rank(),
            deadline: mission.deadline,
            seq,
        });
        state.sort_queue();

        let mission_id = mission.id.clone();
        state.missions.insert(
            mission.id.clone(),
            MissionRecord {
                mission,
                status: MissionStatus::Queued,
                plan: plan.clone(),
                progress: 0.0,
                actual_cost: 0.0,
                budget_exceeded: false,
                eta: None,
                custom_state: Value::Null,
                started_at: None,
                dispatched_agent: None,
                result: None,
                failure: None,
                snapshot_entry: None,
                seq,
            },
        );
        drop(state);

        self.publish(
            "mission.submitted",
            json!({ "id": mission_id, "agent": plan.selected_agent }),
        );
        self.snapshot(&mission_id).await;
        self.notify.notify_one();
        Ok(plan)
    }

    /// Select the best-scoring capable agent plus up to three fallbacks.
    async fn plan_mission(&self, mission: &Mission) -> ScheduleResult<ExecutionPlan> {
        let req = &mission.requirements;
        let candidates: Vec<_> = self
            .agents
            .capabilities()
            .await
            .into_iter()
            .filter(|a| a.capabilities.contains(&mission.domain))
            .filter(|a| a.current_load < a.max_concurrent)
            .filter(|a| req.min_quality.map_or(true, |q| a.quality_score >= q))
            .filter(|a| req.max_latency_ms.map_or(true, |l| a.avg_latency_ms <= l))
            .filter(|a| req.max_cost.map_or(true, |c| a.cost_per_request <= c))
            .collect();

        if candidates.is_empty() {
            return Err(ScheduleError::NoCandidate(format!(
                "no agent available for domain {}",
                mission.domain
            )));
        }

        let latency_ceiling = req
            .max_latency_ms
            .unwrap_or_else(|| candidates.iter().map(|a| a.avg_latency_ms).max().unwrap_or(1))
            .max(1) as f64;

        let mut scored: Vec<_> = candidates
            .into_iter()
            .map(|a| {
                let score = 0.4 * a.quality_score
                    + 0.3 * (1.0 - a.cost_per_request / mission.budget)
                    + 0.3 * (1.0 - a.avg_latency_ms as f64 / latency_ceiling);
                (a, score)
            })
            .collect();
        scored.sort_by(|a, b| b.1.total_cmp(&a.1));

        let (primary, _) = &scored[0];
        if primary.cost_per_request > mission.budget {
            return Err(ScheduleError::Validation(format!(
                "plan cost {:.4} exceeds mission budget {:.4}",
                primary.cost_per_request, mission.budget
            )));
        }

        let fallback_agents: Vec<String> = scored
            .iter()
            .skip(1)
            .take(3)
            .map(|(a, _)| a.agent_id.clone())
            .collect();

        Ok(ExecutionPlan {
            mission_id: mission.id.clone(),
            selected_agent: primary.agent_id.clone(),
            estimated_cost: primary.cost_per_request,
            estimated_latency_ms: primary.avg_latency_ms,
            estimated_quality: primary.quality_score,
            fallback_agents,
            steps: vec![
                "validate requirements".to_string(),
                format!("dispatch to {}", primary.agent_id),
                "collect result".to_string(),
            ],
        })
    }

    /// Start a queued mission now. Fails with `NoCandidate` when neither the
    /// planned agent nor any fallback has a free slot.
    pub async fn start(&self, id: &str) -> ScheduleResult<()> {
        if self.try_dispatch(id).await? {
            Ok(())
        } else {
            Err(ScheduleError::NoCandidate(format!(
                "no agent slot available for mission {id}"
            )))
        }
    }

    // Dispatch path shared by manual start and the run loop. Re-validates the
    // plan against current agent load: the planned agent may have filled up
    // since admission, in which case a fallback takes the slot.
    async fn try_dispatch(&self, id: &str) -> ScheduleResult<bool> {
        let mut state = self.state.write().await;
        let record = state
            .missions
            .get(id)
            .ok_or_else(|| ScheduleError::NotFound(id.to_string()))?;
        if record.status != MissionStatus::Queued {
            return Err(ScheduleError::InvalidState {
                id: id.to_string(),
                status: record.status,
                op: "start",
            });
        }

        let mut chain = vec![record.plan.selected_agent.clone()];
        chain.extend(record.plan.fallback_agents.iter().cloned());
        let mut selected = None;
        for agent_id in chain {
            if self.agents.reserve(&agent_id).await {
                selected = Some(agent_id);
                break;
            }
        }
        let Some(agent_id) = selected else {
            return Ok(false);
        };

        let record = state
            .missions
            .get_mut(id)
            .ok_or_else(|| ScheduleError::NotFound(id.to_string()))?;
        record.status = MissionStatus::Running;
        record.started_at = Some(Utc::now());
        record.dispatched_agent = Some(agent_id.clone());
        let mission = record.mission.clone();
        state.queue.retain(|item| item.mission_id != id);
        drop(state);

        self.publish(
            "mission.started",
            json!({ "id": id, "agent": agent_id }),
        );
        emit_event(
            Level::INFO,
            Component::Scheduler,
            ObservabilityEvent {
                event: "mission.started",
                mission_id: Some(id),
                workspace_id: None,
                provider_id: None,
                model_id: None,
                status: Some("running"),
                error_code: None,
                detail: Some(&agent_id),
            },
        );
        self.snapshot(id).await;

        let Some(handler) = self.agents.handler(&agent_id).await else {
            // Registered capability without a handler; treat as a failure.
            let _ = self.fail(id, "agent handler missing").await;
            return Ok(true);
        };
        let scheduler = self.clone();
        let mission_id = id.to_string();
        tokio::spawn(async move {
            match handler.invoke(&mission).await {
                // Late results against a cancelled mission fail the state
                // check inside complete/fail and are dropped here.
                Ok(result) => {
                    let _ = scheduler.complete(&mission_id, result).await;
                }
                Err(err) => {
                    let _ = scheduler.fail(&mission_id, &err.to_string()).await;
                }
            }
        });
        Ok(true)
    }

    pub async fn pause(&self, id: &str) -> ScheduleResult<()> {
        {
            let mut state = self.state.write().await;
            let record = require_status(&mut state, id, &[MissionStatus::Running], "pause")?;
            record.status = MissionStatus::Paused;
        }
        self.publish("mission.paused", json!({ "id": id }));
        self.snapshot(id).await;
        Ok(())
    }

    pub async fn resume(&self, id: &str) -> ScheduleResult<()> {
        {
            let mut state = self.state.write().await;
            let record = require_status(&mut state, id, &[MissionStatus::Paused], "resume")?;
            record.status = MissionStatus::Running;
        }
        self.publish("mission.resumed", json!({ "id": id }));
        self.snapshot(id).await;
        Ok(())
    }

    /// Cancel a queued or in-flight mission. Queued missions leave the queue
    /// with no side effects; running ones release their agent slot and any
    /// late result is discarded.
    pub async fn cancel(&self, id: &str) -> ScheduleResult<()> {
        let released;
        {
            let mut state = self.state.write().await;
            let record = require_status(
                &mut state,
                id,
                &[
                    MissionStatus::Queued,
                    MissionStatus::Running,
                    MissionStatus::Paused,
                ],
                "cancel",
            )?;
            record.status = MissionStatus::Cancelled;
            released = record.dispatched_agent.take();
            let key = record.mission.idempotency_key.clone();
            state.queue.retain(|item| item.mission_id != id);
            if let Some(key) = key {
                state.pending_keys.remove(&key);
            }
        }
        if let Some(agent_id) = released {
            self.agents.release(&agent_id).await;
        }
        self.publish("mission.cancelled", json!({ "id": id }));
        self.snapshot(id).await;
        Ok(())
    }

    pub async fn complete(&self, id: &str, result: Value) -> ScheduleResult<()> {
        let released;
        {
            let mut state = self.state.write().await;
            let record = require_status(
                &mut state,
                id,
                &[MissionStatus::Running, MissionStatus::Paused],
                "complete",
            )?;
            record.status = MissionStatus::Completed;
            record.progress = 1.0;
            record.result = Some(result);
            released = record.dispatched_agent.take();
            let key = record.mission.idempotency_key.clone();
            let plan = record.plan.clone();
            if let Some(key) = key {
                state.pending_keys.remove(&key);
                state.completed_keys.insert(key, plan);
            }
        }
        if let Some(agent_id) = released {
            self.agents.release(&agent_id).await;
        }
        self.publish("mission.completed", json!({ "id": id }));
        self.snapshot(id).await;
        Ok(())
    }

    pub async fn fail(&self, id: &str, reason: &str) -> ScheduleResult<()> {
        let released;
        {
            let mut state = self.state.write().await;
            let record = require_status(
                &mut state,
                id,
                &[MissionStatus::Running, MissionStatus::Paused],
                "fail",
            )?;
            record.status = MissionStatus::Failed;
            record.failure = Some(reason.to_string());
            released = record.dispatched_agent.take();
            let key = record.mission.idempotency_key.clone();
            if let Some(key) = key {
                state.pending_keys.remove(&key);
            }
        }
        if let Some(agent_id) = released {
            self.agents.release(&agent_id).await;
        }
        self.publish("mission.failed", json!({ "id": id, "reason": reason }));
        emit_event(
            Level::ERROR,
            Component::Scheduler,
            ObservabilityEvent {
                event: "mission.failed",
                mission_id: Some(id),
                workspace_id: None,
                provider_id: None,
                model_id: None,
                status: Some("failed"),
                error_code: None,
                detail: Some(reason),
            },
        );
        self.snapshot(id).await;
        Ok(())
    }

    /// Progress in [0, 1]. Recomputes the ETA from elapsed time and the
    /// completion ratio.
    pub async fn update_progress(&self, id: &str, ratio: f64) -> ScheduleResult<()> {
        if !ratio.is_finite() || !(0.0..=1.0).contains(&ratio) {
            return Err(ScheduleError::Validation(format!(
                "progress must be in [0, 1], got {ratio}"
            )));
        }
        {
            let mut state = self.state.write().await;
            let record = require_status(
                &mut state,
                id,
                &[MissionStatus::Running, MissionStatus::Paused],
                "update_progress",
            )?;
            record.progress = ratio;
            record.eta = match (record.started_at, ratio > 0.0) {
                (Some(started), true) => {
                    let elapsed = Utc::now() - started;
                    let remaining_ms =
                        elapsed.num_milliseconds() as f64 * (1.0 - ratio) / ratio;
                    Some(Utc::now() + chrono::Duration::milliseconds(remaining_ms as i64))
                }
                _ => None,
            };
        }
        self.publish("mission.progress", json!({ "id": id, "progress": ratio }));
        Ok(())
    }

    /// Accumulate actual spend. Crossing the budget marks the mission
    /// exceeded and applies the breach policy.
    pub async fn record_cost(&self, id: &str, amount: f64) -> ScheduleResult<()> {
        if !amount.is_finite() || amount < 0.0 {
            return Err(ScheduleError::Validation(format!(
                "cost must be non-negative, got {amount}"
            )));
        }
        let crossed;
        {
            let mut state = self.state.write().await;
            let record = require_status(
                &mut state,
                id,
                &[MissionStatus::Running, MissionStatus::Paused],
                "record_cost",
            )?;
            record.actual_cost += amount;
            crossed = !record.budget_exceeded && record.actual_cost > record.mission.budget;
            if crossed {
                record.budget_exceeded = true;
            }
        }
        self.publish(
            "mission.cost.recorded",
            json!({ "id": id, "amount": amount }),
        );

        if crossed {
            self.publish("mission.budget.exceeded", json!({ "id": id }));
            emit_event(
                Level::WARN,
                Component::Scheduler,
                ObservabilityEvent {
                    event: "mission.budget.exceeded",
                    mission_id: Some(id),
                    workspace_id: None,
                    provider_id: None,
                    model_id: None,
                    status: None,
                    error_code: None,
                    detail: None,
                },
            );
            match self.config.budget_breach {
                BudgetBreachPolicy::Fail => {
                    self.fail(id, "budget exceeded").await?;
                }
                BudgetBreachPolicy::Pause => {
                    // Already paused missions stay paused
                    let _ = self.pause(id).await;
                }
            }
        }
        Ok(())
    }

    /// Attach caller-defined state carried across pause/resume.
    pub async fn set_state(&self, id: &str, custom: Value) -> ScheduleResult<()> {
        let mut state = self.state.write().await;
        let record = state
            .missions
            .get_mut(id)
            .ok_or_else(|| ScheduleError::NotFound(id.to_string()))?;
        if record.status.is_terminal() {
            return Err(ScheduleError::InvalidState {
                id: id.to_string(),
                status: record.status,
                op: "set_state",
            });
        }
        record.custom_state = custom;
        Ok(())
    }

    pub async fn status(&self, id: &str) -> ScheduleResult<MissionStatusReport> {
        let state = self.state.read().await;
        state
            .missions
            .get(id)
            .map(MissionRecord::report)
            .ok_or_else(|| ScheduleError::NotFound(id.to_string()))
    }

    pub async fn active_missions(&self) -> Vec<MissionStatusReport> {
        let state = self.state.read().await;
        state
            .missions
            .values()
            .filter(|r| matches!(r.status, MissionStatus::Running | MissionStatus::Paused))
            .map(MissionRecord::report)
            .collect()
    }

    /// Queued missions in dispatch order.
    pub async fn queued_missions(&self) -> Vec<MissionStatusReport> {
        let state = self.state.read().await;
        state
            .queue
            .iter()
            .filter_map(|item| state.missions.get(&item.mission_id))
            .map(MissionRecord::report)
            .collect()
    }

    /// Dispatch loop: wakes on the tick interval or a submit, and starts
    /// every queue head an agent slot can take. Dispatched missions run as
    /// independent tasks, so many can be in flight at once.
    pub async fn run(&self, cancel: CancellationToken) {
        let mut interval = tokio::time::interval(self.config.tick_interval);
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = interval.tick() => {}
                _ = self.notify.notified() => {}
            }
            self.drain_queue().await;
        }
    }

    async fn drain_queue(&self) {
        let queued: Vec<String> = {
            let state = self.state.read().await;
            state.queue.iter().map(|i| i.mission_id.clone()).collect()
        };
        for id in queued {
            // Racing lifecycle calls can invalidate entries mid-drain
            let _ = self.try_dispatch(&id).await;
        }
    }

    fn publish(&self, event: &str, properties: Value) {
        self.bus.publish(CoreEvent::new(event, properties));
    }

    // Snapshot the mission's current shape into the context store. First
    // snapshot creates the entry; later ones append versions to it.
    async fn snapshot(&self, id: &str) {
        let (content, entry_id, new_entry) = {
            let state = self.state.read().await;
            let Some(record) = state.missions.get(id) else {
                return;
            };
            let content = json!({
                "mission": record.mission,
                "status": record.status,
                "progress": record.progress,
                "actual_cost": record.actual_cost,
                "budget_exceeded": record.budget_exceeded,
                "plan": record.plan,
                "result": record.result,
                "failure": record.failure,
            });
            let workspace_id = record
                .mission
                .payload
                .get("workspace_id")
                .and_then(|w| w.as_str())
                .unwrap_or("default")
                .to_string();
            let new_entry = NewContextEntry {
                workspace_id,
                domain: record.mission.domain,
                entry_type: "mission_snapshot".to_string(),
                content: content.clone(),
                tags: vec![record.mission.id.clone()],
                relevance_score: None,
            };
            (content, record.snapshot_entry.clone(), new_entry)
        };

        match entry_id {
            Some(entry_id) => {
                let patch = ContextPatch {
                    content: Some(content),
                    ..Default::default()
                };
                if let Err(err) = self
                    .context
                    .update(&entry_id, patch, "scheduler", Some("mission snapshot"))
                    .await
                {
                    warn!(mission = id, error = %err, "mission snapshot update failed");
                }
            }
            None => match self.context.store(new_entry, "scheduler").await {
                Ok(entry) => {
                    let mut state = self.state.write().await;
                    if let Some(record) = state.missions.get_mut(id) {
                        record.snapshot_entry = Some(entry.id);
                    }
                }
                Err(err) => {
                    warn!(mission = id, error = %err, "mission snapshot store failed");
                }
            },
        }
    }
}

fn require_status<'a>(
    state: &'a mut SchedulerState,
    id: &str,
    allowed: &[MissionStatus],
    op: &'static str,
) -> ScheduleResult<&'a mut MissionRecord> {
    let record = state
        .missions
        .get_mut(id)
        .ok_or_else(|| ScheduleError::NotFound(id.to_string()))?;
    if !allowed.contains(&record.status) {
        return Err(ScheduleError::InvalidState {
            id: id.to_string(),
            status: record.status,
            op,
        });
    }
    Ok(record)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agents::AgentHandler;
    use async_trait::async_trait;
    use vantage_types::{AgentCapability, Domain, MissionRequirements, Priority};

    struct Fake {
        output: Value,
    }

    #[async_trait]
    impl AgentHandler for Fake {
        async fn invoke(&self, _mission: &Mission) -> anyhow::Result<Value> {
            Ok(self.output.clone())
        }
    }

    struct Stuck;

    #[async_trait]
    impl AgentHandler for Stuck {
        async fn invoke(&self, _mission: &Mission) -> anyhow::Result<Value> {
            tokio::time::sleep(Duration::from_secs(3600)).await;
            Ok(Value::Null)
        }
    }

    fn capability(id: &str, quality: f64, latency: u64, cost: f64) -> AgentCapability {
        AgentCapability {
            agent_id: id.to_string(),
            capabilities: vec![Domain::Code],
            cost_per_request: cost,
            avg_latency_ms: latency,
            quality_score: quality,
            max_concurrent: 4,
            current_load: 0,
        }
    }

    async fn scheduler_with(
        config: SchedulerConfig,
        agents: &[(AgentCapability, Arc<dyn AgentHandler>)],
    ) -> MissionScheduler {
        let registry = AgentRegistry::new();
        for (cap, handler) in agents {
            registry.register(cap.clone(), handler.clone()).await;
        }
        let context = Arc::new(ContextStore::in_memory().await.unwrap());
        MissionScheduler::new(registry, EventBus::new(), context, config)
    }

    async fn default_scheduler() -> MissionScheduler {
        scheduler_with(
            SchedulerConfig::default(),
            &[(
                capability("coder", 0.9, 500, 0.01),
                Arc::new(Fake {
                    output: json!({"ok": true}),
                }),
            )],
        )
        .await
    }

    fn mission(priority: Priority, budget: f64) -> Mission {
        Mission::new(Domain::Code, priority, budget, json!({}))
    }

    #[tokio::test]
    async fn submit_rejects_non_positive_budget() {
        let scheduler = default_scheduler().await;
        for bad in [0.0, -1.0, f64::NAN] {
            let err = scheduler
                .submit(mission(Priority::Normal, bad))
                .await
                .unwrap_err();
            assert!(matches!(err, ScheduleError::Validation(_)));
        }
        assert!(scheduler.queued_missions().await.is_empty());
    }

    #[tokio::test]
    async fn queue_orders_by_priority_then_deadline_then_fifo() {
        let scheduler = default_scheduler().await;
        let low = mission(Priority::Low, 1.0);
        let mut high_late = mission(Priority::High, 1.0);
        high_late.deadline = Some(Utc::now() + chrono::Duration::hours(2));
        let mut high_soon = mission(Priority::High, 1.0);
        high_soon.deadline = Some(Utc::now() + chrono::Duration::hours(1));

        let low_id = low.id.clone();
        let late_id = high_late.id.clone();
        let soon_id = high_soon.id.clone();

        scheduler.submit(low).await.unwrap();
        scheduler.submit(high_late).await.unwrap();
        scheduler.submit(high_soon).await.unwrap();

        let order: Vec<String> = scheduler
            .queued_missions()
            .await
            .into_iter()
            .map(|r| r.mission_id)
            .collect();
        assert_eq!(order, vec![soon_id, late_id, low_id]);
    }

    #[tokio::test]
    async fn idempotent_resubmission_returns_cached_plan() {
        let scheduler = default_scheduler().await;
        let mut first = mission(Priority::Normal, 1.0);
        first.idempotency_key = Some("job-42".to_string());
        let first_id = first.id.clone();
        let plan = scheduler.submit(first).await.unwrap();

        scheduler.start(&first_id).await.unwrap();
        // Let the spawned handler finish
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(
            scheduler.status(&first_id).await.unwrap().status,
            MissionStatus::Completed
        );

        let mut again = mission(Priority::Normal, 1.0);
        again.idempotency_key = Some("job-42".to_string());
        let replay = scheduler.submit(again).await.unwrap();
        assert_eq!(replay.mission_id, plan.mission_id);
        assert!(scheduler.queued_missions().await.is_empty());
    }

    #[tokio::test]
    async fn in_flight_key_does_not_duplicate_enqueue() {
        let scheduler = default_scheduler().await;
        let mut first = mission(Priority::Normal, 1.0);
        first.idempotency_key = Some("job-7".to_string());
        let plan = scheduler.submit(first).await.unwrap();

        let mut dup = mission(Priority::Normal, 1.0);
        dup.idempotency_key = Some("job-7".to_string());
        let replay = scheduler.submit(dup).await.unwrap();
        assert_eq!(replay.mission_id, plan.mission_id);
        assert_eq!(scheduler.queued_missions().await.len(), 1);
    }

    #[tokio::test]
    async fn queue_full_is_rejected() {
        let scheduler = scheduler_with(
            SchedulerConfig {
                queue_capacity: 1,
                ..SchedulerConfig::default()
            },
            &[(
                capability("coder", 0.9, 500, 0.01),
                Arc::new(Fake { output: json!({}) }),
            )],
        )
        .await;
        scheduler.submit(mission(Priority::Normal, 1.0)).await.unwrap();
        let err = scheduler
            .submit(mission(Priority::Normal, 1.0))
            .await
            .unwrap_err();
        assert!(matches!(err, ScheduleError::QueueFull(1)));
    }

    #[tokio::test]
    async fn planning_prefers_quality_within_budget() {
        let scheduler = scheduler_with(
            SchedulerConfig::default(),
            &[
                (
                    capability("strong", 0.95, 500, 0.05),
                    Arc::new(Fake { output: json!({}) }),
                ),
                (
                    capability("cheap", 0.6, 500, 0.005),
                    Arc::new(Fake { output: json!({}) }),
                ),
            ],
        )
        .await;
        let plan = scheduler
            .submit(mission(Priority::Normal, 10.0))
            .await
            .unwrap();
        assert_eq!(plan.selected_agent, "strong");
        assert_eq!(plan.fallback_agents, vec!["cheap".to_string()]);
    }

    #[tokio::test]
    async fn requirements_filter_candidates() {
        let scheduler = default_scheduler().await;
        let mut m = mission(Priority::Normal, 1.0);
        m.requirements = MissionRequirements {
            min_quality: Some(0.99),
            max_latency_ms: None,
            max_cost: None,
        };
        let err = scheduler.submit(m).await.unwrap_err();
        assert!(matches!(err, ScheduleError::NoCandidate(_)));
    }

    #[tokio::test]
    async fn plan_over_budget_fails_validation() {
        let scheduler = scheduler_with(
            SchedulerConfig::default(),
            &[(
                capability("pricey", 0.9, 500, 5.0),
                Arc::new(Fake { output: json!({}) }),
            )],
        )
        .await;
        let err = scheduler
            .submit(mission(Priority::Normal, 1.0))
            .await
            .unwrap_err();
        assert!(matches!(err, ScheduleError::Validation(_)));
    }

    #[tokio::test]
    async fn cost_accumulates_and_breach_fails_by_default() {
        let scheduler = scheduler_with(
            SchedulerConfig::default(),
            &[(capability("coder", 0.9, 500, 0.01), Arc::new(Stuck))],
        )
        .await;
        let m = mission(Priority::Normal, 0.15);
        let id = m.id.clone();
        scheduler.submit(m).await.unwrap();
        scheduler.start(&id).await.unwrap();

        scheduler.record_cost(&id, 0.05).await.unwrap();
        scheduler.record_cost(&id, 0.08).await.unwrap();
        scheduler.record_cost(&id, 0.07).await.unwrap();

        let report = scheduler.status(&id).await.unwrap();
        assert!((report.actual_cost - 0.20).abs() < 1e-9);
        assert!(report.budget_exceeded);
        assert_eq!(report.status, MissionStatus::Failed);
    }

    #[tokio::test]
    async fn budget_breach_can_pause_instead() {
        let scheduler = scheduler_with(
            SchedulerConfig {
                budget_breach: BudgetBreachPolicy::Pause,
                ..SchedulerConfig::default()
            },
            &[(capability("coder", 0.9, 500, 0.01), Arc::new(Stuck))],
        )
        .await;
        let m = mission(Priority::Normal, 0.1);
        let id = m.id.clone();
        scheduler.submit(m).await.unwrap();
        scheduler.start(&id).await.unwrap();
        scheduler.record_cost(&id, 0.2).await.unwrap();

        let report = scheduler.status(&id).await.unwrap();
        assert!(report.budget_exceeded);
        assert_eq!(report.status, MissionStatus::Paused);
    }

    #[tokio::test]
    async fn pause_preserves_progress_and_custom_state() {
        let scheduler = scheduler_with(
            SchedulerConfig::default(),
            &[(capability("coder", 0.9, 500, 0.01), Arc::new(Stuck))],
        )
        .await;
        let m = mission(Priority::Normal, 1.0);
        let id = m.id.clone();
        scheduler.submit(m).await.unwrap();
        scheduler.start(&id).await.unwrap();

        scheduler.update_progress(&id, 0.4).await.unwrap();
        scheduler
            .set_state(&id, json!({"phase": "analysis"}))
            .await
            .unwrap();
        scheduler.pause(&id).await.unwrap();

        let paused = scheduler.status(&id).await.unwrap();
        assert_eq!(paused.status, MissionStatus::Paused);
        assert!((paused.progress - 0.4).abs() < f64::EPSILON);
        assert_eq!(paused.custom_state, json!({"phase": "analysis"}));

        scheduler.resume(&id).await.unwrap();
        let resumed = scheduler.status(&id).await.unwrap();
        assert_eq!(resumed.status, MissionStatus::Running);
        assert!((resumed.progress - 0.4).abs() < f64::EPSILON);
    }

    #[tokio::test]
    async fn cancel_queued_removes_without_side_effects() {
        let scheduler = default_scheduler().await;
        let m = mission(Priority::Normal, 1.0);
        let id = m.id.clone();
        scheduler.submit(m).await.unwrap();
        scheduler.cancel(&id).await.unwrap();

        assert!(scheduler.queued_missions().await.is_empty());
        assert_eq!(
            scheduler.status(&id).await.unwrap().status,
            MissionStatus::Cancelled
        );
        // Terminal: no further transitions
        let err = scheduler.start(&id).await.unwrap_err();
        assert!(matches!(err, ScheduleError::InvalidState { .. }));
    }

    #[tokio::test]
    async fn cancel_running_releases_slot_and_discards_late_result() {
        let scheduler = scheduler_with(
            SchedulerConfig::default(),
            &[(
                AgentCapability {
                    max_concurrent: 1,
                    ..capability("coder", 0.9, 500, 0.01)
                },
                Arc::new(Stuck),
            )],
        )
        .await;
        let m = mission(Priority::Normal, 1.0);
        let id = m.id.clone();
        scheduler.submit(m).await.unwrap();
        scheduler.start(&id).await.unwrap();
        scheduler.cancel(&id).await.unwrap();

        // Slot released: another mission can start
        let m2 = mission(Priority::Normal, 1.0);
        let id2 = m2.id.clone();
        scheduler.submit(m2).await.unwrap();
        scheduler.start(&id2).await.unwrap();

        // A late completion against the cancelled mission is rejected
        let err = scheduler.complete(&id, json!({})).await.unwrap_err();
        assert!(matches!(err, ScheduleError::InvalidState { .. }));
        assert_eq!(
            scheduler.status(&id).await.unwrap().status,
            MissionStatus::Cancelled
        );
    }

    #[tokio::test]
    async fn update_progress_validates_range_and_sets_eta() {
        let scheduler = scheduler_with(
            SchedulerConfig::default(),
            &[(capability("coder", 0.9, 500, 0.01), Arc::new(Stuck))],
        )
        .await;
        let m = mission(Priority::Normal, 1.0);
        let id = m.id.clone();
        scheduler.submit(m).await.unwrap();
        scheduler.start(&id).await.unwrap();

        assert!(scheduler.update_progress(&id, 1.5).await.is_err());
        assert!(scheduler.update_progress(&id, -0.1).await.is_err());

        tokio::time::sleep(Duration::from_millis(20)).await;
        scheduler.update_progress(&id, 0.5).await.unwrap();
        let report = scheduler.status(&id).await.unwrap();
        assert!(report.eta.is_some());
    }

    #[tokio::test]
    async fn run_loop_dispatches_submitted_missions() {
        let scheduler = scheduler_with(
            SchedulerConfig {
                tick_interval: Duration::from_millis(10),
                ..SchedulerConfig::default()
            },
            &[(
                capability("coder", 0.9, 500, 0.01),
                Arc::new(Fake {
                    output: json!({"done": true}),
                }),
            )],
        )
        .await;

        let mut events = scheduler.bus.subscribe();
        let cancel = CancellationToken::new();
        let loop_handle = {
            let scheduler = scheduler.clone();
            let cancel = cancel.clone();
            tokio::spawn(async move { scheduler.run(cancel).await })
        };

        let m = mission(Priority::Normal, 1.0);
        let id = m.id.clone();
        scheduler.submit(m).await.unwrap();

        let completed = tokio::time::timeout(Duration::from_secs(2), async {
            loop {
                let event = events.recv().await.expect("event stream");
                if event.event_type == "mission.completed" {
                    break event;
                }
            }
        })
        .await
        .expect("mission completes via the run loop");
        assert_eq!(
            completed.properties.get("id").and_then(|v| v.as_str()),
            Some(id.as_str())
        );

        cancel.cancel();
        loop_handle.await.unwrap();
    }

    #[tokio::test]
    async fn snapshots_version_in_context_store() {
        let scheduler = scheduler_with(
            SchedulerConfig::default(),
            &[(capability("coder", 0.9, 500, 0.01), Arc::new(Stuck))],
        )
        .await;
        let m = mission(Priority::Normal, 1.0);
        let id = m.id.clone();
        scheduler.submit(m).await.unwrap();
        scheduler.start(&id).await.unwrap();
        scheduler.pause(&id).await.unwrap();

        let entry_id = {
            let state = scheduler.state.read().await;
            state.missions[&id].snapshot_entry.clone().unwrap()
        };
        let history = scheduler
            .context
            .get_version_history(&entry_id)
            .await
            .unwrap();
        // submitted, started, paused
        assert_eq!(history.len(), 3);
        assert_eq!(
            history[2].content.get("status"),
            Some(&json!("paused"))
        );
    }
}
