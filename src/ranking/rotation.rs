//! Rotation Decision Engine — per-agent hysteresis state machine.
//!
//! Tracks an explicit {tier, consecutive counters} state per agent instead of
//! rescanning ranking history, and proposes promote/demote/suspend/reactivate
//! transitions only after the configured number of consecutive confirming
//! periods. Decisions are created `Proposed`; applying one is the external
//! orchestrator's confirmation step, never the engine's.

use chrono::{DateTime, Utc};
use std::collections::{BTreeMap, BTreeSet};
use tracing::info;
use uuid::Uuid;

use crate::config::RotationConfig;
use crate::domain::{
    DecisionStatus, DecisionType, OperationalTier, PerformanceRecord, RankingEntry,
    RotationDecision,
};
use crate::error::{MetablendError, Result};

/// Hysteresis state for one agent.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RotationState {
    pub tier: OperationalTier,
    /// Consecutive periods at below_average or bottom
    pub consecutive_below: u32,
    /// Consecutive periods at standard or better
    pub consecutive_ok: u32,
}

impl Default for RotationState {
    fn default() -> Self {
        Self {
            tier: OperationalTier::Active,
            consecutive_below: 0,
            consecutive_ok: 0,
        }
    }
}

pub struct RotationEngine {
    config: RotationConfig,
    states: BTreeMap<String, RotationState>,
}

impl RotationEngine {
    pub fn new(config: RotationConfig) -> Self {
        Self {
            config,
            states: BTreeMap::new(),
        }
    }

    /// Register an agent as known, starting it in the active tier.
    pub fn register_agent(&mut self, agent_id: &str) {
        self.states
            .entry(agent_id.to_string())
            .or_insert_with(RotationState::default);
    }

    /// Current hysteresis state for an agent, if known.
    pub fn state(&self, agent_id: &str) -> Option<&RotationState> {
        self.states.get(agent_id)
    }

    /// Evaluate one ranking period and propose rotation decisions.
    ///
    /// Every agent in the snapshot gets a decision, Maintain included, so the
    /// audit trail has no gaps. An entry referencing an agent outside
    /// `known_agents` is a fatal configuration error: rotation must never act
    /// on an agent the tracker has not observed.
    pub fn evaluate(
        &mut self,
        period: &str,
        entries: &[RankingEntry],
        known_agents: &BTreeSet<String>,
        records: &BTreeMap<String, PerformanceRecord>,
        now: DateTime<Utc>,
    ) -> Result<Vec<RotationDecision>> {
        let mut decisions = Vec::with_capacity(entries.len());

        for entry in entries {
            if !known_agents.contains(&entry.agent_id) {
                return Err(MetablendError::Configuration(format!(
                    "rotation references unknown agent: {}",
                    entry.agent_id
                )));
            }

            let state = self
                .states
                .entry(entry.agent_id.clone())
                .or_insert_with(RotationState::default);

            if entry.performance_tier.is_sub_threshold() {
                state.consecutive_below += 1;
                state.consecutive_ok = 0;
            } else {
                state.consecutive_ok += 1;
                state.consecutive_below = 0;
            }

            let previous_tier = state.tier;
            let (decision_type, new_tier, reason) = match state.tier {
                OperationalTier::Active if state.consecutive_below >= self.config.demote_after => (
                    DecisionType::Demote,
                    OperationalTier::Probation,
                    format!(
                        "{} consecutive sub-threshold periods (tier {})",
                        state.consecutive_below, entry.performance_tier
                    ),
                ),
                OperationalTier::Probation
                    if state.consecutive_below >= self.config.suspend_after =>
                {
                    (
                        DecisionType::Suspend,
                        OperationalTier::Suspended,
                        format!(
                            "{} further sub-threshold periods on probation",
                            state.consecutive_below
                        ),
                    )
                }
                OperationalTier::Probation
                    if state.consecutive_ok >= self.config.promote_after =>
                {
                    (
                        DecisionType::Promote,
                        OperationalTier::Active,
                        format!(
                            "{} consecutive periods at standard or better",
                            state.consecutive_ok
                        ),
                    )
                }
                OperationalTier::Suspended
                    if state.consecutive_ok >= self.config.promote_after =>
                {
                    (
                        DecisionType::Reactivate,
                        OperationalTier::Probation,
                        format!(
                            "{} consecutive periods at standard or better while suspended",
                            state.consecutive_ok
                        ),
                    )
                }
                tier => (
                    DecisionType::Maintain,
                    tier,
                    format!(
                        "rank {} ({}), below={} ok={}",
                        entry.rank, entry.performance_tier, state.consecutive_below,
                        state.consecutive_ok
                    ),
                ),
            };

            if decision_type != DecisionType::Maintain {
                // Transition consumes the streak that triggered it
                state.tier = new_tier;
                state.consecutive_below = 0;
                state.consecutive_ok = 0;
                info!(
                    period,
                    agent_id = %entry.agent_id,
                    decision = %decision_type,
                    from = %previous_tier,
                    to = %new_tier,
                    "rotation transition proposed"
                );
            }

            decisions.push(RotationDecision {
                id: Uuid::new_v4(),
                period: period.to_string(),
                agent_id: entry.agent_id.clone(),
                decision_type,
                previous_tier,
                new_tier,
                reason,
                metrics_snapshot: records.get(&entry.agent_id).cloned(),
                status: DecisionStatus::Proposed,
                created_at: now,
                applied_at: None,
            });
        }

        Ok(decisions)
    }

    /// Confirmation callback from the external orchestrator once it has
    /// enforced a decision. Unknown agents are a fatal configuration error.
    pub fn confirm_applied(
        &self,
        decision: &RotationDecision,
        at: DateTime<Utc>,
    ) -> Result<RotationDecision> {
        if !self.states.contains_key(&decision.agent_id) {
            return Err(MetablendError::Configuration(format!(
                "cannot apply decision for unknown agent: {}",
                decision.agent_id
            )));
        }
        let mut applied = decision.clone();
        applied.status = DecisionStatus::Applied;
        applied.applied_at = Some(at);
        Ok(applied)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::PerformanceTier;

    fn entry(agent: &str, rank: u32, tier: PerformanceTier) -> RankingEntry {
        RankingEntry {
            period: "p".to_string(),
            agent_id: agent.to_string(),
            rank,
            score: 0.5,
            score_change: 0.0,
            rank_change: 0,
            has_previous: true,
            performance_tier: tier,
            is_active: true,
        }
    }

    fn engine() -> RotationEngine {
        RotationEngine::new(RotationConfig::default())
    }

    fn known(agents: &[&str]) -> BTreeSet<String> {
        agents.iter().map(|a| a.to_string()).collect()
    }

    fn run_period(
        e: &mut RotationEngine,
        period: &str,
        agent: &str,
        tier: PerformanceTier,
    ) -> RotationDecision {
        let decisions = e
            .evaluate(
                period,
                &[entry(agent, 1, tier)],
                &known(&[agent]),
                &BTreeMap::new(),
                Utc::now(),
            )
            .unwrap();
        decisions.into_iter().next().unwrap()
    }

    #[test]
    fn test_no_demotion_after_single_bad_period() {
        let mut e = engine();
        e.register_agent("a");
        let d = run_period(&mut e, "p1", "a", PerformanceTier::Bottom);
        assert_eq!(d.decision_type, DecisionType::Maintain);
        assert_eq!(e.state("a").unwrap().tier, OperationalTier::Active);
    }

    #[test]
    fn test_demotion_requires_three_consecutive_periods() {
        let mut e = engine();
        e.register_agent("a");
        assert_eq!(
            run_period(&mut e, "p1", "a", PerformanceTier::BelowAverage).decision_type,
            DecisionType::Maintain
        );
        assert_eq!(
            run_period(&mut e, "p2", "a", PerformanceTier::Bottom).decision_type,
            DecisionType::Maintain
        );
        let d = run_period(&mut e, "p3", "a", PerformanceTier::BelowAverage);
        assert_eq!(d.decision_type, DecisionType::Demote);
        assert_eq!(d.previous_tier, OperationalTier::Active);
        assert_eq!(d.new_tier, OperationalTier::Probation);
        assert_eq!(d.status, DecisionStatus::Proposed);
        assert!(d.applied_at.is_none());
    }

    #[test]
    fn test_recovery_resets_demotion_streak() {
        let mut e = engine();
        e.register_agent("a");
        run_period(&mut e, "p1", "a", PerformanceTier::Bottom);
        run_period(&mut e, "p2", "a", PerformanceTier::Bottom);
        // One good period wipes the streak
        run_period(&mut e, "p3", "a", PerformanceTier::Standard);
        run_period(&mut e, "p4", "a", PerformanceTier::Bottom);
        run_period(&mut e, "p5", "a", PerformanceTier::Bottom);
        let d = run_period(&mut e, "p6", "a", PerformanceTier::Bottom);
        assert_eq!(d.decision_type, DecisionType::Demote);
    }

    #[test]
    fn test_probation_to_promote_on_third_standard_period() {
        let mut e = engine();
        e.register_agent("a");
        // Drive the agent onto probation
        for p in ["p1", "p2", "p3"] {
            run_period(&mut e, p, "a", PerformanceTier::Bottom);
        }
        assert_eq!(e.state("a").unwrap().tier, OperationalTier::Probation);

        // Promotion arrives exactly on the third standard period
        assert_eq!(
            run_period(&mut e, "p4", "a", PerformanceTier::Standard).decision_type,
            DecisionType::Maintain
        );
        assert_eq!(
            run_period(&mut e, "p5", "a", PerformanceTier::Standard).decision_type,
            DecisionType::Maintain
        );
        let d = run_period(&mut e, "p6", "a", PerformanceTier::Standard);
        assert_eq!(d.decision_type, DecisionType::Promote);
        assert_eq!(d.new_tier, OperationalTier::Active);
    }

    #[test]
    fn test_probation_to_suspended_needs_further_streak() {
        let mut e = engine();
        e.register_agent("a");
        for p in ["p1", "p2", "p3"] {
            run_period(&mut e, p, "a", PerformanceTier::Bottom);
        }
        assert_eq!(e.state("a").unwrap().tier, OperationalTier::Probation);

        // The streak that caused the demotion does not carry over
        assert_eq!(
            run_period(&mut e, "p4", "a", PerformanceTier::Bottom).decision_type,
            DecisionType::Maintain
        );
        assert_eq!(
            run_period(&mut e, "p5", "a", PerformanceTier::Bottom).decision_type,
            DecisionType::Maintain
        );
        let d = run_period(&mut e, "p6", "a", PerformanceTier::Bottom);
        assert_eq!(d.decision_type, DecisionType::Suspend);
        assert_eq!(d.new_tier, OperationalTier::Suspended);
    }

    #[test]
    fn test_suspended_reactivates_to_probation() {
        let mut e = engine();
        e.register_agent("a");
        for p in ["p1", "p2", "p3", "p4", "p5", "p6"] {
            run_period(&mut e, p, "a", PerformanceTier::Bottom);
        }
        assert_eq!(e.state("a").unwrap().tier, OperationalTier::Suspended);

        for p in ["p7", "p8"] {
            assert_eq!(
                run_period(&mut e, p, "a", PerformanceTier::Standard).decision_type,
                DecisionType::Maintain
            );
        }
        let d = run_period(&mut e, "p9", "a", PerformanceTier::AboveAverage);
        assert_eq!(d.decision_type, DecisionType::Reactivate);
        assert_eq!(d.new_tier, OperationalTier::Probation);
    }

    #[test]
    fn test_unknown_agent_is_fatal() {
        let mut e = engine();
        let err = e
            .evaluate(
                "p1",
                &[entry("ghost", 1, PerformanceTier::Standard)],
                &known(&["real"]),
                &BTreeMap::new(),
                Utc::now(),
            )
            .unwrap_err();
        assert!(matches!(err, MetablendError::Configuration(_)));
        assert!(!err.is_recoverable());
    }

    #[test]
    fn test_confirm_applied_flips_status() {
        let mut e = engine();
        e.register_agent("a");
        let d = run_period(&mut e, "p1", "a", PerformanceTier::Standard);
        let at = Utc::now();
        let applied = e.confirm_applied(&d, at).unwrap();
        assert_eq!(applied.status, DecisionStatus::Applied);
        assert_eq!(applied.applied_at, Some(at));
        // Original proposal is untouched
        assert_eq!(d.status, DecisionStatus::Proposed);
    }

    #[test]
    fn test_maintain_decisions_recorded_for_audit() {
        let mut e = engine();
        e.register_agent("a");
        e.register_agent("b");
        let decisions = e
            .evaluate(
                "p1",
                &[
                    entry("a", 1, PerformanceTier::Top),
                    entry("b", 2, PerformanceTier::Bottom),
                ],
                &known(&["a", "b"]),
                &BTreeMap::new(),
                Utc::now(),
            )
            .unwrap();
        assert_eq!(decisions.len(), 2);
        assert!(decisions
            .iter()
            .all(|d| d.decision_type == DecisionType::Maintain));
    }
}
