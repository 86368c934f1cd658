//! Performance scoring and team health analysis.
//!
//! Member scores combine task completion, speed against the team's rolling
//! average duration, failure-rate quality and collaboration on a 0-100 scale:
//! `overall = 0.4*completion + 0.3*speed + 0.2*quality + 0.1*collaboration`.

use std::sync::Arc;

use ensemble_core::model::{MembershipState, TaskStatus};
use ensemble_core::{CoreError, StateStore};
use serde::{Deserialize, Serialize};

use crate::Result;

/// Thresholds driving underperformer detection and scaling triggers.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PerformanceThresholds {
    pub min_performance_score: u32,
    pub min_task_completion_rate: u32,
    pub min_collaboration_score: u32,
    pub max_avg_task_duration_multiplier: f64,
    pub ready_tasks_threshold: usize,
    pub capacity_utilization_high: u32,
    pub capacity_utilization_low: u32,
}

impl Default for PerformanceThresholds {
    fn default() -> Self {
        Self {
            min_performance_score: 60,
            min_task_completion_rate: 50,
            min_collaboration_score: 40,
            max_avg_task_duration_multiplier: 2.0,
            ready_tasks_threshold: 10,
            capacity_utilization_high: 90,
            capacity_utilization_low: 30,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Recommendation {
    Keep,
    Improve,
    Standby,
    Replace,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Trend {
    Improving,
    Stable,
    Degrading,
}

/// Per-agent performance breakdown.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentPerformanceScore {
    pub agent_id: String,
    pub persona_id: String,
    pub overall_score: u32,
    pub task_completion_score: u32,
    pub speed_score: u32,
    pub quality_score: u32,
    pub collaboration_score: u32,
    pub total_tasks: u32,
    pub completed_tasks: u32,
    pub failed_tasks: u32,
    pub avg_task_duration_hours: Option<f64>,
    pub grade: String,
    pub strengths: Vec<String>,
    pub improvements: Vec<String>,
    pub trend: Trend,
    pub is_underperformer: bool,
    pub recommendation: Recommendation,
    pub issues: Vec<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ScalingDirective {
    ScaleUp,
    ScaleDown,
    Maintain,
}

/// Team-level health summary.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TeamHealthMetrics {
    pub team_id: String,
    pub health_score: u32,
    pub total_members: usize,
    pub active_members: usize,
    pub standby_members: usize,
    pub retired_members: usize,
    pub ready_tasks: usize,
    pub running_tasks: usize,
    pub capacity_utilization: u32,
    pub avg_team_performance: u32,
    pub underperformers_count: usize,
    pub top_performers_count: usize,
    pub scaling_recommendation: ScalingDirective,
    pub recommended_actions: Vec<String>,
    pub issues: Vec<String>,
}

pub struct PerformanceAnalyzer {
    store: Arc<StateStore>,
    thresholds: PerformanceThresholds,
}

impl PerformanceAnalyzer {
    pub fn new(store: Arc<StateStore>) -> Self {
        Self {
            store,
            thresholds: PerformanceThresholds::default(),
        }
    }

    pub fn with_thresholds(mut self, thresholds: PerformanceThresholds) -> Self {
        self.thresholds = thresholds;
        self
    }

    pub fn analyze_agent(&self, team_id: &str, agent_id: &str) -> Result<AgentPerformanceScore> {
        let member = self.store.get_member(agent_id)?;
        if member.team_id != team_id {
            return Err(CoreError::NotFound(format!(
                "member {agent_id} in team {team_id}"
            ))
            .into());
        }
        let team_avg_duration = self.team_average_duration(team_id)?;
        let perf = &member.performance;

        let completion_rate = if perf.total_tasks == 0 {
            100
        } else {
            (perf.completed_tasks * 100) / perf.total_tasks
        };
        let completion_score = completion_rate.min(100);
        let speed_score = speed_score(perf.average_task_duration_hours, team_avg_duration);
        let quality_score = quality_score(perf.completed_tasks, perf.failed_tasks);
        let collaboration_score = perf.collaboration_score.min(100);

        let overall = (completion_score as f64 * 0.4
            + speed_score as f64 * 0.3
            + quality_score as f64 * 0.2
            + collaboration_score as f64 * 0.1) as u32;

        let mut issues = Vec::new();
        if overall < self.thresholds.min_performance_score {
            issues.push(format!("Overall score too low ({overall}/100)"));
        }
        if completion_score < self.thresholds.min_task_completion_rate {
            issues.push(format!("Low task completion rate ({completion_score}%)"));
        }
        if quality_score < 50 {
            issues.push(format!(
                "High task failure rate (quality score: {quality_score}/100)"
            ));
        }
        if collaboration_score < self.thresholds.min_collaboration_score {
            issues.push(format!("Low collaboration ({collaboration_score}/100)"));
        }
        if let (Some(duration), Some(team_avg)) =
            (perf.average_task_duration_hours, team_avg_duration)
        {
            if duration > team_avg * self.thresholds.max_avg_task_duration_multiplier {
                issues.push(format!(
                    "Tasks taking too long ({duration:.1}h vs team avg {team_avg:.1}h)"
                ));
            }
        }
        let is_underperformer = !issues.is_empty();
        let recommendation = if !is_underperformer {
            Recommendation::Keep
        } else if overall >= 50 {
            Recommendation::Improve
        } else if overall >= 30 {
            Recommendation::Standby
        } else {
            Recommendation::Replace
        };

        let components = [
            ("task completion", completion_score),
            ("speed", speed_score),
            ("quality", quality_score),
            ("collaboration", collaboration_score),
        ];
        let strengths = components
            .iter()
            .filter(|(_, score)| *score >= 85)
            .map(|(name, _)| name.to_string())
            .collect();
        let improvements = components
            .iter()
            .filter(|(_, score)| *score < 60)
            .map(|(name, _)| name.to_string())
            .collect();

        Ok(AgentPerformanceScore {
            agent_id: agent_id.to_string(),
            persona_id: member.persona_id,
            overall_score: overall,
            task_completion_score: completion_score,
            speed_score,
            quality_score,
            collaboration_score,
            total_tasks: perf.total_tasks,
            completed_tasks: perf.completed_tasks,
            failed_tasks: perf.failed_tasks,
            avg_task_duration_hours: perf.average_task_duration_hours,
            grade: grade_for(overall),
            strengths,
            improvements,
            trend: self.trend_for(team_id, agent_id)?,
            is_underperformer,
            recommendation,
            issues,
        })
    }

    /// Recent-versus-prior success on dispatched tasks decides the trend.
    fn trend_for(&self, team_id: &str, agent_id: &str) -> Result<Trend> {
        let tasks: Vec<_> = self
            .store
            .list_tasks(team_id, None)?
            .into_iter()
            .filter(|t| {
                t.assigned_to.as_deref() == Some(agent_id)
                    && matches!(t.status, TaskStatus::Completed | TaskStatus::Failed)
            })
            .collect();
        if tasks.len() < 4 {
            return Ok(Trend::Stable);
        }
        let half = tasks.len() / 2;
        let rate = |slice: &[ensemble_core::model::Task]| {
            let done = slice
                .iter()
                .filter(|t| t.status == TaskStatus::Completed)
                .count();
            done as f64 / slice.len() as f64
        };
        let earlier = rate(&tasks[..half]);
        let recent = rate(&tasks[half..]);
        Ok(if recent > earlier + 0.1 {
            Trend::Improving
        } else if recent + 0.1 < earlier {
            Trend::Degrading
        } else {
            Trend::Stable
        })
    }

    fn team_average_duration(&self, team_id: &str) -> Result<Option<f64>> {
        let members = self
            .store
            .list_members(team_id, Some(MembershipState::Active))?;
        let durations: Vec<f64> = members
            .iter()
            .filter_map(|m| m.performance.average_task_duration_hours)
            .collect();
        if durations.is_empty() {
            return Ok(None);
        }
        Ok(Some(durations.iter().sum::<f64>() / durations.len() as f64))
    }

    pub fn underperformers(&self, team_id: &str) -> Result<Vec<AgentPerformanceScore>> {
        let mut scores: Vec<_> = self
            .store
            .list_members(team_id, Some(MembershipState::Active))?
            .into_iter()
            .filter_map(|m| self.analyze_agent(team_id, &m.agent_id).ok())
            .filter(|s| s.is_underperformer)
            .collect();
        scores.sort_by_key(|s| s.overall_score);
        Ok(scores)
    }

    /// Agents recommended for replacement, with the reason.
    pub fn replacement_candidates(&self, team_id: &str) -> Result<Vec<(String, String)>> {
        Ok(self
            .underperformers(team_id)?
            .into_iter()
            .filter(|p| p.recommendation == Recommendation::Replace)
            .map(|p| {
                let reason = format!(
                    "Low performance (score: {}/100). Issues: {}",
                    p.overall_score,
                    p.issues.join(", ")
                );
                (p.agent_id, reason)
            })
            .collect())
    }

    pub fn analyze_team_health(&self, team_id: &str) -> Result<TeamHealthMetrics> {
        let all = self.store.list_members(team_id, None)?;
        let active = self
            .store
            .list_members(team_id, Some(MembershipState::Active))?;
        let standby = self
            .store
            .list_members(team_id, Some(MembershipState::OnStandby))?;
        let retired = self
            .store
            .list_members(team_id, Some(MembershipState::Retired))?;
        let ready_tasks = self.store.list_tasks(team_id, Some(TaskStatus::Ready))?.len();
        let running_tasks = self
            .store
            .list_tasks(team_id, Some(TaskStatus::Running))?
            .len();

        let capacity_utilization = if active.is_empty() {
            0
        } else {
            (((running_tasks * 100) / active.len()) as u32).min(100)
        };

        let scores: Vec<AgentPerformanceScore> = active
            .iter()
            .filter_map(|m| self.analyze_agent(team_id, &m.agent_id).ok())
            .collect();
        let avg_team_performance = if scores.is_empty() {
            0
        } else {
            scores.iter().map(|s| s.overall_score).sum::<u32>() / scores.len() as u32
        };
        let underperformers = scores.iter().filter(|s| s.is_underperformer).count();
        let top_performers = scores.iter().filter(|s| s.overall_score >= 85).count();

        let health_score = team_health_score(
            avg_team_performance,
            underperformers,
            active.len(),
            capacity_utilization,
            ready_tasks,
        );

        let (scaling, actions, issues) = self.scaling_recommendation(
            ready_tasks,
            active.len(),
            capacity_utilization,
            underperformers,
        );

        Ok(TeamHealthMetrics {
            team_id: team_id.to_string(),
            health_score,
            total_members: all.len(),
            active_members: active.len(),
            standby_members: standby.len(),
            retired_members: retired.len(),
            ready_tasks,
            running_tasks,
            capacity_utilization,
            avg_team_performance,
            underperformers_count: underperformers,
            top_performers_count: top_performers,
            scaling_recommendation: scaling,
            recommended_actions: actions,
            issues,
        })
    }

    fn scaling_recommendation(
        &self,
        ready_tasks: usize,
        active_members: usize,
        capacity_utilization: u32,
        underperformers: usize,
    ) -> (ScalingDirective, Vec<String>, Vec<String>) {
        let mut actions = Vec::new();
        let mut issues = Vec::new();

        let mut scale_up = false;
        if ready_tasks > self.thresholds.ready_tasks_threshold {
            scale_up = true;
            issues.push(format!("High task backlog ({ready_tasks} ready tasks)"));
        }
        if capacity_utilization > self.thresholds.capacity_utilization_high {
            scale_up = true;
            issues.push(format!("Team overloaded ({capacity_utilization}% capacity)"));
        }

        let scale_down =
            capacity_utilization < self.thresholds.capacity_utilization_low && ready_tasks < 3;
        if scale_down && !scale_up {
            issues.push(format!(
                "Team underutilized ({capacity_utilization}% capacity)"
            ));
        }

        if scale_up {
            actions.push(format!("Add {} more team members", (ready_tasks / 5).max(2)));
            if underperformers > 0 {
                actions.push(format!(
                    "Consider replacing {underperformers} underperformers first"
                ));
            }
            (ScalingDirective::ScaleUp, actions, issues)
        } else if scale_down {
            actions.push(format!(
                "Move {} members to standby",
                (active_members / 3).max(1)
            ));
            (ScalingDirective::ScaleDown, actions, issues)
        } else {
            if underperformers > 0 {
                actions.push(format!("Address {underperformers} underperformers"));
            } else {
                actions.push("Team is performing well, maintain current composition".to_string());
            }
            (ScalingDirective::Maintain, actions, issues)
        }
    }
}

fn grade_for(score: u32) -> String {
    match score {
        95..=100 => "A+",
        90..=94 => "A",
        80..=89 => "B",
        70..=79 => "C",
        60..=69 => "D",
        _ => "F",
    }
    .to_string()
}

/// Speed relative to the team average, on a piecewise curve: 30% faster caps
/// at 100, up to 50% slower degrades linearly, beyond that falls off harder.
fn speed_score(agent_duration: Option<f64>, team_avg: Option<f64>) -> u32 {
    let (Some(duration), Some(avg)) = (agent_duration, team_avg) else {
        return 70;
    };
    if avg <= 0.0 {
        return 70;
    }
    let ratio = duration / avg;
    let score = if ratio <= 0.7 {
        100.0
    } else if ratio <= 1.0 {
        100.0 - (ratio - 0.7) * 100.0
    } else if ratio <= 1.5 {
        70.0 - (ratio - 1.0) * 100.0
    } else {
        40.0 - (ratio - 1.5) * 50.0
    };
    score.clamp(0.0, 100.0) as u32
}

/// Failure-rate step function: <=5% is perfect, >30% collapses.
fn quality_score(completed: u32, failed: u32) -> u32 {
    let total = completed + failed;
    if total == 0 {
        return 100;
    }
    let failure_rate = (failed as f64 / total as f64) * 100.0;
    if failure_rate <= 5.0 {
        100
    } else if failure_rate <= 10.0 {
        90
    } else if failure_rate <= 20.0 {
        70
    } else if failure_rate <= 30.0 {
        50
    } else {
        ((50.0 - (failure_rate - 30.0) * 2.0).max(0.0)) as u32
    }
}

fn team_health_score(
    avg_team_perf: u32,
    underperformers: usize,
    active_count: usize,
    capacity_utilization: u32,
    ready_tasks: usize,
) -> u32 {
    let mut health = avg_team_perf as i64;
    if active_count > 0 {
        let ratio = underperformers as f64 / active_count as f64;
        health -= (ratio * 30.0) as i64;
    }
    if capacity_utilization > 95 {
        health -= 20;
    } else if capacity_utilization < 20 {
        health -= 10;
    }
    if ready_tasks > 20 {
        health -= 15;
    } else if ready_tasks > 10 {
        health -= 5;
    }
    health.clamp(0, 100) as u32
}
