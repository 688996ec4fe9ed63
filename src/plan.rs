//! Interview plan and transcript data model
//!
//! These types cross the boundary to the surrounding application: the plan
//! collaborator supplies an `InterviewPlan` and `CandidateIdentity` at start,
//! and the reporting collaborator consumes the final `Transcript`.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use uuid::Uuid;

/// One stage of the interview: a question prompt plus its budgets.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Stage {
    /// Prompt template spoken by the agent. `{name}` expands to the
    /// candidate's name.
    pub prompt: String,
    /// Follow-up re-prompts allowed for this stage before advancing.
    pub expected_follow_ups: u32,
    /// Soft time budget for the stage. Informational; the bridge does not
    /// cut a candidate off mid-answer.
    #[serde(with = "duration_secs")]
    pub time_budget: Duration,
}

/// The ordered interview script. Read-only to the bridge.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InterviewPlan {
    pub stages: Vec<Stage>,
    /// Opening utterance template, spoken before the first stage when set.
    #[serde(default)]
    pub greeting: Option<String>,
    /// Closing utterance template, spoken after the last stage when set.
    #[serde(default)]
    pub closing: Option<String>,
}

impl InterviewPlan {
    pub fn stage(&self, index: usize) -> Option<&Stage> {
        self.stages.get(index)
    }

    pub fn len(&self) -> usize {
        self.stages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.stages.is_empty()
    }
}

/// Who the interview is with, supplied by the plan collaborator.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CandidateIdentity {
    pub name: String,
    pub identifier: String,
}

/// One uninterrupted span of speech by a single speaker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Speaker {
    Agent,
    Candidate,
    SupervisorOverride,
}

/// Append-only record of one turn. Never edited after the fact.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TurnRecord {
    pub speaker: Speaker,
    pub text: String,
    pub started_at: DateTime<Utc>,
    pub ended_at: DateTime<Utc>,
    pub stage_index: usize,
}

/// Terminal disposition of a supervisor instruction.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum InstructionStatus {
    Pending,
    Applied,
    Dropped { reason: String },
}

/// A free-text steering directive from a human supervisor. Queued on
/// receipt and consumed at the next safe injection point; never lost
/// silently.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SupervisorInstruction {
    pub id: Uuid,
    pub text: String,
    pub received_at: DateTime<Utc>,
    pub applied_at: Option<DateTime<Utc>>,
    pub status: InstructionStatus,
}

impl SupervisorInstruction {
    pub fn new(text: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            text: text.into(),
            received_at: Utc::now(),
            applied_at: None,
            status: InstructionStatus::Pending,
        }
    }

    pub fn mark_applied(&mut self) {
        self.applied_at = Some(Utc::now());
        self.status = InstructionStatus::Applied;
    }

    pub fn mark_dropped(&mut self, reason: impl Into<String>) {
        self.status = InstructionStatus::Dropped {
            reason: reason.into(),
        };
    }
}

/// The full audit log of a session: ordered turns plus the supervisor
/// instruction log with final statuses.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Transcript {
    pub session_id: Uuid,
    pub candidate: CandidateIdentity,
    pub turns: Vec<TurnRecord>,
    pub instructions: Vec<SupervisorInstruction>,
    pub started_at: DateTime<Utc>,
    pub ended_at: DateTime<Utc>,
    /// Set when the session ended on a fatal fault rather than plan
    /// completion or an operator stop.
    #[serde(default)]
    pub aborted_reason: Option<String>,
}

impl Transcript {
    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string_pretty(self)
    }
}

/// Serialize stage time budgets as whole seconds so plans stay hand-editable.
mod duration_secs {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(d.as_secs())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        Ok(Duration::from_secs(u64::deserialize(d)?))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_plan() -> InterviewPlan {
        InterviewPlan {
            stages: vec![
                Stage {
                    prompt: "Tell me about your current project, {name}.".into(),
                    expected_follow_ups: 1,
                    time_budget: Duration::from_secs(300),
                },
                Stage {
                    prompt: "How would you scale it?".into(),
                    expected_follow_ups: 0,
                    time_budget: Duration::from_secs(240),
                },
            ],
            greeting: Some("Welcome, {name}.".into()),
            closing: None,
        }
    }

    #[test]
    fn plan_round_trips_through_json() {
        let plan = sample_plan();
        let json = serde_json::to_string(&plan).unwrap();
        let back: InterviewPlan = serde_json::from_str(&json).unwrap();
        assert_eq!(back.len(), 2);
        assert_eq!(back.stages[0].time_budget, Duration::from_secs(300));
        assert_eq!(back.greeting.as_deref(), Some("Welcome, {name}."));
    }

    #[test]
    fn instruction_lifecycle_marks() {
        let mut ins = SupervisorInstruction::new("dig into the caching answer");
        assert_eq!(ins.status, InstructionStatus::Pending);
        assert!(ins.applied_at.is_none());

        ins.mark_applied();
        assert_eq!(ins.status, InstructionStatus::Applied);
        assert!(ins.applied_at.unwrap() >= ins.received_at);

        let mut dropped = SupervisorInstruction::new("never consumed");
        dropped.mark_dropped("session ended");
        assert_eq!(
            dropped.status,
            InstructionStatus::Dropped {
                reason: "session ended".into()
            }
        );
    }
}
