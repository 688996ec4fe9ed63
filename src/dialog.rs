//! Interview dialog state machine
//!
//! Decides what the agent says and when the conversation advances through
//! the plan. The machine is pure: it consumes commands, mutates only its own
//! state and emits actions that the session loop applies. No I/O, no timers,
//! no channels in here, which is what makes every transition scriptable in
//! tests.
//!
//! State flow:
//! `AwaitingStart -> Greeting -> Asking <-> Listening -> EvaluatingAnswer ->
//! (FollowUp <-> Asking) -> Closing -> Ended`, with `Ended` terminal.

use crate::events::{SessionCommand, TurnPhase};
use crate::plan::{
    CandidateIdentity, InstructionStatus, InterviewPlan, Speaker, SupervisorInstruction,
    TurnRecord,
};
use chrono::{DateTime, Utc};
use std::collections::VecDeque;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DialogState {
    AwaitingStart,
    Greeting,
    Asking,
    Listening,
    EvaluatingAnswer,
    FollowUp,
    Closing,
    Ended,
}

impl DialogState {
    fn agent_speaking(self) -> bool {
        matches!(
            self,
            DialogState::Greeting | DialogState::Asking | DialogState::FollowUp | DialogState::Closing
        )
    }
}

/// Effects for the session loop to apply.
#[derive(Debug, Clone, PartialEq)]
pub enum DialogAction {
    /// Transmit an utterance to the remote service for synthesis.
    Speak {
        text: String,
        speaker: Speaker,
        stage_index: usize,
    },
    /// Tell the remote to abandon the in-flight synthesis (barge-in).
    SendStopSpeaking,
    /// Candidate has the floor; start the per-turn silence clock.
    ArmSilenceTimer,
    /// The conversation is over; the session may tear down.
    Finished,
}

/// An utterance waiting its turn on the wire. Queued so a supervisor
/// override and the stage prompt can follow each other without the machine
/// ever starting to listen in between.
#[derive(Debug, Clone)]
struct PendingUtterance {
    text: String,
    speaker: Speaker,
    stage_index: usize,
}

pub struct DialogMachine {
    state: DialogState,
    plan: InterviewPlan,
    candidate: CandidateIdentity,
    max_follow_ups: u32,

    stage_index: usize,
    follow_ups_taken: u32,

    /// Utterance currently being synthesized remotely, recorded as a turn
    /// once its turn-end arrives.
    speaking: Option<(PendingUtterance, DateTime<Utc>)>,
    utterance_queue: VecDeque<PendingUtterance>,
    listening_since: Option<DateTime<Utc>>,

    turns: Vec<TurnRecord>,
    instructions: Vec<SupervisorInstruction>,
    pending_instructions: VecDeque<usize>,
    abort_reason: Option<String>,

    actions: Vec<DialogAction>,
}

impl DialogMachine {
    pub fn new(plan: InterviewPlan, candidate: CandidateIdentity, max_follow_ups: u32) -> Self {
        Self {
            state: DialogState::AwaitingStart,
            plan,
            candidate,
            max_follow_ups,
            stage_index: 0,
            follow_ups_taken: 0,
            speaking: None,
            utterance_queue: VecDeque::new(),
            listening_since: None,
            turns: Vec::new(),
            instructions: Vec::new(),
            pending_instructions: VecDeque::new(),
            abort_reason: None,
            actions: Vec::new(),
        }
    }

    pub fn state(&self) -> DialogState {
        self.state
    }

    pub fn phase(&self) -> TurnPhase {
        match self.state {
            s if s.agent_speaking() => TurnPhase::AgentSpeaking,
            DialogState::Listening => TurnPhase::CandidateSpeaking,
            DialogState::EvaluatingAnswer => TurnPhase::Processing,
            _ => TurnPhase::Idle,
        }
    }

    /// Drain the actions produced since the last call.
    pub fn drain_actions(&mut self) -> Vec<DialogAction> {
        std::mem::take(&mut self.actions)
    }

    /// Consume the machine at session end, yielding the audit trail.
    pub fn finish(mut self) -> (Vec<TurnRecord>, Vec<SupervisorInstruction>, Option<String>) {
        // Nothing pending may survive as pending; stop() depends on it.
        self.drop_pending_instructions("session ended before a safe injection point");
        (self.turns, self.instructions, self.abort_reason)
    }

    pub fn on_command(&mut self, cmd: SessionCommand) {
        if self.state == DialogState::Ended {
            // Terminal. A new session object is required for a new interview.
            if let SessionCommand::Instruction(text) = cmd {
                let mut ins = SupervisorInstruction::new(text);
                ins.mark_dropped("session already ended");
                self.instructions.push(ins);
            }
            return;
        }

        match cmd {
            SessionCommand::Start => self.on_start(),
            SessionCommand::AgentTurnEnded => self.on_agent_turn_ended(),
            SessionCommand::CandidateText(text) => self.on_candidate_text(text),
            SessionCommand::SilenceElapsed => self.on_silence(),
            SessionCommand::BargeIn => self.on_barge_in(),
            SessionCommand::Instruction(text) => self.on_instruction(text),
            SessionCommand::RemoteFailure(reason) => self.on_remote_failure(reason),
            SessionCommand::Stop => self.on_stop(),
        }
    }

    // --- command handlers -------------------------------------------------

    fn on_start(&mut self) {
        if self.state != DialogState::AwaitingStart {
            warn!("start ignored in state {:?}", self.state);
            return;
        }
        if let Some(greeting) = self.plan.greeting.clone() {
            info!("greeting {}", self.candidate.name);
            self.state = DialogState::Greeting;
            self.enqueue_utterance(PendingUtterance {
                text: self.render(&greeting),
                speaker: Speaker::Agent,
                stage_index: 0,
            });
        } else {
            self.begin_stage(0);
        }
    }

    fn on_agent_turn_ended(&mut self) {
        if !self.state.agent_speaking() {
            debug!("turn-end ignored in state {:?}", self.state);
            return;
        }
        self.record_finished_utterance();

        if let Some(next) = self.utterance_queue.pop_front() {
            self.speak(next);
            return;
        }

        match self.state {
            DialogState::Closing => {
                self.state = DialogState::Ended;
                self.actions.push(DialogAction::Finished);
                info!("interview ended after closing");
            }
            DialogState::Greeting => {
                // The greeting invites no answer; move straight to stage 0.
                self.begin_stage(0);
            }
            _ => self.begin_listening(),
        }
    }

    fn on_candidate_text(&mut self, text: String) {
        match self.state {
            DialogState::Listening => {
                self.record_candidate_turn(text);
                self.evaluate_answer(false);
            }
            s if s.agent_speaking() => {
                // Recognized speech while we were still talking: an implicit
                // barge-in that already carries the answer text.
                info!("candidate spoke over the agent, yielding the floor");
                self.actions.push(DialogAction::SendStopSpeaking);
                self.record_finished_utterance();
                self.utterance_queue.clear();
                self.listening_since = Some(Utc::now());
                self.record_candidate_turn(text);
                self.evaluate_answer(false);
            }
            _ => debug!("candidate text ignored in state {:?}", self.state),
        }
    }

    fn on_silence(&mut self) {
        if self.state != DialogState::Listening {
            debug!("silence timeout ignored in state {:?}", self.state);
            return;
        }
        // An empty answer, not an error.
        info!("silence timeout in stage {}", self.stage_index);
        self.record_candidate_turn(String::new());
        self.evaluate_answer(true);
    }

    fn on_barge_in(&mut self) {
        if !matches!(self.state, DialogState::Asking | DialogState::FollowUp) {
            debug!("barge-in ignored in state {:?}", self.state);
            return;
        }
        info!("barge-in: abandoning utterance, listening");
        self.actions.push(DialogAction::SendStopSpeaking);
        self.record_finished_utterance();
        // Natural interruption beats script completion: the rest of the
        // planned utterance is discarded, not deferred.
        self.utterance_queue.clear();
        self.begin_listening();
    }

    fn on_instruction(&mut self, text: String) {
        info!("supervisor instruction queued: {}", text);
        let ins = SupervisorInstruction::new(text);
        self.instructions.push(ins);
        self.pending_instructions.push_back(self.instructions.len() - 1);
    }

    fn on_remote_failure(&mut self, reason: String) {
        warn!("remote failure, closing: {}", reason);
        self.abort_reason = Some(reason.clone());
        self.finish_now(&format!("connection lost: {}", reason));
    }

    fn on_stop(&mut self) {
        info!("stop requested in state {:?}", self.state);
        self.finish_now("session stopped before a safe injection point");
    }

    // --- internals --------------------------------------------------------

    fn render(&self, template: &str) -> String {
        template.replace("{name}", &self.candidate.name)
    }

    fn enqueue_utterance(&mut self, utterance: PendingUtterance) {
        if self.speaking.is_none() {
            self.speak(utterance);
        } else {
            self.utterance_queue.push_back(utterance);
        }
    }

    fn speak(&mut self, utterance: PendingUtterance) {
        self.actions.push(DialogAction::Speak {
            text: utterance.text.clone(),
            speaker: utterance.speaker,
            stage_index: utterance.stage_index,
        });
        self.speaking = Some((utterance, Utc::now()));
    }

    fn record_finished_utterance(&mut self) {
        if let Some((utt, started_at)) = self.speaking.take() {
            self.turns.push(TurnRecord {
                speaker: utt.speaker,
                text: utt.text,
                started_at,
                ended_at: Utc::now(),
                stage_index: utt.stage_index,
            });
        }
    }

    fn record_candidate_turn(&mut self, text: String) {
        let started_at = self.listening_since.take().unwrap_or_else(Utc::now);
        self.turns.push(TurnRecord {
            speaker: Speaker::Candidate,
            text,
            started_at,
            ended_at: Utc::now(),
            stage_index: self.stage_index,
        });
    }

    fn begin_listening(&mut self) {
        self.state = DialogState::Listening;
        self.listening_since = Some(Utc::now());
        self.actions.push(DialogAction::ArmSilenceTimer);
    }

    /// Safe injection point: pull every queued supervisor instruction into
    /// the utterance queue, each spoken as its own override turn.
    fn apply_pending_instructions(&mut self) {
        while let Some(idx) = self.pending_instructions.pop_front() {
            let ins = &mut self.instructions[idx];
            ins.mark_applied();
            info!("applying supervisor instruction: {}", ins.text);
            let utterance = PendingUtterance {
                text: ins.text.clone(),
                speaker: Speaker::SupervisorOverride,
                stage_index: self.stage_index,
            };
            self.utterance_queue.push_back(utterance);
        }
    }

    fn begin_stage(&mut self, index: usize) {
        self.stage_index = index;
        self.follow_ups_taken = 0;

        let Some(stage) = self.plan.stage(index) else {
            self.begin_closing();
            return;
        };
        let prompt = self.render(&stage.prompt);
        info!("asking stage {} of {}", index + 1, self.plan.len());

        self.state = DialogState::Asking;
        self.apply_pending_instructions();
        self.utterance_queue.push_back(PendingUtterance {
            text: prompt,
            speaker: Speaker::Agent,
            stage_index: index,
        });
        if let Some(first) = self.utterance_queue.pop_front() {
            self.speak(first);
        }
    }

    fn evaluate_answer(&mut self, was_silence: bool) {
        self.state = DialogState::EvaluatingAnswer;
        self.apply_pending_instructions();

        // Answer quality is the plan collaborator's concern; locally only
        // the turn budget and the advancement rule apply. A silent candidate
        // is re-prompted while the stage's follow-up budget lasts.
        let budget = self
            .plan
            .stage(self.stage_index)
            .map(|s| s.expected_follow_ups.min(self.max_follow_ups))
            .unwrap_or(0);

        if was_silence && self.follow_ups_taken < budget {
            self.follow_ups_taken += 1;
            let prompt = self
                .plan
                .stage(self.stage_index)
                .map(|s| self.render(&s.prompt))
                .unwrap_or_default();
            info!(
                "follow-up {}/{} for stage {}",
                self.follow_ups_taken, budget, self.stage_index
            );
            self.state = DialogState::FollowUp;
            if let Some(next) = self.utterance_queue.pop_front() {
                self.utterance_queue.push_back(PendingUtterance {
                    text: prompt,
                    speaker: Speaker::Agent,
                    stage_index: self.stage_index,
                });
                self.speak(next);
            } else {
                self.speak(PendingUtterance {
                    text: prompt,
                    speaker: Speaker::Agent,
                    stage_index: self.stage_index,
                });
            }
        } else if !self.utterance_queue.is_empty() {
            // Supervisor overrides take the floor before the next stage
            // prompt; the stage advance happens under Asking.
            let next_stage = self.stage_index + 1;
            self.advance_with_queue(next_stage);
        } else {
            self.begin_stage(self.stage_index + 1);
        }
    }

    /// Speak queued overrides first, then the next stage prompt (or the
    /// closing) in one uninterrupted agent span.
    fn advance_with_queue(&mut self, next_stage: usize) {
        self.stage_index = next_stage.min(self.plan.len());
        self.follow_ups_taken = 0;
        if let Some(stage) = self.plan.stage(next_stage) {
            let prompt = self.render(&stage.prompt);
            self.state = DialogState::Asking;
            self.utterance_queue.push_back(PendingUtterance {
                text: prompt,
                speaker: Speaker::Agent,
                stage_index: next_stage,
            });
        } else {
            self.state = DialogState::Closing;
            if let Some(closing) = self.plan.closing.clone() {
                let text = self.render(&closing);
                self.utterance_queue.push_back(PendingUtterance {
                    text,
                    speaker: Speaker::Agent,
                    stage_index: self.plan.len().saturating_sub(1),
                });
            }
        }
        match self.utterance_queue.pop_front() {
            Some(first) => self.speak(first),
            None => {
                // Plan exhausted and nothing left to say.
                self.state = DialogState::Ended;
                self.actions.push(DialogAction::Finished);
                info!("interview plan exhausted");
            }
        }
    }

    fn begin_closing(&mut self) {
        self.state = DialogState::Closing;
        match self.plan.closing.clone() {
            Some(closing) => {
                let text = self.render(&closing);
                self.enqueue_utterance(PendingUtterance {
                    text,
                    speaker: Speaker::Agent,
                    stage_index: self.plan.len().saturating_sub(1),
                });
            }
            None => {
                self.state = DialogState::Ended;
                self.actions.push(DialogAction::Finished);
                info!("interview plan exhausted");
            }
        }
    }

    fn finish_now(&mut self, drop_reason: &str) {
        self.record_finished_utterance();
        self.utterance_queue.clear();
        self.drop_pending_instructions(drop_reason);
        self.state = DialogState::Ended;
        self.actions.push(DialogAction::Finished);
    }

    fn drop_pending_instructions(&mut self, reason: &str) {
        while let Some(idx) = self.pending_instructions.pop_front() {
            let ins = &mut self.instructions[idx];
            if ins.status == InstructionStatus::Pending {
                warn!("dropping unapplied supervisor instruction: {}", ins.text);
                ins.mark_dropped(reason);
            }
        }
        // Instructions that never made it into the queue cannot exist, but a
        // pending status anywhere else would break the applied-or-dropped
        // invariant, so sweep the log too.
        for ins in &mut self.instructions {
            if ins.status == InstructionStatus::Pending {
                ins.mark_dropped(reason);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::plan::Stage;
    use std::time::Duration;

    fn plan(stages: usize, follow_ups: u32) -> InterviewPlan {
        InterviewPlan {
            stages: (0..stages)
                .map(|i| Stage {
                    prompt: format!("Question {}?", i + 1),
                    expected_follow_ups: follow_ups,
                    time_budget: Duration::from_secs(120),
                })
                .collect(),
            greeting: None,
            closing: None,
        }
    }

    fn candidate() -> CandidateIdentity {
        CandidateIdentity {
            name: "Ada".into(),
            identifier: "c-42".into(),
        }
    }

    fn machine(stages: usize, follow_ups: u32) -> DialogMachine {
        DialogMachine::new(plan(stages, follow_ups), candidate(), 2)
    }

    fn speak_texts(actions: &[DialogAction]) -> Vec<&str> {
        actions
            .iter()
            .filter_map(|a| match a {
                DialogAction::Speak { text, .. } => Some(text.as_str()),
                _ => None,
            })
            .collect()
    }

    #[test]
    fn never_listens_before_own_turn_end() {
        let mut m = machine(1, 0);
        m.on_command(SessionCommand::Start);
        assert_eq!(m.state(), DialogState::Asking);
        // Candidate silence or timers cannot move the machine while the
        // agent's utterance is still in flight.
        m.on_command(SessionCommand::SilenceElapsed);
        assert_eq!(m.state(), DialogState::Asking);
        m.on_command(SessionCommand::AgentTurnEnded);
        assert_eq!(m.state(), DialogState::Listening);
        assert!(m.drain_actions().contains(&DialogAction::ArmSilenceTimer));
    }

    #[test]
    fn greeting_precedes_first_stage() {
        let mut p = plan(1, 0);
        p.greeting = Some("Welcome, {name}.".into());
        let mut m = DialogMachine::new(p, candidate(), 2);
        m.on_command(SessionCommand::Start);
        assert_eq!(m.state(), DialogState::Greeting);
        assert_eq!(speak_texts(&m.drain_actions()), vec!["Welcome, Ada."]);
        m.on_command(SessionCommand::AgentTurnEnded);
        assert_eq!(m.state(), DialogState::Asking);
        assert_eq!(speak_texts(&m.drain_actions()), vec!["Question 1?"]);
    }

    #[test]
    fn answer_advances_to_next_stage_without_follow_up() {
        let mut m = machine(2, 1);
        m.on_command(SessionCommand::Start);
        m.on_command(SessionCommand::AgentTurnEnded);
        m.on_command(SessionCommand::CandidateText("my answer".into()));
        // Non-empty answers never trigger the follow-up budget.
        assert_eq!(m.state(), DialogState::Asking);
        let texts = speak_texts(&m.drain_actions());
        assert!(texts.contains(&"Question 2?"));
    }

    #[test]
    fn silence_triggers_follow_up_within_budget() {
        let mut m = machine(1, 1);
        m.on_command(SessionCommand::Start);
        m.on_command(SessionCommand::AgentTurnEnded);
        m.on_command(SessionCommand::SilenceElapsed);
        assert_eq!(m.state(), DialogState::FollowUp);
        m.on_command(SessionCommand::AgentTurnEnded);
        assert_eq!(m.state(), DialogState::Listening);
        // Budget exhausted: a second silence ends the stage and, with a
        // one-stage plan, the interview.
        m.on_command(SessionCommand::SilenceElapsed);
        assert_eq!(m.state(), DialogState::Ended);
    }

    #[test]
    fn stage_budget_caps_global_max() {
        // Stage asks for 5 follow-ups, machine caps at 1.
        let mut m = DialogMachine::new(plan(1, 5), candidate(), 1);
        m.on_command(SessionCommand::Start);
        m.on_command(SessionCommand::AgentTurnEnded);
        m.on_command(SessionCommand::SilenceElapsed);
        assert_eq!(m.state(), DialogState::FollowUp);
        m.on_command(SessionCommand::AgentTurnEnded);
        m.on_command(SessionCommand::SilenceElapsed);
        assert_eq!(m.state(), DialogState::Ended);
    }

    #[test]
    fn barge_in_stops_speech_and_listens() {
        let mut m = machine(1, 0);
        m.on_command(SessionCommand::Start);
        m.drain_actions();
        m.on_command(SessionCommand::BargeIn);
        let actions = m.drain_actions();
        assert_eq!(actions[0], DialogAction::SendStopSpeaking);
        assert!(actions.contains(&DialogAction::ArmSilenceTimer));
        assert_eq!(m.state(), DialogState::Listening);
        // The abandoned utterance is still on the record.
        assert_eq!(m.turns.len(), 1);
        assert_eq!(m.turns[0].speaker, Speaker::Agent);
    }

    #[test]
    fn instruction_applied_at_next_safe_point() {
        let mut m = machine(2, 0);
        m.on_command(SessionCommand::Start);
        // Mid-utterance: must not interrupt.
        m.on_command(SessionCommand::Instruction("ask about testing".into()));
        assert_eq!(m.state(), DialogState::Asking);
        m.drain_actions();
        m.on_command(SessionCommand::AgentTurnEnded);
        m.on_command(SessionCommand::CandidateText("done".into()));
        // Safe point reached: override speaks before the stage 2 prompt.
        let texts: Vec<String> = {
            let a = m.drain_actions();
            speak_texts(&a).iter().map(|s| s.to_string()).collect()
        };
        assert_eq!(texts, vec!["ask about testing".to_string()]);
        m.on_command(SessionCommand::AgentTurnEnded);
        let texts = speak_texts(&m.drain_actions())
            .iter()
            .map(|s| s.to_string())
            .collect::<Vec<_>>();
        assert_eq!(texts, vec!["Question 2?".to_string()]);

        let (turns, instructions, _) = m.finish();
        assert_eq!(instructions.len(), 1);
        assert_eq!(instructions[0].status, InstructionStatus::Applied);
        assert!(instructions[0].applied_at.unwrap() >= instructions[0].received_at);
        assert!(turns
            .iter()
            .any(|t| t.speaker == Speaker::SupervisorOverride && t.text == "ask about testing"));
    }

    #[test]
    fn unapplied_instruction_dropped_on_stop() {
        let mut m = machine(1, 0);
        m.on_command(SessionCommand::Start);
        m.on_command(SessionCommand::Instruction("wrap up early".into()));
        m.on_command(SessionCommand::Stop);
        assert_eq!(m.state(), DialogState::Ended);
        let (_, instructions, _) = m.finish();
        assert!(matches!(
            instructions[0].status,
            InstructionStatus::Dropped { .. }
        ));
    }

    #[test]
    fn remote_failure_preserves_completed_turns() {
        let mut m = machine(3, 0);
        m.on_command(SessionCommand::Start);
        m.on_command(SessionCommand::AgentTurnEnded);
        m.on_command(SessionCommand::CandidateText("first answer".into()));
        m.on_command(SessionCommand::RemoteFailure("socket lost".into()));
        assert_eq!(m.state(), DialogState::Ended);
        let (turns, _, abort) = m.finish();
        assert_eq!(abort.as_deref(), Some("socket lost"));
        assert!(turns.iter().any(|t| t.text == "first answer"));
    }

    #[test]
    fn ended_is_terminal() {
        let mut m = machine(1, 0);
        m.on_command(SessionCommand::Stop);
        assert_eq!(m.state(), DialogState::Ended);
        m.on_command(SessionCommand::Start);
        assert_eq!(m.state(), DialogState::Ended);
        assert!(m.drain_actions().iter().all(|a| a != &DialogAction::ArmSilenceTimer));
    }

    #[test]
    fn three_stage_plan_alternates_exactly() {
        let mut m = machine(3, 1);
        m.on_command(SessionCommand::Start);
        for i in 0..3 {
            assert_eq!(m.state(), DialogState::Asking, "stage {}", i);
            m.on_command(SessionCommand::AgentTurnEnded);
            assert_eq!(m.state(), DialogState::Listening);
            m.on_command(SessionCommand::CandidateText(format!("answer {}", i + 1)));
        }
        assert_eq!(m.state(), DialogState::Ended);
        let (turns, _, abort) = m.finish();
        assert!(abort.is_none());
        assert_eq!(turns.len(), 6);
        for (i, turn) in turns.iter().enumerate() {
            let expected = if i % 2 == 0 {
                Speaker::Agent
            } else {
                Speaker::Candidate
            };
            assert_eq!(turn.speaker, expected, "turn {}", i);
            assert_eq!(turn.stage_index, i / 2);
        }
    }
}
