//! Inbound reply handling
//!
//! Classifies each inbound WhatsApp message and routes it: emergency
//! escalation first, then check-in answers, then free-text conversation.
//! Each inbound message causes at most one attention request, one outgoing
//! log row, and one delivery attempt; delivery is best-effort and never
//! rolls back what was written.

use crate::assistant::{ConversationContext, ReplyGenerator};
use crate::checkin::{
    self, next_step, parse_grade, perspective_for, CheckinStep, Grade,
};
use crate::delivery::DeliveryGateway;
use crate::error::Result;
use crate::store::{Patient, Sender, Store};
use chrono::{DateTime, Utc, Weekday};
use once_cell::sync::Lazy;
use regex::RegexSet;
use tracing::{info, warn};

/// Emergency keyword patterns (Portuguese first, English fallbacks)
static EMERGENCY_PATTERNS: Lazy<RegexSet> = Lazy::new(|| {
    RegexSet::new([
        r"(?i)emerg[êe]ncia",
        r"(?i)socorro",
        r"(?i)dor no peito",
        r"(?i)falta de ar",
        r"(?i)desmai",
        r"(?i)urgente",
        r"(?i)\b(192|samu)\b",
        r"(?i)emergency",
        r"(?i)chest pain",
    ])
    .expect("Invalid emergency regex")
});

const EMERGENCY_REPLY: &str = "Recebemos sua mensagem. Se isso for uma emergência médica, \
ligue 192 (SAMU) agora. Nossa equipe clínica já foi alertada e vai falar com você.";

const CHECKIN_COMPLETE_REPLY: &str = "Check-in de hoje completo! Obrigado por compartilhar. 🎉";

/// How an inbound message was classified
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Classification {
    Emergency,
    CheckinAnswer(Grade),
    FreeText,
}

/// Classify a message body. First match wins: an emergency keyword beats
/// an otherwise-valid check-in answer.
pub fn classify(body: &str, has_open_checkin: bool) -> Classification {
    if EMERGENCY_PATTERNS.is_match(body) {
        return Classification::Emergency;
    }
    if has_open_checkin {
        if let Some(grade) = parse_grade(body) {
            return Classification::CheckinAnswer(grade);
        }
    }
    Classification::FreeText
}

/// What handling an inbound message resulted in
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InboundOutcome {
    UnknownSender,
    EmergencyEscalated,
    CheckinAdvanced { to: CheckinStep, points: i64 },
    CheckinCompleted { points: i64 },
    Conversation { escalated: bool },
}

pub struct ReplyRouter<'a> {
    store: &'a Store,
    gateway: &'a dyn DeliveryGateway,
    generator: &'a dyn ReplyGenerator,
    weigh_day: Weekday,
}

impl<'a> ReplyRouter<'a> {
    pub fn new(
        store: &'a Store,
        gateway: &'a dyn DeliveryGateway,
        generator: &'a dyn ReplyGenerator,
        weigh_day: Weekday,
    ) -> Self {
        Self {
            store,
            gateway,
            generator,
            weigh_day,
        }
    }

    /// Resolve the sender and persist the inbound row. Returns `None` for
    /// unknown senders (logged, no side effects).
    pub fn record_inbound(
        &self,
        from: &str,
        body: &str,
        now: DateTime<Utc>,
    ) -> Result<Option<(Patient, i64)>> {
        let phone = from.strip_prefix("whatsapp:").unwrap_or(from);
        match self.store.patient_by_phone(phone)? {
            Some(patient) => {
                let message_id = self.store.insert_inbound(patient.id, body, now)?;
                Ok(Some((patient, message_id)))
            }
            None => {
                info!(from = phone, "inbound from unknown sender, dropped");
                Ok(None)
            }
        }
    }

    /// Classify and route a persisted inbound message, then stamp its
    /// completion marker.
    pub fn process(
        &self,
        patient: &Patient,
        message_id: i64,
        body: &str,
        now: DateTime<Utc>,
    ) -> Result<InboundOutcome> {
        // First contact closes any open onboarding state.
        if let Some(onboarding) = self.store.open_onboarding(patient.id)? {
            self.store.complete_onboarding(onboarding.id, now)?;
        }

        let open = self.store.open_checkin(patient.id)?;
        let outcome = match classify(body, open.is_some()) {
            Classification::Emergency => self.handle_emergency(patient, body, now)?,
            Classification::CheckinAnswer(grade) => match open {
                Some(ref state) => self.handle_checkin_answer(patient, state, grade, now)?,
                None => self.handle_conversation(patient, body, now)?,
            },
            Classification::FreeText => self.handle_conversation(patient, body, now)?,
        };

        self.store.mark_message_processed(message_id, now)?;
        Ok(outcome)
    }

    /// Record + process in one call (webhook replay and tests)
    pub fn handle_inbound(
        &self,
        from: &str,
        body: &str,
        now: DateTime<Utc>,
    ) -> Result<InboundOutcome> {
        match self.record_inbound(from, body, now)? {
            Some((patient, message_id)) => self.process(&patient, message_id, body, now),
            None => Ok(InboundOutcome::UnknownSender),
        }
    }

    fn handle_emergency(
        &self,
        patient: &Patient,
        body: &str,
        now: DateTime<Utc>,
    ) -> Result<InboundOutcome> {
        self.store
            .insert_attention_request(patient.id, "emergency", body, None, 1, now)?;
        self.store.set_needs_attention(patient.id, true)?;
        self.store
            .insert_message(patient.id, Sender::Me, EMERGENCY_REPLY, now)?;
        self.deliver_best_effort(patient, EMERGENCY_REPLY);
        info!(patient = patient.id, "emergency escalated");
        Ok(InboundOutcome::EmergencyEscalated)
    }

    fn handle_checkin_answer(
        &self,
        patient: &Patient,
        state: &crate::store::CheckinState,
        grade: Grade,
        now: DateTime<Utc>,
    ) -> Result<InboundOutcome> {
        let points = match perspective_for(state.step) {
            Some(perspective) => checkin::points(grade, perspective),
            None => 0,
        };

        let weigh = checkin::is_weigh_day(state.date, self.weigh_day);
        let next = next_step(state.step, patient.plan, weigh);

        // The answer is recorded as the normalized grade letter.
        self.store.advance_checkin(state, next, grade.as_str(), now)?;
        if points > 0 {
            self.store.add_points(patient.id, points)?;
        }

        let (reply, outcome) = if next.is_terminal() {
            self.store.complete_checkin(state.id, now)?;
            (
                CHECKIN_COMPLETE_REPLY,
                InboundOutcome::CheckinCompleted { points },
            )
        } else {
            (
                prompt_for(next),
                InboundOutcome::CheckinAdvanced { to: next, points },
            )
        };

        self.store.insert_message(patient.id, Sender::Me, reply, now)?;
        self.deliver_best_effort(patient, reply);
        Ok(outcome)
    }

    fn handle_conversation(
        &self,
        patient: &Patient,
        body: &str,
        now: DateTime<Utc>,
    ) -> Result<InboundOutcome> {
        let ctx = ConversationContext {
            patient_name: patient.name.clone(),
            plan: patient.plan.as_str().to_string(),
            high_risk: patient.high_risk,
            inbound_text: body.to_string(),
        };

        // A generator failure falls back to the generic reply; patients
        // never see internal errors.
        let generated = match self.generator.generate(&ctx) {
            Ok(g) => g,
            Err(e) => {
                warn!(patient = patient.id, "reply generation failed: {}", e);
                crate::assistant::GeneratedReply {
                    reply_text: crate::assistant::FALLBACK_REPLY.to_string(),
                    escalate: false,
                    escalation: None,
                }
            }
        };

        let escalated = generated.escalate;
        if escalated {
            let (summary, priority) = generated
                .escalation
                .as_ref()
                .map(|d| (d.summary.as_str(), d.priority))
                .unwrap_or(("ai_escalation", 2));
            self.store.insert_attention_request(
                patient.id,
                summary,
                body,
                Some(&generated.reply_text),
                priority,
                now,
            )?;
            self.store.set_needs_attention(patient.id, true)?;
        }

        self.store
            .insert_message(patient.id, Sender::Me, &generated.reply_text, now)?;
        self.deliver_best_effort(patient, &generated.reply_text);
        Ok(InboundOutcome::Conversation { escalated })
    }

    fn deliver_best_effort(&self, patient: &Patient, text: &str) {
        if let Err(e) = self.gateway.deliver(&patient.whatsapp, text) {
            warn!(patient = patient.id, "outbound delivery failed: {}", e);
        }
    }
}

/// Prompt sent for each check-in step
pub fn prompt_for(step: CheckinStep) -> &'static str {
    match step {
        CheckinStep::Hydration => "Como foi sua hidratação hoje? Responda A, B ou C.",
        CheckinStep::Breakfast => "Como foi seu café da manhã? (A/B/C)",
        CheckinStep::Lunch => "Como foi seu almoço? (A/B/C)",
        CheckinStep::Dinner => "Como foi seu jantar? (A/B/C)",
        CheckinStep::Activity => "Você conseguiu se movimentar hoje? (A/B/C)",
        CheckinStep::Wellbeing => "Como está seu bem-estar hoje? (A/B/C)",
        CheckinStep::Weight => "Hoje é dia de pesagem! Como foi sua disciplina na balança? (A/B/C)",
        CheckinStep::Complete => CHECKIN_COMPLETE_REPLY,
    }
}
