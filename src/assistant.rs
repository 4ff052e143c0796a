//! Assistant reply generation - narrow capability over the AI layer
//!
//! The generative backend is currently disabled; the shipped implementation
//! returns a canned fallback and never escalates, so the reply pipeline is
//! fully functional without it.

use crate::error::Result;

/// Context handed to the generator for a free-text reply
#[derive(Debug, Clone)]
pub struct ConversationContext {
    pub patient_name: String,
    pub plan: String,
    pub high_risk: bool,
    pub inbound_text: String,
}

/// Escalation details when the generator flags a message for staff
#[derive(Debug, Clone)]
pub struct EscalationDetails {
    pub summary: String,
    pub priority: i64,
}

#[derive(Debug, Clone)]
pub struct GeneratedReply {
    pub reply_text: String,
    pub escalate: bool,
    pub escalation: Option<EscalationDetails>,
}

pub trait ReplyGenerator: Send + Sync {
    fn generate(&self, ctx: &ConversationContext) -> Result<GeneratedReply>;
}

/// Stand-in while the generative layer is disabled
#[derive(Default)]
pub struct DisabledGenerator;

/// Generic fallback shown to patients on the free-text path
pub const FALLBACK_REPLY: &str =
    "Recebemos sua mensagem! Nossa equipe vai te responder em breve. 💙";

impl ReplyGenerator for DisabledGenerator {
    fn generate(&self, _ctx: &ConversationContext) -> Result<GeneratedReply> {
        Ok(GeneratedReply {
            reply_text: FALLBACK_REPLY.to_string(),
            escalate: false,
            escalation: None,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_disabled_generator_never_escalates() {
        let gen = DisabledGenerator;
        let reply = gen
            .generate(&ConversationContext {
                patient_name: "Maria".to_string(),
                plan: "premium".to_string(),
                high_risk: true,
                inbound_text: "como funciona o plano?".to_string(),
            })
            .unwrap();

        assert!(!reply.escalate);
        assert!(reply.escalation.is_none());
        assert_eq!(reply.reply_text, FALLBACK_REPLY);
    }
}
