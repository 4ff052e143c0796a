//! Daily check-in state machine
//!
//! Pure step-sequencing and scoring logic. Persistence and delivery live
//! elsewhere; everything here is deterministic and side-effect free.

use crate::error::{Error, Result};
use crate::store::ScheduledMessage;
use chrono::{Datelike, NaiveDate, Weekday};
use serde::{Deserialize, Serialize};

/// Reserved tag carried in the title of gamification check-in messages
pub const CHECKIN_TAG: &str = "[check-in]";

/// Subscription plan tier
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Plan {
    Freemium,
    Premium,
    Vip,
}

impl Plan {
    pub fn as_str(&self) -> &'static str {
        match self {
            Plan::Freemium => "freemium",
            Plan::Premium => "premium",
            Plan::Vip => "vip",
        }
    }
}

impl std::str::FromStr for Plan {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "freemium" => Ok(Plan::Freemium),
            "premium" => Ok(Plan::Premium),
            "vip" => Ok(Plan::Vip),
            other => Err(Error::Parse(format!("unknown plan: {}", other))),
        }
    }
}

/// Ordered check-in steps. Ordering is the sequence position; a state may
/// only ever move to a step that compares greater than its current one.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CheckinStep {
    Hydration,
    Breakfast,
    Lunch,
    Dinner,
    Activity,
    Wellbeing,
    Weight,
    Complete,
}

impl CheckinStep {
    pub fn as_str(&self) -> &'static str {
        match self {
            CheckinStep::Hydration => "hydration",
            CheckinStep::Breakfast => "breakfast",
            CheckinStep::Lunch => "lunch",
            CheckinStep::Dinner => "dinner",
            CheckinStep::Activity => "activity",
            CheckinStep::Wellbeing => "wellbeing",
            CheckinStep::Weight => "weight",
            CheckinStep::Complete => "complete",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, CheckinStep::Complete)
    }
}

impl std::str::FromStr for CheckinStep {
    type Err = Error;

    /// Persisted step text maps back strictly; unknown text is corruption,
    /// not a default.
    fn from_str(s: &str) -> Result<Self> {
        match s {
            "hydration" => Ok(CheckinStep::Hydration),
            "breakfast" => Ok(CheckinStep::Breakfast),
            "lunch" => Ok(CheckinStep::Lunch),
            "dinner" => Ok(CheckinStep::Dinner),
            "activity" => Ok(CheckinStep::Activity),
            "wellbeing" => Ok(CheckinStep::Wellbeing),
            "weight" => Ok(CheckinStep::Weight),
            "complete" => Ok(CheckinStep::Complete),
            other => Err(Error::InvalidStep(other.to_string())),
        }
    }
}

impl std::fmt::Display for CheckinStep {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Next step in the fixed sequence for a plan tier. `is_weigh_day` only
/// affects the transition out of `Wellbeing`; `Complete` maps to itself.
/// Freemium patients take the reduced subsequence (no meal or activity
/// steps).
pub fn next_step(current: CheckinStep, plan: Plan, is_weigh_day: bool) -> CheckinStep {
    use CheckinStep::*;

    if plan == Plan::Freemium {
        // Reduced subsequence; a meal or activity step routes forward.
        return match current {
            Hydration | Breakfast | Lunch | Dinner | Activity => Wellbeing,
            Wellbeing if is_weigh_day => Weight,
            Wellbeing | Weight | Complete => Complete,
        };
    }

    match current {
        Hydration => Breakfast,
        Breakfast => Lunch,
        Lunch => Dinner,
        Dinner => Activity,
        Activity => Wellbeing,
        Wellbeing if is_weigh_day => Weight,
        Wellbeing | Weight | Complete => Complete,
    }
}

/// Self-reported adherence grade
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Grade {
    A,
    B,
    C,
}

impl Grade {
    pub fn as_str(&self) -> &'static str {
        match self {
            Grade::A => "A",
            Grade::B => "B",
            Grade::C => "C",
        }
    }
}

/// Parse a reply body as a grade answer. Only a lone letter counts
/// ("A", "b", "C."); anything longer is free text, never a grade.
pub fn parse_grade(body: &str) -> Option<Grade> {
    let token = body.split_whitespace().next()?;
    let token = token.trim_matches(|c: char| !c.is_alphanumeric());
    if token.len() != 1 {
        return None;
    }
    match token.chars().next()? {
        'A' | 'a' => Some(Grade::A),
        'B' | 'b' => Some(Grade::B),
        'C' | 'c' => Some(Grade::C),
        _ => None,
    }
}

/// Gamification perspective a check-in answer scores against
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Perspective {
    Alimentacao,
    Hidratacao,
    Movimento,
    Disciplina,
    BemEstar,
}

impl Perspective {
    pub fn as_str(&self) -> &'static str {
        match self {
            Perspective::Alimentacao => "alimentacao",
            Perspective::Hidratacao => "hidratacao",
            Perspective::Movimento => "movimento",
            Perspective::Disciplina => "disciplina",
            Perspective::BemEstar => "bemEstar",
        }
    }
}

impl std::str::FromStr for Perspective {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "alimentacao" => Ok(Perspective::Alimentacao),
            "hidratacao" => Ok(Perspective::Hidratacao),
            "movimento" => Ok(Perspective::Movimento),
            "disciplina" => Ok(Perspective::Disciplina),
            "bemEstar" => Ok(Perspective::BemEstar),
            other => Err(Error::Scoring {
                grade: String::new(),
                perspective: other.to_string(),
            }),
        }
    }
}

/// Which perspective a step's answer scores against. Terminal steps score
/// nothing.
pub fn perspective_for(step: CheckinStep) -> Option<Perspective> {
    match step {
        CheckinStep::Hydration => Some(Perspective::Hidratacao),
        CheckinStep::Breakfast | CheckinStep::Lunch | CheckinStep::Dinner => {
            Some(Perspective::Alimentacao)
        }
        CheckinStep::Activity => Some(Perspective::Movimento),
        CheckinStep::Wellbeing => Some(Perspective::BemEstar),
        CheckinStep::Weight => Some(Perspective::Disciplina),
        CheckinStep::Complete => None,
    }
}

/// Fixed point award per (perspective, grade). Total over both enums.
pub fn points(grade: Grade, perspective: Perspective) -> i64 {
    match (perspective, grade) {
        (Perspective::Alimentacao, Grade::A) => 20,
        (Perspective::Alimentacao, Grade::B) => 15,
        (Perspective::Alimentacao, Grade::C) => 10,
        (Perspective::Hidratacao, Grade::A) => 15,
        (Perspective::Hidratacao, Grade::B) => 10,
        (Perspective::Hidratacao, Grade::C) => 5,
        (Perspective::Movimento, Grade::A) => 15,
        (Perspective::Movimento, Grade::B) => 10,
        (Perspective::Movimento, Grade::C) => 5,
        (Perspective::Disciplina, Grade::A) => 10,
        (Perspective::Disciplina, Grade::B) => 8,
        (Perspective::Disciplina, Grade::C) => 5,
        (Perspective::BemEstar, Grade::A) => 10,
        (Perspective::BemEstar, Grade::B) => 8,
        (Perspective::BemEstar, Grade::C) => 5,
    }
}

/// Score an answer from stored text. Unknown grade or perspective text
/// fails rather than awarding zero; silent defaults would corrupt point
/// totals downstream. The answer text itself does not influence the score.
pub fn calculate_points(_answer: &str, grade: &str, perspective: &str) -> Result<i64> {
    let g = match grade {
        "A" | "a" => Grade::A,
        "B" | "b" => Grade::B,
        "C" | "c" => Grade::C,
        other => {
            return Err(Error::Scoring {
                grade: other.to_string(),
                perspective: perspective.to_string(),
            })
        }
    };
    let p: Perspective = perspective.parse().map_err(|_| Error::Scoring {
        grade: grade.to_string(),
        perspective: perspective.to_string(),
    })?;
    Ok(points(g, p))
}

/// True iff the message title carries the reserved check-in tag
pub fn is_gamification_checkin(msg: &ScheduledMessage) -> bool {
    msg.title
        .as_deref()
        .map(|t| t.contains(CHECKIN_TAG))
        .unwrap_or(false)
}

/// The message's declared perspective field, verbatim (pass-through, not
/// inferred from content)
pub fn extract_perspective(msg: &ScheduledMessage) -> Option<String> {
    msg.metadata
        .as_ref()
        .and_then(|m| m.get("perspective"))
        .and_then(|v| v.as_str())
        .map(|s| s.to_string())
}

/// Weekly weigh-in: the check-in sequence includes the weight step on the
/// configured weekday.
pub fn is_weigh_day(date: NaiveDate, weigh_day: Weekday) -> bool {
    date.weekday() == weigh_day
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_premium_full_sequence() {
        use CheckinStep::*;
        assert_eq!(next_step(Hydration, Plan::Premium, false), Breakfast);
        assert_eq!(next_step(Breakfast, Plan::Premium, false), Lunch);
        assert_eq!(next_step(Lunch, Plan::Premium, false), Dinner);
        assert_eq!(next_step(Dinner, Plan::Premium, false), Activity);
        assert_eq!(next_step(Activity, Plan::Premium, false), Wellbeing);
        assert_eq!(next_step(Wellbeing, Plan::Premium, false), Complete);
    }

    #[test]
    fn test_weigh_day_branch() {
        use CheckinStep::*;
        assert_eq!(next_step(Wellbeing, Plan::Premium, true), Weight);
        assert_eq!(next_step(Weight, Plan::Premium, true), Complete);
        // Weigh day only affects the transition out of wellbeing
        assert_eq!(next_step(Hydration, Plan::Premium, true), Breakfast);
        assert_eq!(next_step(Wellbeing, Plan::Vip, true), Weight);
    }

    #[test]
    fn test_freemium_reduced_sequence() {
        use CheckinStep::*;
        assert_eq!(next_step(Hydration, Plan::Freemium, false), Wellbeing);
        assert_eq!(next_step(Wellbeing, Plan::Freemium, false), Complete);
        assert_eq!(next_step(Wellbeing, Plan::Freemium, true), Weight);
    }

    #[test]
    fn test_complete_is_terminal() {
        for plan in [Plan::Freemium, Plan::Premium, Plan::Vip] {
            for weigh in [false, true] {
                assert_eq!(
                    next_step(CheckinStep::Complete, plan, weigh),
                    CheckinStep::Complete
                );
            }
        }
    }

    #[test]
    fn test_step_round_trip() {
        use std::str::FromStr;
        for step in [
            CheckinStep::Hydration,
            CheckinStep::Breakfast,
            CheckinStep::Lunch,
            CheckinStep::Dinner,
            CheckinStep::Activity,
            CheckinStep::Wellbeing,
            CheckinStep::Weight,
            CheckinStep::Complete,
        ] {
            assert_eq!(CheckinStep::from_str(step.as_str()).unwrap(), step);
        }
    }

    #[test]
    fn test_unknown_step_fails() {
        use std::str::FromStr;
        let err = CheckinStep::from_str("breakfest").unwrap_err();
        assert!(matches!(err, Error::InvalidStep(_)));
    }

    #[test]
    fn test_scoring_table() {
        assert_eq!(calculate_points("Almoço", "A", "alimentacao").unwrap(), 20);
        assert_eq!(calculate_points("Almoço", "B", "alimentacao").unwrap(), 15);
        assert_eq!(calculate_points("Almoço", "C", "alimentacao").unwrap(), 10);
        assert_eq!(calculate_points("Hidratação", "A", "hidratacao").unwrap(), 15);
        assert_eq!(calculate_points("Caminhada", "A", "movimento").unwrap(), 15);
        assert_eq!(calculate_points("Pesagem", "B", "disciplina").unwrap(), 8);
        assert_eq!(calculate_points("Bem", "C", "bemEstar").unwrap(), 5);
    }

    #[test]
    fn test_unknown_grade_fails() {
        let err = calculate_points("x", "Z", "alimentacao").unwrap_err();
        assert!(matches!(err, Error::Scoring { .. }));
    }

    #[test]
    fn test_unknown_perspective_fails() {
        let err = calculate_points("x", "A", "sleep").unwrap_err();
        assert!(matches!(err, Error::Scoring { .. }));
    }

    #[test]
    fn test_parse_grade() {
        assert_eq!(parse_grade("A"), Some(Grade::A));
        assert_eq!(parse_grade("b"), Some(Grade::B));
        assert_eq!(parse_grade(" C. "), Some(Grade::C));
        // A full word starting with a grade letter is not a grade
        assert_eq!(parse_grade("Almoço"), None);
        assert_eq!(parse_grade("75"), None);
        assert_eq!(parse_grade(""), None);
        assert_eq!(parse_grade("D"), None);
    }

    #[test]
    fn test_perspective_for_steps() {
        assert_eq!(
            perspective_for(CheckinStep::Hydration),
            Some(Perspective::Hidratacao)
        );
        assert_eq!(
            perspective_for(CheckinStep::Lunch),
            Some(Perspective::Alimentacao)
        );
        assert_eq!(
            perspective_for(CheckinStep::Weight),
            Some(Perspective::Disciplina)
        );
        assert_eq!(perspective_for(CheckinStep::Complete), None);
    }

    #[test]
    fn test_gamification_message_helpers() {
        let msg = crate::store::ScheduledMessage {
            id: 1,
            patient_id: 1,
            patient_protocol_id: Some(1),
            protocol_day: Some(3),
            title: Some("[check-in] Dia 3".to_string()),
            body: "Bom dia!".to_string(),
            send_at: chrono::Utc::now(),
            status: crate::store::ScheduledStatus::Pending,
            metadata: Some(serde_json::json!({"perspective": "hidratacao"})),
            created_at: chrono::Utc::now(),
            sent_at: None,
        };
        assert!(is_gamification_checkin(&msg));
        assert_eq!(extract_perspective(&msg).as_deref(), Some("hidratacao"));

        let mut plain = msg.clone();
        plain.title = Some("Lembrete de consulta".to_string());
        plain.metadata = None;
        assert!(!is_gamification_checkin(&plain));
        assert_eq!(extract_perspective(&plain), None);
    }

    #[test]
    fn test_is_weigh_day() {
        // 2024-01-15 is a Monday
        let mon = NaiveDate::from_ymd_opt(2024, 1, 15).unwrap();
        let tue = NaiveDate::from_ymd_opt(2024, 1, 16).unwrap();
        assert!(is_weigh_day(mon, Weekday::Mon));
        assert!(!is_weigh_day(tue, Weekday::Mon));
    }

    fn any_step() -> impl Strategy<Value = CheckinStep> {
        prop_oneof![
            Just(CheckinStep::Hydration),
            Just(CheckinStep::Breakfast),
            Just(CheckinStep::Lunch),
            Just(CheckinStep::Dinner),
            Just(CheckinStep::Activity),
            Just(CheckinStep::Wellbeing),
            Just(CheckinStep::Weight),
            Just(CheckinStep::Complete),
        ]
    }

    fn any_plan() -> impl Strategy<Value = Plan> {
        prop_oneof![Just(Plan::Freemium), Just(Plan::Premium), Just(Plan::Vip)]
    }

    proptest! {
        /// The sequence never regresses and always terminates
        #[test]
        fn next_step_never_regresses(step in any_step(), plan in any_plan(), weigh: bool) {
            let next = next_step(step, plan, weigh);
            prop_assert!(next > step || (step == CheckinStep::Complete && next == step));
        }

        #[test]
        fn sequence_reaches_complete(start in any_step(), plan in any_plan(), weigh: bool) {
            let mut step = start;
            for _ in 0..10 {
                if step == CheckinStep::Complete {
                    break;
                }
                step = next_step(step, plan, weigh);
            }
            prop_assert_eq!(step, CheckinStep::Complete);
        }
    }
}
