//! Message queue scheduler
//!
//! The recurring job behind the cron trigger: generates the next day's
//! scheduled message for every active protocol enrollment, then dispatches
//! every pending message whose send time has passed. Generation and
//! dispatch are separate steps; a transport outage must not stall day
//! advancement, and vice versa.

use crate::delivery::DeliveryGateway;
use crate::error::{Error, Result};
use crate::store::{NewScheduledMessage, PatientProtocol, Store};
use chrono::{DateTime, Utc};
use cron::Schedule;
use serde::Serialize;
use std::str::FromStr;
use std::time::Duration;
use tracing::{error, info, warn};

/// Counts returned to the caller, granular even on partial failure
#[derive(Debug, Default, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SchedulerReport {
    pub messages_scheduled: u32,
    pub protocols_completed: u32,
    pub processed: u32,
    pub failed: u32,
}

pub struct QueueScheduler<'a> {
    store: &'a Store,
    gateway: &'a dyn DeliveryGateway,
}

impl<'a> QueueScheduler<'a> {
    pub fn new(store: &'a Store, gateway: &'a dyn DeliveryGateway) -> Self {
        Self { store, gateway }
    }

    /// One full pass: generation, then dispatch
    pub fn run_pass(&self, now: DateTime<Utc>) -> Result<SchedulerReport> {
        let mut report = SchedulerReport::default();
        self.advance_protocols(now, &mut report)?;
        self.dispatch_due(now, &mut report)?;
        info!(
            scheduled = report.messages_scheduled,
            completed = report.protocols_completed,
            processed = report.processed,
            failed = report.failed,
            "scheduler pass done"
        );
        Ok(report)
    }

    /// Generate the next day's message for each active enrollment. A
    /// per-protocol failure is logged and skipped; it must not stall the
    /// rest of the roster.
    pub fn advance_protocols(&self, now: DateTime<Utc>, report: &mut SchedulerReport) -> Result<()> {
        for pp in self.store.active_patient_protocols()? {
            if let Err(e) = self.advance_one(&pp, now, report) {
                error!(patient_protocol = pp.id, "protocol advancement failed: {}", e);
            }
        }
        Ok(())
    }

    fn advance_one(
        &self,
        pp: &PatientProtocol,
        now: DateTime<Utc>,
        report: &mut SchedulerReport,
    ) -> Result<()> {
        let protocol = self
            .store
            .protocol(pp.protocol_id)?
            .ok_or(Error::ProtocolNotFound(pp.protocol_id))?;

        // Day count already past duration: nothing left to generate.
        if pp.current_day > protocol.duration_days {
            self.store.deactivate_protocol(pp.id)?;
            report.protocols_completed += 1;
            return Ok(());
        }

        let today = now.date_naive();
        // One protocol day per calendar day; consecutive ticks on the same
        // day must not burn through the program.
        if self.store.protocol_day_scheduled_on(pp.id, today)? {
            return Ok(());
        }
        // Concurrent-tick guard: this day's row may already exist.
        if self.store.day_already_scheduled(pp.id, pp.current_day)? {
            return Ok(());
        }

        match self.store.template(pp.protocol_id, pp.current_day)? {
            Some(template) => {
                let send_at = send_time_for(&protocol.send_schedule, now)?;
                let metadata = template
                    .perspective
                    .as_deref()
                    .map(|p| serde_json::json!({ "perspective": p }));
                self.store.insert_scheduled_message(&NewScheduledMessage {
                    patient_id: pp.patient_id,
                    patient_protocol_id: Some(pp.id),
                    protocol_day: Some(pp.current_day),
                    title: template.title.clone(),
                    body: template.body.clone(),
                    send_at,
                    metadata,
                })?;
                report.messages_scheduled += 1;
            }
            None => {
                // A content gap must not wedge the enrollment on one day.
                warn!(
                    protocol = protocol.id,
                    day = pp.current_day,
                    "no template for protocol day, advancing anyway"
                );
            }
        }

        if pp.current_day >= protocol.duration_days {
            self.store.deactivate_protocol(pp.id)?;
            report.protocols_completed += 1;
        } else {
            self.store.advance_protocol_day(pp.id)?;
        }
        Ok(())
    }

    /// Deliver every pending message whose send time has passed. Only
    /// pending rows are eligible, so re-running a pass never re-sends.
    pub fn dispatch_due(&self, now: DateTime<Utc>, report: &mut SchedulerReport) -> Result<()> {
        for msg in self.store.due_pending(now)? {
            let patient = match self.store.patient(msg.patient_id)? {
                Some(p) => p,
                None => {
                    error!(message = msg.id, "scheduled message without patient, cancelling");
                    self.store.cancel_scheduled(msg.id)?;
                    continue;
                }
            };

            match self.gateway.deliver(&patient.whatsapp, &msg.body) {
                Ok(receipt) => {
                    self.store.mark_sent(msg.id, now)?;
                    self.store
                        .insert_message(patient.id, crate::store::Sender::Me, &msg.body, now)?;
                    // A delivered check-in prompt opens the day's state;
                    // yesterday's unfinished one is superseded.
                    if crate::checkin::is_gamification_checkin(&msg) {
                        if let Err(e) = self.begin_checkin_for(patient.id, now) {
                            warn!(patient = patient.id, "could not open check-in state: {}", e);
                        }
                    }
                    report.processed += 1;
                    info!(message = msg.id, sid = %receipt.sid, "dispatched");
                }
                Err(e) => {
                    // Left failed for manual remediation; the whole-job
                    // retry wrapper is the only retry layer.
                    self.store.mark_failed(msg.id)?;
                    report.failed += 1;
                    warn!(message = msg.id, "dispatch failed: {}", e);
                }
            }
        }
        Ok(())
    }

    fn begin_checkin_for(&self, patient_id: i64, now: DateTime<Utc>) -> Result<()> {
        let today = now.date_naive();
        match self.store.open_checkin(patient_id)? {
            Some(state) if state.date == today => {}
            Some(state) => {
                self.store.complete_checkin(state.id, now)?;
                self.store
                    .begin_checkin(patient_id, today, crate::checkin::CheckinStep::Hydration)?;
            }
            None => {
                self.store
                    .begin_checkin(patient_id, today, crate::checkin::CheckinStep::Hydration)?;
            }
        }
        Ok(())
    }
}

/// Today's send time from a protocol's cron schedule (5-field expressions
/// get a seconds field prepended, as users write standard cron).
fn send_time_for(expr: &str, now: DateTime<Utc>) -> Result<DateTime<Utc>> {
    let schedule = parse_schedule(expr)?;
    let day_start = now
        .date_naive()
        .and_hms_opt(0, 0, 0)
        .expect("midnight is always valid")
        .and_utc();
    schedule
        .after(&day_start)
        .next()
        .ok_or_else(|| Error::Parse(format!("cron expression never fires: {}", expr)))
}

pub fn parse_schedule(expr: &str) -> Result<Schedule> {
    let full = if expr.split_whitespace().count() == 5 {
        format!("0 {}", expr)
    } else {
        expr.to_string()
    };
    Schedule::from_str(&full).map_err(|e| Error::Parse(format!("bad cron '{}': {}", expr, e)))
}

/// Bounded exponential backoff for the whole job
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub initial_delay: Duration,
}

impl RetryPolicy {
    pub fn new(max_attempts: u32, initial_delay_ms: u64) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            initial_delay: Duration::from_millis(initial_delay_ms),
        }
    }
}

/// Run a job with bounded exponential backoff (delay doubles per attempt).
/// No partial rollback: work committed by a failed attempt stays, and the
/// next attempt skips it via the pending-only filter and dedup guards.
pub fn with_retry<T>(policy: RetryPolicy, mut job: impl FnMut() -> Result<T>) -> Result<T> {
    let mut delay = policy.initial_delay;
    let mut attempt = 1;
    loop {
        match job() {
            Ok(value) => return Ok(value),
            Err(e) if attempt < policy.max_attempts => {
                warn!(attempt, "job failed, retrying in {:?}: {}", delay, e);
                std::thread::sleep(delay);
                delay *= 2;
                attempt += 1;
            }
            Err(e) => return Err(e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::checkin::Plan;
    use crate::delivery::RecordingGateway;
    use crate::store::{ScheduledStatus, Store};
    use chrono::TimeZone;

    fn seeded() -> (Store, i64, i64) {
        let store = Store::open_in_memory().unwrap();
        let patient = store
            .insert_patient("Maria Silva", "+5511999990001", Plan::Premium)
            .unwrap();
        let protocol = store.insert_protocol("Fase 1", 2, "0 9 * * *").unwrap();
        store
            .insert_template(protocol.id, 1, Some("[check-in] Dia 1"), "Bom dia! Dia 1.", Some("hidratacao"))
            .unwrap();
        store
            .insert_template(protocol.id, 2, Some("[check-in] Dia 2"), "Bom dia! Dia 2.", Some("hidratacao"))
            .unwrap();
        (store, patient.id, protocol.id)
    }

    fn day(d: u32, h: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 1, d, h, 0, 0).unwrap()
    }

    #[test]
    fn test_generation_schedules_and_advances() {
        let (store, patient_id, protocol_id) = seeded();
        let pp = store.assign_protocol(patient_id, protocol_id).unwrap();
        let gateway = RecordingGateway::new();
        let scheduler = QueueScheduler::new(&store, &gateway);

        let mut report = SchedulerReport::default();
        scheduler.advance_protocols(day(15, 10), &mut report).unwrap();

        assert_eq!(report.messages_scheduled, 1);
        assert!(store.day_already_scheduled(pp.id, 1).unwrap());
        let pp = store.patient_protocol(pp.id).unwrap().unwrap();
        assert_eq!(pp.current_day, 2);
        assert!(pp.is_active);
    }

    #[test]
    fn test_generation_once_per_calendar_day() {
        let (store, patient_id, protocol_id) = seeded();
        let pp = store.assign_protocol(patient_id, protocol_id).unwrap();
        let gateway = RecordingGateway::new();
        let scheduler = QueueScheduler::new(&store, &gateway);

        let mut report = SchedulerReport::default();
        scheduler.advance_protocols(day(15, 10), &mut report).unwrap();
        scheduler.advance_protocols(day(15, 11), &mut report).unwrap();
        scheduler.advance_protocols(day(15, 23), &mut report).unwrap();

        // Same day: only day 1 generated, day counter did not burn through
        assert_eq!(report.messages_scheduled, 1);
        assert!(!store.day_already_scheduled(pp.id, 2).unwrap());
    }

    #[test]
    fn test_protocol_completion() {
        let (store, patient_id, protocol_id) = seeded();
        let pp = store.assign_protocol(patient_id, protocol_id).unwrap();
        let gateway = RecordingGateway::new();
        let scheduler = QueueScheduler::new(&store, &gateway);

        let mut report = SchedulerReport::default();
        scheduler.advance_protocols(day(15, 10), &mut report).unwrap();
        scheduler.advance_protocols(day(16, 10), &mut report).unwrap();

        // Two-day protocol: both days generated, enrollment closed
        assert_eq!(report.messages_scheduled, 2);
        assert_eq!(report.protocols_completed, 1);
        let pp = store.patient_protocol(pp.id).unwrap().unwrap();
        assert!(!pp.is_active);
        assert_eq!(pp.current_day, 2);

        // A later pass finds nothing active
        let mut report = SchedulerReport::default();
        scheduler.advance_protocols(day(17, 10), &mut report).unwrap();
        assert_eq!(report.messages_scheduled, 0);
    }

    #[test]
    fn test_current_day_never_exceeds_duration_while_active() {
        let (store, patient_id, protocol_id) = seeded();
        store.assign_protocol(patient_id, protocol_id).unwrap();
        let gateway = RecordingGateway::new();
        let scheduler = QueueScheduler::new(&store, &gateway);

        for d in 15..25 {
            let mut report = SchedulerReport::default();
            scheduler.advance_protocols(day(d, 10), &mut report).unwrap();
            for pp in store.active_patient_protocols().unwrap() {
                let protocol = store.protocol(pp.protocol_id).unwrap().unwrap();
                assert!(pp.current_day <= protocol.duration_days);
            }
        }
    }

    #[test]
    fn test_dispatch_marks_sent_and_logs() {
        let (store, patient_id, protocol_id) = seeded();
        store.assign_protocol(patient_id, protocol_id).unwrap();
        let gateway = RecordingGateway::new();
        let scheduler = QueueScheduler::new(&store, &gateway);

        // Generate at 10:00 (send time 09:00 already passed), dispatch due
        let report = scheduler.run_pass(day(15, 10)).unwrap();
        assert_eq!(report.messages_scheduled, 1);
        assert_eq!(report.processed, 1);
        assert_eq!(gateway.sent_count(), 1);
        assert_eq!(gateway.sent()[0].0, "+5511999990001");
    }

    #[test]
    fn test_dispatch_idempotent() {
        let (store, patient_id, protocol_id) = seeded();
        store.assign_protocol(patient_id, protocol_id).unwrap();
        let gateway = RecordingGateway::new();
        let scheduler = QueueScheduler::new(&store, &gateway);

        scheduler.run_pass(day(15, 10)).unwrap();
        let second = scheduler.run_pass(day(15, 10)).unwrap();

        // Re-running the same pass sends nothing twice
        assert_eq!(second.processed, 0);
        assert_eq!(gateway.sent_count(), 1);
    }

    #[test]
    fn test_dispatch_failure_marks_failed() {
        let (store, patient_id, protocol_id) = seeded();
        store.assign_protocol(patient_id, protocol_id).unwrap();
        let gateway = RecordingGateway::new();
        gateway.set_failing(true);
        let scheduler = QueueScheduler::new(&store, &gateway);

        let report = scheduler.run_pass(day(15, 10)).unwrap();
        assert_eq!(report.failed, 1);
        assert_eq!(report.processed, 0);

        // Failed is terminal: recovery does not re-dispatch it
        gateway.set_failing(false);
        let report = scheduler.run_pass(day(15, 11)).unwrap();
        assert_eq!(report.processed, 0);
        assert_eq!(gateway.sent_count(), 0);

        let due = store.due_pending(day(15, 12)).unwrap();
        assert!(due.is_empty());
        let msg = store.scheduled_message(1).unwrap().unwrap();
        assert_eq!(msg.status, ScheduledStatus::Failed);
    }

    #[test]
    fn test_dispatched_checkin_prompt_opens_state() {
        let (store, patient_id, protocol_id) = seeded();
        store.assign_protocol(patient_id, protocol_id).unwrap();
        let gateway = RecordingGateway::new();
        let scheduler = QueueScheduler::new(&store, &gateway);

        scheduler.run_pass(day(15, 10)).unwrap();
        let state = store.open_checkin(patient_id).unwrap().unwrap();
        assert_eq!(state.date, day(15, 10).date_naive());
        assert_eq!(state.step, crate::checkin::CheckinStep::Hydration);

        // Next day's prompt supersedes the unfinished state
        scheduler.run_pass(day(16, 10)).unwrap();
        let state = store.open_checkin(patient_id).unwrap().unwrap();
        assert_eq!(state.date, day(16, 10).date_naive());
    }

    #[test]
    fn test_send_time_for() {
        let at = send_time_for("0 9 * * *", day(15, 10)).unwrap();
        assert_eq!(at, day(15, 9));
        assert!(send_time_for("not cron", day(15, 10)).is_err());
    }

    #[test]
    fn test_parse_schedule_five_and_six_fields() {
        assert!(parse_schedule("0 9 * * *").is_ok());
        assert!(parse_schedule("30 0 9 * * *").is_ok());
        assert!(parse_schedule("bogus").is_err());
    }

    #[test]
    fn test_with_retry_recovers() {
        let mut attempts = 0;
        let result = with_retry(RetryPolicy::new(3, 1), || {
            attempts += 1;
            if attempts < 3 {
                Err(Error::Delivery("transient".to_string()))
            } else {
                Ok(attempts)
            }
        });
        assert_eq!(result.unwrap(), 3);
    }

    #[test]
    fn test_with_retry_exhausts() {
        let mut attempts = 0;
        let result: Result<()> = with_retry(RetryPolicy::new(3, 1), || {
            attempts += 1;
            Err(Error::Delivery("down".to_string()))
        });
        assert!(result.is_err());
        assert_eq!(attempts, 3);
    }
}
