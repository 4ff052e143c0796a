//! Missed check-in sweeper
//!
//! Finds patients whose daily check-in went quiet and nudges them once per
//! reminder window. The last-reminder time lives on the check-in row, so
//! repeated cron ticks inside one window stay silent.

use crate::delivery::DeliveryGateway;
use crate::error::Result;
use crate::store::Store;
use chrono::{DateTime, Duration, Utc};
use serde::Serialize;
use tracing::{info, warn};

/// Nudge text for a stalled check-in
const REMINDER_TEXT: &str =
    "Oi! Seu check-in de hoje ficou pela metade. Que tal terminar agora? 😊";

#[derive(Debug, Default, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SweepReport {
    pub processed: u32,
}

pub struct MissedCheckinSweeper<'a> {
    store: &'a Store,
    gateway: &'a dyn DeliveryGateway,
    staleness: Duration,
    reminder_window: Duration,
}

impl<'a> MissedCheckinSweeper<'a> {
    pub fn new(
        store: &'a Store,
        gateway: &'a dyn DeliveryGateway,
        stale_hours: i64,
        reminder_window_hours: i64,
    ) -> Self {
        Self {
            store,
            gateway,
            staleness: Duration::hours(stale_hours),
            reminder_window: Duration::hours(reminder_window_hours),
        }
    }

    /// One sweep: at most one reminder per stale check-in per window.
    /// A delivery failure leaves the reminder time unset, so the next
    /// sweep tries again.
    pub fn run(&self, now: DateTime<Utc>) -> Result<SweepReport> {
        let mut report = SweepReport::default();
        let stale_before = now - self.staleness;
        let reminded_before = now - self.reminder_window;

        for state in self.store.stale_open_checkins(stale_before, reminded_before)? {
            let patient = match self.store.patient(state.patient_id)? {
                Some(p) => p,
                None => continue,
            };

            match self.gateway.deliver(&patient.whatsapp, REMINDER_TEXT) {
                Ok(_) => {
                    self.store.mark_checkin_reminded(state.id, now)?;
                    self.store.insert_message(
                        patient.id,
                        crate::store::Sender::System,
                        REMINDER_TEXT,
                        now,
                    )?;
                    report.processed += 1;
                    info!(patient = patient.id, step = %state.step, "check-in nudge sent");
                }
                Err(e) => {
                    warn!(patient = patient.id, "check-in nudge failed: {}", e);
                }
            }
        }

        Ok(report)
    }
}
