//! Typed SQLite boundary over the row store
//!
//! Every entity crosses this boundary as an explicit struct; rows with
//! unknown enum text or malformed timestamps fail fast instead of being
//! trusted for shape. Status transitions on scheduled messages are guarded
//! UPDATEs checked by affected-row count, so terminal states are frozen.

use crate::checkin::{CheckinStep, Plan};
use crate::error::{Error, Result};
use chrono::{DateTime, NaiveDate, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use std::path::Path;

const DATE_FMT: &str = "%Y-%m-%d";

/// Patient identity and gamification totals
#[derive(Debug, Clone)]
pub struct Patient {
    pub id: i64,
    pub name: String,
    pub whatsapp: String,
    pub plan: Plan,
    pub high_risk: bool,
    pub needs_attention: bool,
    pub points: i64,
    pub level: i64,
    pub created_at: DateTime<Utc>,
}

/// A named multi-day program of messages
#[derive(Debug, Clone)]
pub struct Protocol {
    pub id: i64,
    pub name: String,
    pub duration_days: i64,
    /// Cron expression for the daily send time (standard 5-field)
    pub send_schedule: String,
}

/// Day-indexed message content for a protocol
#[derive(Debug, Clone)]
pub struct ProtocolTemplate {
    pub protocol_id: i64,
    pub day: i64,
    pub title: Option<String>,
    pub body: String,
    pub perspective: Option<String>,
}

/// One patient's enrollment in one protocol instance
#[derive(Debug, Clone)]
pub struct PatientProtocol {
    pub id: i64,
    pub patient_id: i64,
    pub protocol_id: i64,
    pub current_day: i64,
    pub is_active: bool,
    pub started_at: DateTime<Utc>,
}

/// Lifecycle status of a scheduled message
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScheduledStatus {
    Pending,
    Sent,
    Failed,
    Cancelled,
}

impl ScheduledStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ScheduledStatus::Pending => "pending",
            ScheduledStatus::Sent => "sent",
            ScheduledStatus::Failed => "failed",
            ScheduledStatus::Cancelled => "cancelled",
        }
    }
}

impl std::str::FromStr for ScheduledStatus {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "pending" => Ok(ScheduledStatus::Pending),
            "sent" => Ok(ScheduledStatus::Sent),
            "failed" => Ok(ScheduledStatus::Failed),
            "cancelled" => Ok(ScheduledStatus::Cancelled),
            other => Err(Error::Parse(format!("unknown message status: {}", other))),
        }
    }
}

/// A persisted unit of outbound work
#[derive(Debug, Clone)]
pub struct ScheduledMessage {
    pub id: i64,
    pub patient_id: i64,
    pub patient_protocol_id: Option<i64>,
    pub protocol_day: Option<i64>,
    pub title: Option<String>,
    pub body: String,
    pub send_at: DateTime<Utc>,
    pub status: ScheduledStatus,
    pub metadata: Option<serde_json::Value>,
    pub created_at: DateTime<Utc>,
    pub sent_at: Option<DateTime<Utc>>,
}

/// Fields for a new scheduled message row
#[derive(Debug, Clone)]
pub struct NewScheduledMessage {
    pub patient_id: i64,
    pub patient_protocol_id: Option<i64>,
    pub protocol_day: Option<i64>,
    pub title: Option<String>,
    pub body: String,
    pub send_at: DateTime<Utc>,
    pub metadata: Option<serde_json::Value>,
}

/// Per-patient, per-day in-progress conversational state
#[derive(Debug, Clone)]
pub struct CheckinState {
    pub id: i64,
    pub patient_id: i64,
    pub date: NaiveDate,
    pub step: CheckinStep,
    /// Accumulated answers keyed by step name
    pub data: serde_json::Value,
    pub reminded_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub updated_at: DateTime<Utc>,
}

/// Who authored a conversation log row
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Sender {
    Me,
    System,
    Patient,
}

impl Sender {
    pub fn as_str(&self) -> &'static str {
        match self {
            Sender::Me => "me",
            Sender::System => "system",
            Sender::Patient => "patient",
        }
    }
}

impl std::str::FromStr for Sender {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "me" => Ok(Sender::Me),
            "system" => Ok(Sender::System),
            "patient" => Ok(Sender::Patient),
            other => Err(Error::Parse(format!("unknown sender: {}", other))),
        }
    }
}

/// Append-only conversation log row
#[derive(Debug, Clone)]
pub struct MessageLog {
    pub id: i64,
    pub patient_id: i64,
    pub sender: Sender,
    pub text: String,
    pub timestamp: DateTime<Utc>,
    /// Completion marker for detached inbound processing
    pub processed_at: Option<DateTime<Utc>>,
}

/// Escalation record surfaced to clinical staff
#[derive(Debug, Clone)]
pub struct AttentionRequest {
    pub id: i64,
    pub patient_id: i64,
    pub reason: String,
    pub trigger_text: String,
    pub suggested_reply: Option<String>,
    pub priority: i64,
    pub created_at: DateTime<Utc>,
}

const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS patients (
    id INTEGER PRIMARY KEY,
    name TEXT NOT NULL,
    whatsapp TEXT NOT NULL UNIQUE,
    plan TEXT NOT NULL DEFAULT 'freemium',
    high_risk INTEGER NOT NULL DEFAULT 0,
    needs_attention INTEGER NOT NULL DEFAULT 0,
    points INTEGER NOT NULL DEFAULT 0,
    level INTEGER NOT NULL DEFAULT 1,
    created_at TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS protocols (
    id INTEGER PRIMARY KEY,
    name TEXT NOT NULL,
    duration_days INTEGER NOT NULL,
    send_schedule TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS protocol_templates (
    id INTEGER PRIMARY KEY,
    protocol_id INTEGER NOT NULL REFERENCES protocols(id),
    day INTEGER NOT NULL,
    title TEXT,
    body TEXT NOT NULL,
    perspective TEXT,
    UNIQUE (protocol_id, day)
);

CREATE TABLE IF NOT EXISTS patient_protocols (
    id INTEGER PRIMARY KEY,
    patient_id INTEGER NOT NULL REFERENCES patients(id),
    protocol_id INTEGER NOT NULL REFERENCES protocols(id),
    current_day INTEGER NOT NULL DEFAULT 1,
    is_active INTEGER NOT NULL DEFAULT 1,
    started_at TEXT NOT NULL
);

CREATE UNIQUE INDEX IF NOT EXISTS idx_one_active_protocol
    ON patient_protocols (patient_id) WHERE is_active = 1;

CREATE TABLE IF NOT EXISTS scheduled_messages (
    id INTEGER PRIMARY KEY,
    patient_id INTEGER NOT NULL REFERENCES patients(id),
    patient_protocol_id INTEGER REFERENCES patient_protocols(id),
    protocol_day INTEGER,
    title TEXT,
    body TEXT NOT NULL,
    send_at TEXT NOT NULL,
    status TEXT NOT NULL DEFAULT 'pending',
    metadata TEXT,
    created_at TEXT NOT NULL,
    sent_at TEXT
);

CREATE UNIQUE INDEX IF NOT EXISTS idx_one_message_per_day
    ON scheduled_messages (patient_protocol_id, protocol_day)
    WHERE patient_protocol_id IS NOT NULL;

CREATE TABLE IF NOT EXISTS daily_checkin_states (
    id INTEGER PRIMARY KEY,
    patient_id INTEGER NOT NULL REFERENCES patients(id),
    date TEXT NOT NULL,
    step TEXT NOT NULL,
    data TEXT NOT NULL DEFAULT '{}',
    reminded_at TEXT,
    completed_at TEXT,
    updated_at TEXT NOT NULL,
    UNIQUE (patient_id, date)
);

CREATE TABLE IF NOT EXISTS onboarding_states (
    id INTEGER PRIMARY KEY,
    patient_id INTEGER NOT NULL REFERENCES patients(id),
    date TEXT NOT NULL,
    step TEXT NOT NULL,
    data TEXT NOT NULL DEFAULT '{}',
    reminded_at TEXT,
    completed_at TEXT,
    updated_at TEXT NOT NULL,
    UNIQUE (patient_id, date)
);

CREATE TABLE IF NOT EXISTS messages (
    id INTEGER PRIMARY KEY,
    patient_id INTEGER NOT NULL REFERENCES patients(id),
    sender TEXT NOT NULL,
    text TEXT NOT NULL,
    timestamp TEXT NOT NULL,
    processed_at TEXT
);

CREATE TABLE IF NOT EXISTS attention_requests (
    id INTEGER PRIMARY KEY,
    patient_id INTEGER NOT NULL REFERENCES patients(id),
    reason TEXT NOT NULL,
    trigger_text TEXT NOT NULL,
    suggested_reply TEXT,
    priority INTEGER NOT NULL DEFAULT 2,
    created_at TEXT NOT NULL
);
"#;

/// The row store. One connection, used by short-lived sequential jobs.
pub struct Store {
    conn: Connection,
}

impl Store {
    /// Open (creating parent directories and schema as needed)
    pub fn open(db_path: &Path) -> Result<Self> {
        if let Some(parent) = db_path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let conn = Connection::open(db_path)?;
        conn.pragma_update(None, "foreign_keys", true)?;
        conn.execute_batch(SCHEMA)?;
        Ok(Self { conn })
    }

    /// In-memory store for tests
    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        conn.pragma_update(None, "foreign_keys", true)?;
        conn.execute_batch(SCHEMA)?;
        Ok(Self { conn })
    }

    // ------------------------------------------------------------------
    // Patients
    // ------------------------------------------------------------------

    pub fn insert_patient(&self, name: &str, whatsapp: &str, plan: Plan) -> Result<Patient> {
        let now = Utc::now();
        self.conn.execute(
            "INSERT INTO patients (name, whatsapp, plan, created_at) VALUES (?1, ?2, ?3, ?4)",
            params![name, whatsapp, plan.as_str(), ts(now)],
        )?;
        let id = self.conn.last_insert_rowid();
        self.patient(id)?
            .ok_or_else(|| Error::PatientNotFound(whatsapp.to_string()))
    }

    pub fn patient(&self, id: i64) -> Result<Option<Patient>> {
        self.patient_where("id = ?1", params![id])
    }

    pub fn patient_by_phone(&self, whatsapp: &str) -> Result<Option<Patient>> {
        self.patient_where("whatsapp = ?1", params![whatsapp])
    }

    fn patient_where(
        &self,
        clause: &str,
        args: impl rusqlite::Params,
    ) -> Result<Option<Patient>> {
        let sql = format!(
            "SELECT id, name, whatsapp, plan, high_risk, needs_attention, points, level, \
             created_at FROM patients WHERE {}",
            clause
        );
        let row: Option<(i64, String, String, String, bool, bool, i64, i64, String)> = self
            .conn
            .query_row(&sql, args, |row| {
                Ok((
                    row.get(0)?,
                    row.get(1)?,
                    row.get(2)?,
                    row.get(3)?,
                    row.get(4)?,
                    row.get(5)?,
                    row.get(6)?,
                    row.get(7)?,
                    row.get(8)?,
                ))
            })
            .optional()?;

        match row {
            None => Ok(None),
            Some((id, name, whatsapp, plan, high_risk, needs_attention, points, level, created)) => {
                Ok(Some(Patient {
                    id,
                    name,
                    whatsapp,
                    plan: plan.parse()?,
                    high_risk,
                    needs_attention,
                    points,
                    level,
                    created_at: parse_ts(&created)?,
                }))
            }
        }
    }

    /// Apply a point delta; level is one per 100 accumulated points.
    pub fn add_points(&self, patient_id: i64, delta: i64) -> Result<i64> {
        self.conn.execute(
            "UPDATE patients SET points = points + ?1, \
             level = (points + ?1) / 100 + 1 WHERE id = ?2",
            params![delta, patient_id],
        )?;
        let points: i64 = self.conn.query_row(
            "SELECT points FROM patients WHERE id = ?1",
            params![patient_id],
            |row| row.get(0),
        )?;
        Ok(points)
    }

    pub fn set_needs_attention(&self, patient_id: i64, flag: bool) -> Result<()> {
        self.conn.execute(
            "UPDATE patients SET needs_attention = ?1 WHERE id = ?2",
            params![flag, patient_id],
        )?;
        Ok(())
    }

    // ------------------------------------------------------------------
    // Protocols
    // ------------------------------------------------------------------

    pub fn insert_protocol(
        &self,
        name: &str,
        duration_days: i64,
        send_schedule: &str,
    ) -> Result<Protocol> {
        self.conn.execute(
            "INSERT INTO protocols (name, duration_days, send_schedule) VALUES (?1, ?2, ?3)",
            params![name, duration_days, send_schedule],
        )?;
        let id = self.conn.last_insert_rowid();
        self.protocol(id)?.ok_or(Error::ProtocolNotFound(id))
    }

    pub fn protocol(&self, id: i64) -> Result<Option<Protocol>> {
        let row = self
            .conn
            .query_row(
                "SELECT id, name, duration_days, send_schedule FROM protocols WHERE id = ?1",
                params![id],
                |row| {
                    Ok(Protocol {
                        id: row.get(0)?,
                        name: row.get(1)?,
                        duration_days: row.get(2)?,
                        send_schedule: row.get(3)?,
                    })
                },
            )
            .optional()?;
        Ok(row)
    }

    pub fn insert_template(
        &self,
        protocol_id: i64,
        day: i64,
        title: Option<&str>,
        body: &str,
        perspective: Option<&str>,
    ) -> Result<()> {
        self.conn.execute(
            "INSERT INTO protocol_templates (protocol_id, day, title, body, perspective) \
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![protocol_id, day, title, body, perspective],
        )?;
        Ok(())
    }

    pub fn template(&self, protocol_id: i64, day: i64) -> Result<Option<ProtocolTemplate>> {
        let row = self
            .conn
            .query_row(
                "SELECT protocol_id, day, title, body, perspective FROM protocol_templates \
                 WHERE protocol_id = ?1 AND day = ?2",
                params![protocol_id, day],
                |row| {
                    Ok(ProtocolTemplate {
                        protocol_id: row.get(0)?,
                        day: row.get(1)?,
                        title: row.get(2)?,
                        body: row.get(3)?,
                        perspective: row.get(4)?,
                    })
                },
            )
            .optional()?;
        Ok(row)
    }

    /// Enroll a patient, deactivating any previous active protocol first
    /// (one active enrollment per patient, backed by a unique index).
    pub fn assign_protocol(&self, patient_id: i64, protocol_id: i64) -> Result<PatientProtocol> {
        let now = Utc::now();
        self.conn.execute(
            "UPDATE patient_protocols SET is_active = 0 WHERE patient_id = ?1 AND is_active = 1",
            params![patient_id],
        )?;
        self.conn.execute(
            "INSERT INTO patient_protocols (patient_id, protocol_id, current_day, is_active, \
             started_at) VALUES (?1, ?2, 1, 1, ?3)",
            params![patient_id, protocol_id, ts(now)],
        )?;
        let id = self.conn.last_insert_rowid();
        self.patient_protocol(id)?.ok_or(Error::ProtocolNotFound(id))
    }

    pub fn patient_protocol(&self, id: i64) -> Result<Option<PatientProtocol>> {
        let row = self
            .conn
            .query_row(
                "SELECT id, patient_id, protocol_id, current_day, is_active, started_at \
                 FROM patient_protocols WHERE id = ?1",
                params![id],
                map_patient_protocol,
            )
            .optional()?;
        row.map(finish_patient_protocol).transpose()
    }

    pub fn active_patient_protocols(&self) -> Result<Vec<PatientProtocol>> {
        let mut stmt = self.conn.prepare(
            "SELECT id, patient_id, protocol_id, current_day, is_active, started_at \
             FROM patient_protocols WHERE is_active = 1 ORDER BY id",
        )?;
        let rows = stmt.query_map([], map_patient_protocol)?;
        rows.map(|r| finish_patient_protocol(r?)).collect()
    }

    pub fn advance_protocol_day(&self, pp_id: i64) -> Result<()> {
        self.conn.execute(
            "UPDATE patient_protocols SET current_day = current_day + 1 \
             WHERE id = ?1 AND is_active = 1",
            params![pp_id],
        )?;
        Ok(())
    }

    pub fn deactivate_protocol(&self, pp_id: i64) -> Result<()> {
        self.conn.execute(
            "UPDATE patient_protocols SET is_active = 0 WHERE id = ?1",
            params![pp_id],
        )?;
        Ok(())
    }

    // ------------------------------------------------------------------
    // Scheduled messages
    // ------------------------------------------------------------------

    pub fn insert_scheduled_message(&self, msg: &NewScheduledMessage) -> Result<i64> {
        let metadata = msg
            .metadata
            .as_ref()
            .map(serde_json::to_string)
            .transpose()?;
        self.conn.execute(
            "INSERT INTO scheduled_messages (patient_id, patient_protocol_id, protocol_day, \
             title, body, send_at, status, metadata, created_at) \
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, 'pending', ?7, ?8)",
            params![
                msg.patient_id,
                msg.patient_protocol_id,
                msg.protocol_day,
                msg.title,
                msg.body,
                ts(msg.send_at),
                metadata,
                ts(Utc::now()),
            ],
        )?;
        Ok(self.conn.last_insert_rowid())
    }

    /// Generation dedup guard: has this protocol day already produced a row?
    pub fn day_already_scheduled(&self, pp_id: i64, day: i64) -> Result<bool> {
        let count: i64 = self.conn.query_row(
            "SELECT COUNT(*) FROM scheduled_messages \
             WHERE patient_protocol_id = ?1 AND protocol_day = ?2",
            params![pp_id, day],
            |row| row.get(0),
        )?;
        Ok(count > 0)
    }

    /// Whether this enrollment already generated a message with a send time
    /// on the given calendar date (one protocol day per day).
    pub fn protocol_day_scheduled_on(&self, pp_id: i64, date: NaiveDate) -> Result<bool> {
        let count: i64 = self.conn.query_row(
            "SELECT COUNT(*) FROM scheduled_messages \
             WHERE patient_protocol_id = ?1 AND substr(send_at, 1, 10) = ?2",
            params![pp_id, date.format(DATE_FMT).to_string()],
            |row| row.get(0),
        )?;
        Ok(count > 0)
    }

    /// Pending rows whose send time has passed. Terminal rows are never
    /// eligible, which is what makes re-running a dispatch pass safe.
    pub fn due_pending(&self, now: DateTime<Utc>) -> Result<Vec<ScheduledMessage>> {
        let mut stmt = self.conn.prepare(
            "SELECT id, patient_id, patient_protocol_id, protocol_day, title, body, send_at, \
             status, metadata, created_at, sent_at FROM scheduled_messages \
             WHERE status = 'pending' AND send_at <= ?1 ORDER BY send_at, id",
        )?;
        let rows = stmt.query_map(params![ts(now)], map_scheduled)?;
        rows.map(|r| finish_scheduled(r?)).collect()
    }

    pub fn scheduled_message(&self, id: i64) -> Result<Option<ScheduledMessage>> {
        let row = self
            .conn
            .query_row(
                "SELECT id, patient_id, patient_protocol_id, protocol_day, title, body, \
                 send_at, status, metadata, created_at, sent_at FROM scheduled_messages \
                 WHERE id = ?1",
                params![id],
                map_scheduled,
            )
            .optional()?;
        row.map(finish_scheduled).transpose()
    }

    pub fn mark_sent(&self, id: i64, now: DateTime<Utc>) -> Result<()> {
        self.transition(id, ScheduledStatus::Sent, Some(now))
    }

    pub fn mark_failed(&self, id: i64) -> Result<()> {
        self.transition(id, ScheduledStatus::Failed, None)
    }

    pub fn cancel_scheduled(&self, id: i64) -> Result<()> {
        self.transition(id, ScheduledStatus::Cancelled, None)
    }

    /// pending -> {sent, failed, cancelled}, exactly once. The WHERE guard
    /// plus affected-row check refuses transitions out of terminal states.
    fn transition(
        &self,
        id: i64,
        to: ScheduledStatus,
        sent_at: Option<DateTime<Utc>>,
    ) -> Result<()> {
        let affected = self.conn.execute(
            "UPDATE scheduled_messages SET status = ?1, sent_at = ?2 \
             WHERE id = ?3 AND status = 'pending'",
            params![to.as_str(), sent_at.map(ts), id],
        )?;
        if affected == 0 {
            return Err(Error::InvalidTransition(id));
        }
        Ok(())
    }

    // ------------------------------------------------------------------
    // Check-in states (daily + onboarding share one shape)
    // ------------------------------------------------------------------

    pub fn begin_checkin(
        &self,
        patient_id: i64,
        date: NaiveDate,
        step: CheckinStep,
    ) -> Result<CheckinState> {
        self.begin_state("daily_checkin_states", patient_id, date, step)
    }

    /// Most recent open daily check-in for a patient, if any
    pub fn open_checkin(&self, patient_id: i64) -> Result<Option<CheckinState>> {
        self.open_state("daily_checkin_states", patient_id)
    }

    /// Record an answer and move the step forward. Regressions are refused;
    /// persisted state only ever advances within a day.
    pub fn advance_checkin(
        &self,
        state: &CheckinState,
        to: CheckinStep,
        answer: &str,
        now: DateTime<Utc>,
    ) -> Result<()> {
        if to <= state.step {
            return Err(Error::StepRegression {
                from: state.step.to_string(),
                to: to.to_string(),
            });
        }
        let mut data = state.data.clone();
        if let Some(obj) = data.as_object_mut() {
            obj.insert(
                state.step.as_str().to_string(),
                serde_json::Value::String(answer.to_string()),
            );
        }
        self.conn.execute(
            "UPDATE daily_checkin_states SET step = ?1, data = ?2, updated_at = ?3 \
             WHERE id = ?4 AND completed_at IS NULL",
            params![to.as_str(), serde_json::to_string(&data)?, ts(now), state.id],
        )?;
        Ok(())
    }

    pub fn complete_checkin(&self, id: i64, now: DateTime<Utc>) -> Result<()> {
        self.conn.execute(
            "UPDATE daily_checkin_states SET step = 'complete', completed_at = ?1, \
             updated_at = ?1 WHERE id = ?2",
            params![ts(now), id],
        )?;
        Ok(())
    }

    /// Open check-ins stale enough to nudge and not nudged within the
    /// reminder window.
    pub fn stale_open_checkins(
        &self,
        stale_before: DateTime<Utc>,
        reminded_before: DateTime<Utc>,
    ) -> Result<Vec<CheckinState>> {
        let mut stmt = self.conn.prepare(
            "SELECT id, patient_id, date, step, data, reminded_at, completed_at, updated_at \
             FROM daily_checkin_states WHERE completed_at IS NULL AND updated_at <= ?1 \
             AND (reminded_at IS NULL OR reminded_at <= ?2) ORDER BY updated_at",
        )?;
        let rows = stmt.query_map(params![ts(stale_before), ts(reminded_before)], map_state)?;
        rows.map(|r| finish_state(r?)).collect()
    }

    pub fn mark_checkin_reminded(&self, id: i64, now: DateTime<Utc>) -> Result<()> {
        self.conn.execute(
            "UPDATE daily_checkin_states SET reminded_at = ?1 WHERE id = ?2",
            params![ts(now), id],
        )?;
        Ok(())
    }

    pub fn begin_onboarding(&self, patient_id: i64, date: NaiveDate) -> Result<CheckinState> {
        self.begin_state("onboarding_states", patient_id, date, CheckinStep::Hydration)
    }

    pub fn open_onboarding(&self, patient_id: i64) -> Result<Option<CheckinState>> {
        self.open_state("onboarding_states", patient_id)
    }

    pub fn complete_onboarding(&self, id: i64, now: DateTime<Utc>) -> Result<()> {
        self.conn.execute(
            "UPDATE onboarding_states SET step = 'complete', completed_at = ?1, updated_at = ?1 \
             WHERE id = ?2",
            params![ts(now), id],
        )?;
        Ok(())
    }

    fn begin_state(
        &self,
        table: &str,
        patient_id: i64,
        date: NaiveDate,
        step: CheckinStep,
    ) -> Result<CheckinState> {
        let now = Utc::now();
        self.conn.execute(
            &format!(
                "INSERT INTO {} (patient_id, date, step, data, updated_at) \
                 VALUES (?1, ?2, ?3, '{{}}', ?4)",
                table
            ),
            params![patient_id, date.format(DATE_FMT).to_string(), step.as_str(), ts(now)],
        )?;
        let id = self.conn.last_insert_rowid();
        Ok(CheckinState {
            id,
            patient_id,
            date,
            step,
            data: serde_json::json!({}),
            reminded_at: None,
            completed_at: None,
            updated_at: now,
        })
    }

    fn open_state(&self, table: &str, patient_id: i64) -> Result<Option<CheckinState>> {
        let row = self
            .conn
            .query_row(
                &format!(
                    "SELECT id, patient_id, date, step, data, reminded_at, completed_at, \
                     updated_at FROM {} WHERE patient_id = ?1 AND completed_at IS NULL \
                     ORDER BY date DESC LIMIT 1",
                    table
                ),
                params![patient_id],
                map_state,
            )
            .optional()?;
        row.map(finish_state).transpose()
    }

    // ------------------------------------------------------------------
    // Conversation log
    // ------------------------------------------------------------------

    /// Outbound/system log rows need no further processing; the marker is
    /// stamped at insert.
    pub fn insert_message(
        &self,
        patient_id: i64,
        sender: Sender,
        text: &str,
        now: DateTime<Utc>,
    ) -> Result<i64> {
        self.conn.execute(
            "INSERT INTO messages (patient_id, sender, text, timestamp, processed_at) \
             VALUES (?1, ?2, ?3, ?4, ?4)",
            params![patient_id, sender.as_str(), text, ts(now)],
        )?;
        Ok(self.conn.last_insert_rowid())
    }

    /// Inbound rows are persisted before the transport ack; the processing
    /// marker is stamped by the background task when it finishes.
    pub fn insert_inbound(&self, patient_id: i64, text: &str, now: DateTime<Utc>) -> Result<i64> {
        self.conn.execute(
            "INSERT INTO messages (patient_id, sender, text, timestamp) VALUES (?1, 'patient', ?2, ?3)",
            params![patient_id, text, ts(now)],
        )?;
        Ok(self.conn.last_insert_rowid())
    }

    pub fn mark_message_processed(&self, id: i64, now: DateTime<Utc>) -> Result<()> {
        self.conn.execute(
            "UPDATE messages SET processed_at = ?1 WHERE id = ?2",
            params![ts(now), id],
        )?;
        Ok(())
    }

    /// Inbound rows a restart left without a completion marker
    pub fn unprocessed_inbound(&self) -> Result<Vec<MessageLog>> {
        let mut stmt = self.conn.prepare(
            "SELECT id, patient_id, sender, text, timestamp, processed_at FROM messages \
             WHERE sender = 'patient' AND processed_at IS NULL ORDER BY id",
        )?;
        let rows = stmt.query_map([], |row| {
            Ok((
                row.get::<_, i64>(0)?,
                row.get::<_, i64>(1)?,
                row.get::<_, String>(2)?,
                row.get::<_, String>(3)?,
                row.get::<_, String>(4)?,
                row.get::<_, Option<String>>(5)?,
            ))
        })?;
        rows.map(|r| {
            let (id, patient_id, sender, text, timestamp, processed_at) = r?;
            Ok(MessageLog {
                id,
                patient_id,
                sender: sender.parse()?,
                text,
                timestamp: parse_ts(&timestamp)?,
                processed_at: processed_at.as_deref().map(parse_ts).transpose()?,
            })
        })
        .collect()
    }

    // ------------------------------------------------------------------
    // Attention requests
    // ------------------------------------------------------------------

    pub fn insert_attention_request(
        &self,
        patient_id: i64,
        reason: &str,
        trigger_text: &str,
        suggested_reply: Option<&str>,
        priority: i64,
        now: DateTime<Utc>,
    ) -> Result<i64> {
        self.conn.execute(
            "INSERT INTO attention_requests (patient_id, reason, trigger_text, suggested_reply, \
             priority, created_at) VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![patient_id, reason, trigger_text, suggested_reply, priority, ts(now)],
        )?;
        Ok(self.conn.last_insert_rowid())
    }

    pub fn attention_requests(&self, patient_id: i64) -> Result<Vec<AttentionRequest>> {
        let mut stmt = self.conn.prepare(
            "SELECT id, patient_id, reason, trigger_text, suggested_reply, priority, created_at \
             FROM attention_requests WHERE patient_id = ?1 ORDER BY id",
        )?;
        let rows = stmt.query_map(params![patient_id], |row| {
            Ok((
                row.get::<_, i64>(0)?,
                row.get::<_, i64>(1)?,
                row.get::<_, String>(2)?,
                row.get::<_, String>(3)?,
                row.get::<_, Option<String>>(4)?,
                row.get::<_, i64>(5)?,
                row.get::<_, String>(6)?,
            ))
        })?;
        rows.map(|r| {
            let (id, patient_id, reason, trigger_text, suggested_reply, priority, created_at) = r?;
            Ok(AttentionRequest {
                id,
                patient_id,
                reason,
                trigger_text,
                suggested_reply,
                priority,
                created_at: parse_ts(&created_at)?,
            })
        })
        .collect()
    }

    /// Row count for a known table (status reporting)
    pub fn count(&self, table: &str) -> Result<i64> {
        const TABLES: &[&str] = &[
            "patients",
            "protocols",
            "patient_protocols",
            "scheduled_messages",
            "daily_checkin_states",
            "onboarding_states",
            "messages",
            "attention_requests",
        ];
        if !TABLES.contains(&table) {
            return Err(Error::Parse(format!("unknown table: {}", table)));
        }
        let count: i64 =
            self.conn
                .query_row(&format!("SELECT COUNT(*) FROM {}", table), [], |row| {
                    row.get(0)
                })?;
        Ok(count)
    }
}

// ----------------------------------------------------------------------
// Row mapping helpers
// ----------------------------------------------------------------------

type RawPatientProtocol = (i64, i64, i64, i64, bool, String);

fn map_patient_protocol(row: &rusqlite::Row<'_>) -> rusqlite::Result<RawPatientProtocol> {
    Ok((
        row.get(0)?,
        row.get(1)?,
        row.get(2)?,
        row.get(3)?,
        row.get(4)?,
        row.get(5)?,
    ))
}

fn finish_patient_protocol(raw: RawPatientProtocol) -> Result<PatientProtocol> {
    let (id, patient_id, protocol_id, current_day, is_active, started_at) = raw;
    Ok(PatientProtocol {
        id,
        patient_id,
        protocol_id,
        current_day,
        is_active,
        started_at: parse_ts(&started_at)?,
    })
}

type RawScheduled = (
    i64,
    i64,
    Option<i64>,
    Option<i64>,
    Option<String>,
    String,
    String,
    String,
    Option<String>,
    String,
    Option<String>,
);

fn map_scheduled(row: &rusqlite::Row<'_>) -> rusqlite::Result<RawScheduled> {
    Ok((
        row.get(0)?,
        row.get(1)?,
        row.get(2)?,
        row.get(3)?,
        row.get(4)?,
        row.get(5)?,
        row.get(6)?,
        row.get(7)?,
        row.get(8)?,
        row.get(9)?,
        row.get(10)?,
    ))
}

fn finish_scheduled(raw: RawScheduled) -> Result<ScheduledMessage> {
    let (id, patient_id, pp_id, day, title, body, send_at, status, metadata, created_at, sent_at) =
        raw;
    Ok(ScheduledMessage {
        id,
        patient_id,
        patient_protocol_id: pp_id,
        protocol_day: day,
        title,
        body,
        send_at: parse_ts(&send_at)?,
        status: status.parse()?,
        metadata: metadata.as_deref().map(serde_json::from_str).transpose()?,
        created_at: parse_ts(&created_at)?,
        sent_at: sent_at.as_deref().map(parse_ts).transpose()?,
    })
}

type RawState = (
    i64,
    i64,
    String,
    String,
    String,
    Option<String>,
    Option<String>,
    String,
);

fn map_state(row: &rusqlite::Row<'_>) -> rusqlite::Result<RawState> {
    Ok((
        row.get(0)?,
        row.get(1)?,
        row.get(2)?,
        row.get(3)?,
        row.get(4)?,
        row.get(5)?,
        row.get(6)?,
        row.get(7)?,
    ))
}

fn finish_state(raw: RawState) -> Result<CheckinState> {
    let (id, patient_id, date, step, data, reminded_at, completed_at, updated_at) = raw;
    Ok(CheckinState {
        id,
        patient_id,
        date: NaiveDate::parse_from_str(&date, DATE_FMT)
            .map_err(|e| Error::Parse(format!("bad date '{}': {}", date, e)))?,
        step: step.parse()?,
        data: serde_json::from_str(&data)?,
        reminded_at: reminded_at.as_deref().map(parse_ts).transpose()?,
        completed_at: completed_at.as_deref().map(parse_ts).transpose()?,
        updated_at: parse_ts(&updated_at)?,
    })
}

fn ts(dt: DateTime<Utc>) -> String {
    dt.to_rfc3339()
}

fn parse_ts(raw: &str) -> Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| Error::Parse(format!("bad timestamp '{}': {}", raw, e)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn store() -> Store {
        Store::open_in_memory().unwrap()
    }

    fn sample_patient(store: &Store) -> Patient {
        store
            .insert_patient("Maria Silva", "+5511999990001", Plan::Premium)
            .unwrap()
    }

    #[test]
    fn test_patient_round_trip() {
        let store = store();
        let p = sample_patient(&store);
        assert_eq!(p.plan, Plan::Premium);
        assert_eq!(p.points, 0);
        assert_eq!(p.level, 1);

        let found = store.patient_by_phone("+5511999990001").unwrap().unwrap();
        assert_eq!(found.id, p.id);
        assert_eq!(found.name, "Maria Silva");

        assert!(store.patient_by_phone("+5511000000000").unwrap().is_none());
    }

    #[test]
    fn test_add_points_and_level() {
        let store = store();
        let p = sample_patient(&store);

        assert_eq!(store.add_points(p.id, 60).unwrap(), 60);
        assert_eq!(store.patient(p.id).unwrap().unwrap().level, 1);

        assert_eq!(store.add_points(p.id, 60).unwrap(), 120);
        assert_eq!(store.patient(p.id).unwrap().unwrap().level, 2);
    }

    #[test]
    fn test_one_active_protocol_per_patient() {
        let store = store();
        let p = sample_patient(&store);
        let proto_a = store.insert_protocol("Fase 1", 14, "0 9 * * *").unwrap();
        let proto_b = store.insert_protocol("Fase 2", 28, "0 9 * * *").unwrap();

        let first = store.assign_protocol(p.id, proto_a.id).unwrap();
        assert!(first.is_active);

        // Second assignment supersedes the first
        let second = store.assign_protocol(p.id, proto_b.id).unwrap();
        assert!(second.is_active);

        let active = store.active_patient_protocols().unwrap();
        assert_eq!(active.len(), 1);
        assert_eq!(active[0].protocol_id, proto_b.id);

        let old = store.patient_protocol(first.id).unwrap().unwrap();
        assert!(!old.is_active);
    }

    #[test]
    fn test_scheduled_message_transitions() {
        let store = store();
        let p = sample_patient(&store);
        let now = Utc::now();

        let id = store
            .insert_scheduled_message(&NewScheduledMessage {
                patient_id: p.id,
                patient_protocol_id: None,
                protocol_day: None,
                title: Some("[check-in] Dia 1".to_string()),
                body: "Bom dia!".to_string(),
                send_at: now,
                metadata: Some(serde_json::json!({"perspective": "hidratacao"})),
            })
            .unwrap();

        let msg = store.scheduled_message(id).unwrap().unwrap();
        assert_eq!(msg.status, ScheduledStatus::Pending);
        assert_eq!(
            msg.metadata.unwrap()["perspective"],
            serde_json::json!("hidratacao")
        );

        store.mark_sent(id, now).unwrap();
        let msg = store.scheduled_message(id).unwrap().unwrap();
        assert_eq!(msg.status, ScheduledStatus::Sent);
        assert!(msg.sent_at.is_some());

        // Terminal states are frozen
        let err = store.mark_failed(id).unwrap_err();
        assert!(matches!(err, Error::InvalidTransition(_)));
        let err = store.mark_sent(id, now).unwrap_err();
        assert!(matches!(err, Error::InvalidTransition(_)));
    }

    #[test]
    fn test_due_pending_excludes_terminal_and_future() {
        let store = store();
        let p = sample_patient(&store);
        let now = Utc::now();

        let due = store
            .insert_scheduled_message(&new_msg(p.id, now - Duration::minutes(5)))
            .unwrap();
        let future = store
            .insert_scheduled_message(&new_msg(p.id, now + Duration::hours(1)))
            .unwrap();
        let sent = store
            .insert_scheduled_message(&new_msg(p.id, now - Duration::minutes(10)))
            .unwrap();
        store.mark_sent(sent, now).unwrap();

        let rows = store.due_pending(now).unwrap();
        let ids: Vec<i64> = rows.iter().map(|m| m.id).collect();
        assert!(ids.contains(&due));
        assert!(!ids.contains(&future));
        assert!(!ids.contains(&sent));
    }

    fn new_msg(patient_id: i64, send_at: DateTime<Utc>) -> NewScheduledMessage {
        NewScheduledMessage {
            patient_id,
            patient_protocol_id: None,
            protocol_day: None,
            title: None,
            body: "msg".to_string(),
            send_at,
            metadata: None,
        }
    }

    #[test]
    fn test_day_already_scheduled() {
        let store = store();
        let p = sample_patient(&store);
        let proto = store.insert_protocol("Fase 1", 14, "0 9 * * *").unwrap();
        let pp = store.assign_protocol(p.id, proto.id).unwrap();

        assert!(!store.day_already_scheduled(pp.id, 1).unwrap());

        store
            .insert_scheduled_message(&NewScheduledMessage {
                patient_id: p.id,
                patient_protocol_id: Some(pp.id),
                protocol_day: Some(1),
                title: None,
                body: "dia 1".to_string(),
                send_at: Utc::now(),
                metadata: None,
            })
            .unwrap();

        assert!(store.day_already_scheduled(pp.id, 1).unwrap());
        assert!(!store.day_already_scheduled(pp.id, 2).unwrap());
    }

    #[test]
    fn test_checkin_forward_only() {
        let store = store();
        let p = sample_patient(&store);
        let date = Utc::now().date_naive();
        let state = store
            .begin_checkin(p.id, date, CheckinStep::Hydration)
            .unwrap();

        let now = Utc::now();
        store
            .advance_checkin(&state, CheckinStep::Breakfast, "A", now)
            .unwrap();

        let state = store.open_checkin(p.id).unwrap().unwrap();
        assert_eq!(state.step, CheckinStep::Breakfast);
        assert_eq!(state.data["hydration"], serde_json::json!("A"));

        // Regression refused
        let err = store
            .advance_checkin(&state, CheckinStep::Hydration, "B", now)
            .unwrap_err();
        assert!(matches!(err, Error::StepRegression { .. }));

        store.complete_checkin(state.id, now).unwrap();
        assert!(store.open_checkin(p.id).unwrap().is_none());
    }

    #[test]
    fn test_stale_open_checkins() {
        let store = store();
        let p = sample_patient(&store);
        let date = Utc::now().date_naive();
        let state = store
            .begin_checkin(p.id, date, CheckinStep::Hydration)
            .unwrap();

        let future = Utc::now() + Duration::hours(1);
        let stale = store.stale_open_checkins(future, future).unwrap();
        assert_eq!(stale.len(), 1);

        // A fresh reminder suppresses the next sweep
        store.mark_checkin_reminded(state.id, Utc::now()).unwrap();
        let past = Utc::now() - Duration::hours(1);
        let stale = store.stale_open_checkins(future, past).unwrap();
        assert!(stale.is_empty());
    }

    #[test]
    fn test_inbound_processing_marker() {
        let store = store();
        let p = sample_patient(&store);
        let now = Utc::now();

        let id = store.insert_inbound(p.id, "75", now).unwrap();
        let pending = store.unprocessed_inbound().unwrap();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].id, id);

        store.mark_message_processed(id, now).unwrap();
        assert!(store.unprocessed_inbound().unwrap().is_empty());

        // Outbound rows never show up as unprocessed
        store.insert_message(p.id, Sender::Me, "oi", now).unwrap();
        assert!(store.unprocessed_inbound().unwrap().is_empty());
    }

    #[test]
    fn test_attention_requests() {
        let store = store();
        let p = sample_patient(&store);
        let now = Utc::now();

        store
            .insert_attention_request(p.id, "emergency", "socorro", None, 1, now)
            .unwrap();

        let requests = store.attention_requests(p.id).unwrap();
        assert_eq!(requests.len(), 1);
        assert_eq!(requests[0].priority, 1);
        assert_eq!(requests[0].trigger_text, "socorro");
    }

    #[test]
    fn test_onboarding_states() {
        let store = store();
        let p = sample_patient(&store);
        let date = Utc::now().date_naive();

        let state = store.begin_onboarding(p.id, date).unwrap();
        assert!(store.open_onboarding(p.id).unwrap().is_some());

        store.complete_onboarding(state.id, Utc::now()).unwrap();
        assert!(store.open_onboarding(p.id).unwrap().is_none());
    }

    #[test]
    fn test_count_unknown_table() {
        let store = store();
        assert!(store.count("patients").is_ok());
        assert!(store.count("sqlite_master").is_err());
    }

    #[test]
    fn test_corrupt_plan_fails_loudly() {
        let store = store();
        store
            .conn
            .execute(
                "INSERT INTO patients (name, whatsapp, plan, created_at) \
                 VALUES ('X', '+550000', 'platinum', ?1)",
                params![ts(Utc::now())],
            )
            .unwrap();
        let err = store.patient_by_phone("+550000").unwrap_err();
        assert!(matches!(err, Error::Parse(_)));
    }
}
