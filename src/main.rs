//! Careloop daemon and CLI
//!
//! `serve` runs the HTTP surface; the remaining subcommands are one-shot
//! jobs and small administrative tools for inspecting and fixing rows.

use anyhow::Context;
use careloop::assistant::DisabledGenerator;
use careloop::checkin::Plan;
use careloop::config::Config;
use careloop::delivery;
use careloop::reply::ReplyRouter;
use careloop::scheduler::{parse_schedule, with_retry, QueueScheduler, RetryPolicy};
use careloop::server::{self, AppState};
use careloop::store::{NewScheduledMessage, Store};
use careloop::sweeper::MissedCheckinSweeper;
use chrono::Utc;
use clap::{Parser, Subcommand};
use tracing::info;
use tracing_subscriber::EnvFilter;

/// Careloop - patient check-in and message scheduling
#[derive(Parser)]
#[command(name = "careloop")]
#[command(about = "WhatsApp check-in and message scheduling daemon")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the HTTP daemon (cron endpoints + webhook)
    Serve,

    /// Run one scheduler pass (generate + dispatch) and print the report
    ProcessQueue,

    /// Run one missed check-in sweep and print the report
    Sweep,

    /// Reprocess inbound messages left without a completion marker
    Replay,

    /// Create the database schema
    InitDb,

    /// Show row counts per table
    Status,

    /// Show one patient's state
    ShowPatient {
        /// WhatsApp number (E.164)
        phone: String,
    },

    /// Register a patient and schedule the welcome message
    AddPatient {
        name: String,
        /// WhatsApp number (E.164)
        phone: String,
        /// freemium, premium or vip
        #[arg(default_value = "freemium")]
        plan: String,
    },

    /// Create a protocol
    AddProtocol {
        name: String,
        /// Program length in days
        days: i64,
        /// Daily send time as a cron expression
        #[arg(default_value = careloop::config::DEFAULT_SEND_SCHEDULE)]
        schedule: String,
    },

    /// Add a day-indexed message template to a protocol
    AddTemplate {
        protocol_id: i64,
        day: i64,
        body: String,

        #[arg(long)]
        title: Option<String>,

        /// Gamification perspective the day's answer scores against
        #[arg(long)]
        perspective: Option<String>,
    },

    /// Enroll a patient in a protocol (supersedes any active enrollment)
    AssignProtocol {
        /// WhatsApp number (E.164)
        phone: String,
        protocol_id: i64,
    },
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();

    let config = Config::from_env().context("loading configuration")?;

    match cli.command {
        Commands::Serve => cmd_serve(config),
        Commands::ProcessQueue => cmd_process_queue(&config),
        Commands::Sweep => cmd_sweep(&config),
        Commands::Replay => cmd_replay(&config),
        Commands::InitDb => cmd_init_db(&config),
        Commands::Status => cmd_status(&config),
        Commands::ShowPatient { phone } => cmd_show_patient(&config, &phone),
        Commands::AddPatient { name, phone, plan } => cmd_add_patient(&config, &name, &phone, &plan),
        Commands::AddProtocol {
            name,
            days,
            schedule,
        } => cmd_add_protocol(&config, &name, days, &schedule),
        Commands::AddTemplate {
            protocol_id,
            day,
            body,
            title,
            perspective,
        } => cmd_add_template(&config, protocol_id, day, &body, title.as_deref(), perspective.as_deref()),
        Commands::AssignProtocol { phone, protocol_id } => {
            cmd_assign_protocol(&config, &phone, protocol_id)
        }
    }
}

fn cmd_serve(config: Config) -> anyhow::Result<()> {
    let state = AppState::from_config(config).context("initializing daemon state")?;
    let runtime = tokio::runtime::Runtime::new().context("starting async runtime")?;
    runtime
        .block_on(server::serve(state))
        .context("running HTTP server")?;
    Ok(())
}

fn cmd_process_queue(config: &Config) -> anyhow::Result<()> {
    let store = Store::open(&config.db_path)?;
    let gateway = delivery::from_config(config);
    let policy = RetryPolicy::new(config.retry_max_attempts, config.retry_initial_delay_ms);

    let report = with_retry(policy, || {
        QueueScheduler::new(&store, gateway.as_ref()).run_pass(Utc::now())
    })
    .context("scheduler pass")?;

    println!("{}", serde_json::to_string_pretty(&report)?);
    Ok(())
}

fn cmd_sweep(config: &Config) -> anyhow::Result<()> {
    let store = Store::open(&config.db_path)?;
    let gateway = delivery::from_config(config);
    let sweeper = MissedCheckinSweeper::new(
        &store,
        gateway.as_ref(),
        config.checkin_stale_hours,
        config.reminder_window_hours,
    );

    let report = sweeper.run(Utc::now()).context("missed check-in sweep")?;
    println!("{}", serde_json::to_string_pretty(&report)?);
    Ok(())
}

fn cmd_replay(config: &Config) -> anyhow::Result<()> {
    let store = Store::open(&config.db_path)?;
    let gateway = delivery::from_config(config);
    let generator = DisabledGenerator;
    let router = ReplyRouter::new(&store, gateway.as_ref(), &generator, config.weigh_day);

    let pending = store.unprocessed_inbound()?;
    if pending.is_empty() {
        println!("No unprocessed inbound messages");
        return Ok(());
    }

    let now = Utc::now();
    let mut replayed = 0;
    for msg in pending {
        let patient = match store.patient(msg.patient_id)? {
            Some(p) => p,
            None => continue,
        };
        match router.process(&patient, msg.id, &msg.text, now) {
            Ok(outcome) => {
                info!(message = msg.id, "replayed: {:?}", outcome);
                replayed += 1;
            }
            Err(e) => eprintln!("message {} failed: {}", msg.id, e),
        }
    }

    println!("Replayed {} messages", replayed);
    Ok(())
}

fn cmd_init_db(config: &Config) -> anyhow::Result<()> {
    Store::open(&config.db_path)?;
    println!("Database ready: {}", config.db_path.display());
    Ok(())
}

fn cmd_status(config: &Config) -> anyhow::Result<()> {
    let store = Store::open(&config.db_path)?;
    for table in [
        "patients",
        "protocols",
        "patient_protocols",
        "scheduled_messages",
        "daily_checkin_states",
        "onboarding_states",
        "messages",
        "attention_requests",
    ] {
        println!("{:24} {}", table, store.count(table)?);
    }
    Ok(())
}

fn cmd_show_patient(config: &Config, phone: &str) -> anyhow::Result<()> {
    let store = Store::open(&config.db_path)?;
    let patient = store
        .patient_by_phone(phone)?
        .with_context(|| format!("no patient with number {}", phone))?;

    println!("{} ({})", patient.name, patient.whatsapp);
    println!("  plan:            {}", patient.plan.as_str());
    println!("  points / level:  {} / {}", patient.points, patient.level);
    println!("  high risk:       {}", patient.high_risk);
    println!("  needs attention: {}", patient.needs_attention);

    match store.open_checkin(patient.id)? {
        Some(state) => println!("  open check-in:   {} (step {})", state.date, state.step),
        None => println!("  open check-in:   none"),
    }

    let requests = store.attention_requests(patient.id)?;
    println!("  attention requests: {}", requests.len());
    for req in requests {
        println!("    [p{}] {}: {}", req.priority, req.reason, req.trigger_text);
    }
    Ok(())
}

fn cmd_add_patient(config: &Config, name: &str, phone: &str, plan: &str) -> anyhow::Result<()> {
    let plan: Plan = plan.parse().context("invalid plan tier")?;
    let store = Store::open(&config.db_path)?;
    let patient = store.insert_patient(name, phone, plan)?;

    let now = Utc::now();
    store.begin_onboarding(patient.id, now.date_naive())?;
    store.insert_scheduled_message(&NewScheduledMessage {
        patient_id: patient.id,
        patient_protocol_id: None,
        protocol_day: None,
        title: Some("[welcome]".to_string()),
        body: format!(
            "Olá, {}! Seja bem-vindo(a) ao acompanhamento da clínica. Responda esta mensagem para começar. 💙",
            name
        ),
        send_at: now,
        metadata: None,
    })?;

    println!("Patient {} registered (id {}), welcome message queued", name, patient.id);
    Ok(())
}

fn cmd_add_protocol(config: &Config, name: &str, days: i64, schedule: &str) -> anyhow::Result<()> {
    anyhow::ensure!(days >= 1, "protocol duration must be at least 1 day");
    parse_schedule(schedule).context("invalid cron schedule")?;

    let store = Store::open(&config.db_path)?;
    let protocol = store.insert_protocol(name, days, schedule)?;
    println!("Protocol {} created (id {})", name, protocol.id);
    Ok(())
}

fn cmd_add_template(
    config: &Config,
    protocol_id: i64,
    day: i64,
    body: &str,
    title: Option<&str>,
    perspective: Option<&str>,
) -> anyhow::Result<()> {
    if let Some(p) = perspective {
        let _: careloop::checkin::Perspective = p.parse().context("invalid perspective")?;
    }

    let store = Store::open(&config.db_path)?;
    let protocol = store
        .protocol(protocol_id)?
        .with_context(|| format!("no protocol with id {}", protocol_id))?;
    anyhow::ensure!(
        day >= 1 && day <= protocol.duration_days,
        "day {} outside protocol duration 1..={}",
        day,
        protocol.duration_days
    );

    store.insert_template(protocol_id, day, title, body, perspective)?;
    println!("Template added: {} day {}", protocol.name, day);
    Ok(())
}

fn cmd_assign_protocol(config: &Config, phone: &str, protocol_id: i64) -> anyhow::Result<()> {
    let store = Store::open(&config.db_path)?;
    let patient = store
        .patient_by_phone(phone)?
        .with_context(|| format!("no patient with number {}", phone))?;
    let protocol = store
        .protocol(protocol_id)?
        .with_context(|| format!("no protocol with id {}", protocol_id))?;

    let pp = store.assign_protocol(patient.id, protocol.id)?;
    println!(
        "{} enrolled in {} (day {} of {})",
        patient.name, protocol.name, pp.current_day, protocol.duration_days
    );
    Ok(())
}
