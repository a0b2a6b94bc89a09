//! Match Tester CLI Tool
//!
//! Command-line tool for driving the matchmaking engine against a SQLite
//! database file.
//!
//! Usage:
//!   cargo run --bin match-tester -- --help
//!   cargo run --bin match-tester create --user alice
//!   cargo run --bin match-tester status --user alice
//!   cargo run --bin match-tester available --user carol
//!   cargo run --bin match-tester accept --user carol --request <uuid>
//!   cargo run --bin match-tester cancel --user alice
//!   cargo run --bin match-tester end-session --user alice --session <uuid>
//!   cargo run --bin match-tester cleanup
//!   cargo run --bin match-tester simulate --users 200

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;

use anyhow::{anyhow, Result};
use clap::{Parser, Subcommand};
use heart_link::config::AppConfig;
use heart_link::{
    CreateOutcome, InMemoryActivityFeed, MatchStatus, RequestId, RequestLifecycleManager,
    SessionId, SqliteMatchStore, StatusReport,
};
use tokio::task::JoinSet;

#[derive(Parser)]
#[command(name = "match-tester")]
#[command(about = "Drive the heart-link matchmaking engine against a SQLite database")]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// SQLite database file
    #[arg(long, default_value = "heart_link.db")]
    db: PathBuf,

    /// Busy timeout in milliseconds
    #[arg(long, default_value = "250")]
    busy_timeout_ms: u64,
}

#[derive(Subcommand)]
enum Commands {
    /// Ask to be matched
    Create {
        #[arg(short, long)]
        user: String,
    },
    /// Cancel a pending request
    Cancel {
        #[arg(short, long)]
        user: String,
    },
    /// Show the status of the latest request
    Status {
        #[arg(short, long)]
        user: String,
    },
    /// List waiting requests of online users
    Available {
        #[arg(short, long)]
        user: String,
        #[arg(short, long, default_value = "10")]
        limit: usize,
    },
    /// Pair with one specific waiting request
    Accept {
        #[arg(short, long)]
        user: String,
        #[arg(short, long)]
        request: RequestId,
    },
    /// Leave a session
    EndSession {
        #[arg(short, long)]
        user: String,
        #[arg(short, long)]
        session: SessionId,
    },
    /// Run every expiry sweep now
    Cleanup,
    /// Show request and session counts
    Stats,
    /// Create requests for N users concurrently and verify nobody is double-booked
    Simulate {
        #[arg(short, long, default_value = "100")]
        users: usize,
    },
}

fn open_manager(cli: &Cli) -> Result<RequestLifecycleManager> {
    let mut config = AppConfig::default();
    config.store.sqlite_path = cli.db.clone();
    config.store.busy_timeout_ms = cli.busy_timeout_ms;

    let store = SqliteMatchStore::open(&cli.db, config.busy_timeout())?;
    Ok(RequestLifecycleManager::new(
        Arc::new(store),
        Arc::new(InMemoryActivityFeed::new()),
        &config,
    ))
}

fn describe(outcome: &CreateOutcome) -> String {
    match outcome {
        CreateOutcome::Matched {
            session_id,
            peer_id,
            ..
        } => format!("💞 matched with '{}' in session {}", peer_id, session_id),
        CreateOutcome::Pending {
            request_id,
            already_waiting,
        } => {
            if *already_waiting {
                format!("⏳ still waiting (request {})", request_id)
            } else {
                format!("⏳ waiting for a partner (request {})", request_id)
            }
        }
        CreateOutcome::Reconnect {
            session_id,
            peer_id,
        } => match peer_id {
            Some(peer) => format!("🔁 reconnected to session {} with '{}'", session_id, peer),
            None => format!("🔁 reconnected to waiting session {}", session_id),
        },
    }
}

/// Every matched session must hold exactly two users who name each other as peer
fn verify_pairings(reports: &HashMap<String, StatusReport>) -> Result<usize> {
    let mut sessions: HashMap<SessionId, Vec<&str>> = HashMap::new();
    for (user, report) in reports {
        if report.status != MatchStatus::Matched {
            continue;
        }
        let session_id = report
            .session_id
            .ok_or_else(|| anyhow!("'{}' is matched without a session", user))?;
        let peer_id = report
            .peer_id
            .as_deref()
            .ok_or_else(|| anyhow!("'{}' is matched without a peer", user))?;
        let peer = reports
            .get(peer_id)
            .ok_or_else(|| anyhow!("'{}' is paired with unknown user '{}'", user, peer_id))?;
        if peer.session_id != Some(session_id) || peer.peer_id.as_deref() != Some(user.as_str())
        {
            return Err(anyhow!(
                "'{}' is paired with '{}' but the peer reports {:?}",
                user,
                peer_id,
                peer
            ));
        }
        sessions.entry(session_id).or_default().push(user);
    }

    for (session_id, members) in &sessions {
        if members.len() != 2 {
            return Err(anyhow!(
                "session {} has {} members: {:?}",
                session_id,
                members.len(),
                members
            ));
        }
    }
    Ok(sessions.len())
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt::init();

    let cli = Cli::parse();
    let manager = open_manager(&cli)?;
    println!("🗄️  Using database {}", cli.db.display());

    match cli.command {
        Commands::Create { user } => match manager.create_request(&user).await {
            Ok(outcome) => println!("✅ '{}': {}", user, describe(&outcome)),
            Err(e) => {
                eprintln!("❌ Failed to create request for '{}': {}", user, e);
                std::process::exit(1);
            }
        },

        Commands::Cancel { user } => {
            let outcome = manager.cancel_request(&user).await?;
            if outcome.rejected() {
                println!("⚠️  Nothing to cancel for '{}'", user);
            } else {
                println!(
                    "✅ Cancelled {} request(s) for '{}'",
                    outcome.cancelled_count, user
                );
            }
        }

        Commands::Status { user } => {
            let report = manager.get_status(&user).await?;
            println!("📋 Status for '{}': {:?}", user, report.status);
            if let Some(request_id) = report.request_id {
                println!("  Request: {}", request_id);
            }
            if report.status == MatchStatus::Matched {
                if let Some(session_id) = report.session_id {
                    println!("  Session: {}", session_id);
                }
                if let Some(peer_id) = report.peer_id {
                    println!("  Peer: {}", peer_id);
                }
            }
        }

        Commands::Available { user, limit } => {
            let available = manager.available_requests(&user, limit).await?;
            if available.is_empty() {
                println!("📭 Nobody online is waiting right now");
            }
            for entry in available {
                println!(
                    "  {} from '{}' (waiting since {})",
                    entry.request_id, entry.requester_id, entry.created_at
                );
            }
        }

        Commands::Accept { user, request } => match manager.accept_request(&user, request).await {
            Ok(outcome) => println!("✅ '{}': {}", user, describe(&outcome)),
            Err(e) => {
                eprintln!("❌ Failed to accept request {}: {}", request, e);
                std::process::exit(1);
            }
        },

        Commands::EndSession { user, session } => {
            match manager.end_session(&user, session).await {
                Ok(true) => println!("✅ Session {} ended", session),
                Ok(false) => println!("⚠️  Session {} had already ended", session),
                Err(e) => {
                    eprintln!("❌ Failed to end session {}: {}", session, e);
                    std::process::exit(1);
                }
            }
        }

        Commands::Cleanup => {
            let report = manager.force_cleanup().await;
            println!("🧹 Cleanup finished:");
            println!("  Expired requests: {}", report.expired_requests);
            println!("  Ended sessions: {}", report.ended_sessions);
            println!("  Failed items: {}", report.failed_items);
        }

        Commands::Stats => {
            let stats = manager.stats().await?;
            println!("📊 Matching Statistics:");
            println!("  Pending: {}", stats.counts.pending);
            println!("  Matching: {}", stats.counts.matching);
            println!("  Matched: {}", stats.counts.matched);
            println!("  Expired: {}", stats.counts.expired);
            println!("  Cancelled: {}", stats.counts.cancelled);
            println!("  Active sessions: {}", stats.active_sessions);
            println!("  Match rate: {:.1}%", stats.match_rate);
        }

        Commands::Simulate { users } => {
            let run = uuid::Uuid::new_v4().simple().to_string();
            println!("🧪 Simulating {} concurrent users (run {})...", users, &run[..8]);

            let started = Instant::now();
            let mut tasks = JoinSet::new();
            for i in 0..users {
                let manager = manager.clone();
                let user = format!("sim-{}-{}", &run[..8], i);
                tasks.spawn(async move {
                    let outcome = manager.create_request(&user).await;
                    (user, outcome)
                });
            }

            let mut outcomes = HashMap::new();
            let mut failures = 0;
            while let Some(joined) = tasks.join_next().await {
                match joined? {
                    (user, Ok(outcome)) => {
                        outcomes.insert(user, outcome);
                    }
                    (user, Err(e)) => {
                        eprintln!("❌ '{}' failed: {}", user, e);
                        failures += 1;
                    }
                }
            }

            let elapsed = started.elapsed();
            let mut reports = HashMap::new();
            for user in outcomes.keys() {
                reports.insert(user.clone(), manager.get_status(user).await?);
            }

            let sessions = verify_pairings(&reports)?;
            let waiting = reports
                .values()
                .filter(|r| r.status == MatchStatus::Pending)
                .count();
            println!(
                "📊 {} users in {:.2}s: {} sessions, {} still waiting, {} failed",
                users,
                elapsed.as_secs_f64(),
                sessions,
                waiting,
                failures
            );

            println!("✅ No double-booking detected");
            if failures > 0 {
                std::process::exit(1);
            }
        }
    }

    Ok(())
}
