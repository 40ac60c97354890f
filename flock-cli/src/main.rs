//! Flock command line.
//!
//! Thin wrapper over `flock-engine`: loads configuration, opens the
//! database, wires a surface, and dispatches one operation. Member
//! lists are fed from plain text files (one username per line, `#`
//! comments allowed), which makes every command runnable without a
//! live platform adapter.

use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tracing::{error, info};

use flock_common::{init_logging, Config};
use flock_engine::notify::{Notifier, NullNotifier, WebhookNotifier};
use flock_engine::scheduler::{Rule, RuleScheduler};
use flock_engine::{
    ActionKind, ActionRunner, ChangeDetector, ControlHandle, Database, MemberKind, RunnerOptions,
    StaticSurface,
};

#[derive(Parser)]
#[command(name = "flock", version, about = "Follower tracking and bulk action engine")]
struct Cli {
    /// Path to an alternate config file
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run one change-detection pass over the current follower list
    Detect {
        /// File listing the account's current followers
        #[arg(long)]
        followers_file: PathBuf,
    },
    /// Follow every user in a file, inside a resumable session
    Follow {
        /// File listing usernames to follow
        #[arg(long)]
        file: PathBuf,
        /// Stop after this many performed actions
        #[arg(long)]
        limit: Option<u32>,
        /// Preview without performing surface actions
        #[arg(long)]
        dry_run: bool,
    },
    /// Unfollow users from a file or by follow age
    Unfollow {
        /// File listing usernames to unfollow
        #[arg(long, conflicts_with = "older_than_days")]
        file: Option<PathBuf>,
        /// Select ledger follows older than this many days
        #[arg(long)]
        older_than_days: Option<i64>,
        /// Spare users who followed back
        #[arg(long)]
        exclude_followed_back: bool,
        /// Stop after this many performed actions
        #[arg(long)]
        limit: Option<u32>,
        /// Preview without performing surface actions
        #[arg(long)]
        dry_run: bool,
    },
    /// Run the rule scheduler until interrupted
    Schedule {
        /// JSON file of scheduling rules
        #[arg(long)]
        rules: PathBuf,
        /// JSON file of member lists per target account
        #[arg(long)]
        members: Option<PathBuf>,
    },
    /// Export the full action ledger as JSON
    Export {
        /// Write to this file instead of stdout
        #[arg(long)]
        output: Option<PathBuf>,
    },
    /// Manage the never-unfollow whitelist
    Whitelist {
        #[command(subcommand)]
        command: WhitelistCommand,
    },
    /// Show the action history for one user
    History { username: String },
    /// List recent batch sessions
    Sessions {
        #[arg(long, default_value_t = 10)]
        limit: usize,
    },
}

#[derive(Subcommand)]
enum WhitelistCommand {
    Add {
        username: String,
        #[arg(long)]
        reason: Option<String>,
    },
    Remove { username: String },
    List,
}

#[tokio::main]
async fn main() {
    if let Err(err) = run().await {
        error!(error = %format!("{err:#}"), "Command failed");
        eprintln!("error: {err:#}");
        std::process::exit(1);
    }
}

async fn run() -> Result<()> {
    let cli = Cli::parse();

    let config = match &cli.config {
        Some(path) => Config::load_from(path.clone())?,
        None => Config::load()?,
    };
    init_logging(
        &config.observability.log_level,
        &config.observability.log_format,
    );

    let db = Database::open(config.db_path())?;

    match cli.command {
        Command::Detect { followers_file } => detect(&config, &db, &followers_file).await,
        Command::Follow {
            file,
            limit,
            dry_run,
        } => {
            let usernames = read_usernames(&file)?;
            batch(&config, &db, ActionKind::Follow, usernames, limit, dry_run).await
        }
        Command::Unfollow {
            file,
            older_than_days,
            exclude_followed_back,
            limit,
            dry_run,
        } => {
            let usernames = match (&file, older_than_days) {
                (Some(path), _) => read_usernames(path)?,
                (None, Some(days)) => db
                    .ledger()
                    .follows_older_than(days, exclude_followed_back)?
                    .into_iter()
                    .map(|r| r.username)
                    .collect(),
                (None, None) => {
                    anyhow::bail!("unfollow needs --file or --older-than-days")
                }
            };
            batch(&config, &db, ActionKind::Unfollow, usernames, limit, dry_run).await
        }
        Command::Schedule { rules, members } => schedule(&config, &db, &rules, members.as_deref()).await,
        Command::Export { output } => export(&db, output.as_deref()),
        Command::Whitelist { command } => whitelist(&db, command),
        Command::History { username } => history(&db, &username),
        Command::Sessions { limit } => sessions(&db, limit),
    }
}

// ============================================================================
// Commands
// ============================================================================

async fn detect(config: &Config, db: &Database, followers_file: &Path) -> Result<()> {
    let followers = read_usernames(followers_file)?;
    let surface = Arc::new(StaticSurface::new());
    surface.set_members(&config.account, MemberKind::Followers, followers);

    let detector = ChangeDetector::new(
        db,
        surface,
        build_notifier(config),
        config.detection.clone(),
        &config.account,
    );
    let report = detector.run_pass().await?;

    if report.baseline {
        println!(
            "baseline recorded: {} followers",
            report.follower_count
        );
        return Ok(());
    }

    println!("followers: {}", report.follower_count);
    for username in &report.new_followers {
        println!("  + @{}", username);
    }
    for username in &report.unfollowers {
        println!("  - @{}", username);
    }
    if let Some(milestone) = report.milestone {
        println!("  milestone crossed: {}", milestone);
    }
    if report.reconciled > 0 {
        println!("  follow-backs confirmed: {}", report.reconciled);
    }
    Ok(())
}

async fn batch(
    config: &Config,
    db: &Database,
    kind: ActionKind,
    usernames: Vec<String>,
    limit: Option<u32>,
    dry_run: bool,
) -> Result<()> {
    let mut engine = config.engine.clone();
    engine.dry_run = engine.dry_run || dry_run;

    let surface = Arc::new(StaticSurface::new());
    if kind == ActionKind::Unfollow {
        // File-driven surface: treat every listed user as followed so
        // the unfollow is performed rather than skipped.
        for username in &usernames {
            surface.set_following(username);
        }
    }

    let runner = ActionRunner::new(db, surface, engine);
    let handle = ControlHandle::new();
    spawn_ctrl_c(handle.clone());

    let options = RunnerOptions {
        max_actions: limit,
        source: Some("cli".to_string()),
        ..Default::default()
    };
    let report = runner.run_batch(kind, &usernames, &handle, &options).await?;

    println!(
        "{:?}: {} ok, {} failed, {} skipped{}",
        report.outcome,
        report.success_count,
        report.failed_count,
        report.skipped_count,
        if report.dry_run { " (dry run)" } else { "" },
    );
    for error in &report.errors {
        println!("  ! {}", error);
    }
    Ok(())
}

async fn schedule(
    config: &Config,
    db: &Database,
    rules_path: &Path,
    members_path: Option<&Path>,
) -> Result<()> {
    let rules: Vec<Rule> = serde_json::from_str(
        &std::fs::read_to_string(rules_path)
            .with_context(|| format!("Failed to read rules from {}", rules_path.display()))?,
    )
    .context("Failed to parse rules file")?;

    let surface = Arc::new(StaticSurface::new());
    if let Some(path) = members_path {
        load_members(&surface, path)?;
    }

    let mut scheduler = RuleScheduler::new(
        db,
        surface,
        config.engine.clone(),
        config.detection.clone(),
        rules,
    );

    let handle = ControlHandle::new();
    spawn_ctrl_c(handle.clone());
    info!("Scheduler running, Ctrl-C to stop");
    scheduler.run(&handle).await?;

    for (rule, stats) in scheduler.stats() {
        println!(
            "{}: {} runs, {} ok, {} failed, {} skipped",
            rule, stats.runs, stats.success_count, stats.failed_count, stats.skipped_count
        );
    }
    Ok(())
}

fn export(db: &Database, output: Option<&Path>) -> Result<()> {
    let records = db.ledger().export_all()?;
    let json = serde_json::to_string_pretty(&records)?;

    match output {
        Some(path) => {
            std::fs::write(path, json)
                .with_context(|| format!("Failed to write {}", path.display()))?;
            println!("exported {} records to {}", records.len(), path.display());
        }
        None => println!("{}", json),
    }
    Ok(())
}

fn whitelist(db: &Database, command: WhitelistCommand) -> Result<()> {
    let ledger = db.ledger();
    match command {
        WhitelistCommand::Add { username, reason } => {
            ledger.whitelist_add(&username, reason.as_deref())?;
            println!("whitelisted @{}", username);
        }
        WhitelistCommand::Remove { username } => {
            if ledger.whitelist_remove(&username)? {
                println!("removed @{}", username);
            } else {
                println!("@{} was not whitelisted", username);
            }
        }
        WhitelistCommand::List => {
            for entry in ledger.whitelist()? {
                match &entry.reason {
                    Some(reason) => println!("@{} ({})", entry.username, reason),
                    None => println!("@{}", entry.username),
                }
            }
        }
    }
    Ok(())
}

fn history(db: &Database, username: &str) -> Result<()> {
    let records = db.ledger().history(username)?;
    if records.is_empty() {
        println!("no recorded actions for @{}", username);
        return Ok(());
    }
    for record in records {
        let followed_back = if record.followed_back { " [followed back]" } else { "" };
        println!(
            "{} {:?}{}",
            record.created_at.format("%Y-%m-%d %H:%M"),
            record.kind,
            followed_back
        );
    }
    Ok(())
}

fn sessions(db: &Database, limit: usize) -> Result<()> {
    for session in db.sessions().recent_sessions(limit)? {
        println!(
            "{} {} {:?} {}/{} ok, {} failed, {} skipped",
            session.started_at.format("%Y-%m-%d %H:%M"),
            session.kind,
            session.status,
            session.success_count,
            session.total_count,
            session.failed_count,
            session.skipped_count,
        );
    }
    Ok(())
}

// ============================================================================
// Helpers
// ============================================================================

/// One username per line; blank lines and `#` comments are skipped.
fn read_usernames(path: &Path) -> Result<Vec<String>> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read {}", path.display()))?;
    Ok(content
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty() && !line.starts_with('#'))
        .map(String::from)
        .collect())
}

/// Member lists per target: `{"target": {"followers": [...],
/// "following": [...]}}`.
fn load_members(surface: &StaticSurface, path: &Path) -> Result<()> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read {}", path.display()))?;
    let targets: BTreeMap<String, HashMap<String, Vec<String>>> =
        serde_json::from_str(&content).context("Failed to parse members file")?;

    for (target, lists) in targets {
        if let Some(followers) = lists.get("followers") {
            surface.set_members(&target, MemberKind::Followers, followers.clone());
        }
        if let Some(following) = lists.get("following") {
            surface.set_members(&target, MemberKind::Following, following.clone());
        }
    }
    Ok(())
}

fn build_notifier(config: &Config) -> Arc<dyn Notifier> {
    if config.notifications.enabled {
        Arc::new(WebhookNotifier::new(config.notifications.clone()))
    } else {
        Arc::new(NullNotifier)
    }
}

fn spawn_ctrl_c(handle: ControlHandle) {
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("Interrupt received, finishing current action");
            handle.cancel();
        }
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_read_usernames_skips_comments_and_blanks() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "# header").unwrap();
        writeln!(file, "alice").unwrap();
        writeln!(file).unwrap();
        writeln!(file, "  bob  ").unwrap();

        let users = read_usernames(file.path()).unwrap();
        assert_eq!(users, vec!["alice".to_string(), "bob".to_string()]);
    }

    #[test]
    fn test_load_members_file() {
        let surface = StaticSurface::new();
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(
            file,
            r#"{{"target": {{"followers": ["a", "b"], "following": ["c"]}}}}"#
        )
        .unwrap();

        load_members(&surface, file.path()).unwrap();
    }
}
