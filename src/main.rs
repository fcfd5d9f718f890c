mod bitrix;
mod channels;
mod config;
mod core;
mod notifications;
mod state;
mod traits;
pub mod utils;
mod webhook;

#[cfg(test)]
mod testing;

use std::path::PathBuf;

use tracing_subscriber::EnvFilter;

use crate::state::SqliteStateStore;
use crate::traits::{ChatIdentity, IdentityLink, NotificationLedger, NotificationType, SnapshotStore};

fn main() -> anyhow::Result<()> {
    // Load .env if present
    let _ = dotenvy::dotenv();

    // Tracing
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    // Handle CLI arguments
    let mut config_path = PathBuf::from("config.toml");
    let mut args: Vec<String> = Vec::new();
    let mut raw = std::env::args().skip(1);
    while let Some(arg) = raw.next() {
        match arg.as_str() {
            "--config" | "-c" => match raw.next() {
                Some(path) => config_path = PathBuf::from(path),
                None => {
                    eprintln!("--config needs a path");
                    std::process::exit(2);
                }
            },
            _ => args.push(arg),
        }
    }

    if let Some(command) = args.first() {
        match command.as_str() {
            "--version" | "-V" => {
                println!("taskwatch {}", env!("CARGO_PKG_VERSION"));
                return Ok(());
            }
            "--help" | "-h" => {
                print_help();
                return Ok(());
            }
            "link" | "unlink" | "track" | "history" => {
                return tokio::runtime::Builder::new_current_thread()
                    .enable_all()
                    .build()?
                    .block_on(handle_admin_command(&config_path, command, &args[1..]));
            }
            other => {
                eprintln!("Unknown command '{}'. Run 'taskwatch --help'.", other);
                std::process::exit(2);
            }
        }
    }

    let config = config::AppConfig::load(&config_path)?;

    // Run async
    tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()?
        .block_on(crate::core::run(config))
}

fn print_help() {
    println!("taskwatch {}", env!("CARGO_PKG_VERSION"));
    println!("{}\n", env!("CARGO_PKG_DESCRIPTION"));
    println!("Usage: taskwatch [OPTIONS] [COMMAND]\n");
    println!("Without a command, runs the webhook server and the deadline scanner.\n");
    println!("Commands:");
    println!("  link <telegram_id> <bitrix_user_id> [username]  Link a Telegram user to a Bitrix24 user");
    println!("  unlink <telegram_id>                            Remove a link");
    println!("  track <task_id> [chat_id]                       Mark a task as created through the bot");
    println!("  history [task_id] [limit]                       Show recent notifications");
    println!("\nOptions:");
    println!("  -c, --config <path>  Config file (default: config.toml)");
    println!("  -h, --help           Print help");
    println!("  -V, --version        Print version");
}

/// Database path for admin commands. The config file may be partial here,
/// so fall back to the environment and then the default.
fn admin_db_path(config_path: &std::path::Path) -> String {
    match config::AppConfig::load(config_path) {
        Ok(config) => config.state.db_path,
        Err(_) => std::env::var("DATABASE_PATH").unwrap_or_else(|_| "taskwatch.db".to_string()),
    }
}

fn parse_id(raw: Option<&String>, what: &str) -> anyhow::Result<i64> {
    let raw = raw.ok_or_else(|| anyhow::anyhow!("Missing {}", what))?;
    raw.trim()
        .parse()
        .map_err(|_| anyhow::anyhow!("Invalid {} '{}'", what, raw))
}

async fn handle_admin_command(
    config_path: &std::path::Path,
    command: &str,
    args: &[String],
) -> anyhow::Result<()> {
    let db_path = admin_db_path(config_path);
    if db_path.trim().is_empty() {
        anyhow::bail!("Admin commands need a database; set state.db_path or DATABASE_PATH");
    }
    let store = SqliteStateStore::new(&db_path).await?;

    match command {
        "link" => {
            let telegram_id = parse_id(args.first(), "telegram_id")?;
            let bitrix_user_id = parse_id(args.get(1), "bitrix_user_id")?;
            let mut identity = ChatIdentity::new(telegram_id);
            if let Some(username) = args.get(2) {
                identity = identity.with_username(username);
            }
            store.link(&identity, bitrix_user_id).await?;
            println!("Linked Telegram user {} to Bitrix24 user {}", telegram_id, bitrix_user_id);
        }
        "unlink" => {
            let telegram_id = parse_id(args.first(), "telegram_id")?;
            if store.unlink(telegram_id).await? {
                println!("Unlinked Telegram user {}", telegram_id);
            } else {
                println!("Telegram user {} was not linked", telegram_id);
            }
        }
        "track" => {
            let task_id = parse_id(args.first(), "task_id")?;
            let chat_id = match args.get(1) {
                Some(_) => Some(parse_id(args.get(1), "chat_id")?),
                None => None,
            };
            store.record_task_created_via_bot(task_id, chat_id).await?;
            println!("Task {} is now watched", task_id);
        }
        "history" => {
            let task_id = match args.first() {
                Some(_) => Some(parse_id(args.first(), "task_id")?),
                None => None,
            };
            let limit = match args.get(1) {
                Some(_) => parse_id(args.get(1), "limit")?,
                None => 20,
            };
            let records = store
                .notification_history(task_id, None::<NotificationType>, limit)
                .await?;
            if records.is_empty() {
                println!("No notifications recorded");
            }
            for record in records {
                println!(
                    "{}  {:<16}  task {:<8}  {}",
                    record.sent_at, record.notification_type, record.task_id, record.notification_key
                );
            }
        }
        other => anyhow::bail!("Unknown command '{}'", other),
    }
    Ok(())
}
