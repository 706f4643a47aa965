//! Simple Bank operator binary
//!
//! ```text
//! simple_bank [--env <name>] migrate
//! simple_bank [--env <name>] health
//! simple_bank [--env <name>] transfer <from_account_id> <to_account_id> <amount>
//! ```
//!
//! Configuration comes from `config/<env>.yaml` (default `dev`).

use anyhow::{Context, bail};

use simple_bank::config::AppConfig;
use simple_bank::db::Database;
use simple_bank::logging::init_logging;
use simple_bank::store::Store;
use simple_bank::transfer::TransferTxParams;

// ============================================================
// ARGUMENTS
// ============================================================

fn get_env() -> String {
    let args: Vec<String> = std::env::args().collect();
    for i in 0..args.len() {
        if (args[i] == "--env" || args[i] == "-e") && i + 1 < args.len() {
            return args[i + 1].clone();
        }
    }
    "dev".to_string()
}

/// Positional arguments with `--env <name>` removed
fn positional_args() -> Vec<String> {
    let mut out = Vec::new();
    let mut args = std::env::args().skip(1);
    while let Some(arg) = args.next() {
        if arg == "--env" || arg == "-e" {
            args.next();
            continue;
        }
        out.push(arg);
    }
    out
}

fn parse_id(value: &str, name: &str) -> anyhow::Result<i64> {
    value
        .parse()
        .with_context(|| format!("{name} must be an integer, got {value:?}"))
}

fn usage() -> &'static str {
    "usage: simple_bank [--env <name>] <migrate | health | transfer <from> <to> <amount>>"
}

// ============================================================
// MAIN
// ============================================================

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let env = get_env();
    let app_config = AppConfig::load(&env)?;
    let _log_guard = init_logging(&app_config);

    tracing::info!("Starting simple_bank in {} mode", env);

    let args = positional_args();
    let Some(command) = args.first() else {
        bail!(usage());
    };

    let db = Database::connect(&app_config.database)
        .await
        .context("failed to connect to PostgreSQL")?;

    match command.as_str() {
        "migrate" => {
            db.migrate().await?;
            println!("migrations applied");
        }
        "health" => {
            db.health_check().await?;
            println!("ok");
        }
        "transfer" => {
            let [from, to, amount] = &args[1..] else {
                bail!(usage());
            };
            let params = TransferTxParams::new(
                parse_id(from, "from_account_id")?,
                parse_id(to, "to_account_id")?,
                parse_id(amount, "amount")?,
            );
            let store = Store::new(db.backend()).with_tx_timeout(app_config.database.tx_timeout());
            let result = store.transfer_tx(params).await?;
            println!("{}", serde_json::to_string_pretty(&result)?);
        }
        other => bail!("unknown command {other:?}\n{}", usage()),
    }

    Ok(())
}
