//! tagsql - Main entry point.
//!
//! Runs one statement or script through the adapter and prints the result as JSON.

use clap::Parser;
use serde_json::json;
use tagsql::config::{Command, Config};
use tagsql::db::postgres;
use tagsql::models::{SqlQuery, Value};
use tracing::{error, info};
use tracing_subscriber::{EnvFilter, fmt, prelude::*};

/// Initialize the tracing subscriber for logging.
fn init_tracing(config: &Config) {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.log_level));

    let subscriber = tracing_subscriber::registry().with(filter);

    // Logs go to stderr so stdout carries only the JSON result.
    if config.json_logs {
        subscriber
            .with(fmt::layer().json().with_writer(std::io::stderr))
            .init();
    } else {
        subscriber
            .with(
                fmt::layer()
                    .with_target(true)
                    .with_thread_ids(false)
                    .with_writer(std::io::stderr),
            )
            .init();
    }
}

/// Parse a CLI argument as a JSON literal, falling back to a plain string.
fn parse_arg(raw: &str) -> Value {
    serde_json::from_str::<serde_json::Value>(raw)
        .map(Value::from)
        .unwrap_or_else(|_| Value::Text(raw.to_string()))
}

fn build_query(sql: String, args: &[String]) -> SqlQuery {
    SqlQuery::new(sql).with_args(args.iter().map(|a| parse_arg(a)).collect())
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let config = Config::parse();
    init_tracing(&config);

    let adapter_config = match config.adapter_config() {
        Ok(c) => c,
        Err(e) => {
            eprintln!("Error: {}", e);
            std::process::exit(2);
        }
    };

    let adapter = postgres::connect(adapter_config);
    info!(
        provider = adapter.provider(),
        max_connections = adapter.pool().max_connections(),
        "Adapter ready"
    );

    let outcome = match config.command {
        Command::Query { sql, args } => adapter
            .query_raw(build_query(sql, &args))
            .await
            .map(|rs| serde_json::to_value(rs).unwrap_or_default()),
        Command::Execute { sql, args } => adapter
            .execute_raw(build_query(sql, &args))
            .await
            .map(|n| json!({ "affectedRows": n })),
        Command::Script { script } => adapter.execute_script(&script).await.map(|_| json!({ "ok": true })),
    };

    adapter.dispose().await;

    match outcome {
        Ok(output) => {
            println!("{}", serde_json::to_string_pretty(&output)?);
            Ok(())
        }
        Err(e) => {
            error!(error = %e, "Command failed");
            if let Some(suggestion) = e.suggestion() {
                eprintln!("Error: {}\nSuggestion: {}", e, suggestion);
            } else {
                eprintln!("Error: {}", e);
            }
            std::process::exit(1);
        }
    }
}
