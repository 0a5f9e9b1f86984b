//! MySQL MCP Server
//!
//! Exposes a MySQL database to an agent over line-delimited JSON-RPC 2.0 on
//! stdio. Only read-only statements (SELECT, SHOW, DESCRIBE, DESC, EXPLAIN)
//! ever reach the database.
//!
//! # Features
//!
//! - Database, table and column introspection
//! - Heuristic read-only gate for raw SQL
//! - Pooled connections with reconnect and bounded shutdown
//! - `$/alive` keep-alive notifications while idle
//!
//! Logs go to stderr; stdout carries only protocol messages.

mod classifier;
mod config;
mod db;
mod error;
mod executor;
mod liveness;
mod rpc;
mod server;
mod tools;

use clap::Parser;
use config::Args;
use log::error;
use std::process::ExitCode;

#[tokio::main]
async fn main() -> ExitCode {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info"))
        .target(env_logger::Target::Stderr)
        .init();

    let args = match Args::try_parse() {
        Ok(args) => args,
        Err(e) => {
            let _ = e.print();
            return if e.use_stderr() {
                ExitCode::FAILURE
            } else {
                ExitCode::SUCCESS
            };
        }
    };

    match server::run(args).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!("{e}");
            ExitCode::FAILURE
        }
    }
}
