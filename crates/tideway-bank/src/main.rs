// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! tideway-bank binary.
//!
//! Environment variables (a `.env` file is honoured):
//!
//! | Variable | Required | Default | Description |
//! |----------|----------|---------|-------------|
//! | `TIDEWAY_DATABASE_URL` | No | `sqlite://tideway.db` | History database |
//! | `TIDEWAY_ACCOUNTS_URL` | No | `http://127.0.0.1:5000` | Balance service |
//! | `RUST_LOG` | No | `tideway_core=info,tideway_bank=info` | Log filter |

use std::process::ExitCode;

use clap::Parser;
use tideway_bank::cli::{Cli, run};
use tracing::error;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> ExitCode {
    dotenvy::dotenv().ok();

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("tideway_core=info,tideway_bank=info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let cli = Cli::parse();
    match run(cli).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!(error = %e, "Command failed");
            eprintln!("Error: {e:#}");
            ExitCode::FAILURE
        }
    }
}
