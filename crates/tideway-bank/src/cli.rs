// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Command-line surface of `tideway-bank`.

use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use serde_json::Value;
use tideway_core::{Client, Config, ConfigError, Engine, StartWorkflowOptions, Worker, WorkerOptions};
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use crate::accounts::{AccountsApi, DEFAULT_ACCOUNTS_URL, HttpAccounts};
use crate::naive::{self, REQUEST_TIMEOUT};
use crate::workflows::{GET_STATE, MONEY_TRANSFER, PRINT_NUMBERS, TransferInput, TransferResult};
use crate::{PRINT_NUMBERS_TASK_QUEUE, TRANSFER_TASK_QUEUE, print_numbers_worker, transfer_worker};

/// Default workflow ID of `transfer`.
pub const TRANSFER_WORKFLOW_ID: &str = "money-transfer-workflow";
/// Default workflow ID of `print-numbers`.
pub const PRINT_NUMBERS_WORKFLOW_ID: &str = "print-numbers-workflow";

/// tideway-bank - durable money transfers on tideway.
#[derive(Debug, Parser)]
#[command(name = "tideway-bank")]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    /// SQLite history database.
    #[arg(
        long,
        global = true,
        env = "TIDEWAY_DATABASE_URL",
        default_value = "sqlite://tideway.db"
    )]
    pub database_url: String,

    /// Balance service base URL.
    #[arg(long, global = true, env = "TIDEWAY_ACCOUNTS_URL", default_value = DEFAULT_ACCOUNTS_URL)]
    pub accounts_url: String,

    /// Subcommand to execute.
    #[command(subcommand)]
    pub command: Commands,
}

/// CLI subcommands.
#[derive(Debug, Subcommand)]
pub enum Commands {
    /// Serve the money-transfer and print-numbers task queues until Ctrl-C.
    Worker,
    /// Start (or attach to) a money transfer and wait for its result.
    Transfer(TransferArgs),
    /// Start (or attach to) the print-numbers workflow and wait for it.
    PrintNumbers(StartArgs),
    /// Read the `get_state` query of a transfer.
    Query(QueryArgs),
    /// Request cancellation of a running workflow.
    Cancel(CancelArgs),
    /// Transfer money with direct HTTP calls and retries, without the engine.
    MoveMoney(MoveMoneyArgs),
}

/// Options shared by commands that start a workflow.
#[derive(Debug, Clone, Args)]
pub struct StartArgs {
    /// Workflow ID; a RUNNING run with this ID is reused.
    #[arg(long)]
    pub workflow_id: Option<String>,

    /// Do not run an in-process worker; rely on a separate `worker`.
    #[arg(long)]
    pub no_worker: bool,
}

/// Accounts and amount of a transfer.
#[derive(Debug, Clone, Args)]
pub struct TransferFlags {
    /// Source account.
    #[arg(long, default_value = "account_A")]
    pub from: String,

    /// Destination account.
    #[arg(long, default_value = "account_B")]
    pub to: String,

    /// Amount to move.
    #[arg(long, default_value_t = 100.0)]
    pub amount: f64,
}

/// Arguments of `transfer`.
#[derive(Debug, Args)]
pub struct TransferArgs {
    #[command(flatten)]
    #[allow(missing_docs)]
    pub transfer: TransferFlags,

    #[command(flatten)]
    #[allow(missing_docs)]
    pub start: StartArgs,
}

/// Arguments of `query`.
#[derive(Debug, Args)]
pub struct QueryArgs {
    /// Workflow ID to query.
    #[arg(default_value = TRANSFER_WORKFLOW_ID)]
    pub workflow_id: String,

    /// Query name.
    #[arg(long, default_value = GET_STATE)]
    pub name: String,
}

/// Arguments of `cancel`.
#[derive(Debug, Args)]
pub struct CancelArgs {
    /// Workflow ID to cancel.
    pub workflow_id: String,

    /// Reason recorded with the cancellation.
    #[arg(long)]
    pub reason: Option<String>,
}

/// Arguments of `move-money`.
#[derive(Debug, Args)]
pub struct MoveMoneyArgs {
    #[command(flatten)]
    #[allow(missing_docs)]
    pub transfer: TransferFlags,
}

impl Cli {
    /// Engine configuration: `TIDEWAY_*` variables with the database URL
    /// taken from the command line.
    pub fn config(&self) -> Result<Config> {
        let mut config = match Config::from_env() {
            Ok(config) => config,
            Err(ConfigError::Missing(_)) => Config::with_database_url(&self.database_url),
            Err(e) => return Err(e.into()),
        };
        config.database_url = self.database_url.clone();
        Ok(config)
    }

    fn accounts(&self) -> Result<Arc<dyn AccountsApi>> {
        let api = HttpAccounts::new(&self.accounts_url, REQUEST_TIMEOUT)
            .context("Failed to build balance service client")?;
        Ok(Arc::new(api))
    }
}

/// Execute the parsed command.
pub async fn run(cli: Cli) -> Result<()> {
    if let Commands::MoveMoney(args) = &cli.command {
        return move_money(&cli, args).await;
    }

    let config = cli.config()?;
    let engine = Arc::new(
        Engine::connect(&config)
            .await
            .context("Failed to open the history store")?,
    );
    let outcome = dispatch(&cli, &config, engine.clone()).await;
    engine.close().await;
    outcome
}

async fn dispatch(cli: &Cli, config: &Config, engine: Arc<Engine>) -> Result<()> {
    match &cli.command {
        Commands::Worker => serve(cli, config, engine).await,
        Commands::Transfer(args) => transfer(cli, config, engine, args).await,
        Commands::PrintNumbers(args) => print_numbers(config, engine, args).await,
        Commands::Query(args) => query(config, engine, args).await,
        Commands::Cancel(args) => cancel(config, engine, args).await,
        Commands::MoveMoney(args) => move_money(cli, args).await,
    }
}

fn client(config: &Config, engine: Arc<Engine>) -> Client {
    Client::new(engine, Arc::new(crate::registry()))
        .with_result_poll_interval(config.result_poll_interval)
}

async fn serve(cli: &Cli, config: &Config, engine: Arc<Engine>) -> Result<()> {
    let options = WorkerOptions::from(config);
    let shutdown = CancellationToken::new();

    let transfers = transfer_worker(engine.clone(), options.clone(), cli.accounts()?);
    let printer = print_numbers_worker(engine, options);
    let transfers = tokio::spawn(transfers.run(shutdown.clone()));
    let printer = tokio::spawn(printer.run(shutdown.clone()));

    println!(
        "Worker started, listening on task queues: {TRANSFER_TASK_QUEUE}, {PRINT_NUMBERS_TASK_QUEUE}"
    );
    tokio::signal::ctrl_c().await?;
    info!("Shutting down...");
    shutdown.cancel();

    transfers.await??;
    printer.await??;
    Ok(())
}

/// Start (or attach to) a run and wait for its result, with an optional
/// in-process worker serving it meanwhile.
async fn start_and_wait(
    client: &Client,
    worker: Option<Worker>,
    workflow_type: &str,
    options: StartWorkflowOptions,
    input: Value,
) -> Result<Value> {
    let shutdown = CancellationToken::new();
    let task = worker.map(|worker| tokio::spawn(worker.run(shutdown.clone())));

    let outcome = wait_for_result(client, workflow_type, options, input).await;

    shutdown.cancel();
    if let Some(task) = task {
        match task.await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => error!(error = %e, "Worker stopped with an error"),
            Err(e) => error!(error = %e, "Worker task panicked"),
        }
    }
    Ok(outcome?)
}

async fn wait_for_result(
    client: &Client,
    workflow_type: &str,
    options: StartWorkflowOptions,
    input: Value,
) -> tideway_core::Result<Value> {
    let handle = client.start_workflow(workflow_type, options, input).await?;
    if handle.created() {
        println!("Starting workflow with ID: {}", handle.workflow_id());
    } else {
        println!("Workflow {} is already running, attaching", handle.workflow_id());
    }
    println!("Workflow RunID: {}", handle.run_id());
    handle.result().await
}

async fn transfer(
    cli: &Cli,
    config: &Config,
    engine: Arc<Engine>,
    args: &TransferArgs,
) -> Result<()> {
    let worker = if args.start.no_worker {
        None
    } else {
        Some(transfer_worker(
            engine.clone(),
            WorkerOptions::from(config),
            cli.accounts()?,
        ))
    };
    let input = TransferInput {
        from_account: args.transfer.from.clone(),
        to_account: args.transfer.to.clone(),
        amount: args.transfer.amount,
    };
    let workflow_id = args
        .start
        .workflow_id
        .clone()
        .unwrap_or_else(|| TRANSFER_WORKFLOW_ID.to_string());

    let value = start_and_wait(
        &client(config, engine),
        worker,
        MONEY_TRANSFER,
        StartWorkflowOptions::new(workflow_id, TRANSFER_TASK_QUEUE),
        serde_json::to_value(&input)?,
    )
    .await?;

    let result: TransferResult = serde_json::from_value(value)?;
    println!("\nTransfer complete!");
    println!(
        "  {}: ${:.2} -> ${:.2}",
        result.from_account, result.from_start, result.from_final
    );
    println!(
        "  {}: ${:.2} -> ${:.2}",
        result.to_account, result.to_start, result.to_final
    );
    Ok(())
}

async fn print_numbers(config: &Config, engine: Arc<Engine>, args: &StartArgs) -> Result<()> {
    let worker = if args.no_worker {
        None
    } else {
        Some(print_numbers_worker(engine.clone(), WorkerOptions::from(config)))
    };
    let workflow_id = args
        .workflow_id
        .clone()
        .unwrap_or_else(|| PRINT_NUMBERS_WORKFLOW_ID.to_string());

    let value = start_and_wait(
        &client(config, engine),
        worker,
        PRINT_NUMBERS,
        StartWorkflowOptions::new(workflow_id, PRINT_NUMBERS_TASK_QUEUE),
        Value::Null,
    )
    .await?;

    println!("\nWorkflow result: {value}");
    Ok(())
}

async fn query(config: &Config, engine: Arc<Engine>, args: &QueryArgs) -> Result<()> {
    let handle = client(config, engine)
        .get_workflow_handle(&args.workflow_id)
        .await?;
    let value = handle.query(&args.name).await?;
    println!("{}", serde_json::to_string_pretty(&value)?);
    Ok(())
}

async fn cancel(config: &Config, engine: Arc<Engine>, args: &CancelArgs) -> Result<()> {
    let handle = client(config, engine)
        .get_workflow_handle(&args.workflow_id)
        .await?;
    handle.cancel(args.reason.clone()).await?;
    println!("Cancellation requested for {} (run {})", handle.workflow_id(), handle.run_id());
    Ok(())
}

async fn move_money(cli: &Cli, args: &MoveMoneyArgs) -> Result<()> {
    let api = cli.accounts()?;
    let policy = naive::default_policy();

    println!("Checking if the balance service is running...");
    naive::with_retries(&policy, "health check", || api.health())
        .await
        .context("Balance service is not running")?;

    let outcome = naive::move_money(
        api.as_ref(),
        &policy,
        &args.transfer.from,
        &args.transfer.to,
        args.transfer.amount,
    )
    .await;

    match outcome {
        Ok(transfer) => {
            println!("Transfer complete!");
            println!(
                "  {}: ${:.2} -> ${:.2}",
                args.transfer.from, transfer.withdrawn.previous_balance, transfer.withdrawn.new_balance
            );
            println!(
                "  {}: ${:.2} -> ${:.2}",
                args.transfer.to, transfer.deposited.previous_balance, transfer.deposited.new_balance
            );
            Ok(())
        }
        Err(e @ naive::NaiveTransferError::PartialFailure { .. }) => {
            println!("WARNING: Money was withdrawn from {} but not deposited!", args.transfer.from);
            println!("WARNING: This is a partial failure - money may be lost!");
            Err(e.into())
        }
        Err(e) => Err(e.into()),
    }
}
