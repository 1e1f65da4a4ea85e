use anyhow::{bail, Context, Result};
use clap::{Args, Parser, Subcommand};
use firechicken_multisend::{
    estimate::CostEstimate,
    export::{export_run, generate_recipients, load_recipients},
    rpc::{load_keypair, KeypairWallet, RpcLedger},
    shutdown::{ExitCode, StopSignal},
    state::Reporter,
    Bucket, MultisendError, ParsedInput, RunState, Session, Settings, Wallet,
};
use solana_sdk::{native_token::lamports_to_sol, pubkey::Pubkey};
use std::{path::PathBuf, str::FromStr, sync::Arc};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[clap(author, version, about, long_about = None)]
struct Cli {
    #[clap(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Check accounts, create the missing ones, send tokens and retry failures
    Run(RunArgs),
    /// Report which recipients already have a token account
    Check(StageArgs),
    /// Create token accounts for recipients that lack one
    Provision(StageArgs),
    /// Send tokens to recipients (accounts are re-checked first)
    Transfer(StageArgs),
    /// Retry recipients one at a time
    Retry(StageArgs),
    /// Generate test recipients
    GenerateRecipients(GenerateArgs),
}

#[derive(Args)]
struct StageArgs {
    /// Input CSV file with `address,amount` lines
    #[clap(long)]
    input_csv: PathBuf,

    /// SPL token mint address
    #[clap(long)]
    mint: String,

    /// Sender keypair path (pays fees and owns the source tokens)
    #[clap(long, env = "MULTISEND_KEYPAIR")]
    keypair: PathBuf,

    /// RPC URL
    #[clap(long, env = "MULTISEND_RPC_URL", default_value = "https://api.mainnet-beta.solana.com")]
    url: String,

    /// Token decimals; read from the mint when omitted
    #[clap(long)]
    decimals: Option<u8>,

    /// Rate limit (requests per second)
    #[clap(long, default_value = "10")]
    rate_limit: u32,

    /// Directory for the CSV exports and summary
    #[clap(long, default_value = "multisend-output")]
    out_dir: PathBuf,

    /// Accounts created per transaction
    #[clap(long, default_value = "10")]
    provision_chunk_size: usize,

    /// Create accounts one per transaction
    #[clap(long)]
    single: bool,

    /// Explicit compute unit limit per transaction
    #[clap(long)]
    compute_unit_limit: Option<u32>,

    /// Skip confirmation prompt
    #[clap(long)]
    yes: bool,
}

#[derive(Args)]
struct RunArgs {
    #[clap(flatten)]
    stage: StageArgs,

    /// Check accounts and print the cost estimate without sending anything
    #[clap(long)]
    dry_run: bool,
}

#[derive(Args)]
struct GenerateArgs {
    /// Number of recipients
    #[clap(long)]
    count: usize,

    /// Whole-token amount per recipient
    #[clap(long)]
    amount: u64,

    /// Output CSV file
    #[clap(long)]
    output: PathBuf,
}

#[tokio::main]
async fn main() {
    init_tracing();
    let cli = Cli::parse();

    let stop = StopSignal::new(CancellationToken::new());
    stop.register_handlers();

    let code = match execute(cli.command, &stop).await {
        Ok(()) if stop.is_stop_requested() => ExitCode::Stopped,
        Ok(()) => ExitCode::Success,
        Err(e) => {
            error!("{e:#}");
            ExitCode::GeneralError
        }
    };
    std::process::exit(code.as_i32());
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();
}

async fn execute(command: Commands, stop: &StopSignal) -> Result<()> {
    match command {
        Commands::Run(args) => run_all(args, stop).await,
        Commands::Check(args) => check(args, stop).await,
        Commands::Provision(args) => provision(args, stop).await,
        Commands::Transfer(args) => transfer(args, stop).await,
        Commands::Retry(args) => retry(args, stop).await,
        Commands::GenerateRecipients(args) => {
            generate_recipients(&args.output, args.count, args.amount)?;
            println!(
                "Generated {} recipients in {}",
                args.count,
                args.output.display()
            );
            Ok(())
        }
    }
}

/// Loads the input and the keypair before any network activity.
async fn open(args: &StageArgs, stop: &StopSignal) -> Result<(Session, ParsedInput)> {
    let input = load_recipients(&args.input_csv)
        .with_context(|| format!("Failed to read recipients from {}", args.input_csv.display()))?;
    for reject in &input.rejects {
        warn!(line = reject.line, address = %reject.address, reason = %reject.reason, "skipping input line");
    }
    if input.recipients.is_empty() {
        return Err(MultisendError::NoRecipients.into());
    }

    let mint = Pubkey::from_str(&args.mint).context("Invalid mint address")?;
    let keypair = load_keypair(&args.keypair)?;

    let ledger = RpcLedger::new(&args.url, args.rate_limit);
    let wallet = KeypairWallet::new(keypair, ledger.clone());
    let lamports = ledger
        .balance(&wallet.pubkey())
        .await
        .context("Failed to read sender SOL balance")?;
    println!("Sender SOL balance: {:.6}", lamports_to_sol(lamports));

    let mut settings = Settings::new(mint, args.decimals.unwrap_or_default());
    settings.provision_chunk_size = args.provision_chunk_size;
    settings.single_mode = args.single;
    settings.fees.compute_unit_limit = args.compute_unit_limit;

    let mut session = Session::new(Arc::new(ledger), Arc::new(wallet), settings, stop.cancel_token());
    if args.decimals.is_none() {
        let decimals = session
            .mint_decimals()
            .await
            .context("Failed to read mint decimals")?;
        session.settings_mut().decimals = decimals;
    }

    info!(
        recipients = input.recipients.len(),
        rejected = input.rejects.len(),
        sender = %session.payer(),
        decimals = session.settings().decimals,
        "loaded input"
    );
    Ok((session, input))
}

fn new_run(session: &Session) -> RunState {
    RunState::with_reporter(session.cancel_token().clone(), Reporter::with_bar())
}

fn confirm(args: &StageArgs, question: &str) -> Result<bool> {
    if args.yes {
        println!("\nProceeding (--yes flag set)");
        return Ok(true);
    }
    println!("\n{question} [y/N] ");
    let mut input = String::new();
    std::io::stdin().read_line(&mut input)?;
    if input.trim().eq_ignore_ascii_case("y") {
        Ok(true)
    } else {
        println!("Aborted.");
        Ok(false)
    }
}

async fn ensure_balance(session: &Session, input: &ParsedInput) -> Result<()> {
    let balance = session.check_balance(&input.recipients).await?;
    println!(
        "Sender balance: {} base units, required: {}",
        balance.available, balance.required
    );
    if !balance.sufficient() {
        bail!(
            "Insufficient token balance: short by {} base units",
            balance.shortfall()
        );
    }
    Ok(())
}

async fn run_all(args: RunArgs, stop: &StopSignal) -> Result<()> {
    let (session, input) = open(&args.stage, stop).await?;
    let mut run = new_run(&session);
    run.buckets.rejected = input.rejects.clone();

    session.check_accounts(&mut run, input.recipients.clone()).await?;
    let estimate = CostEstimate::new(
        &input.recipients,
        run.buckets.needs_account.len(),
        session.settings(),
    );
    println!("\n=== COST ESTIMATE ===\n{estimate}");

    if args.dry_run || stop.is_stop_requested() {
        return finish(&args.stage, &run);
    }

    ensure_balance(&session, &input).await?;
    if !confirm(&args.stage, "Ready to distribute?")? {
        return finish(&args.stage, &run);
    }

    session.finish_pipeline(&mut run).await?;
    finish(&args.stage, &run)
}

async fn check(args: StageArgs, stop: &StopSignal) -> Result<()> {
    let (session, input) = open(&args, stop).await?;
    let mut run = new_run(&session);
    run.buckets.rejected = input.rejects;
    session.check_accounts(&mut run, input.recipients).await?;
    finish(&args, &run)
}

async fn provision(args: StageArgs, stop: &StopSignal) -> Result<()> {
    let (session, input) = open(&args, stop).await?;
    let mut run = new_run(&session);
    run.buckets.rejected = input.rejects;

    let estimate = CostEstimate::new(&input.recipients, input.recipients.len(), session.settings());
    println!("\n=== COST ESTIMATE (upper bound) ===\n{estimate}");
    if !confirm(&args, "Create token accounts?")? {
        return Ok(());
    }

    session.provision_accounts(&mut run, input.recipients).await?;
    finish(&args, &run)
}

async fn transfer(args: StageArgs, stop: &StopSignal) -> Result<()> {
    let (session, input) = open(&args, stop).await?;
    let mut run = new_run(&session);
    run.buckets.rejected = input.rejects.clone();

    ensure_balance(&session, &input).await?;
    if !confirm(&args, "Ready to send tokens?")? {
        return Ok(());
    }

    session.check_accounts(&mut run, input.recipients).await?;
    if !run.buckets.needs_account.is_empty() {
        warn!(
            count = run.buckets.needs_account.len(),
            "recipients without a token account will not be sent to"
        );
    }
    if run.cancelled() {
        return finish(&args, &run);
    }

    let ready = run.buckets.has_account.clone();
    if !ready.is_empty() {
        session.dispatch_transfers(&mut run, ready).await?;
    }
    finish(&args, &run)
}

async fn retry(args: StageArgs, stop: &StopSignal) -> Result<()> {
    let (session, input) = open(&args, stop).await?;
    let mut run = new_run(&session);
    run.buckets.rejected = input.rejects.clone();

    ensure_balance(&session, &input).await?;
    if !confirm(&args, "Retry these recipients?")? {
        return Ok(());
    }
    session.retry_failed(&mut run, input.recipients).await?;
    finish(&args, &run)
}

/// Writes exports and prints the per-bucket counts.
fn finish(args: &StageArgs, run: &RunState) -> Result<()> {
    run.reporter.finish();
    let written = export_run(&args.out_dir, run)
        .with_context(|| format!("Failed to write exports to {}", args.out_dir.display()))?;

    println!("\n=== SUMMARY ({}) ===", run.stage());
    for (label, bucket) in [
        ("Has account", Bucket::HasAccount),
        ("Needs account", Bucket::NeedsAccount),
        ("Account creation failed", Bucket::ProvisionFailed),
        ("Sent", Bucket::Sent),
        ("Transfer failed", Bucket::TransferFailed),
        ("Retry succeeded", Bucket::RetrySucceeded),
        ("Retry failed", Bucket::RetryFailed),
    ] {
        let count = run.buckets.get(bucket).len();
        if count > 0 {
            println!("{label}: {count}");
        }
    }
    if !run.buckets.rejected.is_empty() {
        println!("Rejected input lines: {}", run.buckets.rejected.len());
    }
    for path in written {
        println!("Wrote {}", path.display());
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_run_args_parse() {
        let cli = Cli::try_parse_from([
            "firechicken-multisend",
            "run",
            "--input-csv",
            "recipients.csv",
            "--mint",
            "So11111111111111111111111111111111111111112",
            "--keypair",
            "id.json",
            "--single",
            "--dry-run",
        ])
        .unwrap();

        let Commands::Run(args) = cli.command else {
            panic!("expected run command");
        };
        assert!(args.dry_run);
        assert!(args.stage.single);
        assert_eq!(args.stage.rate_limit, 10);
        assert_eq!(args.stage.provision_chunk_size, 10);
        assert_eq!(args.stage.out_dir, PathBuf::from("multisend-output"));
        assert!(args.stage.decimals.is_none());
    }

    #[test]
    fn test_stage_requires_mint() {
        let result = Cli::try_parse_from([
            "firechicken-multisend",
            "check",
            "--input-csv",
            "recipients.csv",
            "--keypair",
            "id.json",
        ]);
        assert!(result.is_err());
    }

    #[test]
    fn test_generate_args_parse() {
        let cli = Cli::try_parse_from([
            "firechicken-multisend",
            "generate-recipients",
            "--count",
            "5",
            "--amount",
            "3",
            "--output",
            "out.csv",
        ])
        .unwrap();
        assert!(matches!(
            cli.command,
            Commands::GenerateRecipients(GenerateArgs { count: 5, amount: 3, .. })
        ));
    }
}
