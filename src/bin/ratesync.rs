//! ratesync command line.
//!
//! `ratesync run` performs one reconciliation and exits non-zero unless it
//! completes. `ratesync seal` encrypts a SQL file into an envelope usable as
//! the local demonstration dataset.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result, bail};
use clap::{Args, Parser, Subcommand};
use secrecy::SecretString;
use tokio::sync::watch;
use tracing::info;
use tracing_subscriber::EnvFilter;

use ratesync::envelope::{EncryptedEnvelope, random_iv, seal};
use ratesync::{
    Components, DbPools, ProgressEvent, Reconciler, ReconcilerConfig, ReqwestHttpClient,
    RunOutcome, SessionContext,
};

/// Tax-rate reconciliation with the workflow service
#[derive(Parser)]
#[command(version, about, long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run one reconciliation against the configured target
    Run {
        /// Configuration file
        #[arg(short, long, env = "RATESYNC_CONFIG", default_value = "ratesync.toml")]
        config: PathBuf,

        #[command(flatten)]
        license: LicenseArgs,

        /// Print progress events as JSON lines
        #[arg(long)]
        json: bool,
    },

    /// Encrypt a SQL script into an envelope file
    Seal {
        /// SQL script to encrypt
        #[arg(long)]
        input: PathBuf,

        /// Envelope JSON to write
        #[arg(long)]
        output: PathBuf,

        #[command(flatten)]
        license: LicenseArgs,
    },
}

#[derive(Args)]
struct LicenseArgs {
    /// License number
    #[arg(long, env = "RATESYNC_LICENSE")]
    license: String,

    /// Contact address registered with the license
    #[arg(long, env = "RATESYNC_CONTACT")]
    contact: String,

    /// Secret the envelope keys are derived from
    #[arg(long, env = "RATESYNC_SECRET", hide_env_values = true)]
    secret: Option<String>,
}

impl LicenseArgs {
    fn into_session(self, client_version: Option<String>) -> SessionContext {
        let mut session = SessionContext::new(self.license, self.contact);
        if let Some(version) = client_version {
            session = session.with_client_version(version);
        }
        if let Some(secret) = self.secret {
            session = session.with_secret(SecretString::from(secret));
        }
        session
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    match cli.command {
        Command::Run {
            config,
            license,
            json,
        } => run(config, license, json).await,
        Command::Seal {
            input,
            output,
            license,
        } => seal_file(input, output, license).await,
    }
}

async fn run(config_path: PathBuf, license: LicenseArgs, json: bool) -> Result<()> {
    info!(config_path = %config_path.display(), "Loading configuration");
    let config = ReconcilerConfig::load(&config_path)?;
    let session = license.into_session(config.client_version.clone());

    let pools = DbPools::from_config(&config.database)
        .await
        .context("opening target database")?;
    let components = Components::standard(pools, ReqwestHttpClient::new(), &config);
    let (_publisher, sessions) = watch::channel(Some(Arc::new(session)));
    let reconciler = Reconciler::new(components, &config, sessions);

    let mut handle = reconciler.start()?;
    info!(run_id = %handle.run_id(), target = %handle.target(), "Reconciliation started");

    loop {
        tokio::select! {
            event = handle.next_event() => match event {
                Some(event) => print_event(&event, json)?,
                None => break,
            },
            _ = tokio::signal::ctrl_c() => handle.cancel(),
        }
    }

    let report = handle.wait().await?;
    match report.outcome {
        RunOutcome::Completed(run) => {
            info!(
                run_id = %run.data.id,
                statements = run.state.applied.statements_applied,
                rows = run.state.applied.rows_affected,
                source = %run.state.source,
                "Reconciliation completed"
            );
            Ok(())
        }
        RunOutcome::Failed(run) => bail!(
            "run {} failed at {} ({}): {}",
            run.data.id,
            run.state.stage,
            run.state.kind,
            run.state.message
        ),
    }
}

fn print_event(event: &ProgressEvent, json: bool) -> Result<()> {
    if json {
        println!("{}", serde_json::to_string(event)?);
        return Ok(());
    }
    match event {
        ProgressEvent::StageCompleted { stage, .. } => println!("done      {}", stage),
        ProgressEvent::RetryScheduled {
            stage,
            attempt,
            delay_ms,
            reason,
            ..
        } => println!(
            "retry     {} attempt {} failed, next in {}ms: {}",
            stage,
            attempt,
            delay_ms,
            reason.to_error_message()
        ),
        ProgressEvent::FallbackSwitched { from, to, kind, .. } => {
            println!("fallback  {} -> {} after {}", from, to, kind)
        }
        ProgressEvent::Finished {
            status,
            statements_applied,
            failed_stage,
            kind,
            ..
        } => match (statements_applied, failed_stage, kind) {
            (Some(applied), _, _) => println!("finished  {} ({} statements)", status, applied),
            (None, Some(stage), Some(kind)) => {
                println!("finished  {} at {} ({})", status, stage, kind)
            }
            _ => println!("finished  {}", status),
        },
    }
    Ok(())
}

async fn seal_file(input: PathBuf, output: PathBuf, license: LicenseArgs) -> Result<()> {
    let session = license.into_session(None);
    if session.key_material().is_none() {
        bail!("sealing needs a secret (--secret or RATESYNC_SECRET)");
    }

    let script = tokio::fs::read_to_string(&input)
        .await
        .with_context(|| format!("reading {}", input.display()))?;
    let item = seal(&script, &session, random_iv())?;
    let envelope = EncryptedEnvelope::from_items(vec![item]).map_err(anyhow::Error::msg)?;
    tokio::fs::write(&output, envelope.to_json()?)
        .await
        .with_context(|| format!("writing {}", output.display()))?;

    info!(output = %output.display(), bytes = script.len(), "Envelope written");
    Ok(())
}
