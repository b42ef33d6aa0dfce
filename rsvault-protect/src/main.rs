//! rsvault-protect: apply, refresh, destroy and import VM backup protection.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use tokio_util::sync::CancellationToken;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use rsvault_protect::clients::arm::DEFAULT_ENDPOINT;
use rsvault_protect::{
    ArmClient, AuditLogger, ControlPlane, ImportId, Manifest, Orchestrator, ReconcilerConfig,
    StateFile, VaultRef,
};

/// rsvault VM backup protection reconciler
#[derive(Parser, Debug)]
#[command(name = "rsvault-protect", version, about)]
struct Args {
    /// Control plane endpoint
    #[arg(long, default_value = DEFAULT_ENDPOINT)]
    endpoint: String,

    /// Subscription that owns the vaults
    #[arg(long)]
    subscription_id: String,

    /// Bearer token (defaults to $ARM_ACCESS_TOKEN)
    #[arg(long)]
    token: Option<String>,

    /// State file
    #[arg(long, default_value = "rsvault.state.json")]
    state: PathBuf,

    /// Optional JSON file with reconciler tunables
    #[arg(long)]
    config: Option<PathBuf>,

    /// Maximum wait for one remote operation in seconds
    #[arg(long)]
    poll_timeout_secs: Option<u64>,

    /// Initial delay between operation status checks in seconds
    #[arg(long)]
    poll_interval_secs: Option<u64>,

    /// Existence re-checks after create/delete
    #[arg(long)]
    verify_attempts: Option<u32>,

    /// HTTP request timeout in seconds
    #[arg(long, default_value = "60")]
    http_timeout_secs: u64,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Converge state onto a manifest
    Apply {
        /// Manifest JSON file
        manifest: PathBuf,
    },
    /// Re-read recorded bindings and report drift
    Refresh,
    /// Delete every recorded binding, then the given vaults
    Destroy {
        /// Vault to delete afterwards (<resource-group>/<vault-name>, repeatable)
        #[arg(long)]
        vault: Vec<VaultRef>,
        /// Manifest whose bindings must be absent before a vault is deleted
        #[arg(long)]
        manifest: Option<PathBuf>,
    },
    /// Bring an existing protected VM under management
    Import {
        /// Resource address, e.g. protected_vm.web
        address: String,
        /// Full resource ID of the protected item
        id: String,
    },
    /// Assert a recorded binding exists or is absent
    Verify {
        expect: Expectation,
        address: String,
    },
}

#[derive(Clone, Copy, Debug, ValueEnum)]
enum Expectation {
    Exists,
    Absent,
}

async fn load_config(args: &Args) -> Result<ReconcilerConfig> {
    let mut config = match &args.config {
        Some(path) => {
            let text = tokio::fs::read_to_string(path)
                .await
                .with_context(|| format!("Failed to read config {}", path.display()))?;
            serde_json::from_str(&text)
                .with_context(|| format!("Failed to parse config {}", path.display()))?
        }
        None => ReconcilerConfig::default(),
    };
    if let Some(secs) = args.poll_timeout_secs {
        config.poll.max_wait = Duration::from_secs(secs);
    }
    if let Some(secs) = args.poll_interval_secs {
        config.poll.poll_interval = Duration::from_secs(secs);
    }
    if let Some(attempts) = args.verify_attempts {
        config.verify.attempts = attempts;
    }
    Ok(config)
}

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize logging
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "rsvault_protect=info,audit=info,reqwest=warn,hyper=warn".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let args = Args::parse();
    let config = load_config(&args).await?;

    let token = match &args.token {
        Some(token) => token.clone(),
        None => std::env::var("ARM_ACCESS_TOKEN")
            .context("Pass --token or set ARM_ACCESS_TOKEN")?,
    };

    let client: Arc<dyn ControlPlane> = Arc::new(ArmClient::new(
        &args.endpoint,
        args.subscription_id.clone(),
        token,
        Duration::from_secs(args.http_timeout_secs),
    )?);

    // Ctrl-C stops in-flight polling
    let cancel = CancellationToken::new();
    {
        let cancel = cancel.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                info!("Received SIGINT, cancelling");
                cancel.cancel();
            }
        });
    }

    let audit = Arc::new(AuditLogger::new("protect"));
    let orchestrator = Orchestrator::new(
        client,
        args.subscription_id.clone(),
        config,
        cancel,
        audit,
    )
    .with_state_path(&args.state);

    let mut state = StateFile::load(&args.state).await?;

    match &args.command {
        Commands::Apply { manifest } => {
            let manifest = Manifest::load(manifest).await?;
            let summary = orchestrator.apply(&manifest, &mut state).await?;
            info!(
                "Apply complete: {} created, {} updated, {} replaced, {} unchanged, {} deleted",
                summary.created.len(),
                summary.updated.len(),
                summary.replaced.len(),
                summary.unchanged.len(),
                summary.deleted.len()
            );
        }
        Commands::Refresh => {
            let summary = orchestrator.refresh(&mut state).await?;
            info!(
                "Refresh complete: {} in sync, {} drifted, {} missing",
                summary.in_sync.len(),
                summary.drifted.len(),
                summary.missing.len()
            );
            for address in &summary.missing {
                println!("{} missing (will be recreated on apply)", address);
            }
            for address in &summary.drifted {
                println!("{} drifted", address);
            }
        }
        Commands::Destroy { vault, manifest } => {
            let manifest = match manifest {
                Some(path) => Some(Manifest::load(path).await?),
                None => None,
            };
            let deleted = orchestrator
                .destroy(&mut state, manifest.as_ref(), vault)
                .await?;
            info!(
                "Destroy complete: {} bindings, {} vaults",
                deleted.len(),
                vault.len()
            );
        }
        Commands::Import { address, id } => {
            // Fail fast on malformed IDs before touching the network
            ImportId::parse(id).context("Invalid import ID")?;
            let recorded = orchestrator.import(&mut state, address, id).await?;
            println!("{}", serde_json::to_string_pretty(&recorded)?);
        }
        Commands::Verify { expect, address } => {
            let recorded = state
                .resources
                .get(address)
                .with_context(|| format!("{} is not in state", address))?;
            let identity = recorded.identity()?;
            match expect {
                Expectation::Exists => orchestrator.verifier().assert_exists(&identity).await?,
                Expectation::Absent => orchestrator.verifier().assert_absent(&identity).await?,
            }
            println!("{}: ok", address);
        }
    }

    Ok(())
}
