//! unseal-bootstrap - provision KMS auto-unseal infrastructure

use std::path::PathBuf;
use std::sync::Arc;

use clap::{Args, Parser, Subcommand};
use tracing::{info, warn};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use unseal_bootstrap::bootstrap::Bootstrapper;
use unseal_bootstrap::config::{BootstrapConfig, ConfigOverrides};
use unseal_bootstrap::manifest::write_manifests;
use unseal_bootstrap::provider::gcp::ServiceAccountKey;
use unseal_bootstrap::provider::{GcpProvider, MemoryProvider, Providers};

/// Provision KMS auto-unseal infrastructure and TLS material for a secrets server
#[derive(Parser, Debug)]
#[command(name = "unseal-bootstrap", version, about, long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Ensure every resource exists, grant roles and write the manifests
    ///
    /// Safe to re-run: existing resources are reused and existing role
    /// bindings are not duplicated. A fresh CA and server certificate are
    /// generated on every run.
    Provision(ProvisionArgs),

    /// Report which resources already exist without changing anything
    Check(CommonArgs),

    /// Print the effective configuration as YAML
    PrintConfig(CommonArgs),
}

/// Arguments shared by every command
#[derive(Args, Debug)]
struct CommonArgs {
    /// YAML configuration file
    #[arg(short = 'f', long = "config")]
    config_file: Option<PathBuf>,

    /// Project id (overrides the file)
    #[arg(long)]
    project: Option<String>,

    /// Bucket name (overrides the file)
    #[arg(long)]
    bucket: Option<String>,

    /// Service account key file
    #[arg(long, env = "GOOGLE_APPLICATION_CREDENTIALS")]
    credentials: Option<PathBuf>,

    /// Manifest output file (overrides the file)
    #[arg(short, long)]
    output: Option<PathBuf>,

    /// Emit logs as JSON
    #[arg(long)]
    log_json: bool,
}

/// Provision arguments
#[derive(Args, Debug)]
struct ProvisionArgs {
    #[command(flatten)]
    common: CommonArgs,

    /// Run against an in-memory provider instead of the cloud
    #[arg(long)]
    dry_run: bool,
}

fn init_tracing(json: bool) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let registry = tracing_subscriber::registry().with(filter);
    if json {
        registry
            .with(fmt::layer().json().with_writer(std::io::stderr))
            .init();
    } else {
        registry.with(fmt::layer().with_writer(std::io::stderr)).init();
    }
}

fn load_config(args: &CommonArgs) -> anyhow::Result<BootstrapConfig> {
    let mut config = match &args.config_file {
        Some(path) => BootstrapConfig::from_file(path)?,
        None => BootstrapConfig::default(),
    };
    config.apply_overrides(ConfigOverrides {
        project_id: args.project.clone(),
        bucket_name: args.bucket.clone(),
        credentials_file: args.credentials.clone(),
        output: args.output.clone(),
    });
    Ok(config)
}

/// Build cloud providers from the credential file. The key's project is
/// used when none was configured.
fn cloud_providers(config: &mut BootstrapConfig) -> anyhow::Result<Providers> {
    let path = config.credentials_file.clone().ok_or_else(|| {
        anyhow::anyhow!("a credentials file is required (--credentials or GOOGLE_APPLICATION_CREDENTIALS)")
    })?;
    let key = ServiceAccountKey::from_file(&path)?;

    if config.project_id.is_empty() {
        if let Some(project_id) = &key.project_id {
            info!(project = %project_id, "Using project from credentials");
            config.project_id = project_id.clone();
        }
    }

    let provider = GcpProvider::from_service_account(key, config.request_timeout())?;
    Ok(Providers::from_single(Arc::new(provider)))
}

async fn run_provision(args: ProvisionArgs) -> anyhow::Result<()> {
    let mut config = load_config(&args.common)?;

    let providers = if args.dry_run {
        warn!("Dry run: resources are provisioned in memory only");
        Providers::from_single(Arc::new(MemoryProvider::new()))
    } else {
        cloud_providers(&mut config)?
    };

    let output = config.output.clone();
    let bootstrapper = Bootstrapper::new(config, providers)?;
    let report = bootstrapper.run().await?;

    write_manifests(&output, &report.manifest).await?;
    info!(path = %output.display(), "Manifests written");

    for line in report.summary_lines() {
        println!("{}", line);
    }
    Ok(())
}

async fn run_check(args: CommonArgs) -> anyhow::Result<()> {
    let mut config = load_config(&args)?;
    let providers = cloud_providers(&mut config)?;
    let bootstrapper = Bootstrapper::new(config, providers)?;

    for status in bootstrapper.inspect().await? {
        let state = if status.exists { "present" } else { "missing" };
        println!("{:<16} {:<8} {}", status.kind, state, status.name);
    }
    Ok(())
}

fn run_print_config(args: CommonArgs) -> anyhow::Result<()> {
    let config = load_config(&args)?;
    print!("{}", config.to_yaml()?);
    Ok(())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let log_json = match &cli.command {
        Commands::Provision(args) => args.common.log_json,
        Commands::Check(args) | Commands::PrintConfig(args) => args.log_json,
    };
    init_tracing(log_json);

    match cli.command {
        Commands::Provision(args) => run_provision(args).await,
        Commands::Check(args) => run_check(args).await,
        Commands::PrintConfig(args) => run_print_config(args),
    }
}
