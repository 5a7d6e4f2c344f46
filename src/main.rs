//! nbstack CLI
//!
//! Deploys or tears down a notebook-serving platform stack on a managed
//! container cluster.

use std::path::PathBuf;

use clap::Parser;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use nbstack::orchestrator::{DeployOptions, StackDeployment};
use nbstack::runner::ProcessRunner;
use nbstack::{config, params};
use nbstack::{Result, REQUIRED_EXECUTABLES, TEMPLATE_REPO_URL};

/// Deploy a notebook-serving platform stack
#[derive(Parser, Debug)]
#[command(name = "nbstack")]
#[command(version, about, long_about = None)]
struct Cli {
    /// Parameter file (YAML); NBSTACK_* environment variables fill the gaps
    #[arg(short, long)]
    file: Option<PathBuf>,

    /// Keep the rendered configuration in this directory instead of a
    /// discarded scratch directory
    #[arg(short, long)]
    directory: Option<PathBuf>,

    /// Tear the stack down instead of deploying it
    #[arg(short, long)]
    undeploy: bool,

    /// Fetch and render the configuration, then stop
    #[arg(short, long)]
    create_config: bool,

    /// Skip the image prepuller
    #[arg(long)]
    disable_prepuller: bool,

    /// Deploy into a cluster that already exists (never create or delete it)
    #[arg(long)]
    existing_cluster: bool,

    /// Deploy into a namespace that already exists (never create or delete it)
    #[arg(long)]
    existing_namespace: bool,

    /// Manifest template repository
    #[arg(long, default_value = TEMPLATE_REPO_URL)]
    template_repo: String,
}

fn main() -> Result<()> {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with(tracing_subscriber::fmt::layer().with_target(false))
        .init();

    let cli = Cli::parse();

    let mut params = config::params_from_env();
    if let Some(file) = &cli.file {
        let overrides = config::load_parameter_file(file)?;
        params = config::merge(params, &overrides);
    }

    let runner = ProcessRunner::new();
    if cli.undeploy {
        runner.check_prerequisites(REQUIRED_EXECUTABLES)?;
    } else {
        // Deployment also clones the template repository, and generates DH
        // parameters unless the parameter set already carries them
        runner.check_prerequisites(&params::required_tools(&params))?;
    }

    let options = DeployOptions {
        directory: cli.directory.clone(),
        config_only: cli.create_config,
        existing_cluster: cli.existing_cluster,
        existing_namespace: cli.existing_namespace,
        enable_prepuller: !cli.disable_prepuller,
        repo_url: cli.template_repo.clone(),
    };
    let deployment = StackDeployment::new(&runner, options);

    if cli.undeploy {
        deployment.undeploy(&mut params)
    } else {
        deployment.deploy(&mut params)
    }
}
