use std::path::PathBuf;

use {
    clap::{Parser, Subcommand},
    nachos_config::NachosConfig,
    nachos_gateway::GatewayBuilder,
    nachos_policy::PolicyLoader,
    tracing::{info, warn},
    tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt},
};

#[derive(Parser)]
#[command(name = "nachos", about = "Nachos gateway: policy, rate limits, audit and sessions")]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Config file. Defaults to `nachos.{toml,yaml,yml,json}` in the working
    /// directory or the user config dir.
    #[arg(long, short, global = true, env = "NACHOS_CONFIG")]
    config: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error).
    #[arg(long, global = true, default_value = "info")]
    log_level: String,

    /// Output logs as JSON instead of human-readable.
    #[arg(long, global = true, default_value_t = false)]
    json_logs: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the gateway and its health endpoint.
    Gateway {
        #[arg(long)]
        bind: Option<String>,
        #[arg(long)]
        port: Option<u16>,
    },
    /// Policy tooling.
    Policy {
        #[command(subcommand)]
        action: PolicyAction,
    },
    /// Print the effective configuration as JSON.
    Config,
}

#[derive(Subcommand)]
enum PolicyAction {
    /// Validate every policy file without starting the gateway.
    Check {
        /// Overrides `policy.policies_dir`.
        dir: Option<PathBuf>,
    },
}

fn init_telemetry(cli: &Cli) {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&cli.log_level));

    if cli.json_logs {
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().json().with_target(true).with_thread_ids(false))
            .init();
    } else {
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().with_target(false).with_thread_ids(false).with_ansi(true))
            .init();
    }
}

fn load_config(cli: &Cli) -> anyhow::Result<NachosConfig> {
    match &cli.config {
        Some(path) => nachos_config::load_config(path),
        None => nachos_config::discover_and_load(),
    }
}

async fn run_gateway(
    mut config: NachosConfig,
    bind: Option<String>,
    port: Option<u16>,
) -> anyhow::Result<()> {
    if let Some(bind) = bind {
        config.server.bind = bind;
    }
    if let Some(port) = port {
        config.server.port = port;
    }
    let (bind, port) = (config.server.bind.clone(), config.server.port);

    let gateway = GatewayBuilder::new(config).build().await?;
    if let Err(e) = gateway.start().await {
        // Release whatever was already opened before reporting.
        if let Err(drain) = gateway.shutdown().await {
            warn!(error = %drain, "shutdown after failed start");
        }
        return Err(e);
    }

    let served = nachos_gateway::serve(gateway.clone(), &bind, port, async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!(error = %e, "failed to listen for ctrl-c");
        }
        info!("shutdown requested");
    })
    .await;

    let drained = gateway.shutdown().await;
    served?;
    drained
}

fn check_policies(config: &NachosConfig, dir: Option<PathBuf>) -> anyhow::Result<()> {
    let dir = dir.unwrap_or_else(|| config.policy.policies_dir.clone());
    let report = PolicyLoader::new(&dir).load()?;
    for doc in &report.documents {
        println!("ok      {} ({} rules)", doc.file.display(), doc.document.rules.len());
    }
    for error in &report.errors {
        println!("invalid {error}");
    }
    println!(
        "{} documents, {} rules, {} errors",
        report.documents.len(),
        report.rule_count(),
        report.errors.len()
    );
    if report.errors.is_empty() {
        Ok(())
    } else {
        anyhow::bail!("{} policy errors in {}", report.errors.len(), dir.display())
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();
    init_telemetry(&cli);

    info!(version = env!("CARGO_PKG_VERSION"), "nachos starting");
    let config = load_config(&cli)?;

    match cli.command {
        Commands::Gateway { bind, port } => run_gateway(config, bind, port).await,
        Commands::Policy {
            action: PolicyAction::Check { dir },
        } => check_policies(&config, dir),
        Commands::Config => {
            println!("{}", serde_json::to_string_pretty(&config)?);
            Ok(())
        },
    }
}
