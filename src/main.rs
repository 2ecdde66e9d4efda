//! CMIS Store operator tool
//!
//! Checks connectivity to the document store, provisions repository
//! databases, and dumps connector metrics.

use anyhow::{bail, Context};
use clap::{Arg, ArgMatches, Command};
use cmis_store::core::Config;
use cmis_store::storage::{
    endpoint, ConnectionProber, CouchConnector, DeploymentContext, ProvisionReport,
    Provisioner,
};
use cmis_store::system::metrics;
use cmis_store::ClientPool;
use tracing::{error, info};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Parse command line arguments
    let matches = Command::new("cmis-store")
        .version(cmis_store::VERSION)
        .about("Storage connector tooling for a CMIS repository.")
        .subcommand_required(true)
        .arg(
            Arg::new("config")
                .short('c')
                .long("config")
                .value_name("FILE")
                .global(true)
                .help("Configuration file path")
        )
        .arg(
            Arg::new("store-url")
                .long("store-url")
                .value_name("URL")
                .global(true)
                .help("Document store URL, overriding every other source")
        )
        .arg(
            Arg::new("log-level")
                .long("log-level")
                .value_name("LEVEL")
                .global(true)
                .help("Log level (trace, debug, info, warn, error)")
        )
        .subcommand(Command::new("check").about("Resolve the store endpoint and probe it"))
        .subcommand(
            Command::new("init")
                .about("Connect, create missing databases and seed the configuration document"),
        )
        .subcommand(
            Command::new("metrics")
                .about("Bootstrap the connector, then print its metrics in Prometheus text format"),
        )
        .get_matches();

    // Load configuration
    let mut config = match matches.get_one::<String>("config") {
        Some(path) => Config::from_file(path)?,
        None => Config::load()?,
    };
    apply_cli_overrides(&mut config, &matches);
    config.validate()?;

    cmis_store::init_logging(&config.logging)?;
    info!("Starting {} v{}", cmis_store::NAME, cmis_store::VERSION);

    match matches.subcommand() {
        Some(("check", _)) => check(&config).await,
        Some(("init", _)) => init(config).await,
        Some(("metrics", _)) => {
            bootstrap(config).await?;
            print!("{}", metrics::gather_text()?);
            Ok(())
        }
        _ => bail!("no command given; see --help"),
    }
}

/// Apply command line argument overrides to configuration
fn apply_cli_overrides(config: &mut Config, matches: &ArgMatches) {
    if let Some(url) = matches.get_one::<String>("store-url") {
        config.store.url_override = Some(url.clone());
    }

    if let Some(level) = matches.get_one::<String>("log-level") {
        config.logging.level = level.clone();
    }
}

async fn check(config: &Config) -> anyhow::Result<()> {
    let context = DeploymentContext::detect(&config.endpoint.url_env_var);
    let endpoint = endpoint::resolve(config, &context).context("resolving store endpoint")?;
    let connector = CouchConnector::connect(&endpoint, &config.store)?;

    let report = ConnectionProber::from_config(&config.store)
        .probe(&endpoint, connector.as_ref())
        .await;
    println!("endpoint: {} ({})", report.endpoint, endpoint.source().as_str());
    println!("socket:   {}", report.socket);
    println!("http:     {}", report.http);

    if !report.is_healthy() {
        bail!("document store at {} is not healthy", report.endpoint);
    }
    Ok(())
}

/// Initialize the pool, provision it and leave bootstrap
async fn bootstrap(config: Config) -> anyhow::Result<(ClientPool, ProvisionReport)> {
    let pool = ClientPool::new(config);
    let report = match Provisioner::new(&pool).run().await {
        Ok(report) => report,
        Err(e) => {
            error!(error = %e, "storage bootstrap failed");
            return Err(e).context("initializing storage connector");
        }
    };
    pool.mark_ready();
    Ok((pool, report))
}

async fn init(config: Config) -> anyhow::Result<()> {
    let (pool, report) = bootstrap(config).await?;

    for id in &report.databases_created {
        println!("created database {}", id);
    }
    for id in &report.design_documents_created {
        println!("created design document in {}", id);
    }
    if report.configuration_created {
        println!("created default configuration");
    }
    println!("{} databases ready", pool.handle_count());
    Ok(())
}
