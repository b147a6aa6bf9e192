//! Portcullis CLI - an edge gateway
//!
//! Run `portcullis --help` for usage information.

use clap::{Parser, Subcommand};
use portcullis::auth::{hash_password, Identity, Role};
use portcullis::config::{Config, LogFormat, LoggingConfig};
use portcullis::policy::AuthorizationEngine;
use portcullis::router::HttpBackend;
use portcullis::server::Gateway;
use portcullis::storage::MemoryCredentialStore;
use portcullis::web::GatewayApp;
use std::io::{self, Write};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{info, warn, Level};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

#[derive(Parser)]
#[command(
    name = "portcullis",
    about = "An edge gateway: token authentication, role policies, admission control and routing",
    version
)]
struct Cli {
    /// Configuration file path
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Increase verbosity (-v, -vv)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the gateway
    Serve {
        /// Address to bind to, overriding the configuration
        #[arg(short, long)]
        bind: Option<String>,
    },

    /// Validate the configuration and exit
    Check,

    /// Print the route table
    Routes,

    /// Hash a password for a bootstrap user entry
    HashPassword,

    /// Issue a token without a stored identity
    MintToken {
        /// Email to put in the token
        #[arg(short, long)]
        email: String,

        /// Roles to grant (comma-separated)
        #[arg(short, long, default_value = "USER")]
        roles: String,
    },
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    if let Commands::HashPassword = cli.command {
        init_logging(cli.verbose, &LoggingConfig::default());
        return hash_password_prompt();
    }

    let config_path = cli.config.unwrap_or_else(Config::default_path);
    let config = Config::load(&config_path).await?;
    init_logging(cli.verbose, &config.logging);

    match cli.command {
        Commands::Serve { bind } => run_server(config, config_path, bind).await?,
        Commands::Check => check_config(&config),
        Commands::Routes => print_routes(&config),
        Commands::MintToken { email, roles } => mint_token(&config, &email, &roles)?,
        Commands::HashPassword => {}
    }

    Ok(())
}

fn init_logging(verbose: u8, logging: &LoggingConfig) {
    let filter = match verbose {
        0 => EnvFilter::try_from_default_env()
            .or_else(|_| EnvFilter::try_new(&logging.level))
            .unwrap_or_else(|_| EnvFilter::new("info")),
        1 => EnvFilter::from_default_env().add_directive(Level::DEBUG.into()),
        _ => EnvFilter::from_default_env().add_directive(Level::TRACE.into()),
    };

    let registry = tracing_subscriber::registry().with(filter);
    match logging.format {
        LogFormat::Json => registry.with(fmt::layer().json()).init(),
        LogFormat::Pretty => registry.with(fmt::layer()).init(),
    }
}

/// Run the gateway until Ctrl+C
async fn run_server(
    mut config: Config,
    config_path: PathBuf,
    bind: Option<String>,
) -> Result<(), Box<dyn std::error::Error>> {
    if let Some(bind) = bind {
        config.server.bind = bind;
    }
    let sweep_interval = config.admission.sweep_interval;

    let backend = HttpBackend::new()?;
    let gateway = Arc::new(Gateway::new(
        config,
        Arc::new(MemoryCredentialStore::new()),
        Arc::new(backend),
    ));

    let created = gateway.bootstrap_identities().await?;
    info!(
        created,
        routes = gateway.router().snapshot().len(),
        "Gateway initialised"
    );

    let sweeper = Arc::clone(&gateway);
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(sweep_interval);
        loop {
            ticker.tick().await;
            let evicted = sweeper.admission().sweep();
            if evicted > 0 {
                tracing::debug!(evicted, "Evicted idle admission windows");
            }
        }
    });

    #[cfg(unix)]
    spawn_reload_on_hangup(Arc::clone(&gateway), config_path);
    #[cfg(not(unix))]
    drop(config_path);

    let app = GatewayApp::builder()
        .gateway(gateway)
        .with_default_routes()
        .build()?;

    println!("Portcullis listening on {}", app.gateway().config().server.bind);
    println!("Press Ctrl+C to stop");

    app.run(async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!("Failed to listen for Ctrl+C: {}", e);
        }
        info!("Shutting down");
    })
    .await
    .map_err(|e| -> Box<dyn std::error::Error> { e.to_string().into() })
}

/// Reload the route table from the config file on SIGHUP
#[cfg(unix)]
fn spawn_reload_on_hangup(gateway: Arc<Gateway>, path: PathBuf) {
    use tokio::signal::unix::{signal, SignalKind};

    tokio::spawn(async move {
        let mut hangup = match signal(SignalKind::hangup()) {
            Ok(hangup) => hangup,
            Err(e) => {
                warn!("Route reload disabled: {}", e);
                return;
            }
        };

        while hangup.recv().await.is_some() {
            let reloaded = Config::load(&path).await.and_then(|fresh| {
                Config::validate_routes(fresh.routes.rules().to_vec(), &gateway.config().policies)
            });

            match reloaded {
                Ok(table) => gateway.reload_routes(table),
                Err(e) => warn!(path = %path.display(), "Route reload rejected: {}", e),
            }
        }
    });
}

fn check_config(config: &Config) {
    let engine = AuthorizationEngine::new().with_policies(config.policies.clone());

    println!("Configuration OK");
    println!("  bind:      {}", config.server.bind);
    println!("  routes:    {}", config.routes.len());
    println!("  policies:  {}", engine.list_policies().len());
    println!("  users:     {}", config.users.len());
    println!(
        "  admission: {} per {}s, queue {}",
        config.admission.limits.permit_limit,
        config.admission.limits.window.as_secs(),
        config.admission.limits.queue_limit
    );
}

fn print_routes(config: &Config) {
    if config.routes.is_empty() {
        println!("No routes configured.");
        return;
    }

    println!("{:<24} {:<36} {:<14} {:<6} KEY", "PREFIX", "BACKEND", "POLICY", "STRIP");
    for rule in config.routes.rules() {
        println!(
            "{:<24} {:<36} {:<14} {:<6} {}",
            rule.path_prefix,
            rule.backend.as_str(),
            rule.policy.as_deref().unwrap_or("-"),
            if rule.strip_prefix { "yes" } else { "no" },
            rule.key_by.unwrap_or(config.admission.key_by)
        );
    }
}

fn hash_password_prompt() -> Result<(), Box<dyn std::error::Error>> {
    eprint!("Password: ");
    io::stderr().flush()?;
    let password = rpassword::read_password()?;

    eprint!("Confirm password: ");
    io::stderr().flush()?;
    let confirm = rpassword::read_password()?;

    if password != confirm {
        return Err("Passwords do not match".into());
    }

    println!("{}", hash_password(&password)?);
    Ok(())
}

fn mint_token(config: &Config, email: &str, roles: &str) -> Result<(), Box<dyn std::error::Error>> {
    let tokens = portcullis::auth::TokenService::new(&config.token);

    let mut identity = Identity::new(email, "");
    for role in Role::parse_many(roles)? {
        identity.grant(role);
    }

    let issued = tokens.create(&identity)?;
    eprintln!(
        "Token for {} (subject {}) valid for {}s",
        email, identity.id, issued.expires_in
    );
    println!("{}", issued.token);
    Ok(())
}
