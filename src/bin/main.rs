use anyhow::Result;
use clap::{Parser, Subcommand};
use gateway_guard::auth::{assert_configured, resolve_auth_policy};
use gateway_guard::{GatewayState, load_gateway_config, start_gateway};
use std::path::PathBuf;
use tracing::{Level, info};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "gateway-guard")]
#[command(about = "Personal assistant gateway with connection and outbound admission control")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the gateway control-plane server
    Serve {
        /// Bind address, overrides `gateway.bind` from the config file
        #[arg(long)]
        bind: Option<String>,
        /// Path to gateway.json
        #[arg(long, env = "GATEWAY_CONFIG")]
        config: Option<PathBuf>,
    },
    /// Resolve the auth policy and run the startup checks
    CheckConfig {
        /// Path to gateway.json
        #[arg(long, env = "GATEWAY_CONFIG")]
        config: Option<PathBuf>,
    },
}

fn env_lookup(name: &str) -> Option<String> {
    std::env::var(name).ok()
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::from_default_env().add_directive("gateway_guard=info".parse()?),
        )
        .with_max_level(Level::INFO)
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Serve { bind, config } => {
            let config = load_gateway_config(config.as_deref())?;
            let bind = bind.unwrap_or_else(|| config.gateway.bind.clone());

            let state = GatewayState::from_config(&config, env_lookup)?;
            info!(
                "Auth mode {}, tailscale identity {}, trust localhost {}",
                state.policy().mode().as_str(),
                state.policy().allow_tailscale_identity(),
                state.policy().trust_localhost()
            );

            start_gateway(state, &bind).await?;
        }
        Commands::CheckConfig { config } => {
            let config = load_gateway_config(config.as_deref())?;
            let policy = resolve_auth_policy(
                &config.gateway.auth,
                config.gateway.tailscale.mode,
                env_lookup,
            );

            println!("Auth mode: {}", policy.mode().as_str());
            println!("Token configured: {}", policy.token().is_some());
            println!("Password configured: {}", policy.password().is_some());
            println!("Tailscale identity: {}", policy.allow_tailscale_identity());
            println!("Trust localhost: {}", policy.trust_localhost());
            println!("Allowed hosts: {}", policy.allowed_hosts().join(", "));
            println!("Trusted proxies: {}", config.gateway.trusted_proxies.len());
            println!(
                "Rate limit providers: {}",
                config.rate_limits.providers.len()
            );

            assert_configured(&policy)?;
            println!("OK");
        }
    }

    Ok(())
}
