use anyhow::Result;
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;
use wxbridge::agent::commands::mask_api_key;
use wxbridge::Config;

/// WeChat / WeCom callback gateway in front of an OpenAI-compatible chat API.
#[derive(Parser, Debug)]
#[command(name = "wxbridge", author, version, about)]
struct Cli {
    /// Config file (defaults to ~/.wxbridge/config.toml)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run the HTTP gateway
    Serve {
        /// Bind address, overrides `gateway.host`
        #[arg(long)]
        host: Option<String>,
        /// Port, overrides `gateway.port`
        #[arg(short, long)]
        port: Option<u16>,
    },
    /// Load and validate the config, then print a summary with secrets masked
    CheckConfig,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let mut config = Config::load(cli.config.as_deref()).await?;

    let default_level = if config.gateway.debug_mode { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level)),
        )
        .init();

    match cli.command {
        Commands::Serve { host, port } => {
            if let Some(host) = host {
                config.gateway.host = host;
            }
            if let Some(port) = port {
                config.gateway.port = port;
            }
            wxbridge::gateway::run_gateway(config).await
        }
        Commands::CheckConfig => {
            print_summary(&config);
            Ok(())
        }
    }
}

fn redact(secret: Option<&str>) -> String {
    match secret {
        Some(value) if !value.is_empty() => mask_api_key(value),
        _ => "(unset)".to_string(),
    }
}

fn print_summary(config: &Config) {
    println!("config: {}", config.config_path.display());
    println!(
        "gateway: {}:{} debug={} echo={} admin_auth_token={}",
        config.gateway.host,
        config.gateway.port,
        config.gateway.debug_mode,
        config.gateway.echo_mode,
        redact(config.gateway.admin_auth_token.as_deref()),
    );
    println!("store: {:?} {}", config.store.backend, config.store.path);
    println!(
        "openai: {} model={} guest_key={} admin_key={}",
        config.openai.api_base,
        config.openai.chat_model,
        redact(config.openai.guest_key.as_deref()),
        redact(config.openai.admin_key.as_deref()),
    );
    for instance in &config.wechat {
        println!(
            "wechat/{}: appid={} token={} aes_key={} admins={}",
            instance.id,
            instance.appid,
            redact(Some(instance.token.as_str())),
            redact(instance.aes_key.as_deref()),
            instance.admin_user_ids.len(),
        );
    }
    for instance in &config.wework {
        println!(
            "wework/{}: corp_id={} token={} aes_key={} admins={}",
            instance.id,
            instance.corp_id,
            redact(Some(instance.token.as_str())),
            redact(Some(instance.aes_key.as_str())),
            instance.admin_user_ids.len(),
        );
    }
}
