use std::path::PathBuf;

use anyhow::Context;
use clap::{Args as ClapArgs, Parser, Subcommand};
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

mod config;
mod egress;
mod error;
mod proxy;
mod utils;

use config::{parse_ip_list, Config, FileConfig, Mode};
use proxy::Server;

#[derive(Parser, Debug)]
#[command(name = "egress-proxy")]
#[command(about = "SOCKS5 / HTTP forward proxy with random egress IP selection", long_about = None)]
struct Args {
    #[command(subcommand)]
    command: Commands,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run proxy server
    Serve(ProxyArgs),

    /// Validate configuration and exit
    Check(ProxyArgs),
}

#[derive(ClapArgs, Debug)]
struct ProxyArgs {
    /// TOML configuration file
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Listen address, e.g. 127.0.0.1:8080
    #[arg(short = 'L', long)]
    listen: Option<String>,

    /// Proxy protocol
    #[arg(short, long, value_enum)]
    mode: Option<Mode>,

    /// Egress IP (repeatable), replaces ip_list from the config file
    #[arg(long = "ip")]
    ips: Vec<String>,

    /// Outbound dial timeout in seconds
    #[arg(long)]
    dial_timeout: Option<u64>,
}

impl ProxyArgs {
    /// 合并配置文件与命令行参数，命令行优先
    fn into_config(self) -> anyhow::Result<Config> {
        let mut file = match &self.config {
            Some(path) => FileConfig::load(path)
                .with_context(|| format!("failed to load {}", path.display()))?,
            None => FileConfig::default(),
        };

        if let Some(listen) = self.listen {
            file.app.listen = listen;
        }
        if let Some(mode) = self.mode {
            file.app.mode = mode;
        }
        if !self.ips.is_empty() {
            // 提前解析，错误信息指向命令行
            parse_ip_list(&self.ips).context("invalid --ip")?;
            file.app.ip_list = self.ips;
        }
        if let Some(secs) = self.dial_timeout {
            file.app.dial_timeout_secs = secs;
        }

        Ok(file.into_config()?)
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    // 初始化日志
    let log_level = if args.verbose { "debug" } else { "info" };

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| format!("egress_proxy={}", log_level).into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    match args.command {
        Commands::Check(proxy_args) => {
            let config = proxy_args.into_config()?;
            let addr = config.resolve_listen_addr().await?;
            info!("✓ Configuration OK");
            info!("  Listen: {} ({})", config.listen_addr, addr);
            info!("  Mode: {}", config.mode);
            info!("  Egress IPs: {:?}", config.ip_list);
            info!("  Dial timeout: {:?}", config.dial_timeout);
        }

        Commands::Serve(proxy_args) => {
            let config = proxy_args.into_config()?;
            info!("🚀 egress-proxy starting...");
            info!("   Listen: {}", config.listen_addr);
            info!("   Mode: {}", config.mode);
            info!("   Egress IPs: {}", config.ip_list.len());

            let server = Server::bind(config)
                .await
                .context("failed to start listener")?;

            tokio::select! {
                result = server.run() => {
                    if let Err(e) = result {
                        error!("❌ Server error: {}", e);
                        return Err(e.into());
                    }
                }
                signal = tokio::signal::ctrl_c() => {
                    signal.context("failed to listen for Ctrl+C")?;
                    info!("Shutdown signal received, stopping listener");
                }
            }
        }
    }

    Ok(())
}
