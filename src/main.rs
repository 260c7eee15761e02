use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tracing::info;

use xray_harmony::app::{AssetKind, AssetManager, DownloadStatus};
use xray_harmony::config::{self, ConfigBuilder};

#[derive(Parser)]
#[command(name = "xray-harmony", version, about = "Share links, config building and geo data for xray")]
struct Cli {
    /// 日志级别（RUST_LOG 优先）
    #[arg(long, default_value = "info")]
    log_level: String,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// 解析分享链接，输出服务器描述 JSON
    Parse { link: String },
    /// 由服务器描述 JSON 生成分享链接
    Generate { descriptor: String },
    /// 由分享链接生成完整配置
    Build {
        #[arg(long)]
        link: String,
        #[arg(long, default_value_t = 10808)]
        socks_port: u16,
        #[arg(long)]
        http_port: Option<u16>,
        #[arg(long, default_value = "127.0.0.1")]
        listen: String,
        /// 私有地址与指定地区（如 cn）的域名、IP 直连
        #[arg(long, value_name = "REGION")]
        direct_geo: Option<String>,
    },
    /// 校验配置文件（JSON 或 YAML）
    Check { path: PathBuf },
    /// 管理 geoip.dat / geosite.dat
    Assets {
        #[arg(long)]
        dir: PathBuf,
        #[command(subcommand)]
        action: AssetAction,
    },
}

#[derive(Subcommand)]
enum AssetAction {
    List,
    Download {
        kind: AssetKind,
        #[arg(long)]
        url: Option<String>,
    },
    CheckUpdate {
        kind: AssetKind,
        #[arg(long)]
        url: Option<String>,
    },
    Verify { kind: AssetKind },
    Delete { kind: AssetKind },
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(&cli.log_level)),
        )
        .with_writer(std::io::stderr)
        .init();

    match cli.command {
        Command::Parse { link } => {
            let descriptor = config::parse_share_link(&link)?;
            println!("{}", serde_json::to_string_pretty(&descriptor)?);
        }
        Command::Generate { descriptor } => {
            println!("{}", config::share_link::generate_share_link_json(&descriptor)?);
        }
        Command::Build {
            link,
            socks_port,
            http_port,
            listen,
            direct_geo,
        } => {
            let descriptor = config::parse_share_link(&link)?;
            let mut builder = ConfigBuilder::new();
            builder
                .add_socks_inbound(socks_port, &listen, false, true)
                .add_proxy_outbound(&descriptor)
                .add_freedom_outbound("direct");
            if let Some(port) = http_port {
                builder.add_http_inbound(port, &listen);
            }
            if let Some(region) = direct_geo {
                builder
                    .add_routing_rule("field", "direct", vec![format!("geosite:{region}")], Vec::new())
                    .add_routing_rule(
                        "field",
                        "direct",
                        Vec::new(),
                        vec!["geoip:private".into(), format!("geoip:{region}")],
                    );
            }
            println!("{}", builder.build_json()?);
        }
        Command::Check { path } => {
            let cfg = config::load_config_file(&path)
                .with_context(|| format!("failed to load {}", path.display()))?;
            info!(
                inbounds = cfg.inbounds.len(),
                outbounds = cfg.outbounds.len(),
                routing = cfg.routing.is_some(),
                "config ok"
            );
        }
        Command::Assets { dir, action } => run_assets(AssetManager::new(dir)?, action)?,
    }
    Ok(())
}

fn run_assets(manager: AssetManager, action: AssetAction) -> Result<()> {
    match action {
        AssetAction::List => {
            println!("{}", serde_json::to_string_pretty(&manager.list()?)?);
        }
        AssetAction::Download { kind, url } => {
            let mut last_reported = 0u64;
            manager.download(kind, url.as_deref(), &mut |p| match p.status {
                DownloadStatus::Downloading => {
                    // 每 1 MiB 报一次
                    if p.downloaded >= last_reported + (1 << 20) {
                        last_reported = p.downloaded;
                        eprintln!("{kind}: {} / {} bytes", p.downloaded, p.total);
                    }
                }
                DownloadStatus::Completed => eprintln!("{kind}: done, {} bytes", p.downloaded),
                DownloadStatus::Failed => {}
            })?;
        }
        AssetAction::CheckUpdate { kind, url } => {
            let stale = manager.check_update(kind, url.as_deref())?;
            println!("{}", if stale { "update available" } else { "up to date" });
        }
        AssetAction::Verify { kind } => {
            let ok = manager.verify(kind)?;
            println!("{kind}: {}", if ok { "valid" } else { "missing or too small" });
            if !ok {
                std::process::exit(1);
            }
        }
        AssetAction::Delete { kind } => manager.delete(kind)?,
    }
    Ok(())
}
