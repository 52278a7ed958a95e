use crate::config::{parse_rate, ProxyConfig};
use crate::rate_limiter::DEFAULT_RATE;
use clap::Parser;
use std::path::PathBuf;
use tracing::warn;

#[derive(Parser, Debug, Default)]
#[command(name = "throttled-proxy")]
#[command(author, version, about = "HTTP(S) forward proxy with a global bandwidth limit", long_about = None)]
pub struct Cli {
    /// 配置文件路径（TOML，`[proxy]` 表）
    #[arg(short, long, value_name = "PATH")]
    pub config: Option<PathBuf>,

    /// 监听地址
    #[arg(long, value_name = "ADDR")]
    pub bind: Option<String>,

    /// 监听端口
    #[arg(short, long, env = "PORT")]
    pub port: Option<u16>,

    /// 全局带宽上限（字节/秒，可带 k/m/g 后缀）
    #[arg(short, long, env = "RATE")]
    pub rate: Option<String>,

    /// 令牌桶容量（字节，可带 k/m/g 后缀），默认与带宽相同
    #[arg(long)]
    pub burst: Option<String>,

    /// 日志级别 (trace, debug, info, warn, error)
    #[arg(short, long, default_value = "info")]
    pub log_level: String,

    /// 打印解析后的配置并退出
    #[arg(long)]
    pub check: bool,
}

impl Cli {
    /// 合并默认值、配置文件和命令行参数，命令行优先
    pub fn resolve_config(&self) -> anyhow::Result<ProxyConfig> {
        let mut config = match &self.config {
            Some(path) => ProxyConfig::load(path)?,
            None => ProxyConfig::default(),
        };

        if let Some(bind) = &self.bind {
            config.bind_addr = bind.clone();
        }
        if let Some(port) = self.port {
            config.port = port;
        }
        if let Some(rate) = &self.rate {
            config.rate = parse_rate(rate).unwrap_or_else(|| {
                warn!("Invalid rate {:?}, using default {}", rate, DEFAULT_RATE);
                DEFAULT_RATE
            });
        }
        if let Some(burst) = &self.burst {
            match parse_rate(burst) {
                Some(burst) => config.burst = Some(burst),
                None => warn!("Invalid burst {:?}, using rate", burst),
            }
        }

        config.validate()?;
        Ok(config)
    }
}
