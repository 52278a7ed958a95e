use crate::dialer::DialConfig;
use crate::rate_limiter::{BandwidthConfig, DEFAULT_RATE};
use anyhow::{bail, Context};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

/// 默认监听端口
pub const DEFAULT_PORT: u16 = 8888;

/// 代理服务配置
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ProxyConfig {
    /// 监听地址
    pub bind_addr: String,
    /// 监听端口
    pub port: u16,
    /// 全局带宽上限（字节/秒）
    pub rate: u32,
    /// 令牌桶容量（字节），缺省与 rate 相同
    pub burst: Option<u32>,
    /// CONNECT 隧道连接目标的超时（毫秒）
    pub tunnel_connect_timeout_ms: u64,
    /// 普通 HTTP 转发连接目标的超时（毫秒）
    pub forward_connect_timeout_ms: u64,
    /// 出站连接 TCP keepalive 时间（秒）
    pub keepalive_secs: u64,
}

impl Default for ProxyConfig {
    fn default() -> Self {
        let tunnel = DialConfig::tunnel();
        let forward = DialConfig::forward();
        Self {
            bind_addr: "0.0.0.0".to_string(),
            port: DEFAULT_PORT,
            rate: DEFAULT_RATE,
            burst: None,
            tunnel_connect_timeout_ms: tunnel.connect_timeout.as_millis() as u64,
            forward_connect_timeout_ms: forward.connect_timeout.as_millis() as u64,
            keepalive_secs: tunnel.keepalive.as_secs(),
        }
    }
}

impl ProxyConfig {
    /// 从 TOML 文件加载配置（`[proxy]` 表，缺省字段使用默认值）
    pub fn load(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        #[derive(Deserialize, Default)]
        struct ProxyConfigWrapper {
            #[serde(default)]
            proxy: ProxyConfig,
        }

        let path = path.as_ref();
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read configuration file {}", path.display()))?;
        let wrapper: ProxyConfigWrapper =
            toml::from_str(&content).context("Failed to parse proxy configuration")?;
        wrapper
            .proxy
            .validate()
            .context("Proxy configuration validation failed")?;
        Ok(wrapper.proxy)
    }

    /// 验证配置的有效性
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.bind_addr.trim().is_empty() {
            bail!("bind_addr cannot be empty");
        }
        if self.rate == 0 {
            bail!("rate must be greater than 0");
        }
        if self.burst == Some(0) {
            bail!("burst must be greater than 0");
        }
        if self.tunnel_connect_timeout_ms == 0 || self.forward_connect_timeout_ms == 0 {
            bail!("connect timeouts must be greater than 0");
        }
        Ok(())
    }

    /// 监听地址，IPv6 地址加方括号
    pub fn listen_addr(&self) -> String {
        if self.bind_addr.contains(':') && !self.bind_addr.starts_with('[') {
            format!("[{}]:{}", self.bind_addr, self.port)
        } else {
            format!("{}:{}", self.bind_addr, self.port)
        }
    }

    /// 令牌桶参数
    pub fn bandwidth(&self) -> BandwidthConfig {
        BandwidthConfig {
            bytes_per_second: self.rate,
            burst_bytes: self.burst.unwrap_or(self.rate),
        }
    }

    pub fn tunnel_dial(&self) -> DialConfig {
        DialConfig {
            connect_timeout: Duration::from_millis(self.tunnel_connect_timeout_ms),
            keepalive: Duration::from_secs(self.keepalive_secs),
        }
    }

    pub fn forward_dial(&self) -> DialConfig {
        DialConfig {
            connect_timeout: Duration::from_millis(self.forward_connect_timeout_ms),
            keepalive: Duration::from_secs(self.keepalive_secs),
        }
    }
}

/// 解析带宽字符串：纯字节数，或带 `k`/`m`/`g`（1024 进制）后缀
///
/// 无法解析、为 0 或超出 u32 时返回 `None`
pub fn parse_rate(input: &str) -> Option<u32> {
    let value = input.trim().to_ascii_lowercase();
    let (digits, multiplier) = match value.chars().last()? {
        'k' => (&value[..value.len() - 1], 1024u64),
        'm' => (&value[..value.len() - 1], 1024 * 1024),
        'g' => (&value[..value.len() - 1], 1024 * 1024 * 1024),
        _ => (value.as_str(), 1),
    };

    let bytes = digits.trim().parse::<u64>().ok()?.checked_mul(multiplier)?;
    u32::try_from(bytes).ok().filter(|&b| b > 0)
}
