use std::fs;
use std::net::{Ipv6Addr, SocketAddr};
use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result};
use serde::Deserialize;

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    /// UDP 监听地址。
    pub listen_udp: String,
    /// DNS-over-TLS 监听地址。
    pub listen_tls: String,
    /// DoT 服务端证书（PEM）。
    pub tls_cert: String,
    /// DoT 服务端私钥（PEM）。
    pub tls_key: String,
    /// 国内上游列表（host:port），不能为空。
    #[serde(default)]
    pub domestic_parents: Vec<String>,
    /// 海外上游列表（host:port），不能为空。
    #[serde(default)]
    pub overseas_parents: Vec<String>,
    /// 单池超时（毫秒），0 视为缺省。
    #[serde(default = "default_timeout_ms")]
    pub timeout_ms: u64,
    /// 海外先到时留给国内池的宽限窗口（毫秒），0 视为缺省。
    #[serde(default = "default_china_timeout_offset_ms")]
    pub china_timeout_offset_ms: u64,
    /// DNS64 合成用的 IPv6 前缀文本，如 "2001:db8:aaaa:bbbb:cccc:dddd:"。
    /// 与任意 IPv4 点分文本拼接后必须是合法 IPv6 地址。
    #[serde(default)]
    pub prefix: String,
    /// 国内 CIDR 列表文件路径。
    pub ip_database: String,
    /// 分类决策调试日志开关。
    #[serde(default)]
    pub debug: bool,

    /// 启动时解析好的上游地址，加载后不再变化。
    #[serde(skip)]
    pub domestic: Vec<SocketAddr>,
    #[serde(skip)]
    pub overseas: Vec<SocketAddr>,
}

impl Config {
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }

    pub fn grace(&self) -> Duration {
        Duration::from_millis(self.china_timeout_offset_ms)
    }

    /// 轻量校验：上游与前缀问题在启动时暴露，而不是首个请求时。
    fn validate(&mut self) -> Result<()> {
        if self.domestic_parents.is_empty() || self.overseas_parents.is_empty() {
            anyhow::bail!("domestic_parents and overseas_parents must both be non-empty");
        }

        // 0 等同于未配置
        if self.timeout_ms == 0 {
            self.timeout_ms = default_timeout_ms();
        }
        if self.china_timeout_offset_ms == 0 {
            self.china_timeout_offset_ms = default_china_timeout_offset_ms();
        }

        if self.prefix.is_empty() {
            anyhow::bail!("prefix must be set, e.g. \"2001:db8:aaaa:bbbb:cccc:dddd:\"");
        }
        // 用边界点分文本验证拼接结果可解析
        for quad in ["0.0.0.0", "255.255.255.255"] {
            let candidate = format!("{}{}", self.prefix, quad);
            candidate.parse::<Ipv6Addr>().with_context(|| {
                format!(
                    "prefix {:?} does not form a valid IPv6 address with {}",
                    self.prefix, quad
                )
            })?;
        }

        self.domestic = parse_parents(&self.domestic_parents).context("domestic_parents")?;
        self.overseas = parse_parents(&self.overseas_parents).context("overseas_parents")?;
        Ok(())
    }
}

fn parse_parents(parents: &[String]) -> Result<Vec<SocketAddr>> {
    parents
        .iter()
        .map(|p| {
            p.parse::<SocketAddr>()
                .with_context(|| format!("invalid upstream address {p:?}"))
        })
        .collect()
}

pub fn load_config(path: &Path) -> Result<Config> {
    let raw = fs::read_to_string(path)
        .with_context(|| format!("read config file: {}", path.display()))?;
    let mut cfg: Config = serde_json::from_str(&raw)
        .with_context(|| format!("parse config file: {}", path.display()))?;
    cfg.validate()?;
    Ok(cfg)
}

fn default_timeout_ms() -> u64 {
    5000
}

fn default_china_timeout_offset_ms() -> u64 {
    300
}
