use std::fs;
use std::path::Path;
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use serde::Deserialize;

use crate::constants::DEFAULT_WORKERS;

#[derive(Debug, Deserialize, Default)]
pub struct Bootstrap {
    #[serde(default)]
    pub strict: bool,
    #[serde(default)]
    pub hostname: Option<String>,
    #[serde(default)]
    pub pidfile: Option<String>,
    #[serde(default)]
    pub logger: Logger,
    #[serde(default)]
    pub server: Server,
    #[serde(default)]
    pub proxy: Proxy,
    #[serde(default)]
    pub cache: Cache,
    #[serde(default)]
    pub blacklist: Blacklist,
}

impl Bootstrap {
    pub fn validate(&self) -> Result<()> {
        if self.server.addr.trim().is_empty() {
            return Err(anyhow!("server.addr is required"));
        }
        if self.proxy.workers == 0 {
            return Err(anyhow!("proxy.workers must be positive"));
        }
        self.proxy.chain_target()?;
        Ok(())
    }
}

#[derive(Debug, Deserialize, Default)]
pub struct Logger {
    #[serde(default)]
    pub level: String,
    #[serde(default)]
    pub path: String,
    #[serde(default)]
    pub caller: bool,
    #[serde(default)]
    pub max_size: u64,
    #[serde(default)]
    pub max_backups: u64,
    #[serde(default)]
    pub nopid: bool,
}

#[derive(Debug, Deserialize, Default)]
pub struct Server {
    #[serde(default)]
    pub addr: String,
    #[serde(default)]
    pub access_log: Option<AccessLog>,
}

#[derive(Debug, Deserialize, Default)]
pub struct AccessLog {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default)]
    pub path: String,
}

#[derive(Debug, Deserialize)]
pub struct Proxy {
    #[serde(default = "default_workers")]
    pub workers: usize,
    /// "host:port" of a next-hop proxy; when set every request is relayed
    /// there instead of being serviced against its origin.
    #[serde(default)]
    pub chain: Option<String>,
}

impl Default for Proxy {
    fn default() -> Self {
        Self {
            workers: DEFAULT_WORKERS,
            chain: None,
        }
    }
}

impl Proxy {
    pub fn chain_target(&self) -> Result<Option<(String, u16)>> {
        let Some(raw) = self.chain.as_ref().filter(|v| !v.trim().is_empty()) else {
            return Ok(None);
        };
        let (host, port) = raw
            .rsplit_once(':')
            .ok_or_else(|| anyhow!("proxy.chain must be host:port, got {raw:?}"))?;
        let port: u16 = port
            .parse()
            .with_context(|| format!("bad proxy.chain port in {raw:?}"))?;
        if host.is_empty() {
            return Err(anyhow!("proxy.chain must be host:port, got {raw:?}"));
        }
        Ok(Some((host.to_string(), port)))
    }
}

#[derive(Debug, Deserialize, Default)]
pub struct Cache {
    /// Overrides the header-derived entry lifetime when set.
    #[serde(default, with = "humantime_serde")]
    pub max_age: Option<Duration>,
}

#[derive(Debug, Deserialize, Default)]
pub struct Blacklist {
    #[serde(default)]
    pub path: String,
}

fn default_workers() -> usize {
    DEFAULT_WORKERS
}

pub fn load(path: &Path) -> Result<(Bootstrap, Vec<String>)> {
    let raw =
        fs::read_to_string(path).with_context(|| format!("read config {}", path.display()))?;
    let mut ignored = Vec::new();
    let de = serde_yaml::Deserializer::from_str(&raw);
    let cfg: Bootstrap = serde_ignored::deserialize(de, |path| {
        ignored.push(path.to_string());
    })
    .with_context(|| format!("parse config {}", path.display()))?;

    Ok((cfg, ignored))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_fill_missing_sections() {
        let cfg: Bootstrap = serde_yaml::from_str("server:\n  addr: \"127.0.0.1:8080\"\n").unwrap();
        assert_eq!(cfg.proxy.workers, DEFAULT_WORKERS);
        assert!(cfg.proxy.chain.is_none());
        assert!(cfg.cache.max_age.is_none());
        assert!(cfg.blacklist.path.is_empty());
        cfg.validate().unwrap();
    }

    #[test]
    fn full_config_parses() {
        let raw = "\
server:
  addr: \"0.0.0.0:3128\"
  access_log:
    enabled: true
    path: logs/access.log
proxy:
  workers: 8
  chain: \"upstream.example.com:3128\"
cache:
  max_age: 10m
blacklist:
  path: blocked-domains.txt
";
        let cfg: Bootstrap = serde_yaml::from_str(raw).unwrap();
        assert_eq!(cfg.proxy.workers, 8);
        assert_eq!(
            cfg.proxy.chain_target().unwrap(),
            Some(("upstream.example.com".to_string(), 3128))
        );
        assert_eq!(cfg.cache.max_age, Some(Duration::from_secs(600)));
        assert_eq!(cfg.blacklist.path, "blocked-domains.txt");
        cfg.validate().unwrap();
    }

    #[test]
    fn validate_rejects_bad_values() {
        let cfg: Bootstrap = serde_yaml::from_str("server:\n  addr: \"\"\n").unwrap();
        assert!(cfg.validate().is_err());

        let cfg: Bootstrap =
            serde_yaml::from_str("server:\n  addr: \"127.0.0.1:1\"\nproxy:\n  workers: 0\n")
                .unwrap();
        assert!(cfg.validate().is_err());

        let cfg: Bootstrap =
            serde_yaml::from_str("server:\n  addr: \"127.0.0.1:1\"\nproxy:\n  chain: \"nocolon\"\n")
                .unwrap();
        assert!(cfg.validate().is_err());
    }
}
