use anyhow::{bail, Result};
use std::collections::HashSet;

use super::Config;

/// 配置验证器 - 负责所有配置验证逻辑
pub struct ConfigValidator;

impl ConfigValidator {
    /// 验证整份配置
    pub fn validate(cfg: &Config) -> Result<()> {
        Self::validate_version(&cfg.version)?;

        let mut backend_names = HashSet::new();
        for b in &cfg.backends {
            if b.name.trim().is_empty() {
                bail!("backend must have a name");
            }
            if !backend_names.insert(b.name.as_str()) {
                bail!("duplicate backend name: {}", b.name);
            }
        }

        for l in &cfg.listeners {
            if l.name.trim().is_empty() {
                bail!("listener must have a name");
            }
            if l.bind.trim().is_empty() {
                bail!("listener {} must have a bind address", l.name);
            }
            if !l.default_backend.is_empty() && !backend_names.contains(l.default_backend.as_str())
            {
                bail!(
                    "listener {} references unknown backend: {}",
                    l.name,
                    l.default_backend
                );
            }
        }

        Ok(())
    }

    /// 验证配置版本
    pub fn validate_version(version: &str) -> Result<()> {
        if version != "2" {
            bail!("unsupported version: {} (expected '2')", version);
        }
        Ok(())
    }
}
