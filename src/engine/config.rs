use crate::error::InitProcessError;
use serde::{Deserialize, Serialize};
use std::net::Ipv4Addr;
use std::time::Duration;

// エンジンの調整可能な定数 (環境変数から読み込む)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    // このホスト宛てとして扱うアドレス
    pub local_addrs: Vec<Ipv4Addr>,
    // 参加しているマルチキャストグループ
    pub multicast_groups: Vec<Ipv4Addr>,
    pub forwarding_enabled: bool,
    pub default_ttl: u8,
    pub reassembly_timeout_secs: u64,
    // 同時リアセンブリエントリ数の明示的な上限
    // 超過時は最も古いエントリを追い出す
    pub max_reassembly_entries: usize,
}

impl EngineConfig {
    pub fn from_env() -> Result<Self, InitProcessError> {
        let local_addrs = std::env::var("IP_LOCAL_ADDRS")
            .unwrap_or_default()
            .split(',')
            .filter(|s| !s.trim().is_empty())
            .map(|s| {
                s.trim()
                    .parse::<Ipv4Addr>()
                    .map_err(|e| InitProcessError::EnvVarParseError(e.to_string()))
            })
            .collect::<Result<Vec<_>, _>>()?;

        let multicast_groups = std::env::var("IP_MULTICAST_GROUPS")
            .unwrap_or_default()
            .split(',')
            .filter(|s| !s.trim().is_empty())
            .map(|s| {
                s.trim()
                    .parse::<Ipv4Addr>()
                    .map_err(|e| InitProcessError::EnvVarParseError(e.to_string()))
            })
            .collect::<Result<Vec<_>, _>>()?;

        Ok(Self {
            local_addrs,
            multicast_groups,
            forwarding_enabled: std::env::var("IP_FORWARDING")
                .map(|v| v == "1" || v.eq_ignore_ascii_case("true"))
                .unwrap_or(true),
            default_ttl: std::env::var("IP_DEFAULT_TTL")
                .unwrap_or_else(|_| "64".to_string())
                .parse()
                .map_err(|e: std::num::ParseIntError| {
                    InitProcessError::EnvVarParseError(e.to_string())
                })?,
            reassembly_timeout_secs: std::env::var("IP_REASSEMBLY_TIMEOUT_SECS")
                .unwrap_or_else(|_| "30".to_string())
                .parse()
                .map_err(|e: std::num::ParseIntError| {
                    InitProcessError::EnvVarParseError(e.to_string())
                })?,
            max_reassembly_entries: std::env::var("IP_MAX_REASSEMBLY_ENTRIES")
                .unwrap_or_else(|_| "256".to_string())
                .parse()
                .map_err(|e: std::num::ParseIntError| {
                    InitProcessError::EnvVarParseError(e.to_string())
                })?,
        })
    }

    pub fn reassembly_timeout(&self) -> Duration {
        Duration::from_secs(self.reassembly_timeout_secs)
    }

    #[cfg(test)]
    pub fn for_testing() -> Self {
        Self {
            local_addrs: vec![Ipv4Addr::new(10, 0, 0, 1)],
            multicast_groups: vec![Ipv4Addr::new(224, 0, 1, 1)],
            forwarding_enabled: true,
            default_ttl: 64,
            reassembly_timeout_secs: 30,
            max_reassembly_entries: 256,
        }
    }
}
