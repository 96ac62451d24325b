// ============================================================================
// Rate Limit Configuration
// ============================================================================

use anyhow::{anyhow, bail, Context, Result};
use std::str::FromStr;

use crate::constants::{
    DEFAULT_GLOBAL_TPS, DEFAULT_MNO_TPS, DEFAULT_MNO_TPS_LIMITS, DEFAULT_RATE_WINDOW_MS,
};

/// Which scope the consumer throttles on. Chosen once per process.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
pub enum RateLimitStrategy {
    /// One counter per operator, each with its own ceiling
    #[default]
    PerOperator,
    /// One counter shared by all traffic
    Global,
}

impl FromStr for RateLimitStrategy {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().replace('-', "_").as_str() {
            "per_operator" | "per_mno" | "mno" => Ok(Self::PerOperator),
            "global" => Ok(Self::Global),
            other => Err(anyhow!("unknown rate limit strategy: {}", other)),
        }
    }
}

#[derive(Clone, Debug)]
pub struct RateLimitConfig {
    pub strategy: RateLimitStrategy,
    pub global_tps: u32,
    /// (operator, ceiling) pairs in configuration order
    pub mno_limits: Vec<(String, u32)>,
    /// Ceiling for an operator missing from `mno_limits`
    pub default_mno_tps: u32,
    pub window_ms: u64,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            strategy: RateLimitStrategy::PerOperator,
            global_tps: DEFAULT_GLOBAL_TPS,
            mno_limits: parse_mno_limits(DEFAULT_MNO_TPS_LIMITS).unwrap_or_default(),
            default_mno_tps: DEFAULT_MNO_TPS,
            window_ms: DEFAULT_RATE_WINDOW_MS,
        }
    }
}

impl RateLimitConfig {
    pub(crate) fn from_env() -> Result<Self> {
        let strategy = match std::env::var("RATE_LIMIT_STRATEGY") {
            Ok(raw) => raw.parse()?,
            Err(_) => RateLimitStrategy::default(),
        };

        let mno_limits = parse_mno_limits(
            &std::env::var("MNO_TPS_LIMITS").unwrap_or_else(|_| DEFAULT_MNO_TPS_LIMITS.to_string()),
        )
        .context("Invalid MNO_TPS_LIMITS")?;

        let window_ms = std::env::var("RATE_LIMIT_WINDOW_MS")
            .unwrap_or_else(|_| DEFAULT_RATE_WINDOW_MS.to_string())
            .parse()
            .unwrap_or(DEFAULT_RATE_WINDOW_MS);
        if window_ms == 0 {
            bail!("RATE_LIMIT_WINDOW_MS must be greater than zero");
        }

        Ok(Self {
            strategy,
            global_tps: std::env::var("GLOBAL_TPS")
                .unwrap_or_else(|_| DEFAULT_GLOBAL_TPS.to_string())
                .parse()
                .unwrap_or(DEFAULT_GLOBAL_TPS),
            mno_limits,
            default_mno_tps: std::env::var("DEFAULT_MNO_TPS")
                .unwrap_or_else(|_| DEFAULT_MNO_TPS.to_string())
                .parse()
                .unwrap_or(DEFAULT_MNO_TPS),
            window_ms,
        })
    }
}

/// Parse `"GP=450,Robi=400"` into ordered pairs.
pub fn parse_mno_limits(raw: &str) -> Result<Vec<(String, u32)>> {
    raw.split(',')
        .map(str::trim)
        .filter(|entry| !entry.is_empty())
        .map(|entry| {
            let (name, tps) = entry
                .split_once('=')
                .ok_or_else(|| anyhow!("expected NAME=TPS, got {:?}", entry))?;
            let tps = tps
                .trim()
                .parse::<u32>()
                .with_context(|| format!("invalid TPS for {}", name.trim()))?;
            Ok((name.trim().to_string(), tps))
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_mno_limits() {
        let limits = parse_mno_limits("GP=450, Robi=400 ,Airtel=180").unwrap();
        assert_eq!(
            limits,
            vec![
                ("GP".to_string(), 450),
                ("Robi".to_string(), 400),
                ("Airtel".to_string(), 180)
            ]
        );
    }

    #[test]
    fn test_parse_mno_limits_rejects_garbage() {
        assert!(parse_mno_limits("GP").is_err());
        assert!(parse_mno_limits("GP=fast").is_err());
    }

    #[test]
    fn test_strategy_from_str() {
        assert_eq!(
            "per-operator".parse::<RateLimitStrategy>().unwrap(),
            RateLimitStrategy::PerOperator
        );
        assert_eq!(
            "GLOBAL".parse::<RateLimitStrategy>().unwrap(),
            RateLimitStrategy::Global
        );
        assert!("leaky_bucket".parse::<RateLimitStrategy>().is_err());
    }
}
