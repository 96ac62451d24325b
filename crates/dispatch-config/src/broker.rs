// ============================================================================
// Broker Configuration
// ============================================================================

use anyhow::{bail, Result};

use crate::constants::{
    DEFAULT_MANAGEMENT_URL, DEFAULT_PREFETCH_COUNT, DEFAULT_QUEUE_NAME,
    DEFAULT_RECONNECT_DELAY_SECS,
};

/// RabbitMQ cluster configuration
#[derive(Clone, Debug)]
pub struct BrokerConfig {
    /// Ordered node list; the first node that accepts a connection wins
    pub urls: Vec<String>,
    /// Queue consumed by the worker and targeted by the load generator
    pub queue: String,
    /// Unacknowledged deliveries the broker may push per consumer
    pub prefetch_count: u16,
    /// Fixed delay between reconnect cycles
    pub reconnect_delay_secs: u64,
    /// Base URL of the management plugin (e.g. "http://rabbit1:15672")
    pub management_url: String,
    pub management_user: String,
    pub management_password: String,
}

impl BrokerConfig {
    pub(crate) fn from_env() -> Result<Self> {
        let urls = parse_url_list(&std::env::var("RABBITMQ_URLS").unwrap_or_default());
        if urls.is_empty() {
            bail!("RABBITMQ_URLS must list at least one broker node");
        }

        Ok(Self {
            urls,
            queue: std::env::var("RABBITMQ_QUEUE")
                .unwrap_or_else(|_| DEFAULT_QUEUE_NAME.to_string()),
            prefetch_count: std::env::var("RABBITMQ_PREFETCH")
                .unwrap_or_else(|_| DEFAULT_PREFETCH_COUNT.to_string())
                .parse()
                .unwrap_or(DEFAULT_PREFETCH_COUNT),
            reconnect_delay_secs: std::env::var("RABBITMQ_RECONNECT_DELAY_SECS")
                .unwrap_or_else(|_| DEFAULT_RECONNECT_DELAY_SECS.to_string())
                .parse()
                .unwrap_or(DEFAULT_RECONNECT_DELAY_SECS),
            management_url: std::env::var("RABBITMQ_MANAGEMENT_URL")
                .unwrap_or_else(|_| DEFAULT_MANAGEMENT_URL.to_string()),
            management_user: std::env::var("RABBITMQ_MANAGEMENT_USER")
                .unwrap_or_else(|_| "guest".to_string()),
            management_password: std::env::var("RABBITMQ_MANAGEMENT_PASSWORD")
                .unwrap_or_else(|_| "guest".to_string()),
        })
    }
}

/// Split a comma-separated node list, dropping blanks and keeping order.
pub fn parse_url_list(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_url_list_keeps_order() {
        let urls = parse_url_list(" amqp://a:5672 , ,amqp://b:5672,amqp://c:5672");
        assert_eq!(urls, vec!["amqp://a:5672", "amqp://b:5672", "amqp://c:5672"]);
    }

    #[test]
    fn test_parse_url_list_empty() {
        assert!(parse_url_list("").is_empty());
        assert!(parse_url_list(" , ").is_empty());
    }
}
