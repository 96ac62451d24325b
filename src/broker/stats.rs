// ============================================================================
// Broker Statistics
// ============================================================================
//
// Read-only queries against the RabbitMQ management API:
//   GET {management}/api/queues  -> per-queue depth, rates, consumers
//   GET {management}/api/nodes   -> first node's resource usage
//
// Any non-200 answer or undecodable body fails the whole call. No retry.
//
// ============================================================================

use dispatch_error::StatisticsError;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::time::Duration;
use tracing::debug;

const REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct QueueStats {
    pub messages: u64,
    pub messages_ready: u64,
    pub messages_unacknowledged: u64,
    pub consumers: u64,
    pub publish_rate: f64,
    pub deliver_rate: f64,
    pub ack_rate: f64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct NodeStats {
    pub name: String,
    pub mem_used: u64,
    pub fd_used: u64,
    pub fd_total: u64,
    pub disk_free: u64,
    /// Open client connections; older API versions only report `sockets_used`
    pub connections: u64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct Statistics {
    pub queues: BTreeMap<String, QueueStats>,
    /// `None` when the cluster reports no nodes
    pub node: Option<NodeStats>,
}

// Wire shapes; every field is optional in the management API output

#[derive(Debug, Deserialize)]
struct ApiQueue {
    name: String,
    #[serde(default)]
    messages: u64,
    #[serde(default)]
    messages_ready: u64,
    #[serde(default)]
    messages_unacknowledged: u64,
    #[serde(default)]
    consumers: u64,
    #[serde(default)]
    message_stats: Option<ApiMessageStats>,
}

#[derive(Debug, Default, Deserialize)]
struct ApiMessageStats {
    publish_details: Option<ApiRate>,
    deliver_details: Option<ApiRate>,
    ack_details: Option<ApiRate>,
}

#[derive(Debug, Deserialize)]
struct ApiRate {
    #[serde(default)]
    rate: f64,
}

#[derive(Debug, Deserialize)]
struct ApiNode {
    #[serde(default)]
    name: String,
    #[serde(default)]
    mem_used: u64,
    #[serde(default)]
    fd_used: u64,
    #[serde(default)]
    fd_total: u64,
    #[serde(default)]
    disk_free: u64,
    #[serde(default)]
    connections: Option<u64>,
    #[serde(default)]
    sockets_used: Option<u64>,
}

impl From<ApiQueue> for QueueStats {
    fn from(q: ApiQueue) -> Self {
        let stats = q.message_stats.unwrap_or_default();
        let rate = |r: Option<ApiRate>| r.map_or(0.0, |r| r.rate);
        Self {
            messages: q.messages,
            messages_ready: q.messages_ready,
            messages_unacknowledged: q.messages_unacknowledged,
            consumers: q.consumers,
            publish_rate: rate(stats.publish_details),
            deliver_rate: rate(stats.deliver_details),
            ack_rate: rate(stats.ack_details),
        }
    }
}

impl From<ApiNode> for NodeStats {
    fn from(n: ApiNode) -> Self {
        Self {
            name: n.name,
            mem_used: n.mem_used,
            fd_used: n.fd_used,
            fd_total: n.fd_total,
            disk_free: n.disk_free,
            connections: n.connections.or(n.sockets_used).unwrap_or(0),
        }
    }
}

pub struct StatisticsCollector {
    client: reqwest::Client,
    base_url: String,
    username: String,
    password: String,
}

impl StatisticsCollector {
    pub fn new(
        base_url: impl Into<String>,
        username: impl Into<String>,
        password: impl Into<String>,
    ) -> Result<Self, StatisticsError> {
        let base_url = base_url.into().trim_end_matches('/').to_string();
        let client = reqwest::Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()
            .map_err(|e| StatisticsError::Transport {
                endpoint: base_url.clone(),
                reason: e.to_string(),
            })?;

        Ok(Self {
            client,
            base_url,
            username: username.into(),
            password: password.into(),
        })
    }

    pub async fn fetch_statistics(&self) -> Result<Statistics, StatisticsError> {
        let queues: Vec<ApiQueue> = self.get_json("/api/queues").await?;
        let nodes: Vec<ApiNode> = self.get_json("/api/nodes").await?;

        debug!(queues = queues.len(), nodes = nodes.len(), "Fetched broker statistics");
        Ok(Statistics {
            queues: queues.into_iter().map(|q| (q.name.clone(), q.into())).collect(),
            node: nodes.into_iter().next().map(NodeStats::from),
        })
    }

    async fn get_json<T: serde::de::DeserializeOwned>(&self, path: &str) -> Result<T, StatisticsError> {
        let endpoint = format!("{}{}", self.base_url, path);

        let response = self
            .client
            .get(&endpoint)
            .basic_auth(&self.username, Some(&self.password))
            .send()
            .await
            .map_err(|e| StatisticsError::Transport {
                endpoint: endpoint.clone(),
                reason: e.to_string(),
            })?;

        if response.status() != reqwest::StatusCode::OK {
            return Err(StatisticsError::Status {
                endpoint,
                status: response.status().as_u16(),
            });
        }

        let body = response.bytes().await.map_err(|e| StatisticsError::Transport {
            endpoint: endpoint.clone(),
            reason: e.to_string(),
        })?;
        serde_json::from_slice(&body).map_err(|e| StatisticsError::Decode {
            endpoint,
            reason: e.to_string(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_queue_stats_from_api_json() {
        let raw = r#"[{
            "name": "general",
            "messages": 12,
            "messages_ready": 10,
            "messages_unacknowledged": 2,
            "consumers": 3,
            "message_stats": {
                "publish_details": {"rate": 120.5},
                "ack_details": {"rate": 99.0}
            }
        }, {"name": "otp"}]"#;

        let queues: Vec<ApiQueue> = serde_json::from_str(raw).unwrap();
        let stats: Vec<QueueStats> = queues.into_iter().map(QueueStats::from).collect();

        assert_eq!(stats[0].messages, 12);
        assert_eq!(stats[0].messages_unacknowledged, 2);
        assert_eq!(stats[0].publish_rate, 120.5);
        assert_eq!(stats[0].deliver_rate, 0.0);
        assert_eq!(stats[0].ack_rate, 99.0);
        assert_eq!(stats[1], QueueStats::default());
    }

    #[test]
    fn test_node_stats_from_api_json() {
        let raw = r#"[{"name":"rabbit@n1","mem_used":1048576,"fd_used":40,"fd_total":1024,
                       "disk_free":5000000,"sockets_used":12,"uptime":1}]"#;
        let nodes: Vec<ApiNode> = serde_json::from_str(raw).unwrap();
        let node = NodeStats::from(nodes.into_iter().next().unwrap());

        assert_eq!(node.name, "rabbit@n1");
        assert_eq!(node.fd_total, 1024);
        assert_eq!(node.connections, 12);
    }

    #[tokio::test]
    async fn test_unreachable_management_api_is_an_error() {
        let collector = StatisticsCollector::new("http://127.0.0.1:9", "guest", "guest").unwrap();
        assert!(matches!(
            collector.fetch_statistics().await,
            Err(StatisticsError::Transport { .. })
        ));
    }
}
