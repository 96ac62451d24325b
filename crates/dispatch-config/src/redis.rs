// ============================================================================
// Redis Configuration
// ============================================================================

/// Shared key-value store connection
#[derive(Clone, Debug)]
pub struct RedisConfig {
    pub url: String,
    /// Applied to the URL when it carries no credentials of its own
    pub password: Option<String>,
    pub key_prefixes: RedisKeyPrefixes,
}

/// Redis key prefixes configuration
#[derive(Clone, Debug)]
pub struct RedisKeyPrefixes {
    /// Idempotency lock: "lock:{msg_id}"
    pub lock: String,
    /// Fixed-window counters: "rate:{scope}:{window}"
    pub rate: String,
    /// Redelivery counters for the dead-letter guard: "retry_count:{id}"
    pub retry: String,
}

impl Default for RedisKeyPrefixes {
    fn default() -> Self {
        Self {
            lock: "lock:".to_string(),
            rate: "rate:".to_string(),
            retry: "retry_count:".to_string(),
        }
    }
}

impl RedisKeyPrefixes {
    pub(crate) fn from_env() -> Self {
        Self {
            lock: std::env::var("REDIS_KEY_PREFIX_LOCK").unwrap_or_else(|_| "lock:".to_string()),
            rate: std::env::var("REDIS_KEY_PREFIX_RATE").unwrap_or_else(|_| "rate:".to_string()),
            retry: std::env::var("REDIS_KEY_PREFIX_RETRY")
                .unwrap_or_else(|_| "retry_count:".to_string()),
        }
    }
}

impl RedisConfig {
    pub(crate) fn from_env() -> Self {
        Self {
            url: std::env::var("REDIS_URL").unwrap_or_else(|_| "redis://127.0.0.1:6379".to_string()),
            password: std::env::var("REDIS_PASSWORD").ok().filter(|p| !p.is_empty()),
            key_prefixes: RedisKeyPrefixes::from_env(),
        }
    }

    /// Connection URL with `password` spliced in when the URL has no userinfo.
    pub fn connection_url(&self) -> String {
        match &self.password {
            Some(password) if !self.url.contains('@') => match self.url.split_once("://") {
                Some((scheme, rest)) => format!("{}://:{}@{}", scheme, password, rest),
                None => self.url.clone(),
            },
            _ => self.url.clone(),
        }
    }
}
