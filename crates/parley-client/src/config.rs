use std::time::Duration;

#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// Gateway endpoint, e.g. `wss://chat.example.com/gateway`.
    pub url: String,
    pub token: String,
    pub backoff: BackoffConfig,
}

impl ClientConfig {
    pub fn new(url: impl Into<String>, token: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            token: token.into(),
            backoff: BackoffConfig::default(),
        }
    }

    /// The token rides in the query string: browsers cannot set headers on an upgrade.
    pub fn gateway_url(&self) -> String {
        let sep = if self.url.contains('?') { '&' } else { '?' };
        format!("{}{}token={}", self.url, sep, self.token)
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BackoffConfig {
    pub initial: Duration,
    pub max: Duration,
    pub factor: u32,
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            initial: Duration::from_secs(1),
            max: Duration::from_secs(15),
            factor: 2,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn token_is_appended_to_the_query() {
        let config = ClientConfig::new("ws://localhost:3000/gateway", "abc");
        assert_eq!(config.gateway_url(), "ws://localhost:3000/gateway?token=abc");
        let config = ClientConfig::new("ws://h/gateway?v=2", "abc");
        assert_eq!(config.gateway_url(), "ws://h/gateway?v=2&token=abc");
    }
}
