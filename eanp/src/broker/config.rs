//! Configuration structures for broker behavior.

/// Configuration for a broker and the channels it owns.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct BrokerConfig {
    /// Name used in log output
    pub name: String,

    /// Maximum number of channels a server broker keeps at once.
    /// None means unlimited; extra inbound channels are closed right away.
    pub max_channels: Option<usize>,

    /// Maximum number of outgoing queries outstanding per channel.
    /// None means unlimited
    pub max_pending_queries: Option<usize>,
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            name: "broker".to_string(),
            max_channels: None,
            max_pending_queries: None,
        }
    }
}

impl BrokerConfig {
    /// Create a new configuration with specified parameters.
    pub fn new(
        name: impl Into<String>,
        max_channels: Option<usize>,
        max_pending_queries: Option<usize>,
    ) -> Self {
        Self {
            name: name.into(),
            max_channels,
            max_pending_queries,
        }
    }

    /// Set the log name.
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    /// Limit the number of channels a server broker accepts.
    pub fn with_max_channels(mut self, max_channels: usize) -> Self {
        self.max_channels = Some(max_channels);
        self
    }

    /// Limit the number of outstanding outgoing queries per channel.
    pub fn with_max_pending_queries(mut self, max_pending_queries: usize) -> Self {
        self.max_pending_queries = Some(max_pending_queries);
        self
    }

    /// Configuration for a client broker driving commands one at a time.
    pub fn client() -> Self {
        Self {
            name: "client".to_string(),
            max_channels: Some(1),
            max_pending_queries: Some(1),
        }
    }

    /// Configuration for a server broker answering any number of peers.
    pub fn server() -> Self {
        Self {
            name: "server".to_string(),
            max_channels: None,
            max_pending_queries: None,
        }
    }
}
