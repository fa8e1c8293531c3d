//! Broker client configuration
//!
//! Describes how to reach the Kafka cluster and builds the rdkafka
//! `ClientConfig`s for the producer (output) and consumer (input) sides.

use rdkafka::config::ClientConfig;
use rdkafka::Offset;

use crate::relay::constants::{
    DEFAULT_AUTO_COMMIT_INTERVAL_MS, DEFAULT_BOOTSTRAP_SERVERS, DEFAULT_COMPRESSION,
    DEFAULT_LINGER_MS, DEFAULT_MTU,
};

/// Headroom added to the MTU for the key and protocol overhead
const MESSAGE_OVERHEAD_BYTES: usize = 512;

/// Key material for the TLS security mode
#[derive(Clone, PartialEq, Eq)]
pub struct TlsMaterial {
    pub ca_location: String,
    pub certificate_location: String,
    pub key_location: String,
    pub key_password: String,
}

impl std::fmt::Debug for TlsMaterial {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TlsMaterial")
            .field("ca_location", &self.ca_location)
            .field("certificate_location", &self.certificate_location)
            .field("key_location", &self.key_location)
            // REDACT the private key password to prevent log exposure
            .field("key_password", &"[REDACTED]")
            .finish()
    }
}

/// Transport security towards the brokers
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum SecurityMode {
    #[default]
    Plaintext,
    Tls(TlsMaterial),
}

impl SecurityMode {
    /// TLS when all four pieces of key material are given, plaintext otherwise
    pub fn from_parts(
        ca_location: Option<String>,
        certificate_location: Option<String>,
        key_location: Option<String>,
        key_password: Option<String>,
    ) -> Self {
        match (ca_location, certificate_location, key_location, key_password) {
            (Some(ca_location), Some(certificate_location), Some(key_location), Some(key_password)) => {
                SecurityMode::Tls(TlsMaterial {
                    ca_location,
                    certificate_location,
                    key_location,
                    key_password,
                })
            }
            _ => SecurityMode::Plaintext,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            SecurityMode::Plaintext => "plaintext",
            SecurityMode::Tls(_) => "ssl",
        }
    }

    fn apply(&self, client_config: &mut ClientConfig) {
        if let SecurityMode::Tls(tls) = self {
            client_config.set("security.protocol", "ssl");
            client_config.set("ssl.ca.location", &tls.ca_location);
            client_config.set("ssl.certificate.location", &tls.certificate_location);
            client_config.set("ssl.key.location", &tls.key_location);
            client_config.set("ssl.key.password", &tls.key_password);
        }
    }
}

/// What the consumer does when the group has no committed offset
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum OffsetReset {
    /// Start from the earliest retained message
    #[default]
    Earliest,
    /// Leave the decision to the stored offset (librdkafka default)
    Stored,
}

/// Where the input-topic consumer starts reading
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum StartOffset {
    /// From the beginning of the partition
    Beginning,
    /// From the group's stored offset
    #[default]
    Stored,
}

impl StartOffset {
    pub fn to_offset(self) -> Offset {
        match self {
            StartOffset::Beginning => Offset::Beginning,
            StartOffset::Stored => Offset::Stored,
        }
    }
}

/// Broker connection configuration
#[derive(Debug, Clone)]
pub struct BrokerConfig {
    /// Comma-separated bootstrap brokers (host or host:port)
    pub bootstrap_servers: String,
    /// Client id, also used as the consumer group id unless overridden
    pub client_id: String,
    /// Transport security
    pub security: SecurityMode,
    /// Producer compression codec
    pub compression: String,
    /// Producer batching delay in milliseconds
    pub linger_ms: u32,
    /// Consumer group id
    pub group_id: Option<String>,
    /// Consumer offset reset policy
    pub offset_reset: OffsetReset,
    /// Consumer start offset
    pub start_offset: StartOffset,
    /// Largest frame the producer must accept
    pub mtu: usize,
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            bootstrap_servers: DEFAULT_BOOTSTRAP_SERVERS.to_string(),
            client_id: env!("CARGO_PKG_NAME").to_string(),
            security: SecurityMode::default(),
            compression: DEFAULT_COMPRESSION.to_string(),
            linger_ms: DEFAULT_LINGER_MS,
            group_id: None,
            offset_reset: OffsetReset::default(),
            start_offset: StartOffset::default(),
            mtu: DEFAULT_MTU,
        }
    }
}

impl BrokerConfig {
    /// Create a configuration for the given bootstrap servers
    pub fn new(bootstrap_servers: &str) -> Self {
        Self {
            bootstrap_servers: bootstrap_servers.to_string(),
            ..Default::default()
        }
    }

    /// Set the transport security
    pub fn security(mut self, security: SecurityMode) -> Self {
        self.security = security;
        self
    }

    /// Set the consumer start offset
    pub fn start_offset(mut self, start_offset: StartOffset) -> Self {
        self.start_offset = start_offset;
        self
    }

    /// Set the client id
    pub fn client_id(mut self, client_id: &str) -> Self {
        self.client_id = client_id.to_string();
        self
    }

    /// Check if the brokers are configured
    pub fn is_configured(&self) -> bool {
        !self.bootstrap_servers.is_empty()
    }

    /// Effective consumer group id
    pub fn effective_group_id(&self) -> &str {
        self.group_id.as_deref().unwrap_or(&self.client_id)
    }

    /// rdkafka configuration for the producer side
    pub fn producer_config(&self) -> ClientConfig {
        let mut client_config = ClientConfig::new();

        client_config.set("bootstrap.servers", &self.bootstrap_servers);
        client_config.set("client.id", &self.client_id);
        client_config.set("compression.codec", &self.compression);
        client_config.set("socket.nagle.disable", "true");
        client_config.set("linger.ms", self.linger_ms.to_string());
        client_config.set(
            "message.max.bytes",
            (self.mtu + MESSAGE_OVERHEAD_BYTES).to_string(),
        );

        self.security.apply(&mut client_config);
        client_config
    }

    /// rdkafka configuration for the consumer side
    pub fn consumer_config(&self) -> ClientConfig {
        let mut client_config = ClientConfig::new();

        client_config.set("bootstrap.servers", &self.bootstrap_servers);
        client_config.set("client.id", &self.client_id);
        client_config.set("group.id", self.effective_group_id());
        client_config.set("socket.nagle.disable", "true");
        client_config.set("enable.auto.commit", "true");
        client_config.set(
            "auto.commit.interval.ms",
            DEFAULT_AUTO_COMMIT_INTERVAL_MS.to_string(),
        );
        client_config.set("enable.auto.offset.store", "true");
        client_config.set("enable.partition.eof", "true");
        client_config.set("check.crcs", "true");

        if self.offset_reset == OffsetReset::Earliest {
            client_config.set("auto.offset.reset", "earliest");
        }

        self.security.apply(&mut client_config);
        client_config
    }
}
