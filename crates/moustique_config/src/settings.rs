use serde::Deserialize;

/// Top-level configuration for the broker process.
///
/// Aggregates the network settings for the HTTP server, the data directory
/// holding every tenant's state, logging, and access control.
#[derive(Debug, Deserialize, Clone)]
pub struct Settings {
    pub server: ServerSettings,
    pub database: DatabaseSettings,
    pub logging: LoggingSettings,
    pub security: SecuritySettings,
}

/// Network and admission settings for the HTTP server.
#[derive(Debug, Deserialize, Clone)]
pub struct ServerSettings {
    /// The host address (e.g. "127.0.0.1" or "0.0.0.0") the server binds to.
    pub host: String,
    /// The port the server listens on.
    pub port: u16,
    /// Overall per-request deadline, in seconds.
    pub timeout_secs: u64,
    /// Whether requests without credentials are served by the shared
    /// anonymous broker instead of being rejected.
    pub allow_public: bool,
    /// Admission cap for concurrently handled requests.
    pub max_connections: usize,
}

/// Storage settings.
#[derive(Debug, Deserialize, Clone)]
pub struct DatabaseSettings {
    /// Root data directory; tenant stores and logs live underneath it.
    pub path: String,
}

/// Logging settings.
#[derive(Debug, Deserialize, Clone)]
pub struct LoggingSettings {
    /// Log level: error, warn, info, debug or trace.
    pub level: String,
    /// Optional log file; stderr when unset.
    pub file: Option<String>,
}

/// Access-control settings.
#[derive(Debug, Deserialize, Clone)]
pub struct SecuritySettings {
    /// Peers allowed to talk to the broker: single IPs or CIDR blocks.
    /// Loopback and the local 192.168/16 network are always allowed.
    pub allowed_peers: Vec<String>,
    /// Password gating the ADMIN endpoints.
    pub admin_password: String,
}

/// Partial configuration as read from file or environment.
///
/// Every field is optional; missing values are filled from `Settings::default`.
#[derive(Debug, Deserialize)]
pub struct PartialSettings {
    pub server: Option<PartialServerSettings>,
    pub database: Option<PartialDatabaseSettings>,
    pub logging: Option<PartialLoggingSettings>,
    pub security: Option<PartialSecuritySettings>,
}

#[derive(Debug, Deserialize)]
pub struct PartialServerSettings {
    pub host: Option<String>,
    pub port: Option<u16>,
    pub timeout_secs: Option<u64>,
    pub allow_public: Option<bool>,
    pub max_connections: Option<usize>,
}

#[derive(Debug, Deserialize)]
pub struct PartialDatabaseSettings {
    pub path: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct PartialLoggingSettings {
    pub level: Option<String>,
    pub file: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct PartialSecuritySettings {
    pub allowed_peers: Option<Vec<String>>,
    pub admin_password: Option<String>,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            server: ServerSettings {
                host: "0.0.0.0".to_string(),
                port: 33334,
                timeout_secs: 5,
                allow_public: false,
                max_connections: 1000,
            },
            database: DatabaseSettings {
                path: "./data".to_string(),
            },
            logging: LoggingSettings {
                level: "info".to_string(),
                file: None,
            },
            security: SecuritySettings {
                allowed_peers: vec!["172.16.0.0/12".to_string(), "192.168.0.0/16".to_string()],
                admin_password: "admin123".to_string(),
            },
        }
    }
}
