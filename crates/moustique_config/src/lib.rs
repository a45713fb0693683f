pub mod settings;

#[cfg(test)]
mod tests;

use std::path::Path;

use config::{Config, ConfigError, Environment, File};

use crate::settings::PartialSettings;

pub use settings::{
    DatabaseSettings, LoggingSettings, SecuritySettings, ServerSettings, Settings,
};

/// Load settings from `path` (TOML, optional) layered under environment
/// variables, with hard-coded defaults filling every gap.
pub fn load_config(path: &Path) -> Result<Settings, ConfigError> {
    let builder = Config::builder()
        .add_source(File::from(path.to_path_buf()).required(false))
        .add_source(Environment::default().separator("_"));

    let config = builder.build()?;
    let partial: PartialSettings = config.try_deserialize()?;
    let default = Settings::default();

    Ok(Settings {
        server: ServerSettings {
            host: partial
                .server
                .as_ref()
                .and_then(|s| s.host.clone())
                .unwrap_or(default.server.host),
            port: partial
                .server
                .as_ref()
                .and_then(|s| s.port)
                .unwrap_or(default.server.port),
            timeout_secs: partial
                .server
                .as_ref()
                .and_then(|s| s.timeout_secs)
                .unwrap_or(default.server.timeout_secs),
            allow_public: partial
                .server
                .as_ref()
                .and_then(|s| s.allow_public)
                .unwrap_or(default.server.allow_public),
            max_connections: partial
                .server
                .as_ref()
                .and_then(|s| s.max_connections)
                .unwrap_or(default.server.max_connections),
        },
        database: DatabaseSettings {
            path: partial
                .database
                .as_ref()
                .and_then(|d| d.path.clone())
                .unwrap_or(default.database.path),
        },
        logging: LoggingSettings {
            level: partial
                .logging
                .as_ref()
                .and_then(|l| l.level.clone())
                .unwrap_or(default.logging.level),
            file: partial.logging.as_ref().and_then(|l| l.file.clone()),
        },
        security: SecuritySettings {
            allowed_peers: partial
                .security
                .as_ref()
                .and_then(|s| s.allowed_peers.clone())
                .unwrap_or(default.security.allowed_peers),
            admin_password: partial
                .security
                .as_ref()
                .and_then(|s| s.admin_password.clone())
                .unwrap_or(default.security.admin_password),
        },
    })
}

/// Config file written by `--generate-config`.
const DEFAULT_CONFIG: &str = r#"# Moustique broker configuration.

[server]
host = "0.0.0.0"
port = 33334
timeout_secs = 5
# Serve requests without credentials from the shared anonymous broker.
allow_public = false
max_connections = 1000

[database]
# Root data directory; tenant state lives underneath it.
path = "./data"

[logging]
# error, warn, info, debug or trace
level = "info"
# file = "moustique.log"

[security]
# Peers allowed to talk to the broker: single IPs or CIDR blocks.
# Loopback and 192.168/16 are always allowed.
allowed_peers = ["172.16.0.0/12", "192.168.0.0/16"]
admin_password = "admin123"
"#;

/// Write a commented default configuration to `path`.
pub fn generate_default_config(path: &Path) -> std::io::Result<()> {
    std::fs::write(path, DEFAULT_CONFIG)
}
