//! moustique_utils
//!
//! Cross-cutting helpers shared by the broker, transport and binary crates:
//! tracing setup and per-tenant log files, the wire obfuscation codec, and
//! epoch/"nice datetime" time handling.

pub mod codec;
pub mod logging;
pub mod time;

#[cfg(test)]
mod tests {
    use super::logging;

    #[test]
    fn logging_init_accepts_levels() {
        // Should not panic, and repeated calls must be tolerated.
        logging::init("info", None);
        logging::init("debug", None);
        logging::init("warn", None);
    }

    #[test]
    fn user_log_appends_timestamped_lines() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("user.log");

        let log = logging::UserLog::open(&path, "alice").unwrap();
        log.log("Broker initialized");
        log.log("Client c1 subscribed to /a/+");

        let content = std::fs::read_to_string(&path).unwrap();
        let lines: Vec<&str> = content.lines().collect();
        assert_eq!(lines.len(), 2);
        assert!(lines[0].contains("[alice]"));
        assert!(lines[0].contains("Broker initialized"));
        assert!(lines[1].contains("Client c1 subscribed to /a/+"));
    }
}
