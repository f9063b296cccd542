//! Server configuration: the knobs a test (or the CLI binary) can set when
//! building a `MockServer`.

use std::time::Duration;

use serde::Deserialize;

use crate::error::{Error, Result};

/// Configuration for a `MockServer`. Most library users build one inline
/// with the builder methods below, constructed directly in test code, but
/// the CLI binary additionally loads one from an optional TOML file.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// TCP port to listen on. `0` asks the OS for an ephemeral port.
    pub port: u16,
    /// Bind address host part.
    pub host: String,
    /// Optional Unix domain socket path, used instead of TCP when set.
    pub uds_path: Option<String>,
    /// Whether the server should pretend to speak TLS. The crate does not
    /// perform a real TLS handshake; this only affects what `uri()` and
    /// `ismaster`-style canned fields advertise.
    pub ssl: bool,
    /// Emit `tracing::debug!` for every request/reply body.
    pub verbose: bool,
    /// If set, advertised in `uri()` as `?replicaSet=<name>`. Affects only
    /// the advertised URI, never server behavior (see DESIGN.md).
    pub replica_set_name: Option<String>,
    /// How long a blocking `receives`/`got` call waits for a request.
    pub request_timeout: Duration,
    /// How long a request may sit at the head of the queue before a test
    /// is considered to have failed to reply to it.
    pub reply_timeout: Duration,
    /// If true, an `ismaster`/`isMaster` the test hasn't set up a matcher
    /// for is auto-answered with a minimal handshake document instead of
    /// blocking the connection.
    pub auto_ismaster: bool,
    pub min_wire_version: i32,
    pub max_wire_version: i32,
    /// Log filter spec read from a config file, lowest-precedence in the
    /// CLI binary's log-level chain (CLI flag > `RUST_LOG` > this > `"info"`).
    pub log_level: Option<String>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            port: 0,
            host: "127.0.0.1".to_string(),
            uds_path: None,
            ssl: false,
            verbose: false,
            replica_set_name: None,
            request_timeout: Duration::from_secs(10),
            reply_timeout: Duration::from_secs(10),
            auto_ismaster: false,
            min_wire_version: 0,
            max_wire_version: 17,
            log_level: None,
        }
    }
}

impl ServerConfig {
    pub fn with_port(mut self, port: u16) -> Self {
        self.port = port;
        self
    }

    pub fn with_host(mut self, host: impl Into<String>) -> Self {
        self.host = host.into();
        self
    }

    pub fn with_uds_path(mut self, path: impl Into<String>) -> Self {
        self.uds_path = Some(path.into());
        self
    }

    pub fn with_ssl(mut self, ssl: bool) -> Self {
        self.ssl = ssl;
        self
    }

    pub fn with_verbose(mut self, verbose: bool) -> Self {
        self.verbose = verbose;
        self
    }

    pub fn with_replica_set_name(mut self, name: impl Into<String>) -> Self {
        self.replica_set_name = Some(name.into());
        self
    }

    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }

    pub fn with_reply_timeout(mut self, timeout: Duration) -> Self {
        self.reply_timeout = timeout;
        self
    }

    pub fn with_auto_ismaster(mut self, auto: bool) -> Self {
        self.auto_ismaster = auto;
        self
    }

    /// Load configuration from a TOML file, falling back to defaults when
    /// `path_opt` is `None` or the file is missing.
    pub fn load_from_file(path_opt: Option<&str>) -> Result<Self> {
        let Some(path) = path_opt else {
            return Ok(Self::default());
        };
        match std::fs::read_to_string(path) {
            Ok(contents) => toml::from_str(&contents)
                .map_err(|e| Error::BadSpec(format!("failed to parse {path}: {e}"))),
            Err(_) => Ok(Self::default()),
        }
    }

    /// Apply CLI/env overrides (highest precedence) to an existing config.
    pub fn with_overrides(
        mut self,
        port: Option<u16>,
        verbose: Option<bool>,
        replica_set_name: Option<String>,
    ) -> Self {
        if let Some(port) = port {
            self.port = port;
        }
        if let Some(verbose) = verbose {
            self.verbose = verbose;
        }
        if let Some(name) = replica_set_name {
            self.replica_set_name = Some(name);
        }
        self
    }

    /// Compose the `mongodb://` URI a driver under test should connect
    /// with, honoring `replica_set_name` and `uds_path`/TCP selection.
    pub fn uri(&self, actual_port: u16) -> String {
        let address = match &self.uds_path {
            Some(path) => path.clone(),
            None => format!("{}:{}", self.host, actual_port),
        };
        let mut uri = format!("mongodb://{address}");
        let mut params = Vec::new();
        if let Some(rs) = &self.replica_set_name {
            params.push(format!("replicaSet={rs}"));
        }
        if self.ssl {
            params.push("ssl=true".to_string());
        }
        if !params.is_empty() {
            uri.push('?');
            uri.push_str(&params.join("&"));
        }
        uri
    }

    /// Reject a configuration that can't be used to bind a listener.
    pub fn validate(&self) -> Result<()> {
        if self.host.is_empty() {
            return Err(Error::BadSpec("host cannot be empty".to_string()));
        }
        if self.min_wire_version > self.max_wire_version {
            return Err(Error::BadSpec(format!(
                "min_wire_version ({}) must be <= max_wire_version ({})",
                self.min_wire_version, self.max_wire_version
            )));
        }
        if let Some(path) = &self.uds_path {
            if path.is_empty() {
                return Err(Error::BadSpec("uds_path cannot be empty".to_string()));
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn uri_includes_replica_set_param() {
        let cfg = ServerConfig::default().with_replica_set_name("rs0");
        assert_eq!(cfg.uri(27017), "mongodb://127.0.0.1:27017?replicaSet=rs0");
    }

    #[test]
    fn uri_prefers_uds_path_over_tcp() {
        let cfg = ServerConfig::default().with_uds_path("/tmp/mockupdb.sock");
        assert_eq!(cfg.uri(27017), "mongodb:///tmp/mockupdb.sock");
    }

    #[test]
    fn validate_rejects_inverted_wire_version_range() {
        let mut cfg = ServerConfig::default();
        cfg.min_wire_version = 10;
        cfg.max_wire_version = 2;
        assert!(cfg.validate().is_err());
    }
}
