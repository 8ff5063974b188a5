//! MySQL connection configuration.
//!
//! Connection parameters are fixed once the `Connection` is built; use the
//! consuming builder methods to fill them in.

use crate::protocol::capabilities::{
    CLIENT_CONNECT_WITH_DB, CLIENT_PLUGIN_AUTH, DEFAULT_CLIENT_FLAGS,
};
use crate::protocol::{MAX_PACKET_SIZE, charset};

/// MySQL connection configuration.
#[derive(Debug, Clone)]
pub struct Config {
    /// Hostname or IP address
    pub host: String,
    /// Port number (default: 3306)
    pub port: u16,
    /// Username for authentication
    pub user: String,
    /// Password for authentication
    pub password: Option<String>,
    /// Database to select during the handshake
    pub database: Option<String>,
    /// Character set name (default: utf8mb4)
    pub charset_name: String,
    /// Collation name (default: utf8mb4_general_ci)
    pub collation: String,
    /// Collation id sent in the handshake response (default: 45)
    pub bin_charset: u8,
    /// Max packet size announced to the server (default: 16MB - 1)
    pub max_packet_size: u32,
    /// Ask for CLIENT_PLUGIN_AUTH during the handshake
    pub plugin_auth: bool,
}

impl Default for Config {
    #[allow(clippy::cast_possible_truncation)]
    fn default() -> Self {
        Self {
            host: "localhost".to_string(),
            port: 3306,
            user: String::new(),
            password: None,
            database: None,
            charset_name: "utf8mb4".to_string(),
            collation: "utf8mb4_general_ci".to_string(),
            bin_charset: charset::DEFAULT_CHARSET,
            max_packet_size: MAX_PACKET_SIZE as u32,
            plugin_auth: false,
        }
    }
}

impl Config {
    /// Create a new configuration with default values.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the hostname.
    pub fn host(mut self, host: impl Into<String>) -> Self {
        self.host = host.into();
        self
    }

    /// Set the port.
    pub fn port(mut self, port: u16) -> Self {
        self.port = port;
        self
    }

    /// Set the username.
    pub fn user(mut self, user: impl Into<String>) -> Self {
        self.user = user.into();
        self
    }

    /// Set the password.
    pub fn password(mut self, password: impl Into<String>) -> Self {
        self.password = Some(password.into());
        self
    }

    /// Set the database.
    pub fn database(mut self, database: impl Into<String>) -> Self {
        self.database = Some(database.into());
        self
    }

    /// Set the character set name and matching collation id.
    pub fn charset(mut self, name: impl Into<String>, bin_charset: u8) -> Self {
        self.charset_name = name.into();
        self.bin_charset = bin_charset;
        self
    }

    /// Set the collation name.
    pub fn collation(mut self, collation: impl Into<String>) -> Self {
        self.collation = collation.into();
        self
    }

    /// Set the max packet size sent in the handshake response.
    pub fn max_packet_size(mut self, size: u32) -> Self {
        self.max_packet_size = size;
        self
    }

    /// Request plugin-based authentication.
    ///
    /// When the server also supports it, the auth method it names in the
    /// greeting decides how the password is hashed.
    pub fn plugin_auth(mut self, enabled: bool) -> Self {
        self.plugin_auth = enabled;
        self
    }

    /// Get the socket address string for connection.
    ///
    /// IPv6 literals are bracketed so the port stays unambiguous.
    pub fn socket_addr(&self) -> String {
        if self.host.contains(':') && !self.host.starts_with('[') {
            format!("[{}]:{}", self.host, self.port)
        } else {
            format!("{}:{}", self.host, self.port)
        }
    }

    /// Capability flags this client asks the server for.
    pub fn capability_flags(&self) -> u32 {
        let mut flags = DEFAULT_CLIENT_FLAGS;

        if self.database.is_some() {
            flags |= CLIENT_CONNECT_WITH_DB;
        }

        if self.plugin_auth {
            flags |= CLIENT_PLUGIN_AUTH;
        }

        flags
    }
}
