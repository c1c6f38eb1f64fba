//! Establishes the master/slave `mysql::Conn` pair for a shard, reading
//! connection parameters out of the ambient `Config`.

use mysql::{Conn, OptsBuilder};

use crate::config::Config;
use crate::error::Result;

/// Connection parameters shared by every shard, read once at daemon start.
pub struct ConnectionSpec {
    pub master_host: String,
    pub master_port: u16,
    pub slave_host: String,
    pub slave_port: u16,
    pub username: String,
    pub password: String,
    pub schema: String,
    pub use_ssl: bool,
    pub charset: String,
}

impl ConnectionSpec {
    pub fn from_config(config: &Config) -> Self {
        Self {
            master_host: config.get_str("mysql_server_addr", "localhost"),
            master_port: config.get_i64("mysql_server_port", 3306) as u16,
            slave_host: config.get_str("mysql_slave_addr", ""),
            slave_port: config.get_i64("mysql_slave_port", 3306) as u16,
            username: config.get_str("mysql_username", "root"),
            password: config.get_str("mysql_password", ""),
            schema: config.get_str("mysql_schema", ""),
            use_ssl: config.get_bool("mysql_use_ssl", false),
            charset: config.get_str("mysql_charset", "utf8"),
        }
    }

    /// Whether a dedicated slave address was configured; if not, the slave
    /// connection reuses the master's.
    pub fn has_dedicated_slave(&self) -> bool {
        !self.slave_host.is_empty()
    }

    fn opts(&self, host: &str, port: u16) -> OptsBuilder {
        if self.use_ssl {
            log::warn!("mysql_use_ssl is set but this build was compiled without TLS support; connecting in plaintext");
        }
        OptsBuilder::default()
            .ip_or_hostname(Some(host.to_owned()))
            .tcp_port(port)
            .user(Some(self.username.clone()))
            .pass(Some(self.password.clone()))
            .db_name(if self.schema.is_empty() {
                None
            } else {
                Some(self.schema.clone())
            })
            .init(vec![format!("SET NAMES {}", self.charset)])
    }

    pub fn connect_master(&self) -> Result<Conn> {
        Conn::new(self.opts(&self.master_host, self.master_port)).map_err(Into::into)
    }

    pub fn connect_slave(&self) -> Result<Conn> {
        if self.has_dedicated_slave() {
            Conn::new(self.opts(&self.slave_host, self.slave_port)).map_err(Into::into)
        } else {
            self.connect_master()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn slave_falls_back_to_master_address_when_unset() {
        let cfg = Config::from_pairs([("mysql_server_addr", "db1"), ("mysql_server_port", "3307")]);
        let spec = ConnectionSpec::from_config(&cfg);
        assert!(!spec.has_dedicated_slave());
        assert_eq!(spec.slave_host, "");
    }

    #[test]
    fn dedicated_slave_is_recognized() {
        let cfg = Config::from_pairs([("mysql_slave_addr", "db2")]);
        let spec = ConnectionSpec::from_config(&cfg);
        assert!(spec.has_dedicated_slave());
    }

    #[test]
    fn charset_defaults_to_utf8_and_is_overridable() {
        let cfg = Config::from_pairs(Vec::<(&str, &str)>::new());
        assert_eq!(ConnectionSpec::from_config(&cfg).charset, "utf8");

        let cfg = Config::from_pairs([("mysql_charset", "utf8mb4")]);
        assert_eq!(ConnectionSpec::from_config(&cfg).charset, "utf8mb4");
    }
}
