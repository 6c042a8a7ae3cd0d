use serde::de::{Deserialize, Deserializer, Error};

use crate::address::NetLocation;

pub const DEFAULT_UDP_CONCURRENCY: usize = 100;

impl<'de> Deserialize<'de> for NetLocation {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        NetLocation::from_str(&s).map_err(D::Error::custom)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ServerMode {
    Echo,
    Proxy,
}

#[derive(Debug, Clone, serde::Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ServerTlsConfig {
    pub cert: String,
    pub key: String,
}

/// One resolved echo or proxy instance. The configuration layer (YAML here,
/// a directive parser elsewhere) is only a producer of these values; the
/// engine treats them as immutable after construction.
#[derive(Debug, Clone, serde::Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ServerConfig {
    pub mode: ServerMode,
    pub address: NetLocation,
    #[serde(default)]
    pub destination: Option<NetLocation>,
    #[serde(default)]
    pub tls: Option<ServerTlsConfig>,
    #[serde(default = "default_udp_concurrency")]
    pub udp_concurrency: usize,
}

fn default_udp_concurrency() -> usize {
    DEFAULT_UDP_CONCURRENCY
}

impl ServerConfig {
    pub fn validate(&self) -> std::io::Result<()> {
        match self.mode {
            ServerMode::Proxy => {
                if self.destination.is_none() {
                    return Err(std::io::Error::new(
                        std::io::ErrorKind::InvalidInput,
                        format!("proxy server at {} has no destination", self.address),
                    ));
                }
            }
            ServerMode::Echo => {
                if self.destination.is_some() {
                    return Err(std::io::Error::new(
                        std::io::ErrorKind::InvalidInput,
                        format!("echo server at {} cannot have a destination", self.address),
                    ));
                }
            }
        }
        if self.udp_concurrency == 0 {
            return Err(std::io::Error::new(
                std::io::ErrorKind::InvalidInput,
                "udp_concurrency must be at least 1",
            ));
        }
        Ok(())
    }
}

pub fn load_configs(config_str: &str) -> std::io::Result<Vec<ServerConfig>> {
    let configs: Vec<ServerConfig> = serde_yaml::from_str(config_str).map_err(|e| {
        std::io::Error::new(
            std::io::ErrorKind::InvalidData,
            format!("failed to parse config: {e}"),
        )
    })?;
    for config in configs.iter() {
        config.validate()?;
    }
    Ok(configs)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_echo() {
        let configs = load_configs(
            r#"
- mode: echo
  address: ":7000"
"#,
        )
        .unwrap();
        assert_eq!(configs.len(), 1);
        assert_eq!(configs[0].mode, ServerMode::Echo);
        assert_eq!(configs[0].address.port(), 7000);
        assert!(configs[0].destination.is_none());
        assert_eq!(configs[0].udp_concurrency, DEFAULT_UDP_CONCURRENCY);
    }

    #[test]
    fn test_parse_proxy() {
        let configs = load_configs(
            r#"
- mode: proxy
  address: "127.0.0.1:5000"
  destination: "upstream.internal:5001"
  udp_concurrency: 16
"#,
        )
        .unwrap();
        assert_eq!(configs[0].mode, ServerMode::Proxy);
        let destination = configs[0].destination.as_ref().unwrap();
        assert_eq!(destination.address().hostname(), Some("upstream.internal"));
        assert_eq!(configs[0].udp_concurrency, 16);
    }

    #[test]
    fn test_proxy_requires_destination() {
        assert!(load_configs(
            r#"
- mode: proxy
  address: ":5000"
"#,
        )
        .is_err());
    }

    #[test]
    fn test_echo_rejects_destination() {
        assert!(load_configs(
            r#"
- mode: echo
  address: ":5000"
  destination: "127.0.0.1:5001"
"#,
        )
        .is_err());
    }
}
