//! Tunnel parameters pushed by the gateway
//!
//! The gateway answers the parameter request with ASCII text of
//! space-separated `key,value[,value]` fields:
//!
//! | key | meaning       | values            |
//! |-----|---------------|-------------------|
//! | `m` | MTU           | integer           |
//! | `a` | address       | ip, prefix length |
//! | `r` | route         | ip, prefix length |
//! | `d` | DNS server    | ip                |
//! | `s` | search domain | name              |
//!
//! Unknown keys are skipped so newer gateways can add fields.

use crate::error::{Result, VpnError};
use ipnet::IpNet;
use std::fmt;
use std::net::IpAddr;
use std::str::FromStr;

/// MTU used when the gateway does not push one
pub const DEFAULT_MTU: u16 = 1500;

/// Interface configuration negotiated for one session
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TunnelConfig {
    pub mtu: u16,
    pub addresses: Vec<IpNet>,
    pub routes: Vec<IpNet>,
    pub dns_servers: Vec<IpAddr>,
    pub search_domains: Vec<String>,
}

impl Default for TunnelConfig {
    fn default() -> Self {
        Self {
            mtu: DEFAULT_MTU,
            addresses: Vec::new(),
            routes: Vec::new(),
            dns_servers: Vec::new(),
            search_domains: Vec::new(),
        }
    }
}

impl TunnelConfig {
    /// Parse a parameter string. Any malformed field rejects the whole string.
    pub fn parse(text: &str) -> Result<Self> {
        let mut config = TunnelConfig::default();
        let text = text.trim_matches(|c: char| c.is_whitespace() || c == '\0');

        for token in text.split(' ').filter(|t| !t.is_empty()) {
            let mut fields = token.split(',');
            let key = fields.next().unwrap_or_default();
            if key.chars().count() != 1 {
                log::debug!("Ignoring parameter with unknown key: {token}");
                continue;
            }
            let values: Vec<&str> = fields.collect();

            match key {
                "m" => {
                    let mtu: i16 = field(token, &values, 0)?;
                    if mtu <= 0 {
                        return Err(invalid(token));
                    }
                    config.mtu = mtu as u16;
                }
                "a" => config.addresses.push(network(token, &values)?),
                "r" => config.routes.push(network(token, &values)?),
                "d" => config.dns_servers.push(field(token, &values, 0)?),
                "s" => {
                    let domain = values.first().filter(|d| !d.is_empty());
                    let domain = domain.ok_or_else(|| invalid(token))?;
                    config.search_domains.push((*domain).to_string());
                }
                _ => log::debug!("Ignoring parameter with unknown key: {token}"),
            }
        }

        Ok(config)
    }
}

fn invalid(token: &str) -> VpnError {
    VpnError::InvalidParameter {
        token: token.to_string(),
    }
}

fn field<T: FromStr>(token: &str, values: &[&str], index: usize) -> Result<T> {
    values
        .get(index)
        .and_then(|v| v.parse().ok())
        .ok_or_else(|| invalid(token))
}

fn network(token: &str, values: &[&str]) -> Result<IpNet> {
    let addr: IpAddr = field(token, values, 0)?;
    let prefix: u8 = field(token, values, 1)?;
    IpNet::new(addr, prefix).map_err(|_| invalid(token))
}

impl FromStr for TunnelConfig {
    type Err = VpnError;

    fn from_str(s: &str) -> Result<Self> {
        TunnelConfig::parse(s)
    }
}

/// Renders back into the wire grammar
impl fmt::Display for TunnelConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "m,{}", self.mtu)?;
        for net in &self.addresses {
            write!(f, " a,{},{}", net.addr(), net.prefix_len())?;
        }
        for net in &self.routes {
            write!(f, " r,{},{}", net.addr(), net.prefix_len())?;
        }
        for dns in &self.dns_servers {
            write!(f, " d,{dns}")?;
        }
        for domain in &self.search_domains {
            write!(f, " s,{domain}")?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn net(s: &str) -> IpNet {
        s.parse().unwrap()
    }

    #[test]
    fn test_parse_gateway_example() {
        let config = TunnelConfig::parse("m,1400 a,10.0.0.2,32 r,0.0.0.0,0 d,8.8.8.8").unwrap();
        assert_eq!(
            config,
            TunnelConfig {
                mtu: 1400,
                addresses: vec![net("10.0.0.2/32")],
                routes: vec![net("0.0.0.0/0")],
                dns_servers: vec!["8.8.8.8".parse().unwrap()],
                search_domains: vec![],
            }
        );
    }

    #[test]
    fn test_parse_is_idempotent() {
        let text = "m,1280 a,10.8.0.5,24 a,fd00::5,64 r,10.0.0.0,8 d,1.1.1.1 s,corp.example";
        let first = TunnelConfig::parse(text).unwrap();
        let second = TunnelConfig::parse(text).unwrap();
        assert_eq!(first, second);
        assert_eq!(first.addresses.len(), 2);
        assert_eq!(first.search_domains, vec!["corp.example".to_string()]);
    }

    #[test]
    fn test_unknown_keys_are_ignored() {
        let config = TunnelConfig::parse("x,1,2 m,1400 q,foo zz,3 a,10.0.0.2,32").unwrap();
        assert_eq!(config.mtu, 1400);
        assert_eq!(config.addresses, vec![net("10.0.0.2/32")]);
        assert!(config.routes.is_empty());
    }

    #[test]
    fn test_non_numeric_values_are_rejected() {
        for text in [
            "m,abc",
            "m,1400 a,10.0.0.2,xx",
            "r,0.0.0.0,zero",
            "m,99999",
            "m,-5",
            "a,10.0.0.2",
            "d,not-an-ip",
            "a,10.0.0.2,33",
        ] {
            match TunnelConfig::parse(text) {
                Err(VpnError::InvalidParameter { .. }) => {}
                other => panic!("{text:?} parsed as {other:?}"),
            }
        }
    }

    #[test]
    fn test_error_names_offending_token() {
        let err = TunnelConfig::parse("m,1400 a,10.0.0.2,xx").unwrap_err();
        match err {
            VpnError::InvalidParameter { token } => assert_eq!(token, "a,10.0.0.2,xx"),
            other => panic!("unexpected error {other:?}"),
        }
    }

    #[test]
    fn test_padding_is_tolerated() {
        let text = format!("  m,1400  a,10.0.0.2,32 {}\0\0", " ".repeat(200));
        let config: TunnelConfig = text.parse().unwrap();
        assert_eq!(config.mtu, 1400);
        assert_eq!(config.addresses.len(), 1);
    }

    #[test]
    fn test_defaults_and_display() {
        let config = TunnelConfig::parse("").unwrap();
        assert_eq!(config, TunnelConfig::default());
        assert_eq!(config.mtu, DEFAULT_MTU);

        let text = "m,1400 a,10.0.0.2,32 r,0.0.0.0,0 d,8.8.8.8 s,lan";
        let config = TunnelConfig::parse(text).unwrap();
        assert_eq!(config.to_string(), text);
        assert_eq!(TunnelConfig::parse(&config.to_string()).unwrap(), config);
    }
}
