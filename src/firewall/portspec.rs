//! The `--expose-port` grammar (spec §4.8), as a small deterministic hand
//! parser rather than a regex with post-filtering (spec's own recommendation
//! in §9): split on `/` for protocol, then `:` for the interface/host/dest
//! tokens, disambiguating two-token forms by attempting to parse the first
//! token as a port number.

use std::fmt;

use stacked_errors::{bail_locationless, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Protocol {
    Tcp,
    Udp,
}

impl fmt::Display for Protocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Protocol::Tcp => "tcp",
            Protocol::Udp => "udp",
        })
    }
}

/// `{interface?, host_port, dest_port, protocol}` (spec §3).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PortSpec {
    pub interface: Option<String>,
    pub host_port: u16,
    pub dest_port: u16,
    pub protocol: Protocol,
}

impl PortSpec {
    /// Parses one `--expose-port` value.
    pub fn parse(s: &str) -> Result<Self> {
        let (body, proto) = match s.split_once('/') {
            Some((b, p)) => (b, parse_proto(p)?),
            None => (s, Protocol::Tcp),
        };
        let tokens: Vec<&str> = body.split(':').collect();
        let (interface, host_port, dest_port) = match tokens.as_slice() {
            [port] => (None, parse_port(port)?, parse_port(port)?),
            [a, b] => match parse_port(a) {
                Ok(host) => (None, host, parse_port(b)?),
                Err(_) => (Some((*a).to_owned()), parse_port(b)?, parse_port(b)?),
            },
            [iface, host, dest] => (Some((*iface).to_owned()), parse_port(host)?, parse_port(dest)?),
            _ => bail_locationless!("invalid port spec {s:?}: too many ':'-separated fields"),
        };
        Ok(Self {
            interface,
            host_port,
            dest_port,
            protocol: proto,
        })
    }

    /// Canonical rendering; `PortSpec::parse(&spec.render()) == spec` for
    /// every constructible `PortSpec` (spec §8 "Port grammar idempotence").
    pub fn render(&self) -> String {
        let proto_suffix = match self.protocol {
            Protocol::Tcp => String::new(),
            Protocol::Udp => "/udp".to_owned(),
        };
        match &self.interface {
            Some(iface) => format!("{iface}:{}:{}{proto_suffix}", self.host_port, self.dest_port),
            None if self.host_port == self.dest_port => format!("{}{proto_suffix}", self.host_port),
            None => format!("{}:{}{proto_suffix}", self.host_port, self.dest_port),
        }
    }
}

fn parse_proto(s: &str) -> Result<Protocol> {
    match s {
        "tcp" => Ok(Protocol::Tcp),
        "udp" => Ok(Protocol::Udp),
        other => bail_locationless!("invalid protocol {other:?}, expected \"tcp\" or \"udp\""),
    }
}

/// Port numbers are constrained to `1 <= port < 65535` (spec §4.8).
fn parse_port(s: &str) -> Result<u16> {
    let n: u32 = s
        .parse()
        .map_err(|_| stacked_errors::Error::from(format!("{s:?} is not a valid port number")))?;
    if n < 1 || n >= 65535 {
        bail_locationless!("port {n} out of range (1 <= port < 65535)");
    }
    Ok(n as u16)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bare_port() {
        let p = PortSpec::parse("16686").unwrap();
        assert_eq!(
            p,
            PortSpec {
                interface: None,
                host_port: 16686,
                dest_port: 16686,
                protocol: Protocol::Tcp
            }
        );
    }

    #[test]
    fn iface_host_dest_proto() {
        let p = PortSpec::parse("eno1:16687:16686/tcp").unwrap();
        assert_eq!(
            p,
            PortSpec {
                interface: Some("eno1".to_owned()),
                host_port: 16687,
                dest_port: 16686,
                protocol: Protocol::Tcp
            }
        );
    }

    #[test]
    fn port_with_udp() {
        let p = PortSpec::parse("16686/udp").unwrap();
        assert_eq!(p.protocol, Protocol::Udp);
        assert_eq!(p.host_port, 16686);
        assert_eq!(p.dest_port, 16686);
    }

    #[test]
    fn out_of_range_dest_rejected() {
        assert!(PortSpec::parse("eno1:16686:166867/tcp").is_err());
    }

    #[test]
    fn host_colon_dest_without_iface() {
        let p = PortSpec::parse("8080:80").unwrap();
        assert_eq!(p.interface, None);
        assert_eq!(p.host_port, 8080);
        assert_eq!(p.dest_port, 80);
    }

    #[test]
    fn iface_colon_port_two_tokens() {
        let p = PortSpec::parse("eno1:9000").unwrap();
        assert_eq!(p.interface.as_deref(), Some("eno1"));
        assert_eq!(p.host_port, 9000);
        assert_eq!(p.dest_port, 9000);
    }

    #[test]
    fn render_round_trips() {
        for s in [
            "16686",
            "16686/udp",
            "8080:80",
            "8080:80/udp",
            "eno1:9000",
            "eno1:16687:16686/tcp",
        ] {
            let parsed = PortSpec::parse(s).unwrap();
            let rendered = parsed.render();
            assert_eq!(PortSpec::parse(&rendered).unwrap(), parsed, "mismatch for {s:?} -> {rendered:?}");
        }
    }
}
