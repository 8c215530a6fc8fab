//! Tunnel URL codec
//!
//! Tunnels are configured with a compact URL in both directions:
//!
//! ```text
//! scheme://[password@][host]:port/target:port[,target2:port2]?tls=0|1|2&log=LEVEL&...
//! ```
//!
//! where `scheme` is `server` or `client`. The parser accepts bracketed
//! IPv6 literals, a missing host (listen on any interface), and tolerates
//! unknown query keys. The builder always re-emits query keys in canonical
//! order and percent-encodes path components, so
//! `parse(build(config)) == config` holds modulo key ordering.

use crate::error::{AppError, AppResult};
use crate::model::{ListenType, TlsMode, TunnelType};
use std::fmt::Write as _;

/// One `host:port` pair; host may be empty ("any interface")
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HostPort {
    pub host: String,
    pub port: u16,
}

/// Parsed view of a tunnel's config line
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TunnelUrl {
    pub scheme: TunnelType,
    pub password: Option<String>,
    /// Listen host; empty means any
    pub host: String,
    pub port: u16,
    /// Forward targets; the first is primary, the rest load-balance
    pub targets: Vec<HostPort>,
    pub tls: Option<TlsMode>,
    pub log: Option<String>,
    pub mode: Option<i64>,
    pub cert: Option<String>,
    pub key: Option<String>,
    pub min: Option<i64>,
    pub max: Option<i64>,
    pub no_tcp: bool,
    pub no_udp: bool,
}

impl TunnelUrl {
    pub fn listen_type(&self) -> ListenType {
        match (self.no_tcp, self.no_udp) {
            (true, false) => ListenType::Udp,
            (false, true) => ListenType::Tcp,
            _ => ListenType::All,
        }
    }

    pub fn primary_target(&self) -> &HostPort {
        // Parsing guarantees at least one target
        &self.targets[0]
    }

    /// Build the canonical URL string
    pub fn build(&self) -> String {
        let mut out = String::new();
        out.push_str(self.scheme.as_str());
        out.push_str("://");
        if let Some(password) = &self.password {
            out.push_str(&encode_component(password));
            out.push('@');
        }
        write_host_port(&mut out, &self.host, self.port);
        out.push('/');
        for (i, target) in self.targets.iter().enumerate() {
            if i > 0 {
                out.push(',');
            }
            write_host_port(&mut out, &target.host, target.port);
        }

        // Canonical query key order
        let mut query: Vec<(&str, String)> = Vec::new();
        if let Some(tls) = self.tls.and_then(TlsMode::as_query_value) {
            query.push(("tls", tls.to_string()));
        }
        if let Some(log) = &self.log {
            query.push(("log", encode_component(log)));
        }
        if let Some(mode) = self.mode {
            query.push(("mode", mode.to_string()));
        }
        if let Some(cert) = &self.cert {
            query.push(("cert", encode_component(cert)));
        }
        if let Some(key) = &self.key {
            query.push(("key", encode_component(key)));
        }
        if let Some(min) = self.min {
            query.push(("min", min.to_string()));
        }
        if let Some(max) = self.max {
            query.push(("max", max.to_string()));
        }
        if self.no_tcp {
            query.push(("notcp", "1".to_string()));
        }
        if self.no_udp {
            query.push(("noudp", "1".to_string()));
        }

        for (i, (k, v)) in query.iter().enumerate() {
            out.push(if i == 0 { '?' } else { '&' });
            out.push_str(k);
            out.push('=');
            out.push_str(v);
        }
        out
    }

    /// Parse a tunnel URL
    pub fn parse(input: &str) -> AppResult<Self> {
        let input = input.trim();
        let (scheme_str, rest) = input
            .split_once("://")
            .ok_or_else(|| AppError::config_invalid(format!("missing scheme in {input:?}")))?;
        let scheme = TunnelType::parse(scheme_str).ok_or_else(|| {
            AppError::config_invalid(format!("unknown scheme {scheme_str:?} (want server|client)"))
        })?;

        let (before_query, query_str) = match rest.split_once('?') {
            Some((b, q)) => (b, Some(q)),
            None => (rest, None),
        };

        let (authority, path) = before_query.split_once('/').ok_or_else(|| {
            AppError::config_invalid(format!("missing target path in {input:?}"))
        })?;

        // Optional password userinfo
        let (password, host_port) = match authority.rsplit_once('@') {
            Some((pw, hp)) => (Some(decode_component(pw)?), hp),
            None => (None, authority),
        };

        let (host, port) = parse_host_port(host_port)
            .ok_or_else(|| AppError::config_invalid(format!("bad listen address {host_port:?}")))?;

        let mut targets = Vec::new();
        for part in path.split(',') {
            let decoded = decode_component(part)?;
            let (thost, tport) = parse_host_port(&decoded).ok_or_else(|| {
                AppError::config_invalid(format!("bad target address {part:?}"))
            })?;
            targets.push(HostPort {
                host: thost,
                port: tport,
            });
        }
        if targets.is_empty() {
            return Err(AppError::config_invalid("tunnel URL has no target"));
        }

        let mut url = TunnelUrl {
            scheme,
            password,
            host,
            port,
            targets,
            tls: None,
            log: None,
            mode: None,
            cert: None,
            key: None,
            min: None,
            max: None,
            no_tcp: false,
            no_udp: false,
        };

        if let Some(query_str) = query_str {
            for pair in query_str.split('&').filter(|p| !p.is_empty()) {
                let (k, v) = pair.split_once('=').unwrap_or((pair, ""));
                let v = decode_component(v)?;
                match k {
                    "tls" => url.tls = TlsMode::from_query_value(&v),
                    "log" => url.log = Some(v),
                    "mode" => url.mode = v.parse().ok(),
                    "cert" => url.cert = Some(v),
                    "key" => url.key = Some(v),
                    "min" => url.min = v.parse().ok(),
                    "max" => url.max = v.parse().ok(),
                    "notcp" => url.no_tcp = v == "1" || v == "true",
                    "noudp" => url.no_udp = v == "1" || v == "true",
                    // Unknown keys are tolerated by contract
                    _ => {}
                }
            }
        }

        Ok(url)
    }
}

fn write_host_port(out: &mut String, host: &str, port: u16) {
    if host.contains(':') && !host.starts_with('[') {
        // Bare IPv6 literal needs brackets next to the port
        let _ = write!(out, "[{host}]:{port}");
    } else {
        let _ = write!(out, "{host}:{port}");
    }
}

/// Split `host:port` accepting `[v6]:port` and an empty host
fn parse_host_port(s: &str) -> Option<(String, u16)> {
    if let Some(rest) = s.strip_prefix('[') {
        let (host, after) = rest.split_once(']')?;
        let port = after.strip_prefix(':')?.parse().ok()?;
        return Some((host.to_string(), port));
    }
    let (host, port) = s.rsplit_once(':')?;
    // A colon in the host here would be an unbracketed IPv6; reject it so
    // the error points at the URL instead of binding a wrong port
    if host.contains(':') {
        return None;
    }
    let port = port.parse().ok()?;
    Some((host.to_string(), port))
}

const UNRESERVED: &[u8] = b"-_.~";

fn encode_component(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    for byte in s.bytes() {
        if byte.is_ascii_alphanumeric() || UNRESERVED.contains(&byte) || byte == b':' {
            out.push(byte as char);
        } else {
            let _ = write!(out, "%{byte:02X}");
        }
    }
    out
}

fn decode_component(s: &str) -> AppResult<String> {
    let bytes = s.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'%' {
            let hex = s
                .get(i + 1..i + 3)
                .ok_or_else(|| AppError::config_invalid(format!("bad percent escape in {s:?}")))?;
            let value = u8::from_str_radix(hex, 16)
                .map_err(|_| AppError::config_invalid(format!("bad percent escape in {s:?}")))?;
            out.push(value);
            i += 3;
        } else {
            out.push(bytes[i]);
            i += 1;
        }
    }
    String::from_utf8(out)
        .map_err(|_| AppError::config_invalid(format!("non-UTF-8 percent data in {s:?}")))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn base_url() -> TunnelUrl {
        TunnelUrl {
            scheme: TunnelType::Server,
            password: None,
            host: "0.0.0.0".into(),
            port: 10101,
            targets: vec![HostPort {
                host: "127.0.0.1".into(),
                port: 8080,
            }],
            tls: None,
            log: None,
            mode: None,
            cert: None,
            key: None,
            min: None,
            max: None,
            no_tcp: false,
            no_udp: false,
        }
    }

    #[test]
    fn minimal_round_trip() {
        let url = base_url();
        let built = url.build();
        assert_eq!(built, "server://0.0.0.0:10101/127.0.0.1:8080");
        assert_eq!(TunnelUrl::parse(&built).unwrap(), url);
    }

    #[test]
    fn full_round_trip_canonical_order() {
        let url = TunnelUrl {
            scheme: TunnelType::Client,
            password: Some("s3cret!".into()),
            host: "gateway.example.com".into(),
            port: 443,
            targets: vec![
                HostPort {
                    host: "10.0.0.5".into(),
                    port: 22,
                },
                HostPort {
                    host: "10.0.0.6".into(),
                    port: 22,
                },
            ],
            tls: Some(TlsMode::Custom),
            log: Some("debug".into()),
            mode: Some(2),
            cert: Some("/etc/certs/a b.pem".into()),
            key: Some("/etc/certs/a.key".into()),
            min: Some(4),
            max: Some(64),
            no_tcp: false,
            no_udp: true,
        };
        let built = url.build();
        // Canonical key order: tls, log, mode, cert, key, min, max, notcp, noudp
        assert!(built.contains("?tls=2&log=debug&mode=2&cert="));
        assert!(built.ends_with("&min=4&max=64&noudp=1"));
        // Space in the cert path is percent-encoded
        assert!(built.contains("a%20b.pem"));
        assert_eq!(TunnelUrl::parse(&built).unwrap(), url);
    }

    #[test]
    fn missing_host_means_listen_any() {
        let url = TunnelUrl::parse("server://:10101/127.0.0.1:8080").unwrap();
        assert_eq!(url.host, "");
        assert_eq!(url.port, 10101);
        assert_eq!(url.build(), "server://:10101/127.0.0.1:8080");
    }

    #[test]
    fn bracketed_ipv6_round_trips() {
        let built = "client://[::1]:9000/[fe80::2]:22";
        let url = TunnelUrl::parse(built).unwrap();
        assert_eq!(url.host, "::1");
        assert_eq!(url.targets[0].host, "fe80::2");
        assert_eq!(url.build(), built);
    }

    #[test]
    fn unknown_query_keys_are_tolerated() {
        let url =
            TunnelUrl::parse("server://:1/127.0.0.1:2?tls=1&future_flag=yes&log=warn").unwrap();
        assert_eq!(url.tls, Some(TlsMode::SelfSigned));
        assert_eq!(url.log.as_deref(), Some("warn"));
    }

    #[test]
    fn listen_type_from_flags() {
        let url = TunnelUrl::parse("server://:1/h:2?notcp=1").unwrap();
        assert_eq!(url.listen_type(), ListenType::Udp);
        let url = TunnelUrl::parse("server://:1/h:2?noudp=1").unwrap();
        assert_eq!(url.listen_type(), ListenType::Tcp);
        let url = TunnelUrl::parse("server://:1/h:2").unwrap();
        assert_eq!(url.listen_type(), ListenType::All);
    }

    #[test]
    fn rejects_malformed_input() {
        assert!(TunnelUrl::parse("ftp://:1/h:2").is_err());
        assert!(TunnelUrl::parse("server://:1").is_err());
        assert!(TunnelUrl::parse("server://nohost/h:2").is_err());
        assert!(TunnelUrl::parse("server://:1/h:notaport").is_err());
        // Unbracketed IPv6 in the host position is ambiguous
        assert!(TunnelUrl::parse("server://::1:9000/h:2").is_err());
    }

    #[test]
    fn password_with_reserved_chars_round_trips() {
        let mut url = base_url();
        url.password = Some("p@ss/w:rd".into());
        let built = url.build();
        assert_eq!(TunnelUrl::parse(&built).unwrap(), url);
    }
}
