//! Outbound URL validation.
//!
//! Every outbound fetch goes through `validate_outbound_url` first.
//! https is required except toward loopback; userinfo, fragments and
//! IP-literal hosts in private/link-local/multicast ranges are
//! rejected.

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};

use heliora_core::{OracleError, Result};

fn strip_ipv6_brackets(host: &str) -> &str {
    host.strip_prefix('[')
        .and_then(|h| h.strip_suffix(']'))
        .unwrap_or(host)
}

fn is_loopback_host(host: &str) -> bool {
    let host = strip_ipv6_brackets(host);
    if host.eq_ignore_ascii_case("localhost") {
        return true;
    }
    host.parse::<IpAddr>().is_ok_and(|ip| ip.is_loopback())
}

fn is_disallowed_ipv4(ip: Ipv4Addr) -> bool {
    ip.is_unspecified()
        || ip.is_link_local()
        || ip.is_private()
        || ip.is_multicast()
        || ip.is_broadcast()
}

fn is_disallowed_ipv6(ip: Ipv6Addr) -> bool {
    ip.is_unspecified() || ip.is_unicast_link_local() || ip.is_unique_local() || ip.is_multicast()
}

fn is_disallowed_ip(ip: IpAddr) -> bool {
    match ip {
        IpAddr::V4(v4) => is_disallowed_ipv4(v4),
        IpAddr::V6(v6) => is_disallowed_ipv6(v6),
    }
}

/// Validate an outbound URL before any request is made with it.
pub fn validate_outbound_url(raw: &str) -> Result<url::Url> {
    let url =
        url::Url::parse(raw).map_err(|e| OracleError::Config(format!("invalid url: {e}")))?;

    if !url.username().is_empty() || url.password().is_some() {
        return Err(OracleError::Config(
            "outbound url must not contain userinfo".into(),
        ));
    }
    if url.fragment().is_some() {
        return Err(OracleError::Config(
            "outbound url must not contain a fragment".into(),
        ));
    }
    let Some(host) = url.host_str() else {
        return Err(OracleError::Config("outbound url must include a host".into()));
    };

    let loopback = is_loopback_host(host);
    match url.scheme() {
        "https" => {}
        "http" if loopback => {}
        _ => {
            return Err(OracleError::Config(
                "outbound url must be https, or http only toward loopback".into(),
            ));
        }
    }

    if !loopback {
        if let Ok(ip) = strip_ipv6_brackets(host).parse::<IpAddr>() {
            if is_disallowed_ip(ip) {
                return Err(OracleError::Config(
                    "outbound url host is a disallowed ip range".into(),
                ));
            }
        }
    }

    Ok(url)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn allows_https_remote() {
        validate_outbound_url("https://apihub.kma.go.kr/api/typ01/url/kma_sfctm2.php")
            .expect("https should be allowed");
    }

    #[test]
    fn allows_http_loopback() {
        validate_outbound_url("http://localhost:5001").expect("loopback http");
        validate_outbound_url("http://127.0.0.1:8080").expect("loopback ip http");
    }

    #[test]
    fn rejects_http_remote() {
        assert!(validate_outbound_url("http://example.com").is_err());
    }

    #[test]
    fn rejects_userinfo_and_fragment() {
        assert!(validate_outbound_url("https://user:pw@example.com").is_err());
        assert!(validate_outbound_url("https://example.com/x#frag").is_err());
    }

    #[test]
    fn rejects_private_and_link_local_ips() {
        assert!(validate_outbound_url("https://10.0.0.1:8080").is_err());
        assert!(validate_outbound_url("https://169.254.1.2").is_err());
        assert!(validate_outbound_url("https://192.168.0.10").is_err());
    }
}
