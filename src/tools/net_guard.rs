//! SSRF guard shared by every URL-accessing tool. Checks run before any
//! network I/O and again on each redirect hop.

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, ToSocketAddrs};

/// Validate a URL against SSRF rules. Ok(()) means safe to fetch.
pub fn validate_url(url: &str) -> Result<(), String> {
    let parsed = reqwest::Url::parse(url).map_err(|e| format!("Invalid URL: {}", e))?;

    match parsed.scheme() {
        "http" | "https" => {}
        scheme => return Err(format!("Blocked scheme '{}': only http/https allowed", scheme)),
    }

    let host = parsed
        .host_str()
        .ok_or_else(|| "URL must have a host".to_string())?;
    let host_lower = host.to_lowercase();

    const BLOCKED_HOSTS: &[&str] = &[
        "localhost",
        "127.0.0.1",
        "::1",
        "[::1]",
        "0.0.0.0",
        "169.254.169.254",
        "metadata.google.internal",
        "metadata.goog",
    ];
    if BLOCKED_HOSTS.contains(&host_lower.as_str()) {
        return Err(format!("Blocked host: {}", host));
    }
    if host_lower.ends_with(".localhost")
        || host_lower.ends_with(".local")
        || host_lower.ends_with(".internal")
    {
        return Err(format!("Blocked internal hostname: {}", host));
    }

    // Raw IP hosts are checked directly; names are resolved so a DNS
    // record pointing inside the perimeter is still caught.
    if let Ok(ip) = host.trim_matches(['[', ']']).parse::<IpAddr>() {
        if is_blocked_ip(ip) {
            return Err(format!("Blocked IP address: {}", ip));
        }
        return Ok(());
    }

    let port = parsed.port().unwrap_or(match parsed.scheme() {
        "https" => 443,
        _ => 80,
    });
    if let Ok(addrs) = format!("{}:{}", host, port).to_socket_addrs() {
        for addr in addrs {
            if is_blocked_ip(addr.ip()) {
                return Err(format!(
                    "Blocked IP address {} (resolved from {})",
                    addr.ip(),
                    host
                ));
            }
        }
    }
    // Resolution failure: let the request fail naturally.

    Ok(())
}

fn is_blocked_ip(ip: IpAddr) -> bool {
    match ip {
        IpAddr::V4(v4) => is_blocked_ipv4(v4),
        IpAddr::V6(v6) => is_blocked_ipv6(v6),
    }
}

fn is_blocked_ipv4(ip: Ipv4Addr) -> bool {
    let o = ip.octets();
    o[0] == 127                                    // loopback
        || o[0] == 10                              // private
        || (o[0] == 172 && (16..=31).contains(&o[1]))
        || (o[0] == 192 && o[1] == 168)
        || (o[0] == 169 && o[1] == 254)            // link-local + metadata
        || o[0] == 0                               // "this network"
        || ip == Ipv4Addr::BROADCAST
}

fn is_blocked_ipv6(ip: Ipv6Addr) -> bool {
    if ip.is_loopback() || ip.is_unspecified() {
        return true;
    }
    if let Some(v4) = ip.to_ipv4_mapped() {
        return is_blocked_ipv4(v4);
    }
    let seg = ip.segments();
    // fe80::/10 link-local, fc00::/7 unique-local
    (seg[0] & 0xffc0) == 0xfe80 || (seg[0] & 0xfe00) == 0xfc00
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn allows_public_urls() {
        assert!(validate_url("https://example.com/page").is_ok());
        assert!(validate_url("http://93.184.216.34/").is_ok());
    }

    #[test]
    fn rejects_non_http_schemes() {
        assert!(validate_url("file:///etc/passwd").is_err());
        assert!(validate_url("ftp://example.com").is_err());
        assert!(validate_url("gopher://example.com").is_err());
    }

    #[test]
    fn rejects_loopback() {
        assert!(validate_url("http://127.0.0.1/").is_err());
        assert!(validate_url("http://127.8.9.10/").is_err());
        assert!(validate_url("http://localhost/admin").is_err());
        assert!(validate_url("http://[::1]/").is_err());
    }

    #[test]
    fn rejects_private_ranges() {
        assert!(validate_url("http://10.1.2.3/").is_err());
        assert!(validate_url("http://172.16.0.1/").is_err());
        assert!(validate_url("http://172.31.255.255/").is_err());
        assert!(validate_url("http://192.168.1.1/").is_err());
        assert!(validate_url("http://0.0.0.0/").is_err());
    }

    #[test]
    fn allows_adjacent_public_ranges() {
        // 172.32.x is public, unlike 172.16-31.
        assert!(validate_url("http://172.32.0.1/").is_ok());
        assert!(validate_url("http://9.9.9.9/").is_ok());
    }

    #[test]
    fn rejects_metadata_endpoints() {
        assert!(validate_url("http://169.254.169.254/latest/meta-data/").is_err());
        assert!(validate_url("http://metadata.google.internal/").is_err());
    }

    #[test]
    fn rejects_internal_suffixes() {
        assert!(validate_url("http://db.internal/").is_err());
        assert!(validate_url("http://printer.local/").is_err());
        assert!(validate_url("http://web.localhost/").is_err());
    }

    #[test]
    fn rejects_ipv6_special_ranges() {
        assert!(validate_url("http://[fe80::1]/").is_err());
        assert!(validate_url("http://[fc00::1]/").is_err());
        assert!(validate_url("http://[::ffff:127.0.0.1]/").is_err());
        assert!(validate_url("http://[::ffff:10.0.0.1]/").is_err());
    }
}
