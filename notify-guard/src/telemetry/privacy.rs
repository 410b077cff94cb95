//! Scrubbing of identifying data before telemetry leaves the process.

use std::net::IpAddr;
use std::sync::LazyLock;

use regex::{Captures, Regex};
use sha2::{Digest, Sha256};
use url::{Host, Url};

static URL_REGEX: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\b(?:https?|rtsp|rtmp|wss?)://\S+").unwrap());
static EMAIL_REGEX: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\b[A-Za-z0-9._%+-]+@[A-Za-z0-9.-]+\.[A-Za-z]{2,}\b").unwrap()
});
static UUID_REGEX: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"\b[0-9a-fA-F]{8}-[0-9a-fA-F]{4}-[0-9a-fA-F]{4}-[0-9a-fA-F]{4}-[0-9a-fA-F]{12}\b",
    )
    .unwrap()
});
static IPV4_REGEX: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\b(?:(?:25[0-5]|2[0-4][0-9]|[01]?[0-9][0-9]?)\.){3}(?:25[0-5]|2[0-4][0-9]|[01]?[0-9][0-9]?)\b")
        .unwrap()
});
static KEYED_TOKEN_REGEX: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)\b(api[_-]?key|token|secret|auth|password)\s*[:=]\s*[A-Za-z0-9+/_\-.=]{8,}")
        .unwrap()
});
static BEARER_REGEX: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)\bbearer\s+[A-Za-z0-9+/_\-.=]{8,}").unwrap());

/// Remove URLs, emails, UUIDs, IPv4 addresses and API tokens from a message.
///
/// URLs are replaced by their [`anonymize_url`] form so related reports still
/// correlate.
pub fn scrub_message(message: &str) -> String {
    let result = URL_REGEX.replace_all(message, |caps: &Captures| anonymize_url(&caps[0]));
    let result = EMAIL_REGEX.replace_all(&result, "[EMAIL]");
    let result = UUID_REGEX.replace_all(&result, "[UUID]");
    let result = IPV4_REGEX.replace_all(&result, "[IP]");
    let result = BEARER_REGEX.replace_all(&result, "Bearer [TOKEN]");
    let result = KEYED_TOKEN_REGEX.replace_all(&result, "$1: [TOKEN]");
    result.into_owned()
}

/// Replace a URL by a stable hash of its shape.
///
/// The hash covers the scheme, a host category (never the host itself), the
/// port and an anonymized path structure, rendered as `url-<hex>`. Unparseable
/// input hashes the raw string instead, rendered as `url-hash-<hex>`.
pub fn anonymize_url(raw: &str) -> String {
    let Ok(parsed) = Url::parse(raw) else {
        return format!("url-hash-{}", short_hash(raw, 8));
    };

    let mut parts: Vec<String> = Vec::with_capacity(4);
    if !parsed.scheme().is_empty() {
        parts.push(parsed.scheme().to_string());
    }
    if let Some(host) = parsed.host() {
        parts.push(categorize_host(&host));
    }
    if let Some(port) = parsed.port() {
        parts.push(format!("port-{port}"));
    }
    let path = parsed.path();
    if !path.is_empty() && path != "/" {
        parts.push(anonymize_path(path));
    }

    format!("url-{}", short_hash(&parts.join(":"), 16))
}

fn short_hash(input: &str, bytes: usize) -> String {
    let digest = Sha256::digest(input.as_bytes());
    hex::encode(&digest[..bytes])
}

fn categorize_host(host: &Host<&str>) -> String {
    let ip = match host {
        Host::Domain(domain) => {
            if domain.eq_ignore_ascii_case("localhost") {
                return "localhost".to_string();
            }
            return categorize_domain(domain);
        }
        Host::Ipv4(v4) => IpAddr::V4(*v4),
        Host::Ipv6(v6) => IpAddr::V6(*v6),
    };

    if ip.is_loopback() {
        "localhost".to_string()
    } else if is_private_ip(&ip) {
        "private-ip".to_string()
    } else {
        "public-ip".to_string()
    }
}

fn is_private_ip(ip: &IpAddr) -> bool {
    match ip {
        IpAddr::V4(v4) => v4.is_private() || v4.is_link_local(),
        IpAddr::V6(v6) => v6.is_unicast_link_local() || v6.is_unique_local() || v6.is_multicast(),
    }
}

fn categorize_domain(domain: &str) -> String {
    let parts: Vec<&str> = domain.split('.').filter(|p| !p.is_empty()).collect();
    if parts.len() < 2 {
        return "unknown-host".to_string();
    }
    let tld = parts[parts.len() - 1].to_ascii_lowercase();
    if parts.len() >= 3 {
        let second = parts[parts.len() - 2].to_ascii_lowercase();
        if matches!(second.as_str(), "co" | "com" | "gov" | "ac" | "org" | "net" | "edu") {
            return format!("domain-{second}.{tld}");
        }
    }
    format!("domain-{tld}")
}

fn anonymize_path(path: &str) -> String {
    let segments: Vec<String> = path
        .split('/')
        .filter(|s| !s.is_empty())
        .map(|segment| {
            if segment.chars().all(|c| c.is_ascii_digit()) {
                "path-numeric".to_string()
            } else {
                format!("path-seg-{}", short_hash(segment, 4))
            }
        })
        .collect();

    if segments.is_empty() {
        "path-root".to_string()
    } else {
        segments.join("/")
    }
}
