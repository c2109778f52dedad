//! CPE 2.3 generation (§4.5.4): pure, deterministic mapping from observed
//! service fields (and, failing that, banner text) to CPE strings.

use once_cell::sync::Lazy;
use regex::Regex;
use std::collections::HashMap;

/// Product → vendor lookup for the common cases NVD's own CPE dictionary
/// disagrees with a naive `product == vendor` guess.
static VENDOR_MAP: Lazy<HashMap<&'static str, &'static str>> = Lazy::new(|| {
    HashMap::from([
        ("nginx", "nginx"),
        ("openssh", "openbsd"),
        ("http_server", "apache"),
        ("httpd", "apache"),
        ("mysql", "mysql"),
        ("mariadb", "mariadb"),
        ("postgresql", "postgresql"),
        ("redis", "redis"),
        ("iis", "microsoft"),
        ("exchange", "microsoft"),
        ("sql_server", "microsoft"),
        ("memcached", "memcached"),
        ("mongodb", "mongodb"),
        ("elasticsearch", "elastic"),
        ("tomcat", "apache"),
        ("jetty", "eclipse"),
        ("haproxy", "haproxy"),
        ("envoy", "envoyproxy"),
        ("vsftpd", "vsftpd"),
        ("proftpd", "proftpd"),
        ("dovecot", "dovecot"),
        ("postfix", "postfix"),
        ("bind", "isc"),
        ("unbound", "nlnetlabs"),
        ("squid", "squid-cache"),
    ])
});

/// `(pattern, vendor, product)` triples applied in order to a banner sample;
/// the first match wins. The version is captured as group 1.
static BANNER_PATTERNS: Lazy<Vec<(Regex, &'static str, &'static str)>> = Lazy::new(|| {
    vec![
        (Regex::new(r"(?i)^SSH-2\.0-OpenSSH_([\w.]+)").unwrap(), "openbsd", "openssh"),
        (Regex::new(r"(?i)^SSH-2\.0-dropbear_([\w.]+)").unwrap(), "matt_johnston", "dropbear"),
        (Regex::new(r"(?i)Server:\s*nginx/([\w.]+)").unwrap(), "nginx", "nginx"),
        (Regex::new(r"(?i)Server:\s*Apache/([\w.]+)").unwrap(), "apache", "http_server"),
        (Regex::new(r"(?i)Server:\s*Microsoft-IIS/([\w.]+)").unwrap(), "microsoft", "iis"),
        (Regex::new(r"(?i)Server:\s*lighttpd/([\w.]+)").unwrap(), "lighttpd", "lighttpd"),
        (Regex::new(r"(?i)Server:\s*Caddy/?([\w.]*)").unwrap(), "caddyserver", "caddy"),
        (Regex::new(r"(?i)Server:\s*cloudflare").unwrap(), "cloudflare", "cloudflare"),
        (Regex::new(r"(?i)^220.*ProFTPD ([\w.]+)").unwrap(), "proftpd", "proftpd"),
        (Regex::new(r"(?i)^220.*vsFTPd ([\w.]+)").unwrap(), "vsftpd", "vsftpd"),
        (Regex::new(r"(?i)^220.*Pure-FTPd").unwrap(), "pureftpd", "pure-ftpd"),
        (Regex::new(r"(?i)^220.*Postfix").unwrap(), "postfix", "postfix"),
        (Regex::new(r"(?i)^220.*Exim ([\w.]+)").unwrap(), "exim", "exim"),
        (Regex::new(r"(?i)^\+OK Dovecot ready").unwrap(), "dovecot", "dovecot"),
        (Regex::new(r"(?i)mysql_native_password|([\d.]+)-MariaDB").unwrap(), "mariadb", "mariadb"),
        (Regex::new(r"(?i)^5\.([\w.]+)-log\0").unwrap(), "mysql", "mysql"),
        (Regex::new(r#"(?i)"version"\s*:\s*"([\w.]+)".*elasticsearch"#).unwrap(), "elastic", "elasticsearch"),
        (Regex::new(r"(?i)^\$.*redis_version:([\w.]+)").unwrap(), "redis", "redis"),
        (Regex::new(r"(?i)^BIND ([\w.]+)").unwrap(), "isc", "bind"),
        (Regex::new(r"(?i)^220.*FileZilla Server ([\w.]+)").unwrap(), "filezilla", "filezilla_server"),
        (Regex::new(r"(?i)HAProxy").unwrap(), "haproxy", "haproxy"),
        (Regex::new(r"(?i)^220.*Microsoft ESMTP MAIL").unwrap(), "microsoft", "exchange"),
        (Regex::new(r"(?i)Server:\s*Envoy").unwrap(), "envoyproxy", "envoy"),
    ]
});

/// Lowercase, replace spaces with `_`, strip characters outside
/// `[a-z0-9._-*]`, and collapse an empty result to `*`.
fn canonicalize_component(raw: &str) -> String {
    let lowered = raw.to_lowercase().replace(' ', "_");
    let filtered: String = lowered
        .chars()
        .filter(|c| c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-' | '*'))
        .collect();
    if filtered.is_empty() {
        "*".to_string()
    } else {
        filtered
    }
}

fn build_cpe(vendor: &str, product: &str, version: &str) -> String {
    format!(
        "cpe:2.3:a:{}:{}:{}:*:*:*:*:*:*:*",
        canonicalize_component(vendor),
        canonicalize_component(product),
        canonicalize_component(version),
    )
}

fn resolve_vendor(product: &str) -> String {
    let key = product.to_lowercase();
    VENDOR_MAP.get(key.as_str()).map(|v| v.to_string()).unwrap_or(key)
}

/// Generate every CPE inferable from a service's structured fields and, if
/// present, its banner text. Order is stable: structured-field CPE first,
/// then the banner-derived one (if it names a distinct product).
pub fn generate_cpes(product: &str, version: &str, banner: Option<&str>) -> Vec<String> {
    let mut cpes = Vec::new();

    if !product.is_empty() {
        let vendor = resolve_vendor(product);
        if !version.is_empty() {
            cpes.push(build_cpe(&vendor, product, version));
        } else {
            cpes.push(build_cpe(&vendor, product, "*"));
        }
    }

    if let Some(banner) = banner {
        for (pattern, vendor, banner_product) in BANNER_PATTERNS.iter() {
            if let Some(caps) = pattern.captures(banner) {
                let version = caps.get(1).map(|m| m.as_str()).unwrap_or("*");
                let version = if version.is_empty() { "*" } else { version };
                let candidate = build_cpe(vendor, banner_product, version);
                if !cpes.contains(&candidate) {
                    cpes.push(candidate);
                }
                break;
            }
        }
    }

    cpes
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn known_vendor_overrides_product_name() {
        let cpes = generate_cpes("openssh", "9.6p1", None);
        assert_eq!(cpes, vec!["cpe:2.3:a:openbsd:openssh:9.6p1:*:*:*:*:*:*:*"]);
    }

    #[test]
    fn unknown_product_uses_itself_as_vendor() {
        let cpes = generate_cpes("myapp", "1.0", None);
        assert_eq!(cpes, vec!["cpe:2.3:a:myapp:myapp:1.0:*:*:*:*:*:*:*"]);
    }

    #[test]
    fn missing_version_is_wildcarded() {
        let cpes = generate_cpes("nginx", "", None);
        assert_eq!(cpes, vec!["cpe:2.3:a:nginx:nginx:*:*:*:*:*:*:*:*"]);
    }

    #[test]
    fn banner_extracts_vendor_product_version() {
        let cpes = generate_cpes("", "", Some("SSH-2.0-OpenSSH_8.9p1 Ubuntu-3ubuntu0.1"));
        assert_eq!(cpes, vec!["cpe:2.3:a:openbsd:openssh:8.9p1:*:*:*:*:*:*:*"]);
    }

    #[test]
    fn canonicalization_strips_disallowed_characters() {
        assert_eq!(canonicalize_component("Foo Bar/Baz!"), "foo_barbaz");
        assert_eq!(canonicalize_component(""), "*");
    }

    #[test]
    fn canonicalization_is_idempotent() {
        let once = canonicalize_component("Nginx/1.24 Beta");
        let twice = canonicalize_component(&once);
        assert_eq!(once, twice);
    }
}
