use std::net::IpAddr;
use thiserror::Error;
use url::Url;

/// Errors that can occur during URL validation.
///
/// These errors cover both parsing failures and security policy violations
/// designed to prevent SSRF (Server-Side Request Forgery) attacks.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum UrlValidationError {
    /// The URL string could not be parsed.
    #[error("Invalid URL: {0}")]
    InvalidUrl(#[from] url::ParseError),
    /// The URL uses a scheme other than http or https.
    #[error("Unsupported scheme: {0} (only http/https allowed)")]
    UnsupportedScheme(String),
    /// The URL has no host component.
    #[error("URL has no host")]
    MissingHost,
    /// The URL points to a private/internal IP address.
    #[error("Private IP address not allowed: {0}")]
    PrivateIp(String),
    /// The URL points to localhost.
    #[error("Localhost not allowed")]
    Localhost,
}

/// Parses a feed URL and brings it into canonical form.
///
/// Two feed URLs name the same podcast when their canonical forms are equal.
/// Canonicalisation:
/// - trims surrounding whitespace
/// - lower-cases scheme and host and drops the scheme's default port
///   (done by the `url` parser)
/// - drops the fragment
/// - removes trailing slashes from a non-root path
///
/// Only `http` and `https` URLs with a host are accepted. Private and
/// loopback hosts are allowed here; callers that ingest untrusted lists
/// apply [`validate_url`] on top.
///
/// # Examples
///
/// ```
/// use podshelf::util::canonicalize_feed_url;
///
/// let a = canonicalize_feed_url("HTTPS://Example.COM:443/feed/").unwrap();
/// let b = canonicalize_feed_url("https://example.com/feed").unwrap();
/// assert_eq!(a, b);
/// ```
pub fn canonicalize_feed_url(url_str: &str) -> Result<Url, UrlValidationError> {
    let mut url = Url::parse(url_str.trim())?;

    match url.scheme() {
        "http" | "https" => {}
        scheme => return Err(UrlValidationError::UnsupportedScheme(scheme.to_owned())),
    }

    if url.host_str().map_or(true, str::is_empty) {
        return Err(UrlValidationError::MissingHost);
    }

    url.set_fragment(None);

    let path = url.path();
    if path.len() > 1 && path.ends_with('/') {
        let trimmed = path.trim_end_matches('/');
        let trimmed = if trimmed.is_empty() { "/" } else { trimmed }.to_owned();
        url.set_path(&trimmed);
    }

    Ok(url)
}

/// Validates a URL string for use as a feed source from an untrusted list.
///
/// Performs security-focused validation to prevent SSRF attacks by rejecting:
/// - Non-HTTP(S) schemes (e.g., `file://`, `ftp://`)
/// - Localhost addresses (`localhost`, `127.0.0.1`, `::1`)
/// - Private IP ranges (RFC 1918, link-local, unique local IPv6)
///
/// # Errors
///
/// Returns [`UrlValidationError`] if:
/// - The URL cannot be parsed ([`UrlValidationError::InvalidUrl`])
/// - The scheme is not `http` or `https` ([`UrlValidationError::UnsupportedScheme`])
/// - The host is localhost ([`UrlValidationError::Localhost`])
/// - The host is a private IP address ([`UrlValidationError::PrivateIp`])
///
/// # Examples
///
/// ```
/// use podshelf::util::validate_url;
///
/// assert!(validate_url("https://example.com/feed.xml").is_ok());
/// assert!(validate_url("http://localhost/feed").is_err());
/// assert!(validate_url("http://192.168.1.1/feed").is_err());
/// assert!(validate_url("file:///etc/passwd").is_err());
/// ```
pub fn validate_url(url_str: &str) -> Result<Url, UrlValidationError> {
    let url = canonicalize_feed_url(url_str)?;

    if let Some(host) = url.host_str() {
        if host == "localhost" {
            return Err(UrlValidationError::Localhost);
        }

        // Strip brackets from IPv6 addresses for parsing
        let host_for_parse = host
            .strip_prefix('[')
            .and_then(|h| h.strip_suffix(']'))
            .unwrap_or(host);

        if let Ok(ip) = host_for_parse.parse::<IpAddr>() {
            if ip.is_loopback() {
                return Err(UrlValidationError::Localhost);
            }
            if is_private_ip(&ip) {
                return Err(UrlValidationError::PrivateIp(ip.to_string()));
            }
        }
    }

    Ok(url)
}

fn is_private_ip(ip: &IpAddr) -> bool {
    match ip {
        IpAddr::V4(ipv4) => {
            ipv4.is_private() || ipv4.is_loopback() || ipv4.is_link_local() || ipv4.is_unspecified()
        }
        IpAddr::V6(ipv6) => {
            if ipv6.is_loopback() || ipv6.is_unspecified() {
                return true;
            }
            let segments = ipv6.segments();
            // Unique Local (fc00::/7)
            let is_unique_local = (segments[0] & 0xfe00) == 0xfc00;
            // Link-Local (fe80::/10)
            let is_link_local = (segments[0] & 0xffc0) == 0xfe80;
            is_unique_local || is_link_local
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn canonical(s: &str) -> String {
        canonicalize_feed_url(s).unwrap().to_string()
    }

    #[test]
    fn test_scheme_and_host_case_ignored() {
        assert_eq!(canonical("HTTPS://A.Test/Feed"), "https://a.test/Feed");
    }

    #[test]
    fn test_trailing_slashes_removed() {
        assert_eq!(canonical("https://a.test/feed/"), "https://a.test/feed");
        assert_eq!(canonical("https://a.test/feed///"), "https://a.test/feed");
        assert_eq!(canonical("https://a.test/"), "https://a.test/");
        assert_eq!(canonical("https://a.test"), "https://a.test/");
    }

    #[test]
    fn test_default_port_and_fragment_dropped() {
        assert_eq!(
            canonical("https://a.test:443/feed#latest"),
            "https://a.test/feed"
        );
        assert_eq!(canonical("http://a.test:8080/feed"), "http://a.test:8080/feed");
    }

    #[test]
    fn test_query_preserved() {
        assert_eq!(
            canonical("https://a.test/feed/?format=mp3"),
            "https://a.test/feed?format=mp3"
        );
    }

    #[test]
    fn test_canonicalize_rejects_non_http() {
        assert!(matches!(
            canonicalize_feed_url("ftp://a.test/feed"),
            Err(UrlValidationError::UnsupportedScheme(_))
        ));
        assert!(canonicalize_feed_url("not a url").is_err());
    }

    #[test]
    fn test_canonicalize_allows_private_hosts() {
        assert!(canonicalize_feed_url("http://192.168.1.10/feed").is_ok());
    }

    #[test]
    fn test_valid_urls() {
        assert!(validate_url("https://example.com/feed.xml").is_ok());
        assert!(validate_url("http://news.example.org").is_ok());
    }

    #[test]
    fn test_invalid_schemes() {
        assert!(validate_url("file:///etc/passwd").is_err());
        assert!(validate_url("ftp://example.com").is_err());
    }

    #[test]
    fn test_localhost_rejected() {
        assert!(validate_url("http://localhost/feed").is_err());
        assert!(validate_url("http://127.0.0.1/feed").is_err());
        assert!(validate_url("http://[::1]/feed").is_err());
    }

    #[test]
    fn test_private_ips_rejected() {
        assert!(validate_url("http://192.168.1.1/feed").is_err());
        assert!(validate_url("http://10.0.0.1:3000/feed").is_err());
        assert!(validate_url("http://169.254.1.1/feed").is_err());
        assert!(validate_url("http://[fe80::1]/feed").is_err());
        assert!(validate_url("http://0.0.0.0/feed").is_err());
    }
}
