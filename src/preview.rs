//! Link previews for URLs found in message bodies.
//!
//! The fetch never reaches loopback, link-local, private or metadata
//! addresses. Redirects are followed by hand so that every hop is resolved and
//! checked before a connection is made, and the request for a hop is pinned to
//! the addresses that passed the check.

use std::{
    net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr},
    sync::Arc,
    time::Duration,
};

use tracing::debug;

use crate::{
    consts::{
        PREVIEW_MAX_HTML_BYTES, PREVIEW_MAX_REDIRECTS, PREVIEW_REQUEST_TIMEOUT_SECS,
        PREVIEW_USER_AGENT,
    },
    error::{Error, Result},
    model::UrlPreview,
    util::read_limited_body,
};

/// Decides which resolved addresses a preview may connect to.
pub trait AddressGuard: Send + Sync {
    /// `Some(reason)` when `ip` must not be contacted.
    fn block_reason(&self, ip: IpAddr) -> Option<&'static str>;

    fn is_blocked_hostname(&self, host: &str) -> bool {
        is_blocked_preview_hostname(host)
    }
}

/// Only globally routable unicast addresses.
#[derive(Debug, Clone, Copy, Default)]
pub struct PublicOnly;

impl AddressGuard for PublicOnly {
    fn block_reason(&self, ip: IpAddr) -> Option<&'static str> {
        preview_block_reason_for_ip(ip)
    }
}

#[derive(Debug, Clone)]
pub struct PreviewLimits {
    pub request_timeout: Duration,
    /// Budget for the whole redirect chain including DNS lookups.
    pub total_timeout: Duration,
    pub max_redirects: usize,
    pub max_body_bytes: usize,
}

impl Default for PreviewLimits {
    fn default() -> Self {
        Self {
            request_timeout: Duration::from_secs(PREVIEW_REQUEST_TIMEOUT_SECS),
            total_timeout: Duration::from_secs(PREVIEW_REQUEST_TIMEOUT_SECS * 2),
            max_redirects: PREVIEW_MAX_REDIRECTS,
            max_body_bytes: PREVIEW_MAX_HTML_BYTES,
        }
    }
}

#[derive(Clone)]
pub struct PreviewFetcher {
    limits: PreviewLimits,
    guard: Arc<dyn AddressGuard>,
}

impl Default for PreviewFetcher {
    fn default() -> Self {
        Self::new(PreviewLimits::default())
    }
}

impl PreviewFetcher {
    pub fn new(limits: PreviewLimits) -> Self {
        Self::with_guard(limits, Arc::new(PublicOnly))
    }

    pub fn with_guard(limits: PreviewLimits, guard: Arc<dyn AddressGuard>) -> Self {
        Self { limits, guard }
    }

    /// Fetches `url` and extracts title, description, site name and image.
    /// Any policy violation, timeout or non-2xx final response is an error.
    pub async fn preview(&self, url: &str) -> Result<UrlPreview> {
        let total = self.limits.total_timeout;
        match tokio::time::timeout(total, self.fetch(url)).await {
            Ok(result) => result,
            Err(_) => Err(Error::Timeout(total)),
        }
    }

    async fn fetch(&self, url: &str) -> Result<UrlPreview> {
        let mut current_url = reqwest::Url::parse(url.trim())
            .map_err(|error| Error::Config(format!("Invalid preview URL: {error}")))?;
        let max_redirects = self.limits.max_redirects;

        for redirect_hops in 0..=max_redirects {
            let pinned = self.enforce_target_policy(&current_url).await?;
            let client = self.client_for(&current_url, &pinned)?;

            let response = client
                .get(current_url.clone())
                .header(reqwest::header::USER_AGENT, PREVIEW_USER_AGENT)
                .header(reqwest::header::ACCEPT, "text/html,application/xhtml+xml")
                .send()
                .await
                .map_err(|error| Error::Transport(format!("Preview request failed: {error}")))?;

            if response.status().is_redirection() {
                if redirect_hops == max_redirects {
                    return Err(Error::Policy(format!(
                        "Preview request redirected too many times (>{max_redirects})"
                    )));
                }
                let location = response
                    .headers()
                    .get(reqwest::header::LOCATION)
                    .ok_or_else(|| {
                        Error::Protocol("Preview redirect missing location header".to_string())
                    })?;
                let location_value = location.to_str().map_err(|error| {
                    Error::Protocol(format!("Preview redirect location is invalid: {error}"))
                })?;
                current_url = resolve_preview_redirect_url(&current_url, location_value)?;
                debug!(hop = redirect_hops + 1, url = %current_url, "preview redirect");
                continue;
            }

            if !response.status().is_success() {
                return Err(Error::Http {
                    status: response.status().as_u16(),
                    body: format!("preview of {current_url}"),
                });
            }

            let max_bytes = self.limits.max_body_bytes;
            if let Some(content_length) = response.content_length() {
                if content_length > max_bytes as u64 {
                    return Err(Error::Policy(format!(
                        "Preview response too large ({content_length} bytes > {max_bytes} bytes)"
                    )));
                }
            }

            let content_type = response
                .headers()
                .get(reqwest::header::CONTENT_TYPE)
                .and_then(|value| value.to_str().ok())
                .unwrap_or("")
                .to_ascii_lowercase();
            if !content_type.contains("text/html") {
                return Ok(UrlPreview {
                    url: current_url.to_string(),
                    title: None,
                    description: None,
                    site_name: current_url.host_str().map(ToString::to_string),
                    image: None,
                });
            }

            let body = read_limited_preview_body(response, max_bytes).await?;
            return Ok(self.build_preview(&current_url, &body));
        }

        Err(Error::Policy(
            "Preview request failed after redirects".to_string(),
        ))
    }

    /// Checks scheme, hostname and every resolved address. Returns the
    /// addresses the request is pinned to (empty for IP-literal hosts).
    async fn enforce_target_policy(&self, url: &reqwest::Url) -> Result<Vec<SocketAddr>> {
        ensure_preview_http_scheme(url)?;

        let host = url
            .host_str()
            .ok_or_else(|| Error::Policy("Preview URL is missing a host".to_string()))?;
        if self.guard.is_blocked_hostname(host) {
            return Err(Error::Policy(format!(
                "Preview blocked for restricted hostname '{host}'"
            )));
        }

        if let Some(ip) = parse_host_ip(host) {
            if let Some(reason) = self.guard.block_reason(ip) {
                return Err(Error::Policy(format!(
                    "Preview blocked for {reason} target '{ip}'"
                )));
            }
            return Ok(Vec::new());
        }

        let port = url.port_or_known_default().ok_or_else(|| {
            Error::Policy("Preview URL missing a known port for scheme".to_string())
        })?;
        let addrs = resolve_preview_domain_addrs(host, port).await?;
        for addr in &addrs {
            if let Some(reason) = self.guard.block_reason(addr.ip()) {
                return Err(Error::Policy(format!(
                    "Preview blocked for {reason} target (domain '{host}' resolved to {})",
                    addr.ip()
                )));
            }
        }
        Ok(addrs)
    }

    fn client_for(&self, url: &reqwest::Url, pinned: &[SocketAddr]) -> Result<reqwest::Client> {
        let mut builder = reqwest::Client::builder()
            .timeout(self.limits.request_timeout)
            .redirect(reqwest::redirect::Policy::none())
            .no_proxy();
        if let (Some(host), false) = (url.host_str(), pinned.is_empty()) {
            builder = builder.resolve_to_addrs(host, pinned);
        }
        builder
            .build()
            .map_err(|error| Error::Transport(format!("Failed to build preview HTTP client: {error}")))
    }

    fn build_preview(&self, url: &reqwest::Url, html: &str) -> UrlPreview {
        let doc = scraper::Html::parse_document(html);
        let title = find_meta(&doc, &["og:title"]).or_else(|| find_title(&doc));
        let description = find_meta(&doc, &["og:description", "description"]);
        let site_name = find_meta(&doc, &["og:site_name"])
            .or_else(|| url.host_str().map(ToString::to_string));
        let image = find_meta(&doc, &["og:image"])
            .and_then(|value| self.resolve_meta_url(url, &value));

        UrlPreview {
            url: url.to_string(),
            title,
            description,
            site_name,
            image,
        }
    }

    /// Image URLs are only checked syntactically; they are never fetched here.
    fn resolve_meta_url(&self, base_url: &reqwest::Url, raw: &str) -> Option<String> {
        if raw.trim().is_empty() {
            return None;
        }
        let resolved = match reqwest::Url::parse(raw) {
            Ok(url) => url,
            Err(_) => base_url.join(raw).ok()?,
        };
        if !matches!(resolved.scheme(), "http" | "https") {
            return None;
        }
        let host = resolved.host_str()?;
        if self.guard.is_blocked_hostname(host) {
            return None;
        }
        if let Some(ip) = parse_host_ip(host) {
            if self.guard.block_reason(ip).is_some() {
                return None;
            }
        }
        Some(resolved.to_string())
    }
}

fn ensure_preview_http_scheme(url: &reqwest::Url) -> Result<()> {
    match url.scheme() {
        "http" | "https" => Ok(()),
        other => Err(Error::Policy(format!(
            "Only http/https URLs are supported for previews (got '{other}')"
        ))),
    }
}

fn parse_host_ip(host: &str) -> Option<IpAddr> {
    host.trim_start_matches('[')
        .trim_end_matches(']')
        .parse::<IpAddr>()
        .ok()
}

pub fn is_blocked_preview_hostname(host: &str) -> bool {
    let normalized = host.trim().trim_end_matches('.').to_ascii_lowercase();
    if normalized.is_empty() {
        return true;
    }
    if normalized == "localhost" || normalized.ends_with(".localhost") {
        return true;
    }
    if normalized.ends_with(".internal") || normalized.ends_with(".local") {
        return true;
    }
    matches!(
        normalized.as_str(),
        "metadata"
            | "metadata.google.internal"
            | "metadata.azure.internal"
            | "instance-data.ec2.internal"
    )
}

pub fn preview_block_reason_for_ip(ip: IpAddr) -> Option<&'static str> {
    match ip {
        IpAddr::V4(v4) => block_reason_v4(v4),
        IpAddr::V6(v6) => block_reason_v6(v6),
    }
}

fn block_reason_v4(v4: Ipv4Addr) -> Option<&'static str> {
    let octets = v4.octets();
    if matches!(
        octets,
        [169, 254, 169, 254] | [169, 254, 170, 2] | [100, 100, 100, 200]
    ) {
        return Some("metadata endpoint");
    }
    if v4.is_unspecified() || octets[0] == 0 {
        return Some("unspecified");
    }
    if v4.is_loopback() {
        return Some("loopback");
    }
    if v4.is_link_local() {
        return Some("link-local");
    }
    if v4.is_private() {
        return Some("private");
    }
    // 100.64.0.0/10 carrier-grade NAT
    if octets[0] == 100 && (octets[1] & 0xc0) == 64 {
        return Some("shared address space");
    }
    // 198.18.0.0/15 benchmarking
    if octets[0] == 198 && (octets[1] & 0xfe) == 18 {
        return Some("benchmarking");
    }
    if v4.is_broadcast() || v4.is_multicast() || octets[0] >= 240 {
        return Some("non-unicast");
    }
    None
}

fn block_reason_v6(v6: Ipv6Addr) -> Option<&'static str> {
    if v6 == Ipv6Addr::new(0xfd00, 0x0ec2, 0, 0, 0, 0, 0, 0x0254) {
        return Some("metadata endpoint");
    }
    if v6.is_unspecified() {
        return Some("unspecified");
    }
    if v6.is_loopback() {
        return Some("loopback");
    }
    if let Some(mapped) = v6.to_ipv4_mapped() {
        return block_reason_v4(mapped);
    }
    let segments = v6.segments();
    // 64:ff9b::/96 NAT64 embeds an IPv4 destination
    if segments[..6] == [0x64, 0xff9b, 0, 0, 0, 0] {
        let [a, b] = segments[6].to_be_bytes();
        let [c, d] = segments[7].to_be_bytes();
        return block_reason_v4(Ipv4Addr::new(a, b, c, d));
    }
    if (segments[0] & 0xffc0) == 0xfe80 {
        return Some("link-local");
    }
    if (segments[0] & 0xfe00) == 0xfc00 || (segments[0] & 0xffc0) == 0xfec0 {
        return Some("private");
    }
    if v6.is_multicast() {
        return Some("non-unicast");
    }
    None
}

async fn resolve_preview_domain_addrs(domain: &str, port: u16) -> Result<Vec<SocketAddr>> {
    let resolved = tokio::net::lookup_host((domain, port))
        .await
        .map_err(|error| {
            Error::Transport(format!("Failed to resolve preview host '{domain}': {error}"))
        })?;
    let mut addrs: Vec<SocketAddr> = Vec::new();
    for addr in resolved {
        if !addrs.contains(&addr) {
            addrs.push(addr);
        }
    }
    if addrs.is_empty() {
        return Err(Error::Transport(format!(
            "Failed to resolve preview host '{domain}' to an IP address"
        )));
    }
    Ok(addrs)
}

fn resolve_preview_redirect_url(
    current_url: &reqwest::Url,
    location: &str,
) -> Result<reqwest::Url> {
    let trimmed = location.trim();
    if trimmed.is_empty() {
        return Err(Error::Protocol(
            "Preview redirect location is empty".to_string(),
        ));
    }
    let next = current_url
        .join(trimmed)
        .map_err(|error| Error::Protocol(format!("Invalid preview redirect location: {error}")))?;
    ensure_preview_http_scheme(&next)?;
    Ok(next)
}

async fn read_limited_preview_body(response: reqwest::Response, max_bytes: usize) -> Result<String> {
    let body = read_limited_body(response, max_bytes, "Preview response").await?;
    Ok(String::from_utf8_lossy(&body).into_owned())
}

fn find_title(doc: &scraper::Html) -> Option<String> {
    let selector = scraper::Selector::parse("title").ok()?;
    let el = doc.select(&selector).next()?;
    let text: String = el.text().collect();
    let trimmed = text.trim();
    if trimmed.is_empty() {
        None
    } else {
        Some(trimmed.to_string())
    }
}

fn find_meta(doc: &scraper::Html, keys: &[&str]) -> Option<String> {
    let selector = scraper::Selector::parse("meta").ok()?;
    // first key wins over later keys, regardless of tag order
    for key in keys {
        for el in doc.select(&selector) {
            let prop = el
                .value()
                .attr("property")
                .or_else(|| el.value().attr("name"))
                .unwrap_or("");
            if !prop.eq_ignore_ascii_case(key) {
                continue;
            }
            if let Some(content) = el.value().attr("content") {
                let trimmed = content.trim();
                if !trimmed.is_empty() {
                    return Some(trimmed.to_string());
                }
            }
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    fn v4(a: u8, b: u8, c: u8, d: u8) -> IpAddr {
        IpAddr::V4(Ipv4Addr::new(a, b, c, d))
    }

    #[test]
    fn blocks_internal_ipv4_ranges() {
        for ip in [
            v4(127, 0, 0, 1),
            v4(10, 1, 2, 3),
            v4(172, 16, 0, 1),
            v4(172, 31, 255, 255),
            v4(192, 168, 1, 1),
            v4(169, 254, 169, 254),
            v4(169, 254, 3, 4),
            v4(100, 64, 0, 1),
            v4(0, 0, 0, 0),
            v4(0, 1, 2, 3),
            v4(255, 255, 255, 255),
            v4(224, 0, 0, 1),
            v4(198, 18, 0, 1),
        ] {
            assert!(preview_block_reason_for_ip(ip).is_some(), "{ip} should be blocked");
        }
    }

    #[test]
    fn allows_public_ipv4() {
        for ip in [v4(93, 184, 216, 34), v4(1, 1, 1, 1), v4(172, 32, 0, 1), v4(100, 128, 0, 1)] {
            assert_eq!(preview_block_reason_for_ip(ip), None, "{ip} should be allowed");
        }
    }

    #[test]
    fn blocks_internal_ipv6_and_embedded_ipv4() {
        for text in [
            "::1",
            "::",
            "fe80::1",
            "fd00::1",
            "fc12::1",
            "fd00:ec2::254",
            "::ffff:127.0.0.1",
            "::ffff:10.0.0.1",
            "64:ff9b::a9fe:a9fe",
            "ff02::1",
        ] {
            let ip: IpAddr = text.parse().unwrap();
            assert!(preview_block_reason_for_ip(ip).is_some(), "{ip} should be blocked");
        }
        let public: IpAddr = "2606:4700:4700::1111".parse().unwrap();
        assert_eq!(preview_block_reason_for_ip(public), None);
    }

    #[test]
    fn metadata_reason_is_specific() {
        assert_eq!(
            preview_block_reason_for_ip(v4(169, 254, 169, 254)),
            Some("metadata endpoint")
        );
    }

    #[test]
    fn blocks_restricted_hostnames() {
        assert!(is_blocked_preview_hostname("localhost"));
        assert!(is_blocked_preview_hostname("LOCALHOST."));
        assert!(is_blocked_preview_hostname("api.localhost"));
        assert!(is_blocked_preview_hostname("metadata.google.internal"));
        assert!(is_blocked_preview_hostname("printer.local"));
        assert!(is_blocked_preview_hostname(""));
        assert!(!is_blocked_preview_hostname("example.com"));
    }

    #[test]
    fn redirect_resolution_rejects_other_schemes() {
        let base = reqwest::Url::parse("https://example.com/a/b").unwrap();
        assert_eq!(
            resolve_preview_redirect_url(&base, "../c").unwrap().as_str(),
            "https://example.com/c"
        );
        assert!(matches!(
            resolve_preview_redirect_url(&base, "file:///etc/passwd"),
            Err(Error::Policy(_))
        ));
        assert!(resolve_preview_redirect_url(&base, "  ").is_err());
    }

    #[test]
    fn extracts_metadata_with_fallbacks() {
        let fetcher = PreviewFetcher::default();
        let url = reqwest::Url::parse("https://news.example.com/story").unwrap();
        let html = r#"<html><head>
            <title> Fallback title </title>
            <meta name="description" content="plain description">
            <meta property="og:description" content="og description">
            <meta property="og:image" content="/img/cover.png">
        </head></html>"#;
        let preview = fetcher.build_preview(&url, html);
        assert_eq!(preview.title.as_deref(), Some("Fallback title"));
        assert_eq!(preview.description.as_deref(), Some("og description"));
        assert_eq!(preview.site_name.as_deref(), Some("news.example.com"));
        assert_eq!(
            preview.image.as_deref(),
            Some("https://news.example.com/img/cover.png")
        );
    }

    #[test]
    fn drops_images_pointing_inward() {
        let fetcher = PreviewFetcher::default();
        let url = reqwest::Url::parse("https://example.com/").unwrap();
        for raw in [
            "http://127.0.0.1/x.png",
            "http://[::1]/x.png",
            "http://localhost/x.png",
            "javascript:alert(1)",
            "",
        ] {
            assert_eq!(fetcher.resolve_meta_url(&url, raw), None, "{raw}");
        }
    }

    #[tokio::test]
    async fn rejects_literal_internal_targets_before_connecting() {
        let fetcher = PreviewFetcher::default();
        for url in [
            "http://127.0.0.1:9/",
            "http://[::1]:9/",
            "http://10.0.0.1/",
            "http://169.254.169.254/latest/meta-data/",
            "http://localhost/",
            "ftp://example.com/",
        ] {
            assert!(
                matches!(fetcher.preview(url).await, Err(Error::Policy(_))),
                "{url} should be refused by policy"
            );
        }
        assert!(matches!(
            fetcher.preview("not a url").await,
            Err(Error::Config(_))
        ));
    }
}
