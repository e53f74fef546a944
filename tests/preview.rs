use std::{net::IpAddr, sync::Arc, time::Duration};

use gotify_companion::{
    preview::{preview_block_reason_for_ip, AddressGuard, PreviewFetcher, PreviewLimits},
    Error,
};
use wiremock::{
    matchers::{method, path},
    Mock, MockServer, ResponseTemplate,
};

/// Lets the fetcher reach the loopback mock server while keeping every other
/// restriction in place.
struct AllowLoopback;

impl AddressGuard for AllowLoopback {
    fn block_reason(&self, ip: IpAddr) -> Option<&'static str> {
        if ip.is_loopback() {
            None
        } else {
            preview_block_reason_for_ip(ip)
        }
    }
}

fn loopback_fetcher() -> PreviewFetcher {
    PreviewFetcher::with_guard(PreviewLimits::default(), Arc::new(AllowLoopback))
}

fn html(body: &str) -> ResponseTemplate {
    ResponseTemplate::new(200).set_body_raw(body.to_string(), "text/html; charset=utf-8")
}

fn redirect(to: &str) -> ResponseTemplate {
    ResponseTemplate::new(302).insert_header("Location", to)
}

const ARTICLE: &str = r#"<!doctype html><html><head>
<meta property="og:title" content="Release 2.0">
<meta property="og:description" content="What changed">
<meta property="og:site_name" content="Example News">
<meta property="og:image" content="/cover.png">
<title>ignored</title>
</head><body></body></html>"#;

#[tokio::test]
async fn default_guard_refuses_the_loopback_server() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .respond_with(html(ARTICLE))
        .expect(0)
        .mount(&server)
        .await;

    let result = PreviewFetcher::default()
        .preview(&format!("{}/article", server.uri()))
        .await;
    assert!(matches!(result, Err(Error::Policy(_))), "{result:?}");
}

#[tokio::test]
async fn extracts_open_graph_metadata() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/article"))
        .respond_with(html(ARTICLE))
        .mount(&server)
        .await;

    let url = format!("{}/article", server.uri());
    let preview = loopback_fetcher().preview(&url).await.unwrap();
    assert_eq!(preview.url, url);
    assert_eq!(preview.title.as_deref(), Some("Release 2.0"));
    assert_eq!(preview.description.as_deref(), Some("What changed"));
    assert_eq!(preview.site_name.as_deref(), Some("Example News"));
    assert_eq!(
        preview.image.as_deref(),
        Some(format!("{}/cover.png", server.uri()).as_str())
    );
}

#[tokio::test]
async fn follows_redirects_on_the_same_host() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/short"))
        .respond_with(redirect("/article"))
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/article"))
        .respond_with(html(ARTICLE))
        .mount(&server)
        .await;

    let preview = loopback_fetcher()
        .preview(&format!("{}/short", server.uri()))
        .await
        .unwrap();
    assert_eq!(preview.url, format!("{}/article", server.uri()));
}

#[tokio::test]
async fn redirect_into_private_or_metadata_space_is_refused() {
    let server = MockServer::start().await;
    for (route, target) in [
        ("/to-private", "http://10.0.0.1/admin"),
        ("/to-metadata", "http://169.254.169.254/latest/meta-data/"),
        ("/to-localhost", "http://localhost/"),
        ("/to-v6-local", "http://[fd00::1]/"),
        ("/to-file", "file:///etc/passwd"),
    ] {
        Mock::given(method("GET"))
            .and(path(route))
            .respond_with(redirect(target))
            .mount(&server)
            .await;
    }

    let fetcher = loopback_fetcher();
    for route in ["/to-private", "/to-metadata", "/to-localhost", "/to-v6-local", "/to-file"] {
        let result = fetcher.preview(&format!("{}{route}", server.uri())).await;
        assert!(matches!(result, Err(Error::Policy(_))), "{route}: {result:?}");
    }
}

#[tokio::test]
async fn redirect_chain_is_capped() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/loop"))
        .respond_with(redirect("/loop"))
        .mount(&server)
        .await;

    let limits = PreviewLimits {
        max_redirects: 3,
        ..PreviewLimits::default()
    };
    let fetcher = PreviewFetcher::with_guard(limits, Arc::new(AllowLoopback));
    let result = fetcher.preview(&format!("{}/loop", server.uri())).await;
    assert!(matches!(result, Err(Error::Policy(_))), "{result:?}");
    let hops = server.received_requests().await.unwrap_or_default().len();
    assert_eq!(hops, 4);
}

#[tokio::test]
async fn non_success_status_is_a_failure() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .respond_with(ResponseTemplate::new(404))
        .mount(&server)
        .await;

    let result = loopback_fetcher()
        .preview(&format!("{}/missing", server.uri()))
        .await;
    assert!(matches!(result, Err(Error::Http { status: 404, .. })), "{result:?}");
}

#[tokio::test]
async fn oversized_body_is_refused() {
    let server = MockServer::start().await;
    let big = format!("<html><head><title>x</title></head><body>{}</body></html>", "a".repeat(4_096));
    Mock::given(method("GET"))
        .respond_with(html(&big))
        .mount(&server)
        .await;

    let limits = PreviewLimits {
        max_body_bytes: 1_024,
        ..PreviewLimits::default()
    };
    let fetcher = PreviewFetcher::with_guard(limits, Arc::new(AllowLoopback));
    let result = fetcher.preview(&format!("{}/big", server.uri())).await;
    assert!(matches!(result, Err(Error::Policy(_))), "{result:?}");
}

#[tokio::test]
async fn slow_server_times_out() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .respond_with(html(ARTICLE).set_delay(Duration::from_secs(5)))
        .mount(&server)
        .await;

    let limits = PreviewLimits {
        request_timeout: Duration::from_secs(10),
        total_timeout: Duration::from_millis(300),
        ..PreviewLimits::default()
    };
    let fetcher = PreviewFetcher::with_guard(limits, Arc::new(AllowLoopback));
    let result = fetcher.preview(&format!("{}/slow", server.uri())).await;
    assert!(matches!(result, Err(Error::Timeout(_))), "{result:?}");
}

#[tokio::test]
async fn non_html_yields_host_only_preview() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .respond_with(ResponseTemplate::new(200).set_body_raw(vec![0u8; 16], "image/png"))
        .mount(&server)
        .await;

    let preview = loopback_fetcher()
        .preview(&format!("{}/photo.png", server.uri()))
        .await
        .unwrap();
    assert_eq!(preview.title, None);
    assert_eq!(preview.image, None);
    assert_eq!(preview.site_name.as_deref(), Some("127.0.0.1"));
}
