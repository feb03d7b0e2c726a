//! Resource fetching: the page-load data path.
//!
//! One fetch runs the whole gauntlet: the privacy shield may neutralize
//! or rewrite the request, HSTS upgrades it, cookies are attached from
//! the right jar, the HTTP/3 client carries it, Set-Cookie headers come
//! back through the shield's decision ladder, and cacheable bodies are
//! stored compressed and replayed without touching the network until
//! they go stale.

use std::sync::Arc;

use dashmap::DashMap;
use tracing::debug;
use url::Url;

use crate::cache::CompressionCache;
use crate::error::{CoreError, CoreResult};
use crate::net::http3::Http3Client;
use crate::net::optimizer::NetworkOptimizer;
use crate::net::{header, Headers, HstsStore, HttpRequest, HttpResponse, Method};
use crate::privacy::cookies::CookieFlags;
use crate::privacy::{CookieDecision, PrivacyShield};

struct CachedResource {
    /// Body as stored by the compression engine.
    compressed_body: Vec<u8>,
    status: u16,
    headers: Headers,
    stored_ns: u64,
    max_age_secs: u64,
}

impl CachedResource {
    fn is_fresh(&self) -> bool {
        let age_secs = crate::now_unix_ns().saturating_sub(self.stored_ns) / 1_000_000_000;
        age_secs < self.max_age_secs
    }
}

/// The composed fetch path.
pub struct ResourceFetcher {
    shield: Arc<PrivacyShield>,
    client: Arc<Http3Client>,
    cache: Arc<CompressionCache>,
    hsts: Arc<HstsStore>,
    optimizer: Arc<NetworkOptimizer>,
    resources: DashMap<String, CachedResource>,
}

impl ResourceFetcher {
    pub fn new(
        shield: Arc<PrivacyShield>,
        client: Arc<Http3Client>,
        cache: Arc<CompressionCache>,
        hsts: Arc<HstsStore>,
        optimizer: Arc<NetworkOptimizer>,
    ) -> Arc<Self> {
        Arc::new(Self {
            shield,
            client,
            cache,
            hsts,
            optimizer,
            resources: DashMap::new(),
        })
    }

    /// Fetch one resource on behalf of the page at `source_origin`.
    pub async fn fetch(
        self: &Arc<Self>,
        request: HttpRequest,
        source_origin: &Url,
    ) -> CoreResult<HttpResponse> {
        self.fetch_with_cache(request, source_origin, true).await
    }

    fn fetch_with_cache<'a>(
        self: &'a Arc<Self>,
        request: HttpRequest,
        source_origin: &'a Url,
        use_cache: bool,
    ) -> std::pin::Pin<Box<dyn std::future::Future<Output = CoreResult<HttpResponse>> + Send + 'a>> {
        Box::pin(self.fetch_with_cache_inner(request, source_origin, use_cache))
    }

    async fn fetch_with_cache_inner(
        self: &Arc<Self>,
        request: HttpRequest,
        source_origin: &Url,
        use_cache: bool,
    ) -> CoreResult<HttpResponse> {
        // Shield first: a blocked tracker never reaches the cache or the
        // network, and the host gets a successful empty-body response.
        let request = self.shield.modify_request(request, source_origin);
        if request.url.as_str() == "about:blank" {
            return Ok(HttpResponse::blocked_sink(request.url));
        }

        let mut url = request.url.clone();
        if url.scheme() == "http" {
            if let Some(host) = url.host_str() {
                if self.hsts.requires_https(host) {
                    // Scheme upgrade cannot fail for http URLs.
                    let _ = url.set_scheme("https");
                    debug!(%url, "hsts upgraded request to https");
                }
            }
        }

        let cache_key = url.as_str().to_string();
        if use_cache && request.method == Method::Get {
            let cached = self
                .resources
                .get(&cache_key)
                .map(|c| (c.compressed_body.clone(), c.status, c.headers.clone(), c.is_fresh()));
            if let Some((compressed, status, cached_headers, fresh)) = cached {
                let body = self.cache.decompress(&compressed).await?;
                if fresh {
                    debug!(%url, "serving resource from cache");
                    return Ok(HttpResponse {
                        url,
                        status,
                        headers: cached_headers,
                        body,
                        blocked: false,
                        stale: false,
                    });
                }
                // Stale copy: serve it flagged stale and revalidate in
                // the background.
                debug!(%url, "serving stale resource while revalidating");
                let fetcher = self.clone();
                let revalidate = request.clone();
                let origin = source_origin.clone();
                tokio::spawn(async move {
                    if let Err(e) = fetcher.fetch_with_cache(revalidate, &origin, false).await {
                        debug!("background revalidation failed: {e}");
                    }
                });
                return Ok(HttpResponse {
                    url,
                    status,
                    headers: cached_headers,
                    body,
                    blocked: false,
                    stale: true,
                });
            }
        }

        let host = url
            .host_str()
            .ok_or_else(|| CoreError::Config(format!("url {url} has no host")))?
            .to_string();
        let port = url.port().unwrap_or(443);

        let mut headers = request.headers.clone();
        let cookies = self.shield.jar().cookies_for(source_origin, &host);
        if !cookies.is_empty() {
            let cookie_header = cookies
                .iter()
                .map(|(name, value)| format!("{name}={value}"))
                .collect::<Vec<_>>()
                .join("; ");
            headers.push(("cookie".to_string(), cookie_header));
        }

        // Resume with a stored ticket when one exists, else a fresh
        // handshake through the pool.
        let connection = match self.client.tickets.get(&host, port) {
            Some(ticket) => self.client.connect_0rtt(&host, port, ticket).await?.0,
            None => self.client.resolve_and_connect(&host, port).await?,
        };

        let path = match url.query() {
            Some(query) => format!("{}?{query}", url.path()),
            None => url.path().to_string(),
        };
        let body = request.body.clone().unwrap_or_default();
        let stream = self
            .client
            .request(&connection, request.method, &path, headers, body)
            .await?;
        let status = stream.status;
        let response_headers = stream.headers.clone();
        let body = stream.collect_body().await;

        // Feed the connection's live estimates back into profile
        // selection for subsequent connections.
        {
            let metrics = connection.lock().await.metrics();
            if metrics.exchanges > 0 && !metrics.smoothed_rtt.is_zero() {
                let observed = crate::net::optimizer::ObservedNetwork {
                    bandwidth_mbps: metrics.bandwidth_bytes_per_sec as f64 * 8.0 / 1_000_000.0,
                    rtt_ms: metrics.smoothed_rtt.as_secs_f64() * 1000.0,
                    loss_pct: metrics.loss_rate * 100.0,
                    network_type: crate::net::optimizer::NetworkType::Unknown,
                };
                self.optimizer.optimize_for_observed(&observed);
            }
        }

        self.ingest_cookies(source_origin, &host, &response_headers);

        if let Some(sts) = header(&response_headers, "strict-transport-security") {
            if let Some(max_age_secs) = parse_hsts_max_age(sts) {
                let include_subdomains =
                    sts.to_ascii_lowercase().contains("includesubdomains");
                self.hsts.upsert(&host, include_subdomains, max_age_secs);
            }
        }

        // Cacheable GET bodies go in compressed; replays skip the network.
        if request.method == Method::Get && status == 200 {
            if let Some(max_age_secs) =
                header(&response_headers, "cache-control").and_then(parse_max_age)
            {
                if max_age_secs > 0 {
                    let compressed = self.cache.compress(&body, None, None).await?;
                    self.resources.insert(
                        cache_key,
                        CachedResource {
                            compressed_body: compressed,
                            status,
                            headers: response_headers.clone(),
                            stored_ns: crate::now_unix_ns(),
                            max_age_secs,
                        },
                    );
                }
            }
        }

        Ok(HttpResponse {
            url,
            status,
            headers: response_headers,
            body,
            blocked: false,
            stale: false,
        })
    }

    /// Run every Set-Cookie header through the shield's decision ladder
    /// and store survivors in the right jar.
    fn ingest_cookies(&self, source_origin: &Url, host: &str, headers: &Headers) {
        for (name, value) in headers {
            if !name.eq_ignore_ascii_case("set-cookie") {
                continue;
            }
            let Some((cookie_name, cookie_value, flags)) = parse_set_cookie(value) else {
                continue;
            };
            let decision = self.shield.process_cookie(
                source_origin,
                host,
                &cookie_name,
                &cookie_value,
                &flags,
            );
            if decision != CookieDecision::Block {
                self.shield.jar().store(
                    decision,
                    source_origin,
                    host,
                    &cookie_name,
                    &cookie_value,
                    &flags,
                    self.shield.policy().max_cookie_lifetime_secs,
                );
            }
        }
    }
}

/// Extract max-age from a Cache-Control header.
fn parse_max_age(value: &str) -> Option<u64> {
    value.split(',').find_map(|directive| {
        let directive = directive.trim();
        directive
            .strip_prefix("max-age=")
            .and_then(|age| age.parse().ok())
    })
}

/// Extract max-age from a Strict-Transport-Security header.
fn parse_hsts_max_age(value: &str) -> Option<u64> {
    value.split(';').find_map(|directive| {
        let directive = directive.trim();
        directive
            .strip_prefix("max-age=")
            .and_then(|age| age.parse().ok())
    })
}

/// Minimal Set-Cookie parser: name=value plus the attributes the policy
/// ladder cares about.
fn parse_set_cookie(value: &str) -> Option<(String, String, CookieFlags)> {
    let mut parts = value.split(';');
    let pair = parts.next()?;
    let (name, cookie_value) = pair.split_once('=')?;
    let mut flags = CookieFlags::default();
    for attr in parts {
        let attr = attr.trim();
        if attr.eq_ignore_ascii_case("secure") {
            flags.secure = true;
        } else if attr.eq_ignore_ascii_case("httponly") {
            flags.http_only = true;
        } else if let Some(same_site) = attr
            .to_ascii_lowercase()
            .strip_prefix("samesite=")
            .map(str::to_string)
        {
            flags.same_site = match same_site.as_str() {
                "none" => crate::privacy::cookies::SameSite::None,
                "strict" => crate::privacy::cookies::SameSite::Strict,
                _ => crate::privacy::cookies::SameSite::Lax,
            };
        } else if let Some(age) = attr
            .to_ascii_lowercase()
            .strip_prefix("max-age=")
            .and_then(|a| a.parse::<u64>().ok())
        {
            flags.expires_unix = Some(crate::now_unix_ns() / 1_000_000_000 + age);
        } else if let Some(path) = attr.strip_prefix("Path=").or(attr.strip_prefix("path=")) {
            flags.path = path.to_string();
        }
    }
    Some((name.trim().to_string(), cookie_value.trim().to_string(), flags))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cache_control_max_age_parses() {
        assert_eq!(parse_max_age("max-age=60"), Some(60));
        assert_eq!(parse_max_age("public, max-age=3600, immutable"), Some(3600));
        assert_eq!(parse_max_age("no-store"), None);
    }

    #[test]
    fn set_cookie_lines_parse() {
        let (name, value, flags) =
            parse_set_cookie("sid=abc; SameSite=None; Secure; Max-Age=300; Path=/app").unwrap();
        assert_eq!(name, "sid");
        assert_eq!(value, "abc");
        assert!(flags.secure);
        assert_eq!(flags.same_site, crate::privacy::cookies::SameSite::None);
        assert_eq!(flags.path, "/app");
        assert!(flags.expires_unix.is_some());
    }
}
