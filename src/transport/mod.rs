//! Transport layer: HTTP with per-destination network policy.
//!
//! Redirects are never followed here — the request handler inspects
//! `Location` itself. Connections are pooled per *partition*: any difference
//! in DNS rewrite target, resolver identity, source interface, proxy, or TLS
//! settings yields a distinct `reqwest::Client`, so two logical destinations
//! sharing a hostname never share a socket improperly.

pub mod dns;

use crate::error::{ProxyError, Result};
use dashmap::DashMap;
use dns::{IpMode, ResolverChain, RewriteRule, RewriteRules};
use reqwest::dns::{Addrs, Name, Resolve, Resolving};
use reqwest::header::HeaderMap;
use reqwest::{Client, Identity, Method, Proxy, redirect};
use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::io::Write;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempPath;
use tracing::{debug, info};
use url::Url;

/// Network policy snapshot for the active session.
#[derive(Debug, Clone, Default)]
pub struct TransportOptions {
    pub timeout: Option<Duration>,
    pub verify_tls: bool,
    /// Session-wide proxy server (per-rule proxies take precedence).
    pub proxy: Option<String>,
    /// Client certificate: inline PEM, a filesystem path, or a URL to
    /// download once and cache.
    pub client_cert: Option<String>,
    pub ip_mode: IpMode,
    pub rules: RewriteRules,
}

impl TransportOptions {
    pub fn verified() -> Self {
        Self {
            verify_tls: true,
            ..Default::default()
        }
    }
}

/// Adapter plugging [`ResolverChain`] into reqwest's DNS hook.
struct ChainDns(Arc<ResolverChain>);

impl Resolve for ChainDns {
    fn resolve(&self, name: Name) -> Resolving {
        let chain = self.0.clone();
        Box::pin(async move {
            let addrs = chain
                .resolve(name.as_str())
                .await
                .map_err(|e| Box::new(e) as Box<dyn std::error::Error + Send + Sync>)?;
            Ok(Box::new(addrs.into_iter().map(|ip| SocketAddr::new(ip, 0))) as Addrs)
        })
    }
}

pub struct Transport {
    options: TransportOptions,
    chain: Arc<ResolverChain>,
    clients: DashMap<u64, Client>,
    /// Downloaded client certificates, keyed by source URL. The temp path
    /// is deleted when the transport is dropped.
    cert_cache: DashMap<String, Arc<(TempPath, Vec<u8>)>>,
}

impl Transport {
    pub fn new(options: TransportOptions) -> Self {
        let chain = Arc::new(ResolverChain::new(
            options.rules.clone(),
            options.ip_mode,
        ));
        Self {
            options,
            chain,
            clients: DashMap::new(),
            cert_cache: DashMap::new(),
        }
    }

    pub fn options(&self) -> &TransportOptions {
        &self.options
    }

    /// Issue a request. Redirects are surfaced, not followed.
    pub async fn request(
        &self,
        method: Method,
        url: &str,
        headers: HeaderMap,
        body: Option<Vec<u8>>,
    ) -> Result<reqwest::Response> {
        let mut url = url.to_string();
        let rule = Url::parse(&url)
            .ok()
            .and_then(|u| u.host_str().map(str::to_string))
            .and_then(|host| self.options.rules.matching(&host).cloned());

        // URL-substring substitution applies before anything touches the wire.
        if let Some(RewriteRule { replace: Some((from, to)), .. }) = &rule {
            let substituted = url.replace(from.as_str(), to);
            if substituted != url {
                debug!("URL substitution: {} -> {}", url, substituted);
                url = substituted;
            }
        }

        let proxy = rule
            .as_ref()
            .and_then(|r| r.proxy.clone())
            .or_else(|| self.options.proxy.clone());
        let via_proxy = proxy.is_some();

        let client = self.client_for(rule.as_ref(), proxy).await?;

        let mut request = client.request(method, &url).headers(headers);
        if let Some(body) = body {
            request = request.body(body);
        }

        request
            .send()
            .await
            .map_err(|e| ProxyError::upstream(e, via_proxy))
    }

    /// Partition key: every field that must never share a socket.
    fn partition_key(&self, rule: Option<&RewriteRule>, proxy: &Option<String>) -> u64 {
        let mut h = DefaultHasher::new();
        self.options.verify_tls.hash(&mut h);
        self.options.client_cert.hash(&mut h);
        self.options.ip_mode.hash(&mut h);
        proxy.hash(&mut h);
        if let Some(rule) = rule {
            rule.ip.hash(&mut h);
            rule.resolver.hash(&mut h);
            rule.interface.hash(&mut h);
        }
        h.finish()
    }

    async fn client_for(&self, rule: Option<&RewriteRule>, proxy: Option<String>) -> Result<Client> {
        let key = self.partition_key(rule, &proxy);
        if let Some(client) = self.clients.get(&key) {
            return Ok(client.clone());
        }

        let mut builder = Client::builder()
            .redirect(redirect::Policy::none())
            .pool_idle_timeout(Duration::from_secs(90))
            .pool_max_idle_per_host(10)
            .cookie_store(true)
            .use_rustls_tls()
            .dns_resolver(Arc::new(ChainDns(self.chain.clone())));

        if let Some(timeout) = self.options.timeout {
            builder = builder.timeout(timeout);
        }
        if !self.options.verify_tls {
            builder = builder.danger_accept_invalid_certs(true);
        }
        if let Some(interface) = rule.and_then(|r| r.interface) {
            builder = builder.local_address(interface);
        }
        if let Some(proxy_url) = &proxy {
            let proxy = Proxy::all(proxy_url)
                .map_err(|e| ProxyError::Internal(format!("bad proxy {proxy_url:?}: {e}")))?;
            builder = builder.proxy(proxy);
        }
        if let Some(cert_source) = self.options.client_cert.clone() {
            let pem = self.load_client_cert(&cert_source).await?;
            let identity = Identity::from_pem(&pem)
                .map_err(|e| ProxyError::Internal(format!("bad client certificate: {e}")))?;
            builder = builder.identity(identity);
        }

        let client = builder
            .build()
            .map_err(|e| ProxyError::Internal(format!("failed to build HTTP client: {e}")))?;

        info!("Built transport client for partition {:016x}", key);
        self.clients.insert(key, client.clone());
        Ok(client)
    }

    /// Load the client certificate PEM. A URL source is downloaded once and
    /// cached to a temp path for the life of the transport.
    async fn load_client_cert(&self, source: &str) -> Result<Vec<u8>> {
        if source.starts_with("-----BEGIN") {
            return Ok(source.as_bytes().to_vec());
        }
        if source.starts_with("http://") || source.starts_with("https://") {
            if let Some(cached) = self.cert_cache.get(source) {
                return Ok(cached.1.clone());
            }
            info!("Downloading client certificate from {}", source);
            let response = reqwest::get(source)
                .await
                .map_err(|e| ProxyError::upstream(e, false))?
                .error_for_status()
                .map_err(|e| ProxyError::upstream(e, false))?;
            let pem = response
                .bytes()
                .await
                .map_err(|e| ProxyError::upstream(e, false))?
                .to_vec();

            let mut file = tempfile::NamedTempFile::new()?;
            file.write_all(&pem)?;
            let path = file.into_temp_path();
            self.cert_cache
                .insert(source.to_string(), Arc::new((path, pem.clone())));
            return Ok(pem);
        }
        Ok(std::fs::read(source)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use dns::RewriteRule;

    fn rule_with(host: &str, resolver: Option<&str>) -> RewriteRule {
        RewriteRule {
            host: host.to_string(),
            ip: None,
            resolver: resolver.map(str::to_string),
            proxy: None,
            interface: None,
            replace: None,
        }
    }

    #[test]
    fn partitions_differ_per_resolver_identity() {
        let transport = Transport::new(TransportOptions::verified());
        let a = rule_with("a.example.com", Some("https://1.1.1.1/dns-query"));
        let b = rule_with("a.example.com", Some("9.9.9.9"));
        assert_ne!(
            transport.partition_key(Some(&a), &None),
            transport.partition_key(Some(&b), &None),
        );
    }

    #[test]
    fn partitions_differ_per_proxy() {
        let transport = Transport::new(TransportOptions::verified());
        assert_ne!(
            transport.partition_key(None, &Some("http://127.0.0.1:8888".into())),
            transport.partition_key(None, &None),
        );
    }

    #[test]
    fn same_policy_shares_a_partition() {
        let transport = Transport::new(TransportOptions::verified());
        let a = rule_with("a.example.com", Some("9.9.9.9"));
        let b = rule_with("b.example.com", Some("9.9.9.9"));
        // Host is not part of the key — reqwest already partitions by
        // host:port inside one client.
        assert_eq!(
            transport.partition_key(Some(&a), &None),
            transport.partition_key(Some(&b), &None),
        );
    }

    #[tokio::test]
    async fn inline_pem_is_used_verbatim() {
        let transport = Transport::new(TransportOptions::verified());
        let pem = "-----BEGIN CERTIFICATE-----\nabc\n-----END CERTIFICATE-----";
        let loaded = transport.load_client_cert(pem).await.unwrap();
        assert_eq!(loaded, pem.as_bytes());
    }
}
