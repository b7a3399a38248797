//! DNS rewrite rules and the resolver chain.
//!
//! Resolution order for a host: exact literal rewrite → per-host custom
//! resolver (DoH URL or plain DNS server IP) → system resolver. Every step
//! honors the configured IP-family preference; the first resolver that
//! returns any address wins.

use crate::error::{ProxyError, Result};
use dashmap::DashMap;
use hickory_resolver::TokioResolver;
use hickory_resolver::config::{LookupIpStrategy, NameServerConfigGroup, ResolverConfig};
use hickory_resolver::name_server::TokioConnectionProvider;
use regex::Regex;
use serde::Deserialize;
use std::net::IpAddr;
use std::sync::Arc;
use tracing::{debug, warn};
use url::Url;

/// Address-family preference applied at every resolution step.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum IpMode {
    OnlyV4,
    OnlyV6,
    #[default]
    PreferV4,
    PreferV6,
}

impl IpMode {
    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "only_v4" | "v4" => Some(Self::OnlyV4),
            "only_v6" | "v6" => Some(Self::OnlyV6),
            "prefer_v4" => Some(Self::PreferV4),
            "prefer_v6" => Some(Self::PreferV6),
            _ => None,
        }
    }

    fn strategy(self) -> LookupIpStrategy {
        match self {
            Self::OnlyV4 => LookupIpStrategy::Ipv4Only,
            Self::OnlyV6 => LookupIpStrategy::Ipv6Only,
            Self::PreferV4 => LookupIpStrategy::Ipv4thenIpv6,
            Self::PreferV6 => LookupIpStrategy::Ipv6thenIpv4,
        }
    }

    /// Filter and order a mixed address list according to the preference.
    fn apply(self, addrs: Vec<IpAddr>) -> Vec<IpAddr> {
        let (v4, v6): (Vec<IpAddr>, Vec<IpAddr>) = addrs.into_iter().partition(|a| a.is_ipv4());
        match self {
            Self::OnlyV4 => v4,
            Self::OnlyV6 => v6,
            Self::PreferV4 => v4.into_iter().chain(v6).collect(),
            Self::PreferV6 => v6.into_iter().chain(v4).collect(),
        }
    }
}

/// One rewrite rule: a host glob plus the actions it carries.
///
/// The DNS-type actions (`ip`, `resolver`) are alternatives — `ip` wins when
/// both are present — while `proxy`, `interface`, and `replace` all apply
/// together with whichever DNS action matched.
#[derive(Debug, Clone, Deserialize, PartialEq)]
pub struct RewriteRule {
    /// Glob matched against the request host, e.g. `*.cdn.example.com`.
    pub host: String,
    /// Literal IP substitute.
    #[serde(default)]
    pub ip: Option<IpAddr>,
    /// Custom resolver: a DoH URL (`https://...`) or a DNS server IP.
    #[serde(default)]
    pub resolver: Option<String>,
    /// Proxy server override for this destination.
    #[serde(default)]
    pub proxy: Option<String>,
    /// Source interface (bind address) override.
    #[serde(default)]
    pub interface: Option<IpAddr>,
    /// URL substring substitution, applied before the fetch.
    #[serde(default)]
    pub replace: Option<(String, String)>,
}

/// Ordered rule set; first matching rule wins.
#[derive(Debug, Clone, Default)]
pub struct RewriteRules {
    rules: Vec<(Regex, RewriteRule)>,
}

impl RewriteRules {
    /// Parse the JSON rule list (`[{"host": "*.x.com", "ip": "1.2.3.4"}, ...]`).
    pub fn from_json(json: &str) -> Result<Self> {
        let rules: Vec<RewriteRule> = serde_json::from_str(json)
            .map_err(|e| ProxyError::Internal(format!("bad DNS rewrite rules: {e}")))?;
        Self::new(rules)
    }

    pub fn new(rules: Vec<RewriteRule>) -> Result<Self> {
        let mut compiled = Vec::with_capacity(rules.len());
        for rule in rules {
            let pattern = glob_to_regex(&rule.host)?;
            compiled.push((pattern, rule));
        }
        Ok(Self { rules: compiled })
    }

    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }

    /// First rule whose host glob matches, in declaration order.
    pub fn matching(&self, host: &str) -> Option<&RewriteRule> {
        self.rules
            .iter()
            .find(|(pattern, _)| pattern.is_match(host))
            .map(|(_, rule)| rule)
    }
}

/// Compile a host glob (`*` wildcard only) into an anchored regex.
fn glob_to_regex(glob: &str) -> Result<Regex> {
    let escaped = regex::escape(glob).replace(r"\*", ".*");
    Regex::new(&format!("(?i)^{escaped}$"))
        .map_err(|e| ProxyError::Internal(format!("bad host glob {glob:?}: {e}")))
}

/// Resolver chain shared by all pooled clients.
///
/// Custom resolvers are built lazily per resolver spec and cached, so two
/// rules naming the same DoH endpoint share one hickory instance.
pub struct ResolverChain {
    rules: RewriteRules,
    ip_mode: IpMode,
    custom: DashMap<String, Arc<TokioResolver>>,
}

impl ResolverChain {
    pub fn new(rules: RewriteRules, ip_mode: IpMode) -> Self {
        Self {
            rules,
            ip_mode,
            custom: DashMap::new(),
        }
    }

    pub fn rules(&self) -> &RewriteRules {
        &self.rules
    }

    pub fn ip_mode(&self) -> IpMode {
        self.ip_mode
    }

    /// Resolve `host` through the chain. Empty results are a hard error so
    /// the caller sees a typed DNS failure rather than a connect timeout.
    pub async fn resolve(&self, host: &str) -> Result<Vec<IpAddr>> {
        // A literal IP needs no lookup at all.
        if let Ok(ip) = host.parse::<IpAddr>() {
            return Ok(vec![ip]);
        }

        if let Some(rule) = self.rules.matching(host) {
            if let Some(ip) = rule.ip {
                debug!("DNS rewrite: {} -> {}", host, ip);
                return Ok(vec![ip]);
            }
            if let Some(spec) = &rule.resolver {
                match self.custom_resolve(spec, host).await {
                    Ok(addrs) if !addrs.is_empty() => return Ok(addrs),
                    Ok(_) => {}
                    Err(e) => warn!("Custom resolver {} failed for {}: {}", spec, host, e),
                }
            }
        }

        self.system_resolve(host).await
    }

    async fn custom_resolve(&self, spec: &str, host: &str) -> Result<Vec<IpAddr>> {
        let resolver = match self.custom.get(spec) {
            Some(r) => r.clone(),
            None => {
                let built = Arc::new(self.build_resolver(spec).await?);
                self.custom.insert(spec.to_string(), built.clone());
                built
            }
        };
        let lookup = resolver
            .lookup_ip(host)
            .await
            .map_err(|_| ProxyError::Dns { host: host.to_string() })?;
        let addrs: Vec<IpAddr> = lookup.iter().collect();
        if addrs.is_empty() {
            return Err(ProxyError::Dns { host: host.to_string() });
        }
        Ok(addrs)
    }

    /// Build a hickory resolver for a spec: DoH URL or plain DNS server IP.
    async fn build_resolver(&self, spec: &str) -> Result<TokioResolver> {
        let group = if spec.starts_with("https://") {
            let url = Url::parse(spec)
                .map_err(|e| ProxyError::Internal(format!("bad DoH URL {spec:?}: {e}")))?;
            let doh_host = url
                .host_str()
                .ok_or_else(|| ProxyError::Internal(format!("DoH URL {spec:?} has no host")))?
                .to_string();
            // The DoH endpoint itself may be named by IP or by hostname;
            // a hostname must be bootstrapped through the system resolver.
            let ips: Vec<IpAddr> = match doh_host.parse::<IpAddr>() {
                Ok(ip) => vec![ip],
                Err(_) => self.system_resolve(&doh_host).await?,
            };
            NameServerConfigGroup::from_ips_https(&ips, url.port().unwrap_or(443), doh_host, true)
        } else {
            let ip: IpAddr = spec.parse().map_err(|_| {
                ProxyError::Internal(format!("resolver spec {spec:?} is neither DoH URL nor IP"))
            })?;
            NameServerConfigGroup::from_ips_clear(&[ip], 53, true)
        };

        let config = ResolverConfig::from_parts(None, vec![], group);
        let mut builder =
            TokioResolver::builder_with_config(config, TokioConnectionProvider::default());
        builder.options_mut().ip_strategy = self.ip_mode.strategy();
        Ok(builder.build())
    }

    async fn system_resolve(&self, host: &str) -> Result<Vec<IpAddr>> {
        let addrs: Vec<IpAddr> = tokio::net::lookup_host((host, 0))
            .await
            .map_err(|_| ProxyError::Dns { host: host.to_string() })?
            .map(|sa| sa.ip())
            .collect();
        let ordered = self.ip_mode.apply(addrs);
        if ordered.is_empty() {
            return Err(ProxyError::Dns { host: host.to_string() });
        }
        Ok(ordered)
    }
}
