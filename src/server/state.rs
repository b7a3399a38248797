use crate::collab::Collaborators;
use crate::config::Config;
use crate::error::Result;
use crate::quality::QualityMemory;
use crate::session::{Session, SessionHandle};
use crate::transport::dns::RewriteRules;
use crate::transport::{Transport, TransportOptions};
use std::sync::{Arc, RwLock};
use std::time::Instant;

/// Application state shared across all handlers.
#[derive(Clone)]
pub struct AppState {
    /// Application configuration
    pub config: Arc<Config>,
    /// The single active playback session
    pub session: SessionHandle,
    /// Remembered quality choices, bounded LRU, constructed once
    pub quality_memory: Arc<QualityMemory>,
    /// External collaborator set
    pub collab: Collaborators,
    /// Transport is swappable: a new session may carry new network policy
    transport: Arc<RwLock<Arc<Transport>>>,
    pub started_at: Instant,
}

impl AppState {
    /// Create AppState with inert collaborators (tests, headless use).
    pub fn new(config: Config) -> Result<Self> {
        Self::with_collaborators(config, Collaborators::inert())
    }

    pub fn with_collaborators(config: Config, collab: Collaborators) -> Result<Self> {
        let transport = Transport::new(Self::transport_options(&config)?);
        Ok(Self {
            quality_memory: Arc::new(QualityMemory::new(config.quality_history)),
            config: Arc::new(config),
            session: SessionHandle::new(),
            collab,
            transport: Arc::new(RwLock::new(Arc::new(transport))),
            started_at: Instant::now(),
        })
    }

    /// Transport options derived from global configuration.
    fn transport_options(config: &Config) -> Result<TransportOptions> {
        let rules = match &config.dns_rewrites {
            Some(json) => RewriteRules::from_json(json)?,
            None => RewriteRules::default(),
        };
        Ok(TransportOptions {
            timeout: Some(config.timeout),
            verify_tls: config.verify_tls,
            proxy: config.proxy_server.clone(),
            client_cert: config.client_cert.clone(),
            ip_mode: config.ip_mode,
            rules,
        })
    }

    pub fn transport(&self) -> Arc<Transport> {
        self.transport.read().unwrap_or_else(|p| p.into_inner()).clone()
    }

    /// Begin a playback session, optionally replacing the transport policy
    /// with session-scoped overrides.
    pub fn start_session(
        &self,
        session: Session,
        transport_overrides: Option<TransportOptions>,
    ) -> String {
        if let Some(options) = transport_overrides {
            *self.transport.write().unwrap_or_else(|p| p.into_inner()) =
                Arc::new(Transport::new(options));
        }
        self.session.start(session)
    }
}
