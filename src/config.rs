use crate::quality::QualityPolicy;
use crate::transport::dns::IpMode;
use std::env;
use std::time::Duration;

/// Default ceiling above which responses are streamed through untouched.
/// Manifests are small; anything this big is a segment and must never be
/// parsed as text.
pub const DEFAULT_REWRITE_THRESHOLD: usize = 1024 * 1024;

/// Application configuration loaded from environment variables.
///
/// This doubles as the settings provider the rewriters consult: whitelists,
/// default-language lists, subtitle toggles, quality mode, and transport
/// policy all live here and are snapshotted into the session at playback
/// start.
#[derive(Clone, Debug)]
pub struct Config {
    pub port: u16,
    /// The proxy's own base URL, prefixed onto every rewritten URI.
    pub base_url: String,
    pub is_dev: bool,

    /// Audio language whitelist; empty passes everything.
    pub audio_whitelist: Vec<String>,
    /// Subtitle language whitelist; empty passes everything.
    pub subtitle_whitelist: Vec<String>,
    /// Default-language preference order; `original` is the stream's tagged
    /// original audio language.
    pub default_languages: Vec<String>,
    pub default_subtitles: Vec<String>,
    pub include_forced_subs: bool,
    pub include_non_forced_subs: bool,
    pub audio_description: bool,
    /// Strip FRAME-RATE from HLS variants (player decoder-selection workaround).
    pub remove_framerate: bool,

    pub quality: QualityPolicy,
    /// Bounded size of the remembered-choice history.
    pub quality_history: usize,

    /// Content-length at or above which responses bypass rewriting.
    pub rewrite_threshold: usize,
    pub timeout: Duration,
    pub verify_tls: bool,
    pub proxy_server: Option<String>,
    /// Client certificate: inline PEM, path, or URL.
    pub client_cert: Option<String>,
    /// DNS rewrite rules as JSON (see `transport::dns::RewriteRules`).
    pub dns_rewrites: Option<String>,
    pub ip_mode: IpMode,

    /// Consecutive playback failures before a forced stop.
    pub error_threshold: u32,
    /// Bound on blocking collaborator calls (resolver, chooser, plugin).
    pub collaborator_timeout: Duration,
    /// Android handles DRM component installs itself.
    pub platform_android: bool,
    /// Exposed to the player-item builder; the proxy core does not act on it.
    pub drm_security_level: String,
}

fn env_bool(name: &str, default: bool) -> bool {
    env::var(name)
        .ok()
        .and_then(|v| v.trim().parse().ok())
        .unwrap_or(default)
}

fn env_list(name: &str) -> Vec<String> {
    env::var(name)
        .unwrap_or_default()
        .split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect()
}

impl Config {
    /// Load configuration from environment variables.
    /// In DEV mode, provides sensible defaults. In PROD mode, PORT and
    /// BASE_URL are required.
    pub fn from_env() -> Result<Self, Box<dyn std::error::Error>> {
        let is_dev = env::var("DEV_MODE")
            .unwrap_or_else(|_| "false".to_string())
            .parse()
            .unwrap_or(false);

        let port = if is_dev {
            env::var("PORT")
                .unwrap_or_else(|_| "52104".to_string())
                .parse()?
        } else {
            env::var("PORT")
                .map_err(|_| "PORT is required in production")?
                .parse()?
        };

        let base_url = if is_dev {
            env::var("BASE_URL").unwrap_or_else(|_| format!("http://127.0.0.1:{port}"))
        } else {
            env::var("BASE_URL").map_err(|_| "BASE_URL is required in production")?
        };

        let default_languages = {
            let list = env_list("DEFAULT_LANGUAGES");
            if list.is_empty() {
                vec!["original".to_string()]
            } else {
                list
            }
        };

        let quality = env::var("QUALITY_MODE")
            .ok()
            .and_then(|v| QualityPolicy::parse(&v))
            .unwrap_or(QualityPolicy::Ask);

        let ip_mode = env::var("IP_MODE")
            .ok()
            .and_then(|v| IpMode::parse(&v))
            .unwrap_or_default();

        let timeout_secs: u64 = env::var("TIMEOUT_SECS")
            .unwrap_or_else(|_| "30".to_string())
            .parse()
            .unwrap_or(30);

        let collaborator_timeout_secs: u64 = env::var("COLLABORATOR_TIMEOUT_SECS")
            .unwrap_or_else(|_| "60".to_string())
            .parse()
            .unwrap_or(60);

        let rewrite_threshold = env::var("REWRITE_THRESHOLD")
            .ok()
            .and_then(|v| v.parse().ok())
            .unwrap_or(DEFAULT_REWRITE_THRESHOLD);

        let error_threshold = env::var("ERROR_THRESHOLD")
            .ok()
            .and_then(|v| v.parse().ok())
            .unwrap_or(10);

        let quality_history = env::var("QUALITY_HISTORY")
            .ok()
            .and_then(|v| v.parse().ok())
            .unwrap_or(20);

        Ok(Config {
            port,
            base_url,
            is_dev,
            audio_whitelist: env_list("AUDIO_WHITELIST"),
            subtitle_whitelist: env_list("SUBTITLE_WHITELIST"),
            default_languages,
            default_subtitles: env_list("DEFAULT_SUBTITLES"),
            include_forced_subs: env_bool("INCLUDE_FORCED_SUBS", true),
            include_non_forced_subs: env_bool("INCLUDE_NON_FORCED_SUBS", true),
            audio_description: env_bool("AUDIO_DESCRIPTION", true),
            remove_framerate: env_bool("REMOVE_FRAMERATE", false),
            quality,
            quality_history,
            rewrite_threshold,
            timeout: Duration::from_secs(timeout_secs),
            verify_tls: env_bool("VERIFY_TLS", true),
            proxy_server: env::var("PROXY_SERVER").ok(),
            client_cert: env::var("CLIENT_CERT").ok(),
            dns_rewrites: env::var("DNS_REWRITES").ok(),
            ip_mode,
            error_threshold,
            collaborator_timeout: Duration::from_secs(collaborator_timeout_secs),
            platform_android: env_bool("PLATFORM_ANDROID", false),
            drm_security_level: env::var("DRM_SECURITY_LEVEL")
                .unwrap_or_else(|_| "L3".to_string()),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    /// Serialize all env-var tests to prevent races between parallel test threads.
    static ENV_LOCK: Mutex<()> = Mutex::new(());

    /// Set env vars, run `f`, then restore original state.
    ///
    /// `set` — vars to set; `unset` — vars to remove before running `f`.
    fn with_env(set: &[(&str, &str)], unset: &[&str], f: impl FnOnce()) {
        let _lock = ENV_LOCK.lock().unwrap_or_else(|p| p.into_inner());

        let save_set: Vec<(&str, Option<String>)> = set
            .iter()
            .map(|(k, _)| (*k, std::env::var(k).ok()))
            .collect();
        let save_unset: Vec<(&str, Option<String>)> =
            unset.iter().map(|k| (*k, std::env::var(k).ok())).collect();

        for (k, v) in set {
            // SAFETY: serialized by ENV_LOCK — no other thread modifies env vars concurrently.
            unsafe { std::env::set_var(k, v) };
        }
        for k in unset {
            unsafe { std::env::remove_var(k) };
        }

        f();

        for (k, old) in save_set.into_iter().chain(save_unset) {
            match old {
                Some(v) => unsafe { std::env::set_var(k, v) },
                None => unsafe { std::env::remove_var(k) },
            }
        }
    }

    const ALL_VARS: &[&str] = &[
        "PORT",
        "BASE_URL",
        "AUDIO_WHITELIST",
        "SUBTITLE_WHITELIST",
        "DEFAULT_LANGUAGES",
        "DEFAULT_SUBTITLES",
        "INCLUDE_FORCED_SUBS",
        "INCLUDE_NON_FORCED_SUBS",
        "AUDIO_DESCRIPTION",
        "REMOVE_FRAMERATE",
        "QUALITY_MODE",
        "QUALITY_HISTORY",
        "REWRITE_THRESHOLD",
        "TIMEOUT_SECS",
        "VERIFY_TLS",
        "PROXY_SERVER",
        "CLIENT_CERT",
        "DNS_REWRITES",
        "IP_MODE",
        "ERROR_THRESHOLD",
        "COLLABORATOR_TIMEOUT_SECS",
        "PLATFORM_ANDROID",
        "DRM_SECURITY_LEVEL",
    ];

    #[test]
    fn dev_mode_uses_defaults() {
        with_env(&[("DEV_MODE", "true")], ALL_VARS, || {
            let config = Config::from_env().expect("should succeed in dev mode");
            assert!(config.is_dev);
            assert_eq!(config.port, 52104);
            assert_eq!(config.base_url, "http://127.0.0.1:52104");
            assert!(config.audio_whitelist.is_empty());
            assert_eq!(config.default_languages, vec!["original".to_string()]);
            assert_eq!(config.quality, QualityPolicy::Ask);
            assert_eq!(config.rewrite_threshold, DEFAULT_REWRITE_THRESHOLD);
            assert_eq!(config.error_threshold, 10);
            assert!(config.verify_tls);
            assert!(config.include_forced_subs);
            assert!(!config.platform_android);
        });
    }

    #[test]
    fn prod_mode_requires_port() {
        with_env(&[], &["DEV_MODE", "PORT", "BASE_URL"], || {
            assert!(Config::from_env().is_err(), "Should fail without PORT in prod mode");
        });
    }

    #[test]
    fn prod_mode_requires_base_url() {
        with_env(&[("PORT", "8080")], &["DEV_MODE", "BASE_URL"], || {
            assert!(
                Config::from_env().is_err(),
                "Should fail without BASE_URL in prod mode"
            );
        });
    }

    #[test]
    fn whitelists_parse_comma_separated() {
        with_env(
            &[
                ("DEV_MODE", "true"),
                ("AUDIO_WHITELIST", "en, es"),
                ("SUBTITLE_WHITELIST", "en"),
            ],
            &[],
            || {
                let config = Config::from_env().unwrap();
                assert_eq!(config.audio_whitelist, vec!["en".to_string(), "es".to_string()]);
                assert_eq!(config.subtitle_whitelist, vec!["en".to_string()]);
            },
        );
    }

    #[test]
    fn quality_mode_parses_bandwidth_cap() {
        with_env(
            &[("DEV_MODE", "true"), ("QUALITY_MODE", "5000000")],
            &[],
            || {
                let config = Config::from_env().unwrap();
                assert_eq!(config.quality, QualityPolicy::MaxBandwidth(5_000_000));
            },
        );
    }

    #[test]
    fn quality_mode_best() {
        with_env(&[("DEV_MODE", "true"), ("QUALITY_MODE", "best")], &[], || {
            let config = Config::from_env().unwrap();
            assert_eq!(config.quality, QualityPolicy::Best);
        });
    }

    #[test]
    fn ip_mode_parses() {
        with_env(&[("DEV_MODE", "true"), ("IP_MODE", "only_v6")], &[], || {
            let config = Config::from_env().unwrap();
            assert_eq!(config.ip_mode, IpMode::OnlyV6);
        });
    }

    #[test]
    fn error_threshold_configurable() {
        with_env(&[("DEV_MODE", "true"), ("ERROR_THRESHOLD", "3")], &[], || {
            let config = Config::from_env().unwrap();
            assert_eq!(config.error_threshold, 3);
        });
    }
}
