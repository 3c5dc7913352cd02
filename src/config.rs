//! Configuration management
//!
//! Loads configuration from:
//! 1. Default values
//! 2. Configuration files (config/default.toml, config/local.toml)
//! 3. Environment variables (override)

use serde::Deserialize;
use std::{net::IpAddr, path::PathBuf};

use crate::error::AuthError;

/// Main application configuration
#[derive(Debug, Clone, Deserialize)]
pub struct AppConfig {
    pub server: ServerConfig,
    pub database: DatabaseConfig,
    pub auth: AuthConfig,
    #[serde(default)]
    pub providers: ProvidersConfig,
    pub logging: LoggingConfig,
}

/// Server configuration
#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    /// Bind address (e.g., "0.0.0.0")
    pub host: String,
    /// Port number (e.g., 8080)
    pub port: u16,
    /// Public origin used to build provider callback URLs
    /// (e.g., "https://app.example.com")
    pub base_url: String,
}

/// Database configuration (SQLite only)
#[derive(Debug, Clone, Deserialize)]
pub struct DatabaseConfig {
    /// Path to SQLite database file
    pub path: PathBuf,
}

/// Session, CSRF and handshake configuration
#[derive(Debug, Clone, Deserialize)]
pub struct AuthConfig {
    /// Sliding session lifetime in seconds (default: 25200 = 7h)
    pub session_ttl_seconds: i64,
    /// CSRF token lifetime in seconds (default: 1800 = 30m)
    pub csrf_ttl_seconds: i64,
    /// Handshake state lifetime in seconds (default: 600)
    pub state_ttl_seconds: i64,
    /// Upper bound for a single storage call in milliseconds
    pub adapter_timeout_ms: u64,
    /// Expired session sweep interval in seconds; 0 disables the sweep
    pub session_gc_interval_seconds: u64,
    pub cookie: CookieConfig,
    pub routes: RoutesConfig,
    pub csrf: CsrfConfig,
}

/// Session cookie attributes
#[derive(Debug, Clone, Deserialize)]
pub struct CookieConfig {
    pub name: String,
    /// "lax", "strict" or "none"
    pub same_site: String,
    /// Defaults to true unless the server is local plain HTTP
    pub secure: Option<bool>,
    pub path: String,
    pub domain: Option<String>,
}

/// Handshake route prefixes
#[derive(Debug, Clone, Deserialize)]
pub struct RoutesConfig {
    pub login_url: String,
    pub logout_url: String,
    pub callback_url: String,
    /// Where a completed handshake lands
    pub after_login_url: String,
}

/// CSRF guard configuration
#[derive(Debug, Clone, Deserialize)]
pub struct CsrfConfig {
    /// Request header carrying the token; rotated tokens are returned in it
    pub header_name: String,
}

/// Identity provider registrations; absent sections are not registered
#[derive(Debug, Clone, Deserialize, Default)]
pub struct ProvidersConfig {
    pub github: Option<GitHubProviderConfig>,
    pub entraid: Option<EntraIdProviderConfig>,
}

/// GitHub OAuth app
#[derive(Debug, Clone, Deserialize)]
pub struct GitHubProviderConfig {
    pub client_id: String,
    pub client_secret: String,
    /// Overrides the default scopes when non-empty
    #[serde(default)]
    pub scopes: Vec<String>,
}

/// Entra ID app registration
#[derive(Debug, Clone, Deserialize)]
pub struct EntraIdProviderConfig {
    pub client_id: String,
    pub client_secret: String,
    /// "common", "organizations", "consumers" or a tenant id
    #[serde(default = "default_entraid_tenant")]
    pub tenant: String,
    #[serde(default)]
    pub scopes: Vec<String>,
}

fn default_entraid_tenant() -> String {
    "common".to_string()
}

/// Logging configuration
#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
    /// Log level: trace, debug, info, warn, error
    pub level: String,
    /// Log format: "pretty" or "json"
    pub format: String,
}

impl AppConfig {
    /// Load configuration from file and environment
    ///
    /// # Loading Order
    /// 1. Default values
    /// 2. config/default.toml (if exists)
    /// 3. config/local.toml (if exists)
    /// 4. Environment variables (AUTHGATE__*)
    ///
    /// # Errors
    /// Returns error if configuration is invalid
    pub fn load() -> Result<Self, AuthError> {
        use config::{Config, Environment, File};

        let config = Config::builder()
            // Start with default values
            .set_default("server.host", "127.0.0.1")?
            .set_default("server.port", 8080)?
            .set_default("server.base_url", "http://localhost:8080")?
            .set_default("database.path", "data/authgate.db")?
            .set_default("auth.session_ttl_seconds", 25_200)?
            .set_default("auth.csrf_ttl_seconds", 1_800)?
            .set_default("auth.state_ttl_seconds", 600)?
            .set_default("auth.adapter_timeout_ms", 5_000)?
            .set_default("auth.session_gc_interval_seconds", 3_600)?
            .set_default("auth.cookie.name", "authgate_session")?
            .set_default("auth.cookie.same_site", "lax")?
            .set_default("auth.cookie.path", "/")?
            .set_default("auth.routes.login_url", "/login")?
            .set_default("auth.routes.logout_url", "/logout")?
            .set_default("auth.routes.callback_url", "/auth")?
            .set_default("auth.routes.after_login_url", "/")?
            .set_default("auth.csrf.header_name", "X-Csrf-Token")?
            .set_default("logging.level", "info")?
            .set_default("logging.format", "pretty")?
            // Load from config/default.toml if it exists
            .add_source(File::with_name("config/default").required(false))
            // Load from config/local.toml if it exists (overrides default)
            .add_source(File::with_name("config/local").required(false))
            // Load from environment variables (AUTHGATE__*)
            .add_source(
                Environment::with_prefix("AUTHGATE")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()
            .map_err(|e| AuthError::Config(e.to_string()))?;

        let app_config: Self = config
            .try_deserialize()
            .map_err(|e| AuthError::Config(e.to_string()))?;
        app_config.validate()?;
        Ok(app_config)
    }

    /// Explicit `auth.cookie.secure`, else secure unless served locally over HTTP
    pub fn should_use_secure_cookies(&self) -> bool {
        if let Some(secure) = self.auth.cookie.secure {
            return secure;
        }
        self.server.base_url.starts_with("https://") || !is_local_base_url(&self.server.base_url)
    }

    /// Absolute callback URL registered with a provider
    ///
    /// e.g. "https://app.example.com/auth/github/callback"
    pub fn redirect_url(&self, provider: &str) -> String {
        format!(
            "{}{}/{}/callback",
            self.server.base_url.trim_end_matches('/'),
            self.auth.routes.callback_url.trim_end_matches('/'),
            provider
        )
    }

    pub(crate) fn validate(&self) -> Result<(), AuthError> {
        let auth = &self.auth;

        for (name, value) in [
            ("auth.session_ttl_seconds", auth.session_ttl_seconds),
            ("auth.csrf_ttl_seconds", auth.csrf_ttl_seconds),
            ("auth.state_ttl_seconds", auth.state_ttl_seconds),
        ] {
            if value <= 0 {
                return Err(AuthError::Config(format!("{name} must be greater than 0")));
            }
        }

        if auth.adapter_timeout_ms == 0 {
            return Err(AuthError::Config(
                "auth.adapter_timeout_ms must be greater than 0".to_string(),
            ));
        }

        if auth.csrf_ttl_seconds > auth.session_ttl_seconds {
            return Err(AuthError::Config(
                "auth.csrf_ttl_seconds must not exceed auth.session_ttl_seconds".to_string(),
            ));
        }

        match auth.cookie.same_site.to_ascii_lowercase().as_str() {
            "lax" | "strict" => {}
            "none" => {
                if !self.should_use_secure_cookies() {
                    return Err(AuthError::Config(
                        "auth.cookie.same_site=none requires secure cookies".to_string(),
                    ));
                }
            }
            other => {
                return Err(AuthError::Config(format!(
                    "auth.cookie.same_site must be lax, strict or none (got {other})"
                )));
            }
        }

        if auth.cookie.name.trim().is_empty() {
            return Err(AuthError::Config(
                "auth.cookie.name must not be empty".to_string(),
            ));
        }

        for (name, value) in [
            ("auth.routes.login_url", &auth.routes.login_url),
            ("auth.routes.logout_url", &auth.routes.logout_url),
            ("auth.routes.callback_url", &auth.routes.callback_url),
            ("auth.routes.after_login_url", &auth.routes.after_login_url),
            ("auth.cookie.path", &auth.cookie.path),
        ] {
            if !value.starts_with('/') {
                return Err(AuthError::Config(format!("{name} must start with '/'")));
            }
        }

        url::Url::parse(&self.server.base_url).map_err(|e| {
            AuthError::Config(format!("server.base_url is not a valid URL: {e}"))
        })?;

        if !matches!(
            self.logging.level.to_ascii_lowercase().as_str(),
            "trace" | "debug" | "info" | "warn" | "error"
        ) {
            return Err(AuthError::Config(format!(
                "logging.level must be trace, debug, info, warn or error (got {})",
                self.logging.level
            )));
        }
        if !matches!(self.logging.format.as_str(), "pretty" | "json") {
            return Err(AuthError::Config(format!(
                "logging.format must be pretty or json (got {})",
                self.logging.format
            )));
        }

        Ok(())
    }
}

impl LoggingConfig {
    /// `EnvFilter` directives used when `RUST_LOG` is not set
    pub fn filter_directives(&self) -> String {
        format!("authgate={0},tower_http={0}", self.level.to_ascii_lowercase())
    }
}

fn is_local_base_url(base_url: &str) -> bool {
    let Some(host) = url::Url::parse(base_url)
        .ok()
        .and_then(|url| url.host_str().map(|host| host.to_ascii_lowercase()))
    else {
        return false;
    };
    let host = host.trim_start_matches('[').trim_end_matches(']');

    if host == "localhost" || host.ends_with(".localhost") {
        return true;
    }

    if let Ok(ip) = host.parse::<IpAddr>() {
        return ip.is_loopback() || ip.is_unspecified();
    }

    false
}
