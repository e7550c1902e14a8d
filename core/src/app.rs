use std::net::SocketAddr;
use std::path::PathBuf;

use async_trait::async_trait;
use axum::body::Body;
use axum::http::Request;
use axum::response::Response;

use crate::asgi::AsgiApp;
use crate::errors::{AppStartError, CleanupError, ConfigError, DispatchError};
use crate::wsgi::WsgiApp;

/// Connection-level facts about an in-flight request that are not part of
/// the HTTP message itself.
#[derive(Debug, Clone)]
pub struct RequestContext {
    pub client_addr: SocketAddr,
    pub server_addr: SocketAddr,
    pub tls: bool,
}

/// The capability set shared by everything that can serve requests:
/// concrete WSGI/ASGI apps, the autoreload facade, sentinel error apps
/// and the dynamic resolver compose over this trait.
#[async_trait]
pub trait AppServer: Send + Sync {
    async fn handle_request(
        &self,
        request: Request<Body>,
        context: RequestContext,
    ) -> Result<Response, DispatchError>;

    async fn cleanup(&self) -> Result<(), CleanupError>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AppKind {
    Wsgi,
    Asgi,
}

/// Everything needed to import one application callable.
#[derive(Debug, Clone)]
pub struct AppDefinition {
    pub kind: AppKind,
    pub module: String,
    pub symbol: String,
    pub working_dir: Option<PathBuf>,
    pub site_packages: Option<PathBuf>,
    pub lifespan: bool,
}

impl AppDefinition {
    /// Splits a `module:symbol` pattern into its parts.
    pub fn parse_module_pattern(pattern: &str) -> Result<(String, String), ConfigError> {
        match pattern.split_once(':') {
            Some((module, symbol)) if !module.is_empty() && !symbol.is_empty() => {
                Ok((module.to_string(), symbol.to_string()))
            }
            _ => Err(ConfigError::InvalidModulePattern(pattern.to_string())),
        }
    }
}

/// A loaded Python application, tagged by the protocol it speaks.
pub enum App {
    Wsgi(WsgiApp),
    Asgi(AsgiApp),
}

/// Imports the application callable described by `definition` and, for
/// ASGI apps with lifespan enabled, runs the startup phase.
pub async fn load_app(definition: AppDefinition) -> Result<App, AppStartError> {
    match definition.kind {
        AppKind::Wsgi => Ok(App::Wsgi(WsgiApp::load(definition).await?)),
        AppKind::Asgi => Ok(App::Asgi(AsgiApp::load(definition).await?)),
    }
}

#[async_trait]
impl AppServer for App {
    async fn handle_request(
        &self,
        request: Request<Body>,
        context: RequestContext,
    ) -> Result<Response, DispatchError> {
        match self {
            App::Wsgi(app) => app.handle_request(request, context).await,
            App::Asgi(app) => app.handle_request(request, context).await,
        }
    }

    async fn cleanup(&self) -> Result<(), CleanupError> {
        match self {
            App::Wsgi(app) => app.cleanup().await,
            App::Asgi(app) => app.cleanup().await,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_parses_module_patterns() {
        let (module, symbol) = AppDefinition::parse_module_pattern("simple_app:app").unwrap();
        assert_eq!(module, "simple_app");
        assert_eq!(symbol, "app");

        let (module, symbol) = AppDefinition::parse_module_pattern("pkg.web:application").unwrap();
        assert_eq!(module, "pkg.web");
        assert_eq!(symbol, "application");
    }

    #[test]
    fn test_rejects_invalid_module_patterns() {
        for pattern in ["no-symbol", ":app", "module:", ""] {
            let result = AppDefinition::parse_module_pattern(pattern);
            assert_eq!(
                result,
                Err(ConfigError::InvalidModulePattern(pattern.to_string()))
            );
        }
    }
}
