use std::fmt::{Display, Formatter};
use std::sync::Arc;

use anyhow::bail;
use async_trait::async_trait;
#[cfg(test)] use mockall::automock;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::handshake::client::Request;
use tokio_tungstenite::tungstenite::http::{HeaderName, HeaderValue};
use tracing::debug;
use url::Url;

use crate::error::RelayError;
use crate::transport::{NetworkStream, SshRelayTarget};
use crate::websocket;

pub const DEFAULT_BASE_URL: &str = "wss://tunnel.cloudproxy.app/v4";
pub const MTLS_BASE_URL: &str = "wss://mtls.tunnel.cloudproxy.app/v4";

pub const ORIGIN: &str = "bot:iap-tunneler";
pub const SUBPROTOCOL: &str = "relay.tunnel.cloudproxy.app";

/// Provides the OAuth access token that authorizes tunnel connections. Tokens can expire, so this
///  is called for every connect and reconnect.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait TokenSource: Send + Sync + 'static {
    async fn access_token(&self) -> Result<String, RelayError>;
}

pub struct StaticToken(pub String);

#[async_trait]
impl TokenSource for StaticToken {
    async fn access_token(&self) -> Result<String, RelayError> {
        Ok(self.0.clone())
    }
}

/// The VM port a tunnel connects to
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct IapTunnelTarget {
    pub project_id: String,
    pub zone: String,
    pub instance: String,
    pub interface: String,
    pub port: u16,
}

impl IapTunnelTarget {
    pub fn new(project_id: impl Into<String>, zone: impl Into<String>, instance: impl Into<String>, port: u16) -> IapTunnelTarget {
        IapTunnelTarget {
            project_id: project_id.into(),
            zone: zone.into(),
            instance: instance.into(),
            interface: "nic0".to_string(),
            port,
        }
    }
}

impl Display for IapTunnelTarget {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}/{}:{}", self.project_id, self.zone, self.instance, self.port)
    }
}

#[derive(Debug, Clone)]
pub struct IapTunnelConfig {
    /// Use the mTLS endpoint instead of the regular one. Selecting and presenting the client
    ///  certificate is up to the TLS layer.
    pub use_mtls: bool,

    /// Replaces the relay's base URL, e.g. for a private endpoint or for testing. This is used
    ///  regardless of `use_mtls`.
    pub base_url_override: Option<String>,

    pub user_agent: String,
}

impl IapTunnelConfig {
    pub fn new() -> IapTunnelConfig {
        IapTunnelConfig {
            use_mtls: false,
            base_url_override: None,
            user_agent: format!("{}/{}", env!("CARGO_PKG_NAME"), env!("CARGO_PKG_VERSION")),
        }
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        if let Some(base_url) = &self.base_url_override {
            let url = Url::parse(base_url)?;
            if url.scheme() != "ws" && url.scheme() != "wss" {
                bail!("base URL must be a ws:// or wss:// URL, was {}", base_url);
            }
            if url.cannot_be_a_base() {
                bail!("base URL {} cannot be a base", base_url);
            }
        }
        if self.user_agent.is_empty() {
            bail!("user agent must not be empty");
        }
        Ok(())
    }

    fn base_url(&self) -> Result<Url, RelayError> {
        let raw = match &self.base_url_override {
            Some(base_url) => base_url.as_str(),
            None if self.use_mtls => MTLS_BASE_URL,
            None => DEFAULT_BASE_URL,
        };
        Url::parse(raw)
            .map_err(|e| RelayError::invalid_argument(format!("invalid base URL {}: {}", raw, e)))
    }
}

impl Default for IapTunnelConfig {
    fn default() -> Self {
        IapTunnelConfig::new()
    }
}

/// Connects to a VM port through the Cloud IAP relay (protocol v4)
pub struct IapTunnelEndpoint {
    target: IapTunnelTarget,
    config: IapTunnelConfig,
    tokens: Arc<dyn TokenSource>,
}

impl IapTunnelEndpoint {
    pub fn new(target: IapTunnelTarget, config: IapTunnelConfig, tokens: Arc<dyn TokenSource>) -> IapTunnelEndpoint {
        IapTunnelEndpoint {
            target,
            config,
            tokens,
        }
    }

    pub fn target(&self) -> &IapTunnelTarget {
        &self.target
    }

    pub fn connect_url(&self) -> Result<Url, RelayError> {
        let mut url = self.endpoint_url("connect")?;
        url.query_pairs_mut()
            .append_pair("project", &self.target.project_id)
            .append_pair("port", &self.target.port.to_string())
            .append_pair("newWebsocket", "true")
            .append_pair("zone", &self.target.zone)
            .append_pair("instance", &self.target.instance)
            .append_pair("interface", &self.target.interface);
        Ok(url)
    }

    pub fn reconnect_url(&self, sid: &str, ack: u64) -> Result<Url, RelayError> {
        let mut url = self.endpoint_url("reconnect")?;
        url.query_pairs_mut()
            .append_pair("sid", sid)
            .append_pair("ack", &ack.to_string())
            .append_pair("newWebsocket", "true")
            .append_pair("zone", &self.target.zone);
        Ok(url)
    }

    fn endpoint_url(&self, operation: &str) -> Result<Url, RelayError> {
        let mut url = self.config.base_url()?;
        url.path_segments_mut()
            .map_err(|_| RelayError::invalid_argument("base URL cannot be a base"))?
            .pop_if_empty()
            .push(operation);
        Ok(url)
    }

    pub async fn build_request(&self, url: &Url) -> Result<Request, RelayError> {
        let mut request = url.as_str().into_client_request()
            .map_err(|e| RelayError::invalid_argument(format!("invalid WebSocket URL {}: {}", url, e)))?;

        let token = self.tokens.access_token().await?;
        let headers = [
            ("authorization", format!("Bearer {}", token)),
            ("origin", ORIGIN.to_string()),
            ("sec-websocket-protocol", SUBPROTOCOL.to_string()),
            ("user-agent", self.config.user_agent.clone()),
        ];
        for (name, value) in headers {
            let value = HeaderValue::from_str(&value)
                .map_err(|_| RelayError::invalid_argument(format!("invalid value for header {}", name)))?;
            request.headers_mut().insert(HeaderName::from_static(name), value);
        }
        Ok(request)
    }

    async fn open(&self, url: Url) -> Result<Arc<dyn NetworkStream>, RelayError> {
        let request = self.build_request(&url).await?;
        let stream = websocket::connect(request).await?;
        Ok(Arc::new(stream))
    }
}

#[async_trait]
impl SshRelayTarget for IapTunnelEndpoint {
    async fn connect(&self) -> Result<Arc<dyn NetworkStream>, RelayError> {
        debug!("connecting to {}", self.target);
        self.open(self.connect_url()?).await
    }

    async fn reconnect(&self, sid: &str, ack: u64) -> Result<Arc<dyn NetworkStream>, RelayError> {
        debug!("reconnecting to {} with ack={}", self.target, ack);
        self.open(self.reconnect_url(sid, ack)?).await
    }

    fn is_mutual_tls_enabled(&self) -> bool {
        self.config.use_mtls
    }
}
