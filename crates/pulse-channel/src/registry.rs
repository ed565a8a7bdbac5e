//! Keyed channel factory with a single socket per key.
//!
//! Consumers get [`SharedChannel`] handles. A handle can connect, send and
//! subscribe, but cannot disconnect: only the registry tears a shared
//! connection down, through [`ChannelRegistry::cleanup_service`] or
//! [`ChannelRegistry::disconnect_all`].

use std::{collections::HashMap, fmt, sync::Arc};

use parking_lot::Mutex;
use tracing::{debug, info};
use url::Url;

use crate::{
    config::ChannelConfig,
    dispatcher::{EventStream, HandlerId, Subscription},
    error::{ChannelError, ChannelResult},
    event::{Event, EventName},
    lifecycle::ConnectionState,
    manager::ConnectionManager,
    message::Message,
    transport::{Connector, TungsteniteConnector},
};

/// Which family of endpoint a channel belongs to.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ChannelKind {
    /// Per-room chat and presence traffic.
    Conversation,
    /// Bulk monitoring and memory streams.
    Infrastructure,
}

impl ChannelKind {
    /// URL path segment for this kind.
    pub fn path(&self) -> &'static str {
        match self {
            Self::Conversation => "chat",
            Self::Infrastructure => "infrastructure",
        }
    }
}

/// Identity of a logical channel.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct ChannelKey {
    pub kind: ChannelKind,
    pub room: String,
    pub tenant: Option<String>,
}

impl ChannelKey {
    pub fn new(kind: ChannelKind, room: impl Into<String>) -> Self {
        Self {
            kind,
            room: room.into(),
            tenant: None,
        }
    }

    /// Key for a chat room.
    pub fn conversation(room: impl Into<String>) -> Self {
        Self::new(ChannelKind::Conversation, room)
    }

    /// Key for an infrastructure stream.
    pub fn infrastructure(stream: impl Into<String>) -> Self {
        Self::new(ChannelKind::Infrastructure, stream)
    }

    /// Scope the key to a tenant.
    #[must_use]
    pub fn with_tenant(mut self, tenant: impl Into<String>) -> Self {
        self.tenant = Some(tenant.into());
        self
    }
}

impl fmt::Display for ChannelKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.kind.path(), self.room)?;
        if let Some(tenant) = &self.tenant {
            write!(f, "@{tenant}")?;
        }
        Ok(())
    }
}

/// Registry-wide settings.
#[derive(Clone, Debug)]
pub struct RegistryConfig {
    /// Endpoint root, e.g. `wss://dash.example.com/ws`.
    pub base_url: String,
    /// Opaque credentials appended to every channel URL.
    pub credentials: Option<String>,
    /// Query parameter carrying `credentials`.
    pub credentials_param: String,
    /// Connect channels as soon as they are created.
    pub auto_connect: bool,
    /// Timings for [`ChannelKind::Conversation`]; the URL is ignored.
    pub conversation: ChannelConfig,
    /// Timings for [`ChannelKind::Infrastructure`]; the URL is ignored.
    pub infrastructure: ChannelConfig,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            base_url: String::new(),
            credentials: None,
            credentials_param: "token".to_string(),
            auto_connect: true,
            conversation: ChannelConfig::conversational(""),
            infrastructure: ChannelConfig::infrastructure(""),
        }
    }
}

impl RegistryConfig {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into(),
            ..Default::default()
        }
    }

    #[must_use]
    pub fn credentials(mut self, credentials: impl Into<String>) -> Self {
        self.credentials = Some(credentials.into());
        self
    }

    #[must_use]
    pub fn credentials_param(mut self, name: impl Into<String>) -> Self {
        self.credentials_param = name.into();
        self
    }

    #[must_use]
    pub fn auto_connect(mut self, enabled: bool) -> Self {
        self.auto_connect = enabled;
        self
    }

    #[must_use]
    pub fn conversation(mut self, config: ChannelConfig) -> Self {
        self.conversation = config;
        self
    }

    #[must_use]
    pub fn infrastructure(mut self, config: ChannelConfig) -> Self {
        self.infrastructure = config;
        self
    }

    /// Validate the configuration.
    pub fn validate(&self) -> Result<(), String> {
        if self.base_url.is_empty() {
            return Err("Base URL cannot be empty".to_string());
        }
        let url = Url::parse(&self.base_url).map_err(|e| format!("Invalid base URL: {e}"))?;
        if !matches!(url.scheme(), "ws" | "wss") {
            return Err(format!("Unsupported URL scheme: {}", url.scheme()));
        }
        if url.cannot_be_a_base() {
            return Err("Base URL cannot carry a path".to_string());
        }
        if self.credentials.is_some() && self.credentials_param.is_empty() {
            return Err("Credentials parameter name cannot be empty".to_string());
        }
        Ok(())
    }
}

/// Keyed owner of every live channel.
pub struct ChannelRegistry {
    config: RegistryConfig,
    base: Url,
    connector: Arc<dyn Connector>,
    channels: Mutex<HashMap<ChannelKey, ConnectionManager>>,
}

impl fmt::Debug for ChannelRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ChannelRegistry")
            .field("base_url", &self.config.base_url)
            .field("channels", &self.len())
            .finish()
    }
}

impl ChannelRegistry {
    /// Create a registry using the tokio-tungstenite transport.
    pub fn new(config: RegistryConfig) -> ChannelResult<Self> {
        Self::with_connector(config, Arc::new(TungsteniteConnector::new()))
    }

    /// Create a registry whose channels share a custom transport.
    pub fn with_connector(
        config: RegistryConfig,
        connector: Arc<dyn Connector>,
    ) -> ChannelResult<Self> {
        config.validate().map_err(ChannelError::config)?;
        let base = Url::parse(&config.base_url).map_err(|e| ChannelError::config(e.to_string()))?;
        Ok(Self {
            config,
            base,
            connector,
            channels: Mutex::new(HashMap::new()),
        })
    }

    /// Endpoint URL for `key`: `{base}/{kind}/{room}`, with the tenant and
    /// credentials as query parameters.
    pub fn url_for(&self, key: &ChannelKey) -> ChannelResult<String> {
        let mut url = self.base.clone();
        url.path_segments_mut()
            .map_err(|()| ChannelError::config("Base URL cannot carry a path"))?
            .pop_if_empty()
            .push(key.kind.path())
            .push(&key.room);

        if key.tenant.is_some() || self.config.credentials.is_some() {
            let mut query = url.query_pairs_mut();
            if let Some(tenant) = &key.tenant {
                query.append_pair("tenant", tenant);
            }
            if let Some(credentials) = &self.config.credentials {
                query.append_pair(&self.config.credentials_param, credentials);
            }
        }
        Ok(url.into())
    }

    /// Connection settings for `key`.
    pub fn config_for(&self, key: &ChannelKey) -> ChannelResult<ChannelConfig> {
        let template = match key.kind {
            ChannelKind::Conversation => &self.config.conversation,
            ChannelKind::Infrastructure => &self.config.infrastructure,
        };
        Ok(template.clone().with_url(self.url_for(key)?))
    }

    /// The channel for `key`, created (and connected, unless auto-connect is
    /// off) on first request.
    pub fn get_service(&self, key: &ChannelKey) -> ChannelResult<SharedChannel> {
        let mut channels = self.channels.lock();
        if let Some(existing) = channels.get(key) {
            return Ok(SharedChannel {
                manager: existing.clone(),
            });
        }

        let manager =
            ConnectionManager::with_connector(self.config_for(key)?, Arc::clone(&self.connector))?;
        channels.insert(key.clone(), manager.clone());
        drop(channels);

        info!(channel = %key, "Channel created");
        if self.config.auto_connect {
            manager.connect();
        }
        Ok(SharedChannel { manager })
    }

    /// Disconnect and forget the channel for `key`. Returns false if there
    /// was none. Handles still held by consumers go permanently idle.
    pub fn cleanup_service(&self, key: &ChannelKey) -> bool {
        let removed = self.channels.lock().remove(key);
        match removed {
            Some(manager) => {
                manager.teardown();
                info!(channel = %key, "Channel removed");
                true
            }
            None => false,
        }
    }

    /// Disconnect and forget every channel.
    pub fn disconnect_all(&self) {
        let drained: Vec<_> = self.channels.lock().drain().collect();
        if !drained.is_empty() {
            debug!(count = drained.len(), "Disconnecting all channels");
        }
        for (_, manager) in drained {
            manager.teardown();
        }
    }

    pub fn contains(&self, key: &ChannelKey) -> bool {
        self.channels.lock().contains_key(key)
    }

    pub fn len(&self) -> usize {
        self.channels.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.channels.lock().is_empty()
    }

    pub fn keys(&self) -> Vec<ChannelKey> {
        self.channels.lock().keys().cloned().collect()
    }
}

impl Drop for ChannelRegistry {
    fn drop(&mut self) {
        self.disconnect_all();
    }
}

/// A consumer's view of a registry-owned channel.
#[derive(Clone, Debug)]
pub struct SharedChannel {
    manager: ConnectionManager,
}

impl SharedChannel {
    /// Open the socket if it is not already open. Ignored once the
    /// registry has removed the channel.
    pub fn connect(&self) {
        self.manager.connect();
    }

    /// See [`ConnectionManager::send`].
    pub fn send(&self, message: &Message) -> bool {
        self.manager.send(message)
    }

    pub fn on<F>(&self, name: impl Into<EventName>, handler: F) -> HandlerId
    where
        F: Fn(&Event) + Send + Sync + 'static,
    {
        self.manager.on(name, handler)
    }

    pub fn off(&self, name: impl Into<EventName>, id: HandlerId) -> bool {
        self.manager.off(name, id)
    }

    pub fn subscribe<F>(&self, name: impl Into<EventName>, handler: F) -> Subscription
    where
        F: Fn(&Event) + Send + Sync + 'static,
    {
        self.manager.subscribe(name, handler)
    }

    pub fn listen<I, N>(&self, names: I) -> EventStream
    where
        I: IntoIterator<Item = N>,
        N: Into<EventName>,
    {
        self.manager.listen(names)
    }

    pub fn state(&self) -> ConnectionState {
        self.manager.state()
    }

    pub fn is_connected(&self) -> bool {
        self.manager.is_connected()
    }

    pub fn is_retired(&self) -> bool {
        self.manager.is_retired()
    }

    pub fn reconnect_attempts(&self) -> u32 {
        self.manager.reconnect_attempts()
    }

    pub fn url(&self) -> &str {
        self.manager.url()
    }

    pub fn config(&self) -> &ChannelConfig {
        self.manager.config()
    }

    /// Whether both handles share one connection.
    pub fn ptr_eq(&self, other: &Self) -> bool {
        self.manager.ptr_eq(&other.manager)
    }
}
