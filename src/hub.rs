//! Hub bootstrap
//!
//! Wires the connection registry, store, router and twin manager together
//! from a [`HubConfig`] and an upstream transport, and exposes the calls a
//! transport adapter makes: `on_connect`, `on_message` and `on_disconnect`.
//!
//! ```rust
//! # tokio_test::block_on(async {
//! use bytes::Bytes;
//! use edgehub::config::RouteEntry;
//! use edgehub::testing::{MockDeviceProxy, MockUpstream};
//! use edgehub::{Credentials, Disposition, Hub, HubConfig, Identity};
//! use std::collections::HashMap;
//! use std::sync::Arc;
//!
//! let mut config = HubConfig::for_device("edge-1", "hub.example.net");
//! config.routes.push(RouteEntry {
//!     name: "all".to_string(),
//!     route: "FROM /* INTO $upstream".to_string(),
//! });
//!
//! let hub = Hub::new(config, Arc::new(MockUpstream::new())).unwrap();
//! hub.start().await.unwrap();
//!
//! let listener = hub
//!     .on_connect(
//!         Identity::device("leaf-1"),
//!         Credentials::sas_token("SharedAccessSignature sr=hub.example.net&sig=abc"),
//!         Arc::new(MockDeviceProxy::new()),
//!     )
//!     .await
//!     .unwrap();
//!
//! let disposition = hub
//!     .on_message(&listener, Bytes::from_static(b"{\"t\":21}"), HashMap::new())
//!     .await;
//! assert_eq!(disposition, Disposition::Accepted);
//!
//! hub.shutdown().await;
//! # });
//! ```

use crate::cloud::UpstreamTransport;
use crate::config::HubConfig;
use crate::connection::{ConnectionManager, ConnectionManagerConfig, DeviceProxy, EventBus};
use crate::device::{DeviceListener, Disposition};
use crate::error::HubResult;
use crate::identity::{Credentials, Identity};
use crate::observability::{metrics, HealthServer};
use crate::routing::{EndpointResolver, Router, RouterConfig, SystemHandler};
use crate::store::{MessageLog, MessageStore};
use crate::twin::{FlushOutcome, TwinDocument, TwinManager, TwinPatch};
use bytes::Bytes;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn, Instrument};

pub struct Hub {
    config: HubConfig,
    events: EventBus,
    connections: Arc<ConnectionManager>,
    store: Arc<MessageStore>,
    router: Arc<Router>,
    twins: Arc<TwinManager>,
    health: Option<Arc<HealthServer>>,
    shutdown: CancellationToken,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    started: AtomicBool,
}

impl Hub {
    pub fn new(config: HubConfig, transport: Arc<dyn UpstreamTransport>) -> HubResult<Self> {
        let store = MessageStore::new(config.store.store_config());
        Self::with_store(config, transport, store)
    }

    /// Hub whose store is backed by a persistence log
    pub fn with_store_log(
        config: HubConfig,
        transport: Arc<dyn UpstreamTransport>,
        log: Arc<dyn MessageLog>,
    ) -> HubResult<Self> {
        let store = MessageStore::with_log(config.store.store_config(), log);
        Self::with_store(config, transport, store)
    }

    fn with_store(
        config: HubConfig,
        transport: Arc<dyn UpstreamTransport>,
        store: MessageStore,
    ) -> HubResult<Self> {
        config.validate()?;
        let routes = config.route_table()?;

        let events = EventBus::new();
        let connections = Arc::new(ConnectionManager::new(
            transport,
            ConnectionManagerConfig::from_config(&config),
            events.clone(),
        ));
        let store = Arc::new(store);
        let resolver = EndpointResolver::new(Arc::clone(&connections), config.hub.device_id.as_str());
        let router = Arc::new(Router::new(
            routes,
            Arc::clone(&store),
            resolver,
            RouterConfig::from_config(&config),
        ));
        let twins = Arc::new(TwinManager::new(Arc::clone(&connections), &config.twin));

        Ok(Self {
            config,
            events,
            connections,
            store,
            router,
            twins,
            health: None,
            shutdown: CancellationToken::new(),
            tasks: Mutex::new(Vec::new()),
            started: AtomicBool::new(false),
        })
    }

    /// Report readiness through this health server once started
    pub fn set_health_server(&mut self, health: Arc<HealthServer>) {
        self.health = Some(health);
    }

    pub fn config(&self) -> &HubConfig {
        &self.config
    }

    pub fn events(&self) -> &EventBus {
        &self.events
    }

    pub fn connections(&self) -> &Arc<ConnectionManager> {
        &self.connections
    }

    pub fn store(&self) -> &Arc<MessageStore> {
        &self.store
    }

    pub fn router(&self) -> &Arc<Router> {
        &self.router
    }

    pub fn twins(&self) -> &Arc<TwinManager> {
        &self.twins
    }

    pub fn is_started(&self) -> bool {
        self.started.load(Ordering::SeqCst)
    }

    pub fn register_system_handler<S: Into<String>>(&self, name: S, handler: Arc<dyn SystemHandler>) {
        self.router.register_system_handler(name, handler);
    }

    /// Recover stored messages and start the background tasks
    pub async fn start(&self) -> HubResult<()> {
        if self.started.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        metrics().set_hub_state("starting");

        let recovered = self.store.recover().await?;

        let mut tasks = self.tasks.lock().await;
        tasks.push(self.connections.spawn_event_handler());
        tasks.push(self.router.start(&self.events));
        tasks.push(self.twins.spawn(self.shutdown.child_token()));
        tasks.push(self.store.spawn_cleanup(
            Duration::from_secs(self.config.store.cleanup_interval_secs.max(1)),
            self.shutdown.child_token(),
        ));
        if let Some(health) = &self.health {
            tasks.push(health.watch_events(&self.events, self.shutdown.child_token()));
            health.set_started(true);
        }
        drop(tasks);

        metrics().set_hub_state("running");
        info!(
            device_id = %self.config.hub.device_id,
            routes = self.router.routes().len(),
            recovered,
            "Hub started"
        );
        Ok(())
    }

    /// A transport session authenticated
    ///
    /// Registers the connection (superseding any previous one for the
    /// identity) and opens the upstream link in the background.
    pub async fn on_connect(
        &self,
        identity: Identity,
        credentials: Credentials,
        device: Arc<dyn DeviceProxy>,
    ) -> HubResult<Arc<DeviceListener>> {
        let connection = self
            .connections
            .connect(&identity, credentials.clone(), device)
            .await?;
        let listener = Arc::new(DeviceListener::new(
            &connection,
            Arc::clone(&self.router),
            Arc::clone(&self.connections),
        ));

        let connections = Arc::clone(&self.connections);
        let cancel = self.shutdown.child_token();
        let span = crate::connection_span!(identity = %identity);
        tokio::spawn(
            async move {
                match connections
                    .get_or_create_cloud_proxy(&identity, credentials, &cancel)
                    .await
                {
                    Ok(_) => debug!("Upstream link ready"),
                    Err(e) if e.is_fatal() => warn!(error = %e, "Upstream link refused"),
                    Err(e) => debug!(error = %e, "Upstream link not ready yet"),
                }
            }
            .instrument(span),
        );

        Ok(listener)
    }

    /// Inbound message from a session
    pub async fn on_message(
        &self,
        listener: &DeviceListener,
        payload: Bytes,
        properties: HashMap<String, String>,
    ) -> Disposition {
        let message = listener.build_message(payload, properties);
        listener.process_message(message).await
    }

    /// The transport session went away
    pub async fn on_disconnect(&self, listener: &DeviceListener) -> HubResult<()> {
        listener.disconnect().await
    }

    pub async fn get_twin(&self, listener: &DeviceListener) -> HubResult<TwinDocument> {
        self.twins.get_twin(listener.identity()).await
    }

    pub async fn update_reported_properties(
        &self,
        listener: &DeviceListener,
        patch: TwinPatch,
    ) -> HubResult<FlushOutcome> {
        self.twins
            .submit_reported_patch(listener.identity(), patch)
            .await
    }

    /// Parse `config`'s routes and swap them in
    ///
    /// A table that fails to parse leaves the current one in place.
    pub fn reload_routes(&self, config: &HubConfig) -> HubResult<()> {
        let routes = config.route_table()?;
        self.router.update_routes(routes);
        Ok(())
    }

    /// Stop background work and close every connection
    ///
    /// Stored messages stay in the store.
    pub async fn shutdown(&self) {
        info!("Hub shutting down");
        metrics().set_hub_state("stopping");
        if let Some(health) = &self.health {
            health.set_started(false);
        }

        self.shutdown.cancel();
        self.router.shutdown().await;
        self.connections.shutdown().await;

        let tasks = std::mem::take(&mut *self.tasks.lock().await);
        for task in tasks {
            if let Err(e) = task.await {
                warn!(error = %e, "Background task ended abnormally");
            }
        }

        self.started.store(false, Ordering::SeqCst);
        metrics().set_hub_state("stopped");
        info!("Hub stopped");
    }
}
