//! Application assembly and lifecycle.
//!
//! Construction is an explicit ordered sequence — config, collaborators,
//! broker, event bus, bridge, front-ends — and shutdown runs the same
//! sequence in reverse.

use std::net::SocketAddr;
use std::sync::Arc;

use courier_wire::Codec;
use tracing::{error, info};

use crate::api::{build_schema, ApiDeps, ApiServer};
use crate::auth::{
    InMemoryUserRepository, StaticTokenVerifier, TokenVerifier, UserRepository,
};
use crate::config::Config;
use crate::events::{EventBridge, EventBus};
use crate::net::{ConnectionManager, MessageHandler, TcpServer};
use crate::pubsub::Broker;
use crate::ws::WsFrontend;
use crate::Result;

/// The assembled server.
pub struct App {
    config: Config,
    broker: Broker,
    bus: Arc<EventBus>,
    bridge: Arc<EventBridge>,
    tcp: Option<Arc<TcpServer>>,
    api: Option<Arc<ApiServer>>,
    tcp_addr: Option<SocketAddr>,
    api_addr: Option<SocketAddr>,
}

impl App {
    /// Builds every component and connects the broker. Nothing is listening
    /// yet; call [`App::start`].
    pub async fn build(config: Config) -> Result<Self> {
        let verifier: Arc<dyn TokenVerifier> =
            Arc::new(StaticTokenVerifier::from_config(&config.auth));
        let users: Arc<dyn UserRepository> =
            Arc::new(InMemoryUserRepository::from_config(&config.auth));

        let broker = Broker::from_config(&config.pubsub);
        broker.connect().await?;

        let bus = Arc::new(EventBus::new());
        let bridge = Arc::new(EventBridge::new(Arc::clone(&bus), broker.clone()));
        bridge.init();

        let tcp_manager = Arc::new(ConnectionManager::new(
            config.tcp.max_connections,
            config.tcp.max_connections_per_ip,
        ));
        let tcp_handler = Arc::new(MessageHandler::new(
            Arc::clone(&tcp_manager),
            broker.clone(),
            Arc::clone(&verifier),
            Arc::clone(&users),
            Codec::new(config.tcp.max_frame_size),
        ));
        let tcp = config.tcp.enabled.then(|| {
            Arc::new(TcpServer::new(
                config.tcp.clone(),
                Arc::clone(&tcp_manager),
                Arc::clone(&tcp_handler),
            ))
        });

        let ws = Arc::new(WsFrontend::new(
            &config.websocket,
            broker.clone(),
            Arc::clone(&verifier),
            Arc::clone(&users),
        ));
        let api = config.api.enabled.then(|| {
            let schema = build_schema(ApiDeps {
                broker: broker.clone(),
                users: Arc::clone(&users),
                tcp_manager: Arc::clone(&tcp_manager),
                tcp_handler: Arc::clone(&tcp_handler),
                ws: Arc::clone(&ws),
            });
            Arc::new(ApiServer::new(
                config.api.clone(),
                config.websocket.clone(),
                schema,
                ws,
                Arc::clone(&verifier),
                broker.clone(),
                tcp_manager,
            ))
        });

        Ok(Self {
            config,
            broker,
            bus,
            bridge,
            tcp,
            api,
            tcp_addr: None,
            api_addr: None,
        })
    }

    /// Starts the enabled front-ends.
    pub async fn start(&mut self) -> Result<()> {
        if let Some(tcp) = &self.tcp {
            self.tcp_addr = Some(tcp.start().await?);
        }
        if let Some(api) = &self.api {
            self.api_addr = Some(api.start().await?);
        }
        info!(
            tcp = ?self.tcp_addr,
            api = ?self.api_addr,
            adapter = ?self.config.pubsub.adapter,
            "Server started."
        );
        Ok(())
    }

    /// Stops front-ends, then the bridge, then the broker.
    pub async fn stop(&self) {
        if let Some(tcp) = &self.tcp {
            tcp.stop().await;
        }
        if let Some(api) = &self.api {
            api.stop().await;
        }
        self.bridge.shutdown();
        if let Err(err) = self.broker.disconnect().await {
            error!(%err, "Broker disconnect failed.");
        }
        info!("Server stopped.");
    }

    /// Starts, waits for ctrl-c, then stops.
    pub async fn run(mut self) -> Result<()> {
        self.start().await?;
        if let Err(err) = tokio::signal::ctrl_c().await {
            error!(%err, "Failed to listen for shutdown signal.");
        }
        info!("Shutdown signal received.");
        self.stop().await;
        Ok(())
    }

    /// The event bus business services emit on.
    pub fn bus(&self) -> &Arc<EventBus> {
        &self.bus
    }

    /// The pub/sub broker.
    pub fn broker(&self) -> &Broker {
        &self.broker
    }

    /// Bound TCP listener address, once started.
    pub fn tcp_addr(&self) -> Option<SocketAddr> {
        self.tcp_addr
    }

    /// Bound API listener address, once started.
    pub fn api_addr(&self) -> Option<SocketAddr> {
        self.api_addr
    }
}
