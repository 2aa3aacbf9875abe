//! The HTTP front-end: GraphQL queries and subscriptions, the WebSocket
//! session endpoint, and a health probe, all served by one warp listener.

mod schema;
mod stream;

use std::convert::Infallible;
use std::net::{IpAddr, SocketAddr};
use std::sync::{Arc, Mutex};

use async_graphql::http::{playground_source, GraphQLPlaygroundConfig};
use serde_json::json;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use warp::Filter;

pub use schema::{build_schema, ApiDeps, ApiSchema, AuthUserId, QueryRoot, SubscriptionRoot};
pub use stream::{subscribe_stream, BrokerStream};

use crate::auth::TokenVerifier;
use crate::config::{ApiConfig, WebSocketConfig};
use crate::error::{DependencySnafu, InvalidInputSnafu};
use crate::net::ConnectionManager;
use crate::pubsub::Broker;
use crate::ws::WsFrontend;
use crate::Result;

/// The HTTP listener serving `/graphql`, `/subscriptions`, `/ws` and
/// `/health`.
pub struct ApiServer {
    config: ApiConfig,
    ws_config: WebSocketConfig,
    schema: ApiSchema,
    ws: Arc<WsFrontend>,
    verifier: Arc<dyn TokenVerifier>,
    broker: Broker,
    tcp_manager: Arc<ConnectionManager>,
    shutdown: CancellationToken,
    local_addr: Mutex<Option<SocketAddr>>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl ApiServer {
    /// Creates a stopped server.
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        config: ApiConfig,
        ws_config: WebSocketConfig,
        schema: ApiSchema,
        ws: Arc<WsFrontend>,
        verifier: Arc<dyn TokenVerifier>,
        broker: Broker,
        tcp_manager: Arc<ConnectionManager>,
    ) -> Self {
        Self {
            config,
            ws_config,
            schema,
            ws,
            verifier,
            broker,
            tcp_manager,
            shutdown: CancellationToken::new(),
            local_addr: Mutex::new(None),
            tasks: Mutex::new(Vec::new()),
        }
    }

    /// Binds the listener and starts serving. Returns the bound address.
    pub async fn start(&self) -> Result<SocketAddr> {
        let ip: IpAddr = self.config.host.parse().map_err(|_| {
            InvalidInputSnafu {
                message: format!("invalid api host {}", self.config.host),
            }
            .build()
        })?;
        let bind_addr = SocketAddr::new(ip, self.config.port);

        let routes = self.routes();
        let shutdown = self.shutdown.clone();
        let (local_addr, serve) = warp::serve(routes)
            .try_bind_with_graceful_shutdown(bind_addr, async move {
                shutdown.cancelled().await;
            })
            .map_err(|error| {
                DependencySnafu {
                    message: format!("failed to bind api listener on {bind_addr}: {error}"),
                }
                .build()
            })?;

        *self
            .local_addr
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner()) = Some(local_addr);

        let mut tasks = self
            .tasks
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        tasks.push(tokio::spawn(serve));
        if self.ws_config.enabled {
            tasks.push(tokio::spawn(ws_stale_sweep(
                Arc::clone(self.ws.manager()),
                self.ws_config.ping_timeout(),
                self.shutdown.clone(),
            )));
        }

        info!(addr = %local_addr, "API server started.");
        Ok(local_addr)
    }

    /// Stops serving and drains WebSocket sessions.
    pub async fn stop(&self) {
        self.shutdown.cancel();
        let forced = self
            .ws
            .manager()
            .close_all(self.ws_config.drain_timeout())
            .await;
        if forced > 0 {
            warn!(forced, "Forcibly closed WebSocket sessions at drain timeout.");
        }

        let tasks: Vec<JoinHandle<()>> = self
            .tasks
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .drain(..)
            .collect();
        for task in tasks {
            let _ = task.await;
        }
        info!("API server stopped.");
    }

    /// The bound listener address, once started.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        *self
            .local_addr
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn routes(&self) -> impl Filter<Extract = impl warp::Reply, Error = warp::Rejection> + Clone {
        let schema = self.schema.clone();
        let verifier = Arc::clone(&self.verifier);
        let graphql_post = warp::path("graphql")
            .and(warp::post())
            .and(async_graphql_warp::graphql(schema.clone()))
            .and(warp::header::optional::<String>("authorization"))
            .and_then(
                move |(schema, mut request): (ApiSchema, async_graphql::Request),
                      authorization: Option<String>| {
                    let verifier = Arc::clone(&verifier);
                    async move {
                        if let Some(header) = authorization {
                            let token = header.strip_prefix("Bearer ").unwrap_or(&header);
                            if let Ok(verified) = verifier.verify(token).await {
                                request = request.data(AuthUserId(verified.user_id));
                            }
                        }
                        Ok::<_, Infallible>(async_graphql_warp::GraphQLResponse::from(
                            schema.execute(request).await,
                        ))
                    }
                },
            );

        let playground = warp::path("graphql").and(warp::get()).map(|| {
            warp::reply::html(playground_source(
                GraphQLPlaygroundConfig::new("/graphql").subscription_endpoint("/subscriptions"),
            ))
        });

        let init_verifier = Arc::clone(&self.verifier);
        let subscriptions = warp::path("subscriptions")
            .and(warp::ws())
            .and(async_graphql_warp::graphql_protocol())
            .map(move |upgrade: warp::ws::Ws, protocol| {
                let schema = schema.clone();
                let verifier = Arc::clone(&init_verifier);
                let reply = upgrade.on_upgrade(move |socket| {
                    async_graphql_warp::GraphQLWebSocket::new(socket, schema, protocol)
                        .on_connection_init(move |params| {
                            let verifier = Arc::clone(&verifier);
                            async move {
                                let mut data = async_graphql::Data::default();
                                if let Some(token) = connection_token(&params) {
                                    let verified =
                                        verifier.verify(&token).await.map_err(|error| {
                                            async_graphql::Error::new(error.to_string())
                                        })?;
                                    data.insert(AuthUserId(verified.user_id));
                                }
                                Ok(data)
                            }
                        })
                        .serve()
                });
                warp::reply::with_header(
                    reply,
                    "Sec-WebSocket-Protocol",
                    protocol.sec_websocket_protocol(),
                )
            });

        let ws_enabled = self.ws_config.enabled;
        let frontend = Arc::clone(&self.ws);
        let ws_route = warp::path("ws")
            .and(warp::ws())
            .and(warp::addr::remote())
            .and_then(move |upgrade: warp::ws::Ws, peer: Option<SocketAddr>| {
                let frontend = Arc::clone(&frontend);
                async move {
                    if !ws_enabled {
                        return Err(warp::reject::not_found());
                    }
                    Ok::<_, warp::Rejection>(upgrade.on_upgrade(move |socket| {
                        frontend.handle_socket(socket, peer)
                    }))
                }
            });

        let broker = self.broker.clone();
        let tcp_manager = Arc::clone(&self.tcp_manager);
        let ws_manager = Arc::clone(self.ws.manager());
        let health = warp::path("health").and(warp::get()).map(move || {
            warp::reply::json(&json!({
                "status": if broker.is_connected() { "ok" } else { "degraded" },
                "brokerConnected": broker.is_connected(),
                "tcpConnections": tcp_manager.active_count(),
                "websocketConnections": ws_manager.active_count(),
            }))
        });

        graphql_post
            .or(playground)
            .or(subscriptions)
            .or(ws_route)
            .or(health)
    }
}

/// Pulls the bearer token out of graphql-ws connection params.
fn connection_token(params: &serde_json::Value) -> Option<String> {
    let token = params.get("token").and_then(|value| value.as_str());
    let header = params
        .get("Authorization")
        .or_else(|| params.get("authorization"))
        .and_then(|value| value.as_str())
        .map(|header| header.strip_prefix("Bearer ").unwrap_or(header));
    token.or(header).map(str::to_owned)
}

async fn ws_stale_sweep(
    manager: Arc<ConnectionManager>,
    ping_timeout: std::time::Duration,
    shutdown: CancellationToken,
) {
    let sweep_every = ping_timeout.min(std::time::Duration::from_secs(60));
    let mut ticker = tokio::time::interval(sweep_every);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
    ticker.tick().await;
    loop {
        tokio::select! {
            _ = ticker.tick() => {}
            _ = shutdown.cancelled() => return,
        }
        let evicted = manager.remove_stale_connections(ping_timeout * 2);
        if evicted > 0 {
            info!(evicted, "Evicted stale WebSocket sessions.");
        }
    }
}
