use std::sync::Arc;

use async_graphql::{
    Context, EmptyMutation, Json, Object, Result as GqlResult, Schema, SimpleObject, Subscription,
};
use futures::Stream;
use serde_json::Value;

use super::stream::subscribe_stream;
use crate::auth::UserRepository;
use crate::net::{ConnectionManager, HandlerStats, MessageHandler};
use crate::pubsub::Broker;
use crate::ws::WsFrontend;

/// The authenticated caller identity, inserted into the request data by the
/// HTTP filter or the subscription connection initialiser.
pub struct AuthUserId(pub String);

/// The executable schema.
pub type ApiSchema = Schema<QueryRoot, EmptyMutation, SubscriptionRoot>;

/// Shared collaborators reachable from resolvers.
pub struct ApiDeps {
    /// The pub/sub broker.
    pub broker: Broker,
    /// User lookups for the `user` query.
    pub users: Arc<dyn UserRepository>,
    /// TCP connection registry, for stats.
    pub tcp_manager: Arc<ConnectionManager>,
    /// TCP message handler, for stats.
    pub tcp_handler: Arc<MessageHandler>,
    /// WebSocket front-end, for stats.
    pub ws: Arc<WsFrontend>,
}

/// Builds the executable schema around its collaborators.
pub fn build_schema(deps: ApiDeps) -> ApiSchema {
    Schema::build(QueryRoot, EmptyMutation, SubscriptionRoot)
        .data(deps)
        .finish()
}

/// A user as exposed through the API.
#[derive(SimpleObject)]
pub struct UserObject {
    /// Unique user id.
    id: String,
    /// Display name.
    username: String,
    /// Account creation time, RFC 3339.
    created_at: String,
}

/// Broker counter snapshot.
#[derive(SimpleObject)]
pub struct BrokerStatsObject {
    /// Messages accepted for publication.
    messages_published: i64,
    /// Handler invocations dispatched.
    messages_delivered: i64,
    /// Publication or delivery errors.
    errors: i64,
    /// Currently registered subscriptions.
    active_subscriptions: i64,
}

/// Per-front-end counter snapshot.
#[derive(SimpleObject)]
pub struct TransportStatsObject {
    /// Currently tracked connections.
    active_connections: i64,
    /// Tracked connections that have authenticated.
    authenticated_connections: i64,
    /// Connections accepted over the front-end's lifetime.
    total_accepted: i64,
    /// Messages routed through the session handler.
    messages_processed: i64,
    /// Subscriptions created.
    subscriptions: i64,
    /// Errors replied to clients.
    errors: i64,
}

fn transport_stats(
    connections: crate::net::ConnectionStats,
    handler: HandlerStats,
) -> TransportStatsObject {
    TransportStatsObject {
        active_connections: connections.active_connections as i64,
        authenticated_connections: connections.authenticated_connections as i64,
        total_accepted: connections.total_accepted as i64,
        messages_processed: handler.messages_processed as i64,
        subscriptions: handler.subscriptions as i64,
        errors: handler.errors as i64,
    }
}

/// Server-wide counter snapshot.
#[derive(SimpleObject)]
pub struct StatsObject {
    /// Broker counters.
    broker: BrokerStatsObject,
    /// TCP front-end counters.
    tcp: TransportStatsObject,
    /// WebSocket front-end counters.
    websocket: TransportStatsObject,
}

/// Read-only queries.
pub struct QueryRoot;

#[Object]
impl QueryRoot {
    /// Looks a user up by id.
    async fn user(&self, ctx: &Context<'_>, id: String) -> GqlResult<Option<UserObject>> {
        let deps = ctx.data::<ApiDeps>()?;
        let user = deps
            .users
            .find_by_id(&id)
            .await
            .map_err(|error| async_graphql::Error::new(error.to_string()))?;
        Ok(user.map(|user| UserObject {
            id: user.id,
            username: user.username,
            created_at: user
                .created_at
                .to_rfc3339_opts(chrono::SecondsFormat::Millis, true),
        }))
    }

    /// Broker and front-end counters.
    async fn stats(&self, ctx: &Context<'_>) -> GqlResult<StatsObject> {
        let deps = ctx.data::<ApiDeps>()?;
        let broker = deps.broker.stats();
        Ok(StatsObject {
            broker: BrokerStatsObject {
                messages_published: broker.messages_published as i64,
                messages_delivered: broker.messages_delivered as i64,
                errors: broker.errors as i64,
                active_subscriptions: broker.active_subscriptions as i64,
            },
            tcp: transport_stats(deps.tcp_manager.stats(), deps.tcp_handler.stats()),
            websocket: transport_stats(deps.ws.manager().stats(), deps.ws.stats()),
        })
    }
}

/// Live update streams backed by broker subscriptions.
pub struct SubscriptionRoot;

#[Subscription]
impl SubscriptionRoot {
    /// All user account events.
    async fn user_events(&self, ctx: &Context<'_>) -> async_graphql::Result<impl Stream<Item = Json<Value>>> {
        let deps = ctx.data::<ApiDeps>()?;
        let stream = subscribe_stream(&deps.broker, "users", |message| Some(Json(message.data)))
            .await
            .map_err(|error| async_graphql::Error::new(error.to_string()))?;
        Ok(stream)
    }

    /// Events for one user account.
    async fn user_updated(
        &self,
        ctx: &Context<'_>,
        user_id: String,
    ) -> async_graphql::Result<impl Stream<Item = Json<Value>>> {
        let deps = ctx.data::<ApiDeps>()?;
        let topic = format!("users.{user_id}");
        let stream = subscribe_stream(&deps.broker, &topic, |message| Some(Json(message.data)))
            .await
            .map_err(|error| async_graphql::Error::new(error.to_string()))?;
        Ok(stream)
    }

    /// All sent messages.
    async fn message_sent(&self, ctx: &Context<'_>) -> async_graphql::Result<impl Stream<Item = Json<Value>>> {
        let deps = ctx.data::<ApiDeps>()?;
        let stream = subscribe_stream(&deps.broker, "messages", extract_message)
            .await
            .map_err(|error| async_graphql::Error::new(error.to_string()))?;
        Ok(stream)
    }

    /// Messages posted to one channel.
    async fn message_to_channel(
        &self,
        ctx: &Context<'_>,
        channel_id: String,
    ) -> async_graphql::Result<impl Stream<Item = Json<Value>>> {
        let deps = ctx.data::<ApiDeps>()?;
        let topic = format!("messages.channel.{channel_id}");
        let stream = subscribe_stream(&deps.broker, &topic, extract_message)
            .await
            .map_err(|error| async_graphql::Error::new(error.to_string()))?;
        Ok(stream)
    }

    /// Direct messages for one user. Only the user themselves may subscribe;
    /// the check runs before the broker subscription is created.
    async fn message_to_user(
        &self,
        ctx: &Context<'_>,
        user_id: String,
    ) -> async_graphql::Result<impl Stream<Item = Json<Value>>> {
        let caller = ctx
            .data_opt::<AuthUserId>()
            .ok_or_else(|| async_graphql::Error::new("Unauthorized"))?;
        if caller.0 != user_id {
            return Err(async_graphql::Error::new("Forbidden"));
        }

        let deps = ctx.data::<ApiDeps>()?;
        let topic = format!("messages.user.{user_id}");
        let stream = subscribe_stream(&deps.broker, &topic, extract_message)
            .await
            .map_err(|error| async_graphql::Error::new(error.to_string()))?;
        Ok(stream)
    }
}

/// Bridged message publications wrap the message record in a `message` key;
/// hand the record itself to subscribers.
fn extract_message(message: crate::pubsub::PubSubMessage) -> Option<Json<Value>> {
    match message.data.get("message") {
        Some(inner) => Some(Json(inner.clone())),
        None => Some(Json(message.data)),
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;
    use std::time::Duration;

    use chrono::Utc;
    use courier_wire::Codec;
    use futures::StreamExt;
    use serde_json::json;
    use tokio::time::timeout;

    use super::*;
    use crate::auth::{InMemoryUserRepository, StaticTokenVerifier, User};
    use crate::config::WebSocketConfig;
    use crate::pubsub::MemoryAdapter;

    async fn deps() -> ApiDeps {
        let broker = Broker::new(Arc::new(MemoryAdapter::new(100)));
        broker.connect().await.unwrap();

        let users = Arc::new(InMemoryUserRepository::with_users([User {
            id: "u1".to_owned(),
            username: "alice".to_owned(),
            created_at: Utc::now(),
        }]));
        let verifier = Arc::new(StaticTokenVerifier::new(HashMap::new()));
        let tcp_manager = Arc::new(ConnectionManager::new(10, 10));
        let tcp_handler = Arc::new(MessageHandler::new(
            Arc::clone(&tcp_manager),
            broker.clone(),
            verifier.clone(),
            users.clone(),
            Codec::default(),
        ));
        let ws = Arc::new(WsFrontend::new(
            &WebSocketConfig::default(),
            broker.clone(),
            verifier,
            users.clone(),
        ));
        ApiDeps {
            broker,
            users,
            tcp_manager,
            tcp_handler,
            ws,
        }
    }

    #[tokio::test]
    async fn user_query_resolves_known_users() {
        let schema = build_schema(deps().await);
        let response = schema
            .execute(r#"{ user(id: "u1") { id username } }"#)
            .await;
        assert!(response.errors.is_empty(), "{:?}", response.errors);
        let data = response.data.into_json().unwrap();
        assert_eq!(data["user"]["username"], "alice");

        let response = schema.execute(r#"{ user(id: "nope") { id } }"#).await;
        let data = response.data.into_json().unwrap();
        assert_eq!(data["user"], json!(null));
    }

    #[tokio::test]
    async fn stats_query_reports_counters() {
        let deps = deps().await;
        let broker = deps.broker.clone();
        let schema = build_schema(deps);
        broker
            .publish("anywhere", json!(1), HashMap::new())
            .await
            .unwrap();

        let response = schema
            .execute("{ stats { broker { messagesPublished } tcp { activeConnections } } }")
            .await;
        assert!(response.errors.is_empty(), "{:?}", response.errors);
        let data = response.data.into_json().unwrap();
        assert_eq!(data["stats"]["broker"]["messagesPublished"], 1);
        assert_eq!(data["stats"]["tcp"]["activeConnections"], 0);
    }

    #[tokio::test]
    async fn message_sent_stream_yields_bridged_messages() {
        let deps = deps().await;
        let broker = deps.broker.clone();
        let schema = build_schema(deps);

        let mut stream = schema.execute_stream("subscription { messageSent }");

        // The resolver subscribes when the stream is first polled, so the
        // publication has to trail the first poll.
        let publisher = broker.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(200)).await;
            publisher
                .publish(
                    "messages",
                    json!({ "message": { "id": "m1" } }),
                    HashMap::new(),
                )
                .await
                .unwrap();
        });

        let response = timeout(Duration::from_secs(2), stream.next())
            .await
            .unwrap()
            .unwrap();
        assert!(response.errors.is_empty(), "{:?}", response.errors);
        let data = response.data.into_json().unwrap();
        assert_eq!(data["messageSent"]["id"], "m1");

        drop(stream);
        for _ in 0..50 {
            if broker.stats().active_subscriptions == 0 {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("subscription leaked after stream drop");
    }

    #[tokio::test]
    async fn message_to_user_requires_matching_identity() {
        let deps = deps().await;
        let schema = build_schema(deps);

        // No identity at all.
        let mut stream =
            schema.execute_stream(r#"subscription { messageToUser(userId: "u1") }"#);
        let response = stream.next().await.unwrap();
        assert!(!response.errors.is_empty());
        assert!(response.errors[0].message.contains("Unauthorized"));

        // Wrong identity.
        let request = async_graphql::Request::new(
            r#"subscription { messageToUser(userId: "u1") }"#,
        )
        .data(AuthUserId("u2".to_owned()));
        let mut stream = schema.execute_stream(request);
        let response = stream.next().await.unwrap();
        assert!(!response.errors.is_empty());
        assert!(response.errors[0].message.contains("Forbidden"));
    }
}
