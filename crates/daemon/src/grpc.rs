//! gRPC server implementation
//!
//! `DeviceService.DeviceStream` answers every inbound signal with the same
//! payload enriched with the sender's device record. Requests are resolved
//! against the registry directly; the broker is not involved.

use crate::generated::device_service_server::{DeviceService, DeviceServiceServer};
use crate::generated as pb;
use futures::{stream, Stream, StreamExt};
use meshgate_common::relay::resolve_signal;
use meshgate_common::{DeviceRegistry, Error, SignalRequest, SignalResponse};
use meshgate_web::{TokenIssuer, TokenKind};
use prost_types::{value::Kind, ListValue, Struct, Value};
use std::net::SocketAddr;
use std::pin::Pin;
use std::sync::Arc;
use tonic::service::Interceptor;
use tonic::{Request, Response, Status, Streaming};
use tracing::{debug, info, warn};
use uuid::Uuid;

/// User resolved from the bearer token by [`BearerAuth`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AuthenticatedUser(pub Uuid);

/// Rejects calls without a valid access token in `authorization` metadata
#[derive(Clone)]
pub struct BearerAuth {
    tokens: Arc<TokenIssuer>,
}

impl BearerAuth {
    pub fn new(tokens: Arc<TokenIssuer>) -> Self {
        Self { tokens }
    }
}

impl Interceptor for BearerAuth {
    fn call(&mut self, mut request: Request<()>) -> Result<Request<()>, Status> {
        let token = request
            .metadata()
            .get("authorization")
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.strip_prefix("Bearer "))
            .ok_or_else(|| Status::unauthenticated("missing bearer token"))?;

        let claims = self
            .tokens
            .verify(token, TokenKind::Access)
            .map_err(|_| Status::unauthenticated("invalid or expired token"))?;

        request.extensions_mut().insert(AuthenticatedUser(claims.sub));
        Ok(request)
    }
}

type ResponseStream = Pin<Box<dyn Stream<Item = Result<pb::SignalResponse, Status>> + Send>>;

/// gRPC service implementation
pub struct DeviceStreamService {
    registry: Arc<dyn DeviceRegistry>,
}

impl DeviceStreamService {
    pub fn new(registry: Arc<dyn DeviceRegistry>) -> Self {
        Self { registry }
    }
}

#[tonic::async_trait]
impl DeviceService for DeviceStreamService {
    type DeviceStreamStream = ResponseStream;

    async fn device_stream(
        &self,
        request: Request<Streaming<pb::SignalRequest>>,
    ) -> Result<Response<Self::DeviceStreamStream>, Status> {
        let AuthenticatedUser(user_id) = request
            .extensions()
            .get::<AuthenticatedUser>()
            .copied()
            .ok_or_else(|| Status::unauthenticated("missing bearer token"))?;

        info!("DeviceStream opened for user {}", user_id);
        let inbound = request.into_inner();
        Ok(Response::new(Box::pin(respond(
            self.registry.clone(),
            user_id,
            inbound,
        ))))
    }
}

/// Drive one stream: resolve each request and answer it in order.
///
/// Requests without a `uniqueId` are dropped. A lookup failure is sent to
/// the client as the final item. The stream ends when the client stops
/// sending or its transport fails.
pub fn respond<S>(
    registry: Arc<dyn DeviceRegistry>,
    user_id: Uuid,
    inbound: S,
) -> impl Stream<Item = Result<pb::SignalResponse, Status>> + Send
where
    S: Stream<Item = Result<pb::SignalRequest, Status>> + Send + 'static,
{
    let state = Some((registry, Box::pin(inbound)));
    stream::unfold(state, move |state| async move {
        let (registry, mut inbound) = state?;
        loop {
            let request = match inbound.next().await {
                Some(Ok(request)) => from_proto(request),
                Some(Err(status)) => {
                    debug!("DeviceStream transport ended: {}", status);
                    return None;
                }
                None => {
                    debug!("DeviceStream closed by client");
                    return None;
                }
            };

            debug!("Received {} from {}", request.kind, request.unique_id);
            match resolve_signal(registry.as_ref(), user_id, request).await {
                Ok(response) => return Some((Ok(to_proto(response)), Some((registry, inbound)))),
                Err(Error::InvalidInput(msg)) => {
                    warn!("Dropping malformed request: {}", msg);
                }
                Err(e) => {
                    warn!("DeviceStream lookup failed: {}", e);
                    return Some((Err(Status::from(e)), None));
                }
            }
        }
    })
}

fn from_proto(request: pb::SignalRequest) -> SignalRequest {
    SignalRequest {
        kind: request.r#type,
        data: request
            .data
            .map(struct_to_json)
            .unwrap_or(serde_json::Value::Null),
        unique_id: request.unique_id,
        device_id: request.device_id,
        sender_id: request.sender_id,
    }
}

fn to_proto(response: SignalResponse) -> pb::SignalResponse {
    let device = response.device;
    pb::SignalResponse {
        r#type: response.kind,
        data: json_to_struct(response.data),
        device: Some(pb::Device {
            id: device.id,
            machine_name: device.machine_name,
            platform: device.platform,
            device_id: device.device_id,
            ip_address: device.ip_address,
            created: device.created,
            updated: device.updated,
            user_id: device.user_id,
        }),
    }
}

fn struct_to_json(data: Struct) -> serde_json::Value {
    serde_json::Value::Object(
        data.fields
            .into_iter()
            .map(|(k, v)| (k, value_to_json(v)))
            .collect(),
    )
}

fn value_to_json(value: Value) -> serde_json::Value {
    match value.kind {
        None | Some(Kind::NullValue(_)) => serde_json::Value::Null,
        Some(Kind::BoolValue(b)) => serde_json::Value::Bool(b),
        Some(Kind::NumberValue(n)) => serde_json::Number::from_f64(n)
            .map(serde_json::Value::Number)
            .unwrap_or(serde_json::Value::Null),
        Some(Kind::StringValue(s)) => serde_json::Value::String(s),
        Some(Kind::ListValue(list)) => {
            serde_json::Value::Array(list.values.into_iter().map(value_to_json).collect())
        }
        Some(Kind::StructValue(s)) => struct_to_json(s),
    }
}

/// Only objects map onto a `Struct`; anything else is sent without data.
fn json_to_struct(data: serde_json::Value) -> Option<Struct> {
    match data {
        serde_json::Value::Object(map) => Some(Struct {
            fields: map.into_iter().map(|(k, v)| (k, json_to_value(v))).collect(),
        }),
        _ => None,
    }
}

fn json_to_value(value: serde_json::Value) -> Value {
    let kind = match value {
        serde_json::Value::Null => Kind::NullValue(0),
        serde_json::Value::Bool(b) => Kind::BoolValue(b),
        serde_json::Value::Number(n) => Kind::NumberValue(n.as_f64().unwrap_or_default()),
        serde_json::Value::String(s) => Kind::StringValue(s),
        serde_json::Value::Array(items) => Kind::ListValue(ListValue {
            values: items.into_iter().map(json_to_value).collect(),
        }),
        serde_json::Value::Object(map) => Kind::StructValue(Struct {
            fields: map.into_iter().map(|(k, v)| (k, json_to_value(v))).collect(),
        }),
    };
    Value { kind: Some(kind) }
}

/// Start the gRPC server
pub async fn serve(
    addr: SocketAddr,
    registry: Arc<dyn DeviceRegistry>,
    tokens: Arc<TokenIssuer>,
) -> anyhow::Result<()> {
    let service = DeviceServiceServer::with_interceptor(
        DeviceStreamService::new(registry),
        BearerAuth::new(tokens),
    );

    info!("gRPC server listening on {}", addr);

    tonic::transport::Server::builder()
        .add_service(service)
        .serve(addr)
        .await?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use meshgate_common::{Database, NewDevice, SqliteRegistry, User, UserProfile};
    use meshgate_web::auth::{DEFAULT_ACCESS_TTL, DEFAULT_REFRESH_TTL};
    use serde_json::json;

    async fn setup() -> (Arc<dyn DeviceRegistry>, User) {
        let registry = SqliteRegistry::new(Database::open_memory().unwrap());
        let user = registry
            .upsert_user(&UserProfile {
                email: "ada@example.com".to_string(),
                name: "Ada".to_string(),
                ..Default::default()
            })
            .await
            .unwrap();
        registry
            .register_device(
                user.id,
                &NewDevice {
                    device_id: "laptop".to_string(),
                    machine_name: "ada-laptop".to_string(),
                    platform: "linux".to_string(),
                },
            )
            .await
            .unwrap();
        let registry: Arc<dyn DeviceRegistry> = Arc::new(registry);
        (registry, user)
    }

    fn request(unique_id: &str, data: serde_json::Value) -> pb::SignalRequest {
        pb::SignalRequest {
            r#type: "offer".to_string(),
            data: json_to_struct(data),
            unique_id: unique_id.to_string(),
            device_id: "phone".to_string(),
            sender_id: String::new(),
        }
    }

    #[tokio::test]
    async fn test_each_request_is_enriched_in_order() {
        let (registry, user) = setup().await;
        let inbound = stream::iter(vec![
            Ok(request("laptop", json!({"sdp": "a"}))),
            Ok(request("laptop", json!({"sdp": "b"}))),
        ]);

        let responses: Vec<_> = respond(registry, user.id, inbound).collect().await;
        assert_eq!(responses.len(), 2);

        let first = responses[0].as_ref().unwrap();
        assert_eq!(first.r#type, "offer");
        assert_eq!(
            first.data.clone().map(struct_to_json),
            Some(json!({"sdp": "a"}))
        );
        let device = first.device.as_ref().unwrap();
        assert_eq!(device.device_id, "laptop");
        assert_eq!(device.machine_name, "ada-laptop");
        assert_eq!(device.user_id, user.id.to_string());

        let second = responses[1].as_ref().unwrap();
        assert_eq!(
            second.data.clone().map(struct_to_json),
            Some(json!({"sdp": "b"}))
        );
    }

    #[tokio::test]
    async fn test_malformed_request_is_dropped() {
        let (registry, user) = setup().await;
        let inbound = stream::iter(vec![
            Ok(request("", json!({}))),
            Ok(request("laptop", json!({"n": 1}))),
        ]);

        let responses: Vec<_> = respond(registry, user.id, inbound).collect().await;
        assert_eq!(responses.len(), 1);
        assert!(responses[0].is_ok());
    }

    #[tokio::test]
    async fn test_unknown_device_ends_stream() {
        let (registry, user) = setup().await;
        let inbound = stream::iter(vec![
            Ok(request("tablet", json!({}))),
            Ok(request("laptop", json!({}))),
        ]);

        let responses: Vec<_> = respond(registry, user.id, inbound).collect().await;
        assert_eq!(responses.len(), 1);
        let status = responses[0].as_ref().unwrap_err();
        assert_eq!(status.code(), tonic::Code::NotFound);
    }

    #[tokio::test]
    async fn test_device_scoped_to_caller() {
        let (registry, _) = setup().await;
        let inbound = stream::iter(vec![Ok(request("laptop", json!({})))]);

        let responses: Vec<_> = respond(registry, Uuid::new_v4(), inbound).collect().await;
        assert_eq!(responses.len(), 1);
        assert!(responses[0].is_err());
    }

    #[tokio::test]
    async fn test_transport_error_ends_stream() {
        let (registry, user) = setup().await;
        let inbound = stream::iter(vec![
            Err(Status::cancelled("client went away")),
            Ok(request("laptop", json!({}))),
        ]);

        let responses: Vec<_> = respond(registry, user.id, inbound).collect().await;
        assert!(responses.is_empty());
    }

    #[test]
    fn test_struct_conversion_preserves_nested_values() {
        let data = json!({
            "candidate": {"port": 4242.0, "tcp": false},
            "hosts": ["a", null, 1.5],
            "label": "x"
        });
        let converted = json_to_struct(data.clone()).unwrap();
        assert_eq!(struct_to_json(converted), data);

        assert!(json_to_struct(json!("scalar")).is_none());
        assert_eq!(from_proto(request("laptop", json!(null))).data, serde_json::Value::Null);
    }

    #[test]
    fn test_bearer_interceptor() {
        let tokens = Arc::new(TokenIssuer::new(
            b"grpc-test",
            DEFAULT_ACCESS_TTL,
            DEFAULT_REFRESH_TTL,
        ));
        let user = User {
            id: Uuid::new_v4(),
            subject: String::new(),
            email: "ada@example.com".to_string(),
            name: "Ada".to_string(),
            given_name: String::new(),
            family_name: String::new(),
            picture: None,
            locale: None,
            verified_email: true,
        };
        let issued = tokens.issue(&user).unwrap();
        let mut auth = BearerAuth::new(tokens);

        let status = auth.call(Request::new(())).unwrap_err();
        assert_eq!(status.code(), tonic::Code::Unauthenticated);

        let mut refresh = Request::new(());
        refresh.metadata_mut().insert(
            "authorization",
            format!("Bearer {}", issued.refresh_token).parse().unwrap(),
        );
        assert!(auth.call(refresh).is_err());

        let mut access = Request::new(());
        access.metadata_mut().insert(
            "authorization",
            format!("Bearer {}", issued.auth_token).parse().unwrap(),
        );
        let accepted = auth.call(access).unwrap();
        assert_eq!(
            accepted.extensions().get::<AuthenticatedUser>(),
            Some(&AuthenticatedUser(user.id))
        );
    }
}
