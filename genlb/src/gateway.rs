//! Optional CRUD passthrough to an external API-gateway admin endpoint
//! (spec.md §1: "out of scope... pure passthrough; not specified"). Grounded
//! in `original_source/kong_manager.py`'s `KongManager` — a plain wrapper
//! over Services/Routes/Plugins/Consumers with no coupling to the core
//! data model. Enabled only behind the `gateway` Cargo feature.

use std::sync::Arc;

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{delete, get, post};
use axum::{Json, Router};
use reqwest::Method;
use serde_json::Value;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum GatewayError {
    #[error("gateway unreachable: {0}")]
    Unreachable(String),
    #[error("gateway rejected request (status {status}): {message}")]
    Rejected { status: u16, message: String },
}

impl IntoResponse for GatewayError {
    fn into_response(self) -> Response {
        let status = StatusCode::BAD_GATEWAY;
        let body = Json(serde_json::json!({ "error": self.to_string() }));
        (status, body).into_response()
    }
}

/// Thin wrapper around an external gateway's admin API. Holds nothing but
/// an HTTP client and a base URL — no reference into `genlb_core::Engine`,
/// matching spec.md §9's "no coupling to the core data model".
#[derive(Clone)]
pub struct GatewayClient {
    http: reqwest::Client,
    admin_url: String,
}

impl GatewayClient {
    pub fn new(admin_url: String) -> Self {
        GatewayClient {
            http: reqwest::Client::new(),
            admin_url,
        }
    }

    async fn request(&self, method: Method, path: &str, body: Option<Value>) -> Result<Value, GatewayError> {
        let url = format!("{}{}", self.admin_url, path);
        let mut req = self.http.request(method, &url);
        if let Some(body) = body {
            req = req.json(&body);
        }
        let resp = req
            .send()
            .await
            .map_err(|e| GatewayError::Unreachable(e.to_string()))?;
        let status = resp.status();
        if status.as_u16() == 204 {
            return Ok(serde_json::json!({ "success": true }));
        }
        if !status.is_success() {
            let message = resp.text().await.unwrap_or_default();
            return Err(GatewayError::Rejected {
                status: status.as_u16(),
                message,
            });
        }
        resp.json().await.map_err(|e| GatewayError::Rejected {
            status: status.as_u16(),
            message: e.to_string(),
        })
    }

    pub async fn list_services(&self) -> Result<Value, GatewayError> {
        self.request(Method::GET, "/services", None).await
    }

    pub async fn create_service(&self, body: Value) -> Result<Value, GatewayError> {
        self.request(Method::POST, "/services", Some(body)).await
    }

    pub async fn delete_service(&self, name_or_id: &str) -> Result<Value, GatewayError> {
        self.request(Method::DELETE, &format!("/services/{name_or_id}"), None).await
    }

    pub async fn list_routes(&self, service_name: &str) -> Result<Value, GatewayError> {
        self.request(Method::GET, &format!("/services/{service_name}/routes"), None)
            .await
    }

    pub async fn create_route(&self, service_name: &str, body: Value) -> Result<Value, GatewayError> {
        self.request(Method::POST, &format!("/services/{service_name}/routes"), Some(body))
            .await
    }

    pub async fn delete_route(&self, name_or_id: &str) -> Result<Value, GatewayError> {
        self.request(Method::DELETE, &format!("/routes/{name_or_id}"), None).await
    }

    pub async fn list_consumers(&self) -> Result<Value, GatewayError> {
        self.request(Method::GET, "/consumers", None).await
    }

    pub async fn create_consumer(&self, body: Value) -> Result<Value, GatewayError> {
        self.request(Method::POST, "/consumers", Some(body)).await
    }

    pub async fn delete_consumer(&self, username_or_id: &str) -> Result<Value, GatewayError> {
        self.request(Method::DELETE, &format!("/consumers/{username_or_id}"), None)
            .await
    }

    pub async fn list_plugins(&self) -> Result<Value, GatewayError> {
        self.request(Method::GET, "/plugins", None).await
    }

    pub async fn create_plugin(&self, body: Value) -> Result<Value, GatewayError> {
        self.request(Method::POST, "/plugins", Some(body)).await
    }

    pub async fn delete_plugin(&self, plugin_id: &str) -> Result<Value, GatewayError> {
        self.request(Method::DELETE, &format!("/plugins/{plugin_id}"), None).await
    }
}

async fn list_services(State(client): State<Arc<GatewayClient>>) -> Result<Json<Value>, GatewayError> {
    Ok(Json(client.list_services().await?))
}

async fn create_service(
    State(client): State<Arc<GatewayClient>>,
    Json(body): Json<Value>,
) -> Result<Json<Value>, GatewayError> {
    Ok(Json(client.create_service(body).await?))
}

async fn delete_service(
    State(client): State<Arc<GatewayClient>>,
    Path(name): Path<String>,
) -> Result<Json<Value>, GatewayError> {
    Ok(Json(client.delete_service(&name).await?))
}

async fn list_routes(
    State(client): State<Arc<GatewayClient>>,
    Path(service_name): Path<String>,
) -> Result<Json<Value>, GatewayError> {
    Ok(Json(client.list_routes(&service_name).await?))
}

async fn create_route(
    State(client): State<Arc<GatewayClient>>,
    Path(service_name): Path<String>,
    Json(body): Json<Value>,
) -> Result<Json<Value>, GatewayError> {
    Ok(Json(client.create_route(&service_name, body).await?))
}

async fn delete_route(
    State(client): State<Arc<GatewayClient>>,
    Path(name): Path<String>,
) -> Result<Json<Value>, GatewayError> {
    Ok(Json(client.delete_route(&name).await?))
}

async fn list_consumers(State(client): State<Arc<GatewayClient>>) -> Result<Json<Value>, GatewayError> {
    Ok(Json(client.list_consumers().await?))
}

async fn create_consumer(
    State(client): State<Arc<GatewayClient>>,
    Json(body): Json<Value>,
) -> Result<Json<Value>, GatewayError> {
    Ok(Json(client.create_consumer(body).await?))
}

async fn delete_consumer(
    State(client): State<Arc<GatewayClient>>,
    Path(name): Path<String>,
) -> Result<Json<Value>, GatewayError> {
    Ok(Json(client.delete_consumer(&name).await?))
}

async fn list_plugins(State(client): State<Arc<GatewayClient>>) -> Result<Json<Value>, GatewayError> {
    Ok(Json(client.list_plugins().await?))
}

async fn create_plugin(
    State(client): State<Arc<GatewayClient>>,
    Json(body): Json<Value>,
) -> Result<Json<Value>, GatewayError> {
    Ok(Json(client.create_plugin(body).await?))
}

async fn delete_plugin(
    State(client): State<Arc<GatewayClient>>,
    Path(id): Path<String>,
) -> Result<Json<Value>, GatewayError> {
    Ok(Json(client.delete_plugin(&id).await?))
}

/// Builds the gateway sub-router with its own state, so it can be merged
/// into the main router (which has a different state type) via
/// `Router::merge` once both have had `with_state` applied.
pub fn router(admin_url: String) -> Router {
    let client = Arc::new(GatewayClient::new(admin_url));

    Router::new()
        .route("/lb/gateway/services", get(list_services).post(create_service))
        .route("/lb/gateway/services/:name", delete(delete_service))
        .route(
            "/lb/gateway/services/:name/routes",
            get(list_routes).post(create_route),
        )
        .route("/lb/gateway/routes/:name", delete(delete_route))
        .route("/lb/gateway/consumers", get(list_consumers).post(create_consumer))
        .route("/lb/gateway/consumers/:name", delete(delete_consumer))
        .route("/lb/gateway/plugins", get(list_plugins).post(create_plugin))
        .route("/lb/gateway/plugins/:id", delete(delete_plugin))
        .with_state(client)
}

#[cfg(test)]
mod tests {
    use super::*;
    use httpmock::Method::{DELETE, GET, POST};
    use httpmock::MockServer;
    use serde_json::json;

    #[tokio::test]
    async fn list_services_forwards_to_admin_url() {
        let server = MockServer::start();
        let mock = server.mock(|when, then| {
            when.method(GET).path("/services");
            then.status(200).json_body(json!({ "data": [] }));
        });

        let client = GatewayClient::new(server.base_url());
        let result = client.list_services().await.unwrap();
        assert_eq!(result, json!({ "data": [] }));
        mock.assert();
    }

    #[tokio::test]
    async fn create_consumer_sends_json_body() {
        let server = MockServer::start();
        let mock = server.mock(|when, then| {
            when.method(POST)
                .path("/consumers")
                .json_body(json!({ "username": "alice" }));
            then.status(201).json_body(json!({ "id": "c1", "username": "alice" }));
        });

        let client = GatewayClient::new(server.base_url());
        let result = client.create_consumer(json!({ "username": "alice" })).await.unwrap();
        assert_eq!(result["id"], "c1");
        mock.assert();
    }

    #[tokio::test]
    async fn non_2xx_becomes_rejected_error() {
        let server = MockServer::start();
        server.mock(|when, then| {
            when.method(DELETE).path("/services/missing");
            then.status(404).body("not found");
        });

        let client = GatewayClient::new(server.base_url());
        let err = client.delete_service("missing").await.unwrap_err();
        assert!(matches!(err, GatewayError::Rejected { status: 404, .. }));
    }
}
