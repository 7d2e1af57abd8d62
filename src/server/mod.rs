//! Axum HTTP transport binding [`NamingCore`] to the wire protocol of
//! §6: two independently bound routers, one for client-facing requests
//! (§6.1) and one for storage registration (§6.2).
//!
//! Shaped like `nfs-mamont`'s socket-accept loop in `lib.rs`
//! (`handle_forever`/`process_socket`), but the transport itself is
//! HTTP/JSON via `axum` rather than raw RPC framing over TCP, per the
//! ecosystem choice recorded in SPEC_FULL.md §6.

use std::net::SocketAddr;
use std::sync::Arc;

use axum::extract::State;
use axum::response::IntoResponse;
use axum::routing::post;
use axum::{Json, Router};
use serde::{Deserialize, Serialize};
use tokio::net::TcpListener;
use tracing::info;

use crate::error::NamingError;
use crate::service::NamingCore;

#[derive(Deserialize)]
struct PathRequest {
    path: String,
}

#[derive(Deserialize)]
struct LockRequest {
    path: String,
    exclusive: bool,
}

#[derive(Serialize)]
struct BoolResponse {
    success: bool,
}

#[derive(Serialize)]
struct StorageResponse {
    server_ip: String,
    server_port: u16,
}

#[derive(Serialize)]
struct ListResponse {
    files: Vec<String>,
}

#[derive(Deserialize)]
struct RegisterRequest {
    storage_ip: String,
    client_port: u16,
    command_port: u16,
    files: Vec<String>,
}

#[derive(Serialize)]
struct RegisterResponse {
    files: Vec<String>,
}

async fn is_valid_path(
    State(core): State<Arc<NamingCore>>,
    Json(req): Json<PathRequest>,
) -> impl IntoResponse {
    Json(BoolResponse { success: core.is_valid_path(&req.path) })
}

async fn get_storage(
    State(core): State<Arc<NamingCore>>,
    Json(req): Json<PathRequest>,
) -> Result<Json<StorageResponse>, NamingError> {
    let hosting = core.get_storage(&req.path)?;
    Ok(Json(StorageResponse {
        server_ip: hosting.client_endpoint.ip().to_string(),
        server_port: hosting.client_endpoint.port(),
    }))
}

async fn is_directory(
    State(core): State<Arc<NamingCore>>,
    Json(req): Json<PathRequest>,
) -> Result<Json<BoolResponse>, NamingError> {
    Ok(Json(BoolResponse { success: core.is_directory(&req.path)? }))
}

async fn list(
    State(core): State<Arc<NamingCore>>,
    Json(req): Json<PathRequest>,
) -> Result<Json<ListResponse>, NamingError> {
    Ok(Json(ListResponse { files: core.list(&req.path)? }))
}

async fn create_file(
    State(core): State<Arc<NamingCore>>,
    Json(req): Json<PathRequest>,
) -> Result<Json<BoolResponse>, NamingError> {
    Ok(Json(BoolResponse { success: core.create_file(&req.path)? }))
}

async fn create_directory(
    State(core): State<Arc<NamingCore>>,
    Json(req): Json<PathRequest>,
) -> Result<Json<BoolResponse>, NamingError> {
    Ok(Json(BoolResponse { success: core.create_directory(&req.path)? }))
}

async fn delete(
    State(core): State<Arc<NamingCore>>,
    Json(req): Json<PathRequest>,
) -> Result<Json<BoolResponse>, NamingError> {
    Ok(Json(BoolResponse { success: core.delete(&req.path)? }))
}

async fn lock(
    State(core): State<Arc<NamingCore>>,
    Json(req): Json<LockRequest>,
) -> Result<(), NamingError> {
    core.lock(&req.path, req.exclusive).await
}

async fn unlock(
    State(core): State<Arc<NamingCore>>,
    Json(req): Json<LockRequest>,
) -> Result<(), NamingError> {
    core.unlock(&req.path, req.exclusive)
}

async fn register(
    State(core): State<Arc<NamingCore>>,
    Json(req): Json<RegisterRequest>,
) -> Result<Json<RegisterResponse>, NamingError> {
    let storage_ip: std::net::IpAddr = req
        .storage_ip
        .parse()
        .map_err(|_| NamingError::IllegalArgument("storage_ip is not a valid IP address"))?;
    let files = core.register(storage_ip, req.client_port, req.command_port, &req.files)?;
    Ok(Json(RegisterResponse { files }))
}

/// The client-facing service endpoint router (§6.1).
pub fn client_router(core: Arc<NamingCore>) -> Router {
    Router::new()
        .route("/is_valid_path", post(is_valid_path))
        .route("/get_storage", post(get_storage))
        .route("/is_directory", post(is_directory))
        .route("/list", post(list))
        .route("/create_file", post(create_file))
        .route("/create_directory", post(create_directory))
        .route("/delete", post(delete))
        .route("/lock", post(lock))
        .route("/unlock", post(unlock))
        .with_state(core)
}

/// The storage registration endpoint router (§6.2).
pub fn registration_router(core: Arc<NamingCore>) -> Router {
    Router::new().route("/register", post(register)).with_state(core)
}

/// Binds and serves both routers until either task exits. Mirrors the
/// teacher's `handle_forever` naming: the naming server accepts
/// connections until the process is killed.
pub async fn serve(core: Arc<NamingCore>, client_bind: SocketAddr, registration_bind: SocketAddr) -> std::io::Result<()> {
    let client_listener = TcpListener::bind(client_bind).await?;
    let registration_listener = TcpListener::bind(registration_bind).await?;

    info!(%client_bind, %registration_bind, "naming server listening");

    let client_server = axum::serve(client_listener, client_router(core.clone()));
    let registration_server = axum::serve(registration_listener, registration_router(core));

    tokio::try_join!(
        async { client_server.await },
        async { registration_server.await },
    )?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::command::CommandClient;
    use crate::error::CommandError;
    use crate::path::Path;
    use axum::body::Body;
    use axum::http::{Request, StatusCode};
    use tower::ServiceExt;

    struct NoopClient;

    #[async_trait::async_trait]
    impl CommandClient for NoopClient {
        async fn create(&self, _endpoint: SocketAddr, _path: &Path) -> Result<(), CommandError> {
            Ok(())
        }
        async fn delete(&self, _endpoint: SocketAddr, _path: &Path) -> Result<(), CommandError> {
            Ok(())
        }
        async fn copy(
            &self,
            _endpoint: SocketAddr,
            _path: &Path,
            _source: SocketAddr,
        ) -> Result<(), CommandError> {
            Ok(())
        }
    }

    fn core() -> Arc<NamingCore> {
        Arc::new(NamingCore::new(Arc::new(NoopClient)))
    }

    fn json_request(uri: &str, body: serde_json::Value) -> Request<Body> {
        Request::builder()
            .method("POST")
            .uri(uri)
            .header("content-type", "application/json")
            .body(Body::from(body.to_string()))
            .unwrap()
    }

    #[tokio::test]
    async fn is_valid_path_round_trips_through_http() {
        let app = client_router(core());
        let response = app
            .oneshot(json_request("/is_valid_path", serde_json::json!({"path": "/"})))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn get_storage_for_missing_file_is_404() {
        let app = client_router(core());
        let response = app
            .oneshot(json_request("/get_storage", serde_json::json!({"path": "/missing"})))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn register_then_create_file_then_get_storage() {
        let core = core();
        let reg_app = registration_router(core.clone());
        let reg_response = reg_app
            .oneshot(json_request(
                "/register",
                serde_json::json!({
                    "storage_ip": "127.0.0.1",
                    "client_port": 9000,
                    "command_port": 9001,
                    "files": []
                }),
            ))
            .await
            .unwrap();
        assert_eq!(reg_response.status(), StatusCode::OK);

        let client_app = client_router(core);
        let create_response = client_app
            .clone()
            .oneshot(json_request("/create_file", serde_json::json!({"path": "/f"})))
            .await
            .unwrap();
        assert_eq!(create_response.status(), StatusCode::OK);

        let storage_response = client_app
            .oneshot(json_request("/get_storage", serde_json::json!({"path": "/f"})))
            .await
            .unwrap();
        assert_eq!(storage_response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn duplicate_registration_endpoint_is_409() {
        let core = core();
        let reg_app = registration_router(core);
        let body = serde_json::json!({
            "storage_ip": "127.0.0.1",
            "client_port": 9000,
            "command_port": 9001,
            "files": []
        });
        let first = reg_app.clone().oneshot(json_request("/register", body.clone())).await.unwrap();
        assert_eq!(first.status(), StatusCode::OK);
        let second = reg_app.oneshot(json_request("/register", body)).await.unwrap();
        assert_eq!(second.status(), StatusCode::CONFLICT);
    }
}
