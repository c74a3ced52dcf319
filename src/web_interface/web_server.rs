use std::convert::Infallible;
use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;

use log::info;
use warp::{Filter, Reply};

use super::routes::*;
use crate::controller::proxy_service::ProxyService;
use crate::error_handling::types::WebError;

/// Web server for the HTTP API and the streaming socket
pub struct WebServer {
    service: Arc<ProxyService>,
    max_chunk_size: u64,
}

impl WebServer {
    /// `max_chunk_size` bounds the body of a chunk upload.
    pub fn new(service: Arc<ProxyService>, max_chunk_size: u64) -> Self {
        Self {
            service,
            max_chunk_size,
        }
    }

    /// Every route, with warp's own rejections turned into JSON errors.
    pub fn routes(&self) -> impl Filter<Extract = impl Reply, Error = Infallible> + Clone {
        let service = self.service.clone();

        let sessions = init_session_route(service.clone())
            .or(release_session_route(service.clone()))
            .or(keep_alive_route(service.clone()))
            .or(exec_route(service.clone()))
            .or(list_directory_route(service.clone()))
            .or(stream_route(service.clone()));

        let transfers = init_transfer_route(service.clone())
            .or(transfer_status_route(service.clone()))
            .or(list_chunks_route(service.clone()))
            .or(upload_chunk_route(service.clone(), self.max_chunk_size))
            .or(download_chunk_route(service.clone()))
            .or(cancel_transfer_route(service.clone()));

        let operations = list_host_keys_route(service.clone())
            .or(remove_host_key_route(service.clone()))
            .or(health_route(service));

        sessions
            .or(transfers)
            .or(operations)
            .with(warp::log("shellgate::http"))
            .recover(handle_rejection)
    }

    /// Serves on `addr` until `shutdown` completes.
    pub async fn start<F>(&self, addr: SocketAddr, shutdown: F) -> Result<(), WebError>
    where
        F: Future<Output = ()> + Send,
    {
        let routes = self.routes();
        info!("Web server listening on {}", addr);
        tokio::select! {
            _ = warp::serve(routes).run(addr) => Err(WebError::ServerStartFailed(format!(
                "server on {} stopped unexpectedly",
                addr
            ))),
            _ = shutdown => {
                info!("Web server on {} stopping", addr);
                Ok(())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::configuration::config::Config;
    use crate::controller::controller_handler::Controller;
    use tempfile::TempDir;
    use warp::http::StatusCode;

    async fn server(dir: &TempDir) -> WebServer {
        let raw = format!(
            "[server]\ninstance_id = \"instance-web\"\n[token]\nsecret = \"{}\"\n[transfer]\nscratch_dir = \"{}\"\n",
            "0123456789abcdef0123456789abcdef0123456789abcdef",
            dir.path().display()
        );
        let config = Config::from_toml_str(&raw).unwrap();
        let controller = Controller::new(config).await.unwrap();
        WebServer::new(controller.service(), 1024)
    }

    #[tokio::test]
    async fn test_health_reports_instance() {
        let dir = TempDir::new().unwrap();
        let routes = server(&dir).await.routes();

        let res = warp::test::request()
            .method("GET")
            .path("/api/health")
            .reply(&routes)
            .await;
        assert_eq!(res.status(), StatusCode::OK);
        let body: serde_json::Value = serde_json::from_slice(res.body()).unwrap();
        assert_eq!(body["instanceId"], "instance-web");
        assert_eq!(body["activeSessions"], 0);
    }

    #[tokio::test]
    async fn test_missing_or_bad_token_is_unauthorized() {
        let dir = TempDir::new().unwrap();
        let routes = server(&dir).await.routes();

        let res = warp::test::request()
            .method("POST")
            .path("/api/sessions/exec")
            .json(&serde_json::json!({"command": "uptime"}))
            .reply(&routes)
            .await;
        assert_eq!(res.status(), StatusCode::UNAUTHORIZED);

        let res = warp::test::request()
            .method("GET")
            .path("/api/transfers/some-id")
            .header("authorization", "Bearer not-a-token")
            .reply(&routes)
            .await;
        assert_eq!(res.status(), StatusCode::UNAUTHORIZED);
        let body: serde_json::Value = serde_json::from_slice(res.body()).unwrap();
        assert!(body["message"].is_string());
    }

    #[tokio::test]
    async fn test_session_init_requires_user_header() {
        let dir = TempDir::new().unwrap();
        let routes = server(&dir).await.routes();

        let res = warp::test::request()
            .method("POST")
            .path("/api/sessions")
            .json(&serde_json::json!({
                "resourceId": uuid::Uuid::new_v4(),
                "host": "10.0.0.5",
                "username": "ops",
                "password": "pw"
            }))
            .reply(&routes)
            .await;
        assert_eq!(res.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_unknown_route_is_json_not_found() {
        let dir = TempDir::new().unwrap();
        let routes = server(&dir).await.routes();

        let res = warp::test::request()
            .method("GET")
            .path("/api/nothing-here")
            .reply(&routes)
            .await;
        assert_eq!(res.status(), StatusCode::NOT_FOUND);
        let body: serde_json::Value = serde_json::from_slice(res.body()).unwrap();
        assert_eq!(body["message"], "Not found");
    }

    #[tokio::test]
    async fn test_unknown_host_key_is_not_found() {
        let dir = TempDir::new().unwrap();
        let routes = server(&dir).await.routes();

        let res = warp::test::request()
            .method("DELETE")
            .path("/api/host-keys/db-01.internal/22")
            .reply(&routes)
            .await;
        assert_eq!(res.status(), StatusCode::NOT_FOUND);
    }
}
