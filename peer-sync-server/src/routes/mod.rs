pub mod health;
pub mod sync;

use crate::auth::require_password;
use crate::state::AppState;
use axum::extract::DefaultBodyLimit;
use axum::Router;
use std::sync::Arc;
use tower_http::trace::TraceLayer;

pub fn create_router(state: Arc<AppState>) -> Router {
    let sync_routes = sync::router().layer(axum::middleware::from_fn_with_state(state.clone(), require_password));

    Router::new()
        .nest("/api/sync", sync_routes)
        .route("/health", axum::routing::get(health::health))
        .layer(DefaultBodyLimit::disable())
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::AppConfig;
    use axum::body::Body;
    use axum::http::{Request, StatusCode};
    use tempfile::TempDir;
    use tower::ServiceExt;

    fn app(dir: &TempDir, password: Option<&str>) -> Router {
        let config = AppConfig {
            port: 0,
            incoming_dir: dir.path().join("incoming"),
            archive_dir: dir.path().join("archives"),
            keys_dir: dir.path().join("keys"),
            password: password.map(str::to_string),
            log_level: "info".into(),
        };
        create_router(Arc::new(AppState::new(config)))
    }

    const MANIFEST_URI: &str = "/api/sync/manifest?user_id=3&share_name=docs&source_server=origin-a";

    async fn send(app: Router, request: Request<Body>) -> (StatusCode, Vec<u8>) {
        let response = app.oneshot(request).await.unwrap();
        let status = response.status();
        let body = axum::body::to_bytes(response.into_body(), usize::MAX).await.unwrap();
        (status, body.to_vec())
    }

    #[tokio::test]
    async fn test_health_needs_no_password() {
        let dir = TempDir::new().unwrap();
        let request = Request::get("/health").body(Body::empty()).unwrap();
        let (status, body) = send(app(&dir, Some("s3cret")), request).await;
        assert_eq!(status, StatusCode::OK);
        let value: serde_json::Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(value["status"], "ok");
    }

    #[tokio::test]
    async fn test_password_is_enforced() {
        let dir = TempDir::new().unwrap();

        let missing = Request::get(MANIFEST_URI).body(Body::empty()).unwrap();
        let (status, body) = send(app(&dir, Some("s3cret")), missing).await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);
        let value: serde_json::Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(value["error"], "Missing sync password");

        let wrong = Request::get(MANIFEST_URI)
            .header("X-Sync-Password", "guess")
            .body(Body::empty())
            .unwrap();
        let (status, _) = send(app(&dir, Some("s3cret")), wrong).await;
        assert_eq!(status, StatusCode::FORBIDDEN);

        let right = Request::get(MANIFEST_URI)
            .header("X-Sync-Password", "s3cret")
            .body(Body::empty())
            .unwrap();
        let (status, _) = send(app(&dir, Some("s3cret")), right).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_manifest_put_then_get() {
        let dir = TempDir::new().unwrap();

        let put = Request::put(MANIFEST_URI).body(Body::from(&b"sealed bytes"[..])).unwrap();
        let (status, _) = send(app(&dir, None), put).await;
        assert_eq!(status, StatusCode::OK);

        let stored = dir.path().join("incoming/origin-a/3_docs/.sync-manifest.json.enc");
        assert_eq!(std::fs::read(&stored).unwrap(), b"sealed bytes");

        let get = Request::get(MANIFEST_URI).body(Body::empty()).unwrap();
        let (status, body) = send(app(&dir, None), get).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body, b"sealed bytes");
    }

    #[tokio::test]
    async fn test_origin_defaults_to_unknown() {
        let dir = TempDir::new().unwrap();
        let put = Request::put("/api/sync/manifest?user_id=3&share_name=docs")
            .body(Body::from(&b"m"[..]))
            .unwrap();
        let (status, _) = send(app(&dir, None), put).await;
        assert_eq!(status, StatusCode::OK);
        assert!(dir.path().join("incoming/unknown/3_docs/.sync-manifest.json.enc").exists());
    }

    #[tokio::test]
    async fn test_unsafe_names_are_rejected() {
        let dir = TempDir::new().unwrap();

        let share = Request::get("/api/sync/manifest?user_id=3&share_name=..&source_server=a")
            .body(Body::empty())
            .unwrap();
        let (status, _) = send(app(&dir, None), share).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);

        let delete = Request::delete("/api/sync/file?user_id=3&share_name=docs&source_server=a&path=../../x.enc")
            .body(Body::empty())
            .unwrap();
        let (status, _) = send(app(&dir, None), delete).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_listing_without_backup_is_empty() {
        let dir = TempDir::new().unwrap();
        let list = Request::get("/api/sync/list-physical-files?user_id=3&share_name=docs")
            .body(Body::empty())
            .unwrap();
        let (status, body) = send(app(&dir, None), list).await;
        assert_eq!(status, StatusCode::OK);
        let value: serde_json::Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(value["files"], serde_json::json!([]));
    }
}
