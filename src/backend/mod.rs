//! Backend service
//!
//! Stateless responder: `GET /` answers with a fixed plain-text body, every
//! other path is 404.

use axum::{routing::get, Router};
use tower_http::trace::TraceLayer;

pub const GREETING: &str = "Hello from the backend!";

pub fn router() -> Router {
    Router::new()
        .route("/", get(greeting))
        .layer(TraceLayer::new_for_http())
}

async fn greeting() -> &'static str {
    GREETING
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::serve;

    #[tokio::test]
    async fn test_root_returns_fixed_body() {
        let addr = serve(router()).await;
        let resp = reqwest::get(format!("http://{}/", addr)).await.unwrap();

        assert_eq!(resp.status(), 200);
        assert!(resp.headers()["content-type"]
            .to_str()
            .unwrap()
            .starts_with("text/plain"));
        assert_eq!(resp.text().await.unwrap(), GREETING);
    }

    #[tokio::test]
    async fn test_other_paths_are_not_found() {
        let addr = serve(router()).await;
        let resp = reqwest::get(format!("http://{}/api/health", addr)).await.unwrap();
        assert_eq!(resp.status(), 404);
    }

    #[tokio::test]
    async fn test_concurrent_requests_get_identical_answers() {
        let addr = serve(router()).await;
        let client = reqwest::Client::new();

        let requests = (0..32).map(|_| {
            let client = client.clone();
            async move {
                let resp = client.get(format!("http://{}/", addr)).send().await.unwrap();
                (resp.status(), resp.text().await.unwrap())
            }
        });

        for (status, body) in futures::future::join_all(requests).await {
            assert_eq!(status, 200);
            assert_eq!(body, GREETING);
        }
    }
}
