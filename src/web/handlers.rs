//! HTTP request handlers.

use super::AppState;

use askama::Template;
use axum::{
    extract::State,
    http::{header, StatusCode},
    response::{Html, IntoResponse},
};
use prometheus::{Encoder, TextEncoder};

#[derive(Template)]
#[template(
    source = r#"<html>
<head><title>Watchdog Exporter</title></head>
<body>
<h1>Watchdog Exporter</h1>
<p><a href="{{ telemetry_path }}">Metrics</a></p>
</body>
</html>
"#,
    ext = "html"
)]
struct IndexTemplate<'a> {
    telemetry_path: &'a str,
}

/// Encode the registry in the Prometheus text format.
pub async fn handle_metrics(State(state): State<AppState>) -> impl IntoResponse {
    let encoder = TextEncoder::new();
    let families = state.registry.gather();

    let mut buffer = Vec::new();
    if let Err(e) = encoder.encode(&families, &mut buffer) {
        tracing::error!("Failed to encode metrics: {}", e);
        return (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()).into_response();
    }

    (
        [(header::CONTENT_TYPE, encoder.format_type().to_string())],
        buffer,
    )
        .into_response()
}

pub async fn handle_index(State(state): State<AppState>) -> impl IntoResponse {
    let page = IndexTemplate {
        telemetry_path: &state.telemetry_path,
    };
    match page.render() {
        Ok(html) => Html(html).into_response(),
        Err(e) => {
            tracing::error!("Failed to render index page: {}", e);
            (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()).into_response()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use prometheus::Registry;

    #[tokio::test]
    async fn test_index_escapes_telemetry_path() {
        let state = AppState {
            registry: Registry::new(),
            telemetry_path: "/m\"><script>alert(1)</script>".to_string(),
        };

        let resp = handle_index(State(state)).await.into_response();
        assert_eq!(resp.status(), StatusCode::OK);
        let body = axum::body::to_bytes(resp.into_body(), usize::MAX).await.unwrap();
        let html = String::from_utf8(body.to_vec()).unwrap();

        assert!(!html.contains("<script>"));
        assert!(html.contains("&lt;script&gt;"));
        assert!(html.contains("m&quot;&gt;"));
    }
}
