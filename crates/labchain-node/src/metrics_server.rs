use axum::{extract::State, http::StatusCode, routing::get, Router};
use labchain_runtime::RuntimeMetrics;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

pub fn router(metrics: Arc<RuntimeMetrics>) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/metrics", get(get_metrics))
        .with_state(metrics)
}

/// Serve `/health` and `/metrics` on `listener` until `token` is cancelled.
pub async fn serve(
    listener: TcpListener,
    metrics: Arc<RuntimeMetrics>,
    token: CancellationToken,
) -> anyhow::Result<()> {
    info!(addr = %listener.local_addr()?, "📊 Metrics endpoint listening");
    axum::serve(listener, router(metrics))
        .with_graceful_shutdown(async move { token.cancelled().await })
        .await?;
    Ok(())
}

async fn health() -> &'static str {
    "OK"
}

async fn get_metrics(State(metrics): State<Arc<RuntimeMetrics>>) -> Result<String, StatusCode> {
    metrics.gather_text().map_err(|e| {
        warn!(error = %e, "Failed to encode metrics");
        StatusCode::INTERNAL_SERVER_ERROR
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    async fn get(addr: std::net::SocketAddr, path: &str) -> String {
        let mut stream = tokio::net::TcpStream::connect(addr).await.unwrap();
        let request = format!(
            "GET {} HTTP/1.1\r\nHost: localhost\r\nConnection: close\r\n\r\n",
            path
        );
        stream.write_all(request.as_bytes()).await.unwrap();
        let mut response = String::new();
        stream.read_to_string(&mut response).await.unwrap();
        response
    }

    #[tokio::test]
    async fn test_health_and_metrics_endpoints() {
        let metrics = Arc::new(RuntimeMetrics::new().unwrap());
        metrics.runs_completed.inc();

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let token = CancellationToken::new();
        let server = tokio::spawn(serve(listener, metrics, token.clone()));

        let health = get(addr, "/health").await;
        assert!(health.starts_with("HTTP/1.1 200"));
        assert!(health.ends_with("OK"));

        let body = get(addr, "/metrics").await;
        assert!(body.contains("labchain_runs_completed_total 1"));

        token.cancel();
        server.await.unwrap().unwrap();
    }
}
