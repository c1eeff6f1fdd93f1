//! Operator HTTP API, run event websocket and the background workers that
//! run next to them.

pub mod api;
pub mod ws;

use std::sync::Arc;

use anyhow::{Context, Result};
use axum::{Router, routing::get};
use tower_http::cors::CorsLayer;
use tracing::{error, info};

use crate::dispatch::{JobHandler, WorkerPool};
use crate::pipeline::Pipeline;

use api::AppState;

/// Where and how `serve` listens.
#[derive(Debug, Clone)]
pub struct ServeOptions {
    pub host: String,
    pub port: u16,
    pub workers: usize,
    /// Permissive CORS for a local frontend dev server.
    pub dev: bool,
}

/// Build the full application router: API plus `/ws`.
pub fn build_router(state: Arc<AppState>) -> Router {
    let events_tx = state.events.sender();

    api::api_router()
        .route(
            "/ws",
            get(move |ws_upgrade, filter| ws::run_events_handler(ws_upgrade, filter, events_tx)),
        )
        .with_state(state)
}

/// Serve the API until Ctrl+C, then stop the workers after in-flight jobs.
pub async fn serve(pipeline: Pipeline, options: ServeOptions) -> Result<()> {
    let ctx = pipeline.context().clone();
    let handler: Arc<dyn JobHandler> = Arc::new(pipeline.clone());
    let pool = WorkerPool::spawn(ctx.db.clone(), handler, &ctx.settings.jobs, options.workers);

    let state = Arc::new(AppState {
        pipeline,
        events: ctx.events.clone(),
    });
    let mut app = build_router(state);
    if options.dev {
        app = app.layer(CorsLayer::permissive());
    }

    let addr = format!("{}:{}", options.host, options.port);
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("Failed to bind to {}", addr))?;
    let local_addr = listener.local_addr()?;
    info!(addr = %local_addr, workers = options.workers, "phaseline API listening");

    let served = axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("Server error");

    pool.shutdown().await;
    served?;
    info!("server shut down gracefully");
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        error!(error = %e, "failed to install Ctrl+C handler");
        std::future::pending::<()>().await;
    }
    info!("shutting down");
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use axum::http::{Request, StatusCode};
    use tower::ServiceExt;

    use crate::pipeline::{EventBus, PipelineContext, ScriptedReasoning};
    use crate::settings::Settings;
    use crate::store::{DbHandle, PipelineDb};

    fn test_router() -> Router {
        let db = DbHandle::new(PipelineDb::new_in_memory().unwrap());
        let events = EventBus::new(16);
        let ctx = PipelineContext::new(
            db,
            Arc::new(ScriptedReasoning::new()),
            Arc::new(Settings::default()),
            events.clone(),
        );
        build_router(Arc::new(AppState {
            pipeline: Pipeline::new(ctx),
            events,
        }))
    }

    #[tokio::test]
    async fn test_health_via_full_router() {
        let req = Request::builder().uri("/health").body(Body::empty()).unwrap();
        let resp = test_router().oneshot(req).await.unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn test_api_routes_mounted() {
        let req = Request::builder().uri("/api/runs").body(Body::empty()).unwrap();
        let resp = test_router().oneshot(req).await.unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn test_ws_requires_upgrade() {
        let req = Request::builder().uri("/ws").body(Body::empty()).unwrap();
        let resp = test_router().oneshot(req).await.unwrap();
        assert!(resp.status().is_client_error());
    }

    #[tokio::test]
    async fn test_unknown_route_is_not_found() {
        let req = Request::builder().uri("/nope").body(Body::empty()).unwrap();
        let resp = test_router().oneshot(req).await.unwrap();
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);
    }
}
