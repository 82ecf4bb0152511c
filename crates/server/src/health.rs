use axum::{extract::State, http::StatusCode, routing::get, Json, Router};
use chrono::Utc;
use pricewise_core::{DispatchStats, SignalEmitter};
use pricewise_db::DbPool;
use serde::Serialize;
use tracing::{error, info};

#[derive(Clone)]
pub struct HealthState {
    db_pool: DbPool,
    signals: SignalEmitter,
}

impl HealthState {
    pub fn new(db_pool: DbPool, signals: SignalEmitter) -> Self {
        Self { db_pool, signals }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct HealthCheck {
    pub status: &'static str,
    pub detail: String,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
    pub service: HealthCheck,
    pub database: HealthCheck,
    pub signals: DispatchStats,
    pub checked_at: String,
}

pub fn router(state: HealthState) -> Router {
    Router::new().route("/health", get(health)).with_state(state)
}

pub async fn spawn(bind_address: &str, port: u16, state: HealthState) -> std::io::Result<()> {
    let address = format!("{bind_address}:{port}");
    let listener = tokio::net::TcpListener::bind(&address).await?;

    info!(
        event_name = "system.health.start",
        correlation_id = "bootstrap",
        bind_address = %address,
        "health endpoint started"
    );

    tokio::spawn(async move {
        if let Err(error) = axum::serve(listener, router(state)).await {
            error!(
                event_name = "system.health.error",
                correlation_id = "bootstrap",
                error = %error,
                "health endpoint server terminated unexpectedly"
            );
        }
    });

    Ok(())
}

/// Readiness follows the database. Signal delivery failures are reported but
/// never degrade the service.
pub async fn health(State(state): State<HealthState>) -> (StatusCode, Json<HealthResponse>) {
    let database = database_check(&state.db_pool).await;
    let ready = database.status == "ready";

    let payload = HealthResponse {
        status: if ready { "ready" } else { "degraded" },
        service: HealthCheck {
            status: "ready",
            detail: "pricewise-server runtime initialized".to_string(),
        },
        database,
        signals: state.signals.stats(),
        checked_at: Utc::now().to_rfc3339(),
    };

    let status_code = if ready { StatusCode::OK } else { StatusCode::SERVICE_UNAVAILABLE };
    (status_code, Json(payload))
}

async fn database_check(pool: &DbPool) -> HealthCheck {
    match sqlx::query_scalar::<_, i64>("SELECT COUNT(1) FROM experiment").fetch_one(pool).await {
        Ok(count) => HealthCheck {
            status: "ready",
            detail: format!("database query succeeded ({count} experiments)"),
        },
        Err(error) => {
            HealthCheck { status: "degraded", detail: format!("database query failed: {error}") }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use axum::body::{to_bytes, Body};
    use axum::http::Request;
    use axum::{extract::State, http::StatusCode, Json};
    use pricewise_core::signals::NoopSignalSink;
    use pricewise_core::{DispatcherSettings, SignalDispatcher};
    use pricewise_db::{connect_with_settings, migrations};

    use tower::ServiceExt;

    use crate::health::{health, router, HealthState};

    #[tokio::test]
    async fn health_returns_ready_when_database_is_reachable() {
        let pool = connect_with_settings("sqlite::memory:", 1, 5)
            .await
            .expect("pool should connect");
        migrations::run_pending(&pool).await.expect("migrations");
        let dispatcher =
            SignalDispatcher::spawn(Arc::new(NoopSignalSink), DispatcherSettings::default());

        let (status, Json(payload)) =
            health(State(HealthState::new(pool.clone(), dispatcher.emitter()))).await;

        assert_eq!(status, StatusCode::OK);
        assert_eq!(payload.status, "ready");
        assert_eq!(payload.database.status, "ready");
        assert_eq!(payload.database.detail, "database query succeeded (0 experiments)");
        assert_eq!(payload.signals.delivered, 0);

        dispatcher.shutdown().await;
        pool.close().await;
    }

    #[tokio::test]
    async fn health_degrades_when_schema_is_missing() {
        let pool = connect_with_settings("sqlite::memory:", 1, 5)
            .await
            .expect("pool should connect");
        let dispatcher =
            SignalDispatcher::spawn(Arc::new(NoopSignalSink), DispatcherSettings::default());

        let (status, Json(payload)) =
            health(State(HealthState::new(pool.clone(), dispatcher.emitter()))).await;

        assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(payload.status, "degraded");
        assert_eq!(payload.database.status, "degraded");
        assert_eq!(payload.service.status, "ready");

        dispatcher.shutdown().await;
    }

    #[tokio::test]
    async fn health_returns_service_unavailable_when_pool_is_closed() {
        let pool = connect_with_settings("sqlite::memory:", 1, 5)
            .await
            .expect("pool should connect");
        pool.close().await;
        let dispatcher =
            SignalDispatcher::spawn(Arc::new(NoopSignalSink), DispatcherSettings::default());

        let (status, Json(payload)) =
            health(State(HealthState::new(pool, dispatcher.emitter()))).await;

        assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(payload.database.status, "degraded");

        dispatcher.shutdown().await;
    }

    #[tokio::test]
    async fn router_serves_health_as_json() {
        let pool = connect_with_settings("sqlite::memory:", 1, 5)
            .await
            .expect("pool should connect");
        migrations::run_pending(&pool).await.expect("migrations");
        let dispatcher =
            SignalDispatcher::spawn(Arc::new(NoopSignalSink), DispatcherSettings::default());

        let response = router(HealthState::new(pool, dispatcher.emitter()))
            .oneshot(Request::builder().uri("/health").body(Body::empty()).expect("request"))
            .await
            .expect("router response");
        assert_eq!(response.status(), StatusCode::OK);

        let body = to_bytes(response.into_body(), usize::MAX).await.expect("body");
        let payload: serde_json::Value = serde_json::from_slice(&body).expect("json");
        assert_eq!(payload["status"], "ready");
        assert_eq!(payload["signals"]["dropped"], 0);

        dispatcher.shutdown().await;
    }
}
