use std::sync::Arc;
use std::time::Duration;

use pricewise_core::config::{AppConfig, ConfigError, LoadOptions};
use pricewise_core::signals::NoopSignalSink;
use pricewise_core::{
    DispatchStats, DispatcherSettings, ExperimentService, ServiceSettings, SignalDispatcher,
    SignalSink,
};
use pricewise_db::{
    connect, migrations, DbPool, SqlAssignmentRepository, SqlEventRepository,
    SqlExperimentRepository,
};
use thiserror::Error;
use tracing::info;

use crate::webhook::WebhookSignalSink;

pub struct Application {
    pub config: AppConfig,
    pub db_pool: DbPool,
    pub service: ExperimentService,
    pub signals: SignalDispatcher,
}

impl Application {
    /// Drains queued signals and closes the pool.
    pub async fn shutdown(self) -> DispatchStats {
        let stats = self.signals.shutdown().await;
        self.db_pool.close().await;
        stats
    }
}

#[derive(Debug, Error)]
pub enum BootstrapError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error("database connection failed: {0}")]
    DatabaseConnect(#[source] sqlx::Error),
    #[error("database migration failed: {0}")]
    Migration(#[source] sqlx::migrate::MigrateError),
    #[error("signal sink initialization failed: {0}")]
    SignalSink(#[source] reqwest::Error),
}

pub async fn bootstrap(options: LoadOptions) -> Result<Application, BootstrapError> {
    let config = AppConfig::load(options)?;
    bootstrap_with_config(config).await
}

pub async fn bootstrap_with_config(config: AppConfig) -> Result<Application, BootstrapError> {
    info!(
        event_name = "system.bootstrap.start",
        correlation_id = "bootstrap",
        environment = ?config.environment,
        "starting application bootstrap"
    );

    let db_pool = connect(&config.database).await.map_err(BootstrapError::DatabaseConnect)?;
    info!(
        event_name = "system.bootstrap.database_connected",
        correlation_id = "bootstrap",
        "database connection established"
    );

    migrations::run_pending(&db_pool).await.map_err(BootstrapError::Migration)?;
    info!(
        event_name = "system.bootstrap.migrations_applied",
        correlation_id = "bootstrap",
        "database migrations applied"
    );

    let sink = signal_sink(&config)?;
    let signals = SignalDispatcher::spawn(sink, DispatcherSettings::from_config(&config.signals));

    let service = ExperimentService::new(
        Arc::new(SqlExperimentRepository::new(db_pool.clone())),
        Arc::new(SqlAssignmentRepository::new(db_pool.clone())),
        Arc::new(SqlEventRepository::new(db_pool.clone())),
        ServiceSettings::from_config(&config.experiments),
    )
    .with_signals(signals.emitter());

    info!(
        event_name = "system.bootstrap.service_ready",
        correlation_id = "bootstrap",
        signals_enabled = config.signals.enabled,
        store_timeout_ms = config.experiments.store_timeout_ms,
        "experiment service ready"
    );

    Ok(Application { config, db_pool, service, signals })
}

fn signal_sink(config: &AppConfig) -> Result<Arc<dyn SignalSink>, BootstrapError> {
    let signals = &config.signals;
    match (signals.enabled, &signals.webhook_url, &signals.webhook_secret) {
        (true, Some(url), Some(secret)) => {
            let sink = WebhookSignalSink::new(
                url.clone(),
                secret.clone(),
                Duration::from_secs(signals.request_timeout_secs),
            )
            .map_err(BootstrapError::SignalSink)?;
            Ok(Arc::new(sink))
        }
        _ => Ok(Arc::new(NoopSignalSink)),
    }
}

#[cfg(test)]
mod tests {
    use pricewise_core::config::{ConfigOverrides, LoadOptions};
    use pricewise_core::ExperimentRef;
    use pricewise_db::DemoSeedDataset;

    use crate::bootstrap::bootstrap;

    #[tokio::test]
    async fn bootstrap_fails_fast_when_signals_lack_a_webhook() {
        let result = bootstrap(LoadOptions {
            overrides: ConfigOverrides {
                database_url: Some("sqlite::memory:".to_string()),
                signals_enabled: Some(true),
                ..ConfigOverrides::default()
            },
            ..LoadOptions::default()
        })
        .await;

        let message = result.err().expect("error").to_string();
        assert!(message.contains("signals.webhook_url"));
    }

    #[tokio::test]
    async fn integration_smoke_covers_assignment_conversion_and_recommendation() {
        let dir = tempfile::tempdir().expect("tempdir");
        let url = format!("sqlite://{}", dir.path().join("bootstrap.db").display());
        let app = bootstrap(LoadOptions {
            overrides: ConfigOverrides { database_url: Some(url), ..ConfigOverrides::default() },
            ..LoadOptions::default()
        })
        .await
        .expect("bootstrap should succeed with valid overrides");

        let seeded = DemoSeedDataset::load(&app.db_pool).await.expect("seed");
        let experiment = ExperimentRef::Id(seeded.experiment_id);

        let assigned =
            app.service.get_or_assign_variant(&experiment, "smoke-user").await.expect("assign");
        assert!(assigned.newly_assigned);

        let receipt =
            app.service.record_conversion(&experiment, "smoke-user", None).await.expect("convert");
        assert_eq!(receipt.revenue, assigned.price);

        let recommendation =
            app.service.recommend(&experiment, &Default::default()).await.expect("recommend");
        assert_eq!(recommendation.best.rank, 1);
        assert!(!recommendation.uses_baseline_conversion);

        let stats = app.shutdown().await;
        assert_eq!(stats.delivered, 2, "noop sink accepts both signals");
        assert_eq!(stats.failed, 0);
    }
}
