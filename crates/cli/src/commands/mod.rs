pub mod assign;
pub mod config;
pub mod convert;
pub mod doctor;
pub mod migrate;
pub mod recommend;
pub mod results;
pub mod seed;

use std::future::Future;
use std::sync::Arc;

use clap::Args;
use pricewise_core::config::{AppConfig, LoadOptions};
use pricewise_core::{
    ApplicationError, ExperimentRef, ExperimentService, InterfaceError, ServiceSettings,
};
use pricewise_db::{
    connect, migrations, SqlAssignmentRepository, SqlEventRepository, SqlExperimentRepository,
};
use serde::Serialize;
use serde_json::Value;
use tokio::runtime::Runtime;

pub const EXIT_CONFIG: u8 = 2;
pub const EXIT_RUNTIME: u8 = 3;
pub const EXIT_DATABASE: u8 = 4;
pub const EXIT_MIGRATION: u8 = 5;
pub const EXIT_OPERATION: u8 = 6;

#[derive(Debug, Clone)]
pub struct CommandResult {
    pub exit_code: u8,
    pub output: String,
}

#[derive(Debug, Serialize)]
struct CommandOutcome {
    command: String,
    status: String,
    error_class: Option<String>,
    message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    correlation_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    data: Option<Value>,
}

impl CommandResult {
    pub fn success(command: &str, message: impl Into<String>) -> Self {
        Self::emit(CommandOutcome {
            command: command.to_string(),
            status: "ok".to_string(),
            error_class: None,
            message: message.into(),
            correlation_id: None,
            data: None,
        }, 0)
    }

    pub fn success_with_data(
        command: &str,
        message: impl Into<String>,
        data: impl Serialize,
    ) -> Self {
        match serde_json::to_value(data) {
            Ok(data) => Self::emit(CommandOutcome {
                command: command.to_string(),
                status: "ok".to_string(),
                error_class: None,
                message: message.into(),
                correlation_id: None,
                data: Some(data),
            }, 0),
            Err(error) => Self::failure(command, "serialization", error.to_string(), EXIT_RUNTIME),
        }
    }

    pub fn failure(
        command: &str,
        error_class: &str,
        message: impl Into<String>,
        exit_code: u8,
    ) -> Self {
        Self::emit(CommandOutcome {
            command: command.to_string(),
            status: "error".to_string(),
            error_class: Some(error_class.to_string()),
            message: message.into(),
            correlation_id: None,
            data: None,
        }, exit_code)
    }

    fn operation_failure(command: &str, error: &InterfaceError) -> Self {
        let error_class = match error {
            InterfaceError::BadRequest { .. } => "bad_request",
            InterfaceError::NotFound { .. } => "not_found",
            InterfaceError::ServiceUnavailable { .. } => "service_unavailable",
            InterfaceError::Internal { .. } => "internal",
        };
        Self::emit(CommandOutcome {
            command: command.to_string(),
            status: "error".to_string(),
            error_class: Some(error_class.to_string()),
            message: error.to_string(),
            correlation_id: Some(error.correlation_id().to_string()),
            data: None,
        }, EXIT_OPERATION)
    }

    fn emit(payload: CommandOutcome, exit_code: u8) -> Self {
        Self { exit_code, output: serialize_payload(payload) }
    }
}

fn serialize_payload(payload: CommandOutcome) -> String {
    serde_json::to_string(&payload).unwrap_or_else(|error| {
        format!(
            "{{\"command\":\"unknown\",\"status\":\"error\",\"error_class\":\"serialization\",\"message\":\"{}\"}}",
            error.to_string().replace('\\', "\\\\").replace('"', "\\\"")
        )
    })
}

/// Identifies an experiment either by id or by tenant-scoped key.
#[derive(Debug, Clone, Args)]
pub struct ExperimentTarget {
    #[arg(long, help = "Experiment id, or the experiment key when --tenant is given")]
    pub experiment: String,
    #[arg(long, help = "Tenant id; switches --experiment to key lookup")]
    pub tenant: Option<String>,
}

impl ExperimentTarget {
    pub fn by_id(id: impl Into<String>) -> Self {
        Self { experiment: id.into(), tenant: None }
    }

    pub fn reference(&self) -> ExperimentRef {
        match &self.tenant {
            Some(tenant) => ExperimentRef::key(tenant.as_str(), self.experiment.as_str()),
            None => ExperimentRef::id(self.experiment.as_str()),
        }
    }
}

type Failure = (&'static str, String, u8);

pub(crate) fn load_config(command: &str) -> Result<AppConfig, CommandResult> {
    AppConfig::load(LoadOptions::default()).map_err(|error| {
        CommandResult::failure(
            command,
            "config_validation",
            format!("configuration issue: {error}"),
            EXIT_CONFIG,
        )
    })
}

pub(crate) fn build_runtime(command: &str) -> Result<Runtime, CommandResult> {
    tokio::runtime::Builder::new_current_thread().enable_all().build().map_err(|error| {
        CommandResult::failure(
            command,
            "runtime_init",
            format!("failed to initialize async runtime: {error}"),
            EXIT_RUNTIME,
        )
    })
}

/// Connects, applies migrations, wires SQL stores into an
/// [`ExperimentService`] and runs one operation against it.
pub(crate) fn run_operation<T, F, Fut>(command: &str, message: &str, operation: F) -> CommandResult
where
    T: Serialize,
    F: FnOnce(ExperimentService) -> Fut,
    Fut: Future<Output = Result<T, ApplicationError>>,
{
    let config = match load_config(command) {
        Ok(config) => config,
        Err(result) => return result,
    };
    let runtime = match build_runtime(command) {
        Ok(runtime) => runtime,
        Err(result) => return result,
    };
    let expose_details = config.environment.exposes_error_details();

    let result = runtime.block_on(async {
        let pool = connect(&config.database).await.map_err(|error| {
            OperationFailure::Setup(("db_connectivity", error.to_string(), EXIT_DATABASE))
        })?;
        migrations::run_pending(&pool).await.map_err(|error| {
            OperationFailure::Setup(("migration", error.to_string(), EXIT_MIGRATION))
        })?;

        let service = ExperimentService::new(
            Arc::new(SqlExperimentRepository::new(pool.clone())),
            Arc::new(SqlAssignmentRepository::new(pool.clone())),
            Arc::new(SqlEventRepository::new(pool.clone())),
            ServiceSettings::from_config(&config.experiments),
        );
        let outcome = operation(service).await;
        pool.close().await;

        outcome.map_err(|error| {
            let correlation_id = format!("cli-{}", uuid::Uuid::new_v4());
            OperationFailure::Operation(error.into_interface(correlation_id, expose_details))
        })
    });

    match result {
        Ok(data) => CommandResult::success_with_data(command, message, data),
        Err(OperationFailure::Setup((error_class, message, exit_code))) => {
            CommandResult::failure(command, error_class, message, exit_code)
        }
        Err(OperationFailure::Operation(error)) => {
            CommandResult::operation_failure(command, &error)
        }
    }
}

enum OperationFailure {
    Setup(Failure),
    Operation(InterfaceError),
}

#[cfg(test)]
mod tests {
    use pricewise_core::{ExperimentRef, InterfaceError};
    use serde_json::Value;

    use super::{CommandResult, ExperimentTarget, EXIT_OPERATION};

    #[test]
    fn target_switches_to_key_lookup_when_tenant_is_given() {
        let by_id = ExperimentTarget::by_id("exp-1");
        let by_key = ExperimentTarget {
            experiment: "annual".to_string(),
            tenant: Some("tenant-1".to_string()),
        };

        assert!(matches!(by_id.reference(), ExperimentRef::Id(ref id) if id.0 == "exp-1"));
        assert!(matches!(
            by_key.reference(),
            ExperimentRef::Key { ref tenant_id, ref key }
                if tenant_id.0 == "tenant-1" && key == "annual"
        ));
    }

    #[test]
    fn operation_failures_carry_class_and_correlation_id() {
        let result = CommandResult::operation_failure(
            "convert",
            &InterfaceError::NotFound {
                message: "assignment exp-1/u not found".to_string(),
                correlation_id: "cli-1".to_string(),
            },
        );
        let payload: Value = serde_json::from_str(&result.output).expect("json");

        assert_eq!(result.exit_code, EXIT_OPERATION);
        assert_eq!(payload["error_class"], "not_found");
        assert_eq!(payload["correlation_id"], "cli-1");
        assert!(payload.get("data").is_none());
    }
}
