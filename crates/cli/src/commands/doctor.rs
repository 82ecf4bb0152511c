use pricewise_core::config::{AppConfig, LoadOptions};
use pricewise_db::connect;
use serde::Serialize;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
enum CheckStatus {
    Pass,
    Fail,
    Skipped,
}

#[derive(Debug, Serialize)]
struct DoctorCheck {
    name: &'static str,
    status: CheckStatus,
    details: String,
}

#[derive(Debug, Serialize)]
struct DoctorReport {
    overall_status: CheckStatus,
    summary: String,
    checks: Vec<DoctorCheck>,
}

pub fn run(json_output: bool) -> String {
    let report = build_report();

    if json_output {
        return serde_json::to_string_pretty(&report).unwrap_or_else(|error| {
            format!(
                "{{\"overall_status\":\"fail\",\"summary\":\"doctor serialization failed\",\"error\":\"{}\"}}",
                escape_json(&error.to_string())
            )
        });
    }

    render_human(&report)
}

fn build_report() -> DoctorReport {
    let mut checks = Vec::new();

    match AppConfig::load(LoadOptions::default()) {
        Ok(config) => {
            checks.push(DoctorCheck {
                name: "config_validation",
                status: CheckStatus::Pass,
                details: "configuration loaded and validated".to_string(),
            });
            checks.push(check_signal_readiness(&config));
            checks.extend(check_database(&config));
        }
        Err(error) => {
            checks.push(DoctorCheck {
                name: "config_validation",
                status: CheckStatus::Fail,
                details: error.to_string(),
            });
            for name in ["signal_readiness", "database_connectivity", "schema_status"] {
                checks.push(DoctorCheck {
                    name,
                    status: CheckStatus::Skipped,
                    details: "skipped because configuration did not load".to_string(),
                });
            }
        }
    }

    let all_pass = checks.iter().all(|check| check.status == CheckStatus::Pass);
    let overall_status = if all_pass { CheckStatus::Pass } else { CheckStatus::Fail };
    let summary = if all_pass {
        "doctor: all readiness checks passed".to_string()
    } else {
        "doctor: one or more readiness checks failed".to_string()
    };

    DoctorReport { overall_status, summary, checks }
}

fn check_signal_readiness(config: &AppConfig) -> DoctorCheck {
    let signals = &config.signals;
    if !signals.enabled {
        return DoctorCheck {
            name: "signal_readiness",
            status: CheckStatus::Pass,
            details: "signal emission disabled".to_string(),
        };
    }

    match signals.webhook_url.as_deref() {
        Some(url) if url.starts_with("https://") || url.starts_with("http://") => DoctorCheck {
            name: "signal_readiness",
            status: CheckStatus::Pass,
            details: format!(
                "webhook `{url}` with {} retries and queue capacity {}",
                signals.max_retries, signals.queue_capacity
            ),
        },
        Some(url) => DoctorCheck {
            name: "signal_readiness",
            status: CheckStatus::Fail,
            details: format!("webhook url `{url}` must use http or https"),
        },
        None => DoctorCheck {
            name: "signal_readiness",
            status: CheckStatus::Fail,
            details: "signals enabled without a webhook url".to_string(),
        },
    }
}

fn check_database(config: &AppConfig) -> Vec<DoctorCheck> {
    let runtime = match tokio::runtime::Builder::new_current_thread().enable_all().build() {
        Ok(runtime) => runtime,
        Err(error) => {
            return vec![DoctorCheck {
                name: "database_connectivity",
                status: CheckStatus::Fail,
                details: format!("failed to initialize async runtime: {error}"),
            }];
        }
    };

    let result = runtime.block_on(async {
        let pool = connect(&config.database)
            .await
            .map_err(|error| format!("failed to connect to database: {error}"))?;

        let experiment_tables: i64 = sqlx::query_scalar(
            "SELECT COUNT(1) FROM sqlite_master
             WHERE type = 'table'
               AND name IN ('experiment', 'experiment_assignment', 'experiment_event')",
        )
        .fetch_one(&pool)
        .await
        .map_err(|error| format!("failed to inspect schema: {error}"))?;

        pool.close().await;
        Ok::<i64, String>(experiment_tables)
    });

    match result {
        Ok(tables) => {
            let connectivity = DoctorCheck {
                name: "database_connectivity",
                status: CheckStatus::Pass,
                details: format!("connected using `{}`", config.database.url),
            };
            let schema = if tables == 3 {
                DoctorCheck {
                    name: "schema_status",
                    status: CheckStatus::Pass,
                    details: "experiment tables present".to_string(),
                }
            } else {
                DoctorCheck {
                    name: "schema_status",
                    status: CheckStatus::Fail,
                    details: "experiment tables missing; run `pricewise migrate`".to_string(),
                }
            };
            vec![connectivity, schema]
        }
        Err(error) => vec![
            DoctorCheck {
                name: "database_connectivity",
                status: CheckStatus::Fail,
                details: error,
            },
            DoctorCheck {
                name: "schema_status",
                status: CheckStatus::Skipped,
                details: "skipped because the database is unreachable".to_string(),
            },
        ],
    }
}

fn render_human(report: &DoctorReport) -> String {
    let mut lines = Vec::new();
    lines.push(report.summary.clone());

    for check in &report.checks {
        let marker = match check.status {
            CheckStatus::Pass => "ok",
            CheckStatus::Fail => "fail",
            CheckStatus::Skipped => "skip",
        };
        lines.push(format!("- [{marker}] {}: {}", check.name, check.details));
    }

    lines.join("\n")
}

fn escape_json(value: &str) -> String {
    value.replace('\\', "\\\\").replace('"', "\\\"")
}
