use crate::commands::{run_operation, CommandResult, ExperimentTarget};

/// RecordConversion. Without `revenue` the assigned variant's listed price is
/// recorded.
pub fn run(target: &ExperimentTarget, user_id: &str, revenue: Option<f64>) -> CommandResult {
    let reference = target.reference();
    let user_id = user_id.to_string();
    run_operation("convert", "conversion recorded", move |service| async move {
        service.record_conversion(&reference, &user_id, revenue).await
    })
}
