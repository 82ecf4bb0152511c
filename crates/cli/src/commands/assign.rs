use crate::commands::{run_operation, CommandResult, ExperimentTarget};

/// GetOrAssignVariant: returns the user's sticky variant and records a view.
pub fn run(target: &ExperimentTarget, user_id: &str) -> CommandResult {
    let reference = target.reference();
    let user_id = user_id.to_string();
    run_operation("assign", "variant resolved", move |service| async move {
        service.get_or_assign_variant(&reference, &user_id).await
    })
}
