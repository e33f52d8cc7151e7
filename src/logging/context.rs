use crate::cli::Command;

/// Execution contexts that influence how logging is routed.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ExecutionContext {
    /// Operator commands driven from a terminal (`plan`, `apply`, `runs`, ...).
    LocalDev,
    /// Long-lived agent server answering dispatch requests from a controller.
    AgentServer,
}

/// Derive the active execution context from a parsed CLI command.
pub fn detect_context(command: &Command) -> ExecutionContext {
    match command {
        Command::Agent(_) => ExecutionContext::AgentServer,
        Command::Plan(_)
        | Command::Apply(_)
        | Command::Validate(_)
        | Command::Runs(_)
        | Command::Reconcile(_) => ExecutionContext::LocalDev,
    }
}
