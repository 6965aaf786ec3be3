//! Stage context - the explicit logging handle every stage is constructed with.

use crate::error::StageError;
use std::fmt;

/// Identifies one pipeline stage. Its `target()` is used as the `log` target,
/// so each stage's lines can be filtered with `RUST_LOG=control::duty_cycle=debug`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct StageContext {
    module: &'static str,
    component: &'static str,
    target: &'static str,
}

impl StageContext {
    /// `target` is normally `"<module>::<component>"`.
    pub const fn new(module: &'static str, component: &'static str, target: &'static str) -> Self {
        Self {
            module,
            component,
            target,
        }
    }

    pub fn module(&self) -> &'static str {
        self.module
    }

    pub fn component(&self) -> &'static str {
        self.component
    }

    pub fn target(&self) -> &'static str {
        self.target
    }

    pub fn startup(&self) {
        log::debug!(target: self.target, "startup");
    }

    pub fn shutdown(&self) {
        log::debug!(target: self.target, "shutdown");
    }

    /// Log a message that was dropped because its consumer is gone.
    pub fn dropped(&self, what: &str, reason: impl fmt::Display) {
        log::warn!(target: self.target, "dropped {}: {}", what, reason);
    }

    /// Log a value that could not be processed. The stage carries on with the next one.
    pub fn rejected(&self, what: &str, reason: impl fmt::Display) {
        log::error!(target: self.target, "rejected {}: {}", what, reason);
    }

    /// Log a stage fault before it is propagated.
    pub fn fault(&self, error: StageError) -> StageError {
        log::error!(target: self.target, "stage fault: {}", error);
        error
    }

    pub fn collaborator_error(&self, message: impl fmt::Display) -> StageError {
        self.fault(StageError::Collaborator {
            stage: self.target,
            message: message.to_string(),
        })
    }
}

impl fmt::Display for StageContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.target)
    }
}

/// Declares a `StageContext` constant for a module/component pair.
#[macro_export]
macro_rules! stage_context {
    ($module:literal, $component:literal) => {
        $crate::context::StageContext::new($module, $component, concat!($module, "::", $component))
    };
}
