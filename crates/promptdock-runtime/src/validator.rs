//! Static checks on generated program source before it reaches the sandbox.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum ValidationError {
    #[error("package error: missing 'package main'")]
    MissingPackageMain,
    #[error("missing required functions: missing function: {0}")]
    MissingFunction(String),
    #[error("forbidden packages used: forbidden package used: {0}")]
    ForbiddenImport(String),
    #[error("form action routing error: form action must use prefix: {0}")]
    FormActionPrefix(String),
    #[error("handler routing error: handler must be at root, but found under runtime prefix: {0}")]
    HandlerUnderPrefix(String),
}

/// Validates the generated-program contract.
pub struct ProgramValidator {
    required_functions: Vec<String>,
    forbidden_imports: Vec<String>,
    form_action_prefix: String,
}

impl ProgramValidator {
    /// Default rules for a runtime id: `main` and `Shutdown` must exist, the
    /// OS syscall layer is off limits, forms target `/runtime/<id>/` while
    /// handlers stay at the root.
    pub fn for_runtime(id: &str) -> Self {
        Self {
            required_functions: vec!["main".to_string(), "Shutdown".to_string()],
            forbidden_imports: vec!["syscall".to_string()],
            form_action_prefix: format!("/runtime/{id}/"),
        }
    }

    pub fn validate(&self, code: &str) -> Result<(), ValidationError> {
        self.check_package(code)?;
        self.check_required_functions(code)?;
        self.check_forbidden_imports(code)?;
        self.check_form_action_prefix(code)?;
        self.check_handler_root(code)?;
        Ok(())
    }

    fn check_package(&self, code: &str) -> Result<(), ValidationError> {
        if code.contains("package main") {
            Ok(())
        } else {
            Err(ValidationError::MissingPackageMain)
        }
    }

    fn check_required_functions(&self, code: &str) -> Result<(), ValidationError> {
        for name in &self.required_functions {
            let needle = format!("func {name}(");
            if !code.lines().any(|line| line.trim_start().starts_with(&needle)) {
                return Err(ValidationError::MissingFunction(name.clone()));
            }
        }
        Ok(())
    }

    fn check_forbidden_imports(&self, code: &str) -> Result<(), ValidationError> {
        for forbidden in &self.forbidden_imports {
            let quoted = format!("\"{forbidden}\"");
            let hit = code.lines().any(|line| {
                let line = line.trim();
                (line.starts_with("import") || line.starts_with('"')) && line.contains(&quoted)
            });
            if hit {
                return Err(ValidationError::ForbiddenImport(forbidden.clone()));
            }
        }
        Ok(())
    }

    fn check_form_action_prefix(&self, code: &str) -> Result<(), ValidationError> {
        for line in code.lines() {
            if line.contains("<form") && line.contains("action=") {
                if !line.contains(&self.form_action_prefix) {
                    return Err(ValidationError::FormActionPrefix(
                        self.form_action_prefix.clone(),
                    ));
                }
            }
        }
        Ok(())
    }

    fn check_handler_root(&self, code: &str) -> Result<(), ValidationError> {
        for line in code.lines() {
            if line.contains(".HandleFunc(") && line.contains(&self.form_action_prefix) {
                return Err(ValidationError::HandlerUnderPrefix(
                    self.form_action_prefix.clone(),
                ));
            }
        }
        Ok(())
    }
}
