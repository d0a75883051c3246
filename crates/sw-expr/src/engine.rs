//! Shared minijinja environment for expressions

use crate::error::{ExprError, ExprResult};
use crate::functions;
use crate::scope::{Scope, Variables};
use minijinja::value::{Value as JinjaValue, ValueKind};
use minijinja::{Environment, UndefinedBehavior};
use serde_json::Value;
use std::sync::OnceLock;
use tracing::trace;

static ENGINE: OnceLock<ExpressionEngine> = OnceLock::new();

/// Expression engine wrapping a strict minijinja environment
pub(crate) struct ExpressionEngine {
    env: Environment<'static>,
}

impl ExpressionEngine {
    fn new() -> Self {
        let mut env = Environment::new();
        env.set_undefined_behavior(UndefinedBehavior::Strict);
        functions::register(&mut env);
        Self { env }
    }

    /// The process-wide engine
    pub fn global() -> &'static ExpressionEngine {
        ENGINE.get_or_init(ExpressionEngine::new)
    }

    /// Check that an expression compiles
    pub fn validate(&self, src: &str) -> ExprResult<()> {
        self.env
            .compile_expression(src)
            .map(|_| ())
            .map_err(|err| ExprError::from_jinja(err, src, &[]))
    }

    /// Evaluate an expression and return its native value
    pub fn evaluate(&self, src: &str, scope: &dyn Scope) -> ExprResult<Value> {
        let expr = self
            .env
            .compile_expression(src)
            .map_err(|err| ExprError::from_jinja(err, src, &[]))?;

        let (context, missing) = Variables::capture(scope);
        let result = expr.eval(context);
        let missing = missing.lock().map(|m| m.clone()).unwrap_or_default();

        let value = result.map_err(|err| ExprError::from_jinja(err, src, &missing))?;
        if value.is_undefined() {
            return Err(ExprError::UndefinedVariable {
                name: missing
                    .into_iter()
                    .next()
                    .unwrap_or_else(|| src.trim().to_string()),
            });
        }

        let value = to_json(&value)?;
        trace!(expression = %src, result = %value, "Evaluated expression");
        Ok(value)
    }
}

/// Convert an evaluation result into a script value
///
/// Integers outside the `i64`/`u64` range and non-finite floats have no JSON
/// form and are reported instead of being truncated.
pub(crate) fn to_json(value: &JinjaValue) -> ExprResult<Value> {
    if value.kind() == ValueKind::Number {
        if let Ok(f) = f64::try_from(value.clone()) {
            if !f.is_finite() {
                return Err(ExprError::NotFinite);
            }
        }
    }
    serde_json::to_value(value).map_err(|err| ExprError::type_mismatch(err.to_string()))
}
