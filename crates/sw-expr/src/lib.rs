//! Inline expression evaluation for Stepwright scripts
//!
//! Script values embed expressions inside `{{ }}` placeholders. Expressions
//! are minijinja expressions evaluated against a variable [`Scope`] with
//! strict undefined handling, so a misspelled variable is an error rather
//! than an empty string.
//!
//! # Syntax
//!
//! - Literals: `42`, `2.5`, `'text'`, `"text"`, `true`, `false`, `none`
//!   (`null` is available as an alias), `[1, 2]`, `{'a': 1}`
//! - Variables and paths: `user`, `user.email`, `items[0]`, `items[-1]`
//! - Arithmetic: `+ - * / // % **`, string concatenation with `~`
//! - Comparison: `== != < <= > >=`, `in`, `not in`
//! - Logic: `and`, `or`, `not`
//! - Functions: `length`, `to_string`, `to_int`, `to_float`, `to_bool`,
//!   `range`, also usable as filters (`items | length`)
//!
//! # The `+` operator
//!
//! Numbers add, two lists concatenate and two strings concatenate. Any other
//! combination is a [`ExprError::TypeMismatch`]; `~` joins the display forms
//! of any two values. `/` always divides as floats, `//` is integer division.
//!
//! # Templates
//!
//! - `render("{{ items }}")` returns the list itself
//! - `render("Hello {{ name }}")` returns a string
//! - `evaluate_rhs("{{x}} + {{i}}")` treats each placeholder as a
//!   parenthesised sub-expression
//!
//! # Example
//!
//! ```
//! use serde_json::json;
//!
//! let scope = json!({"x": 1, "i": 2}).as_object().unwrap().clone();
//! assert_eq!(sw_expr::evaluate("x + i", &scope).unwrap(), json!(3));
//! assert_eq!(sw_expr::render("x={{ x }}", &scope).unwrap(), json!("x=1"));
//! ```

mod engine;
mod error;
mod functions;
mod scope;
mod template;
mod value;

use serde_json::Value;

pub use error::{ExprError, ExprResult};
pub use functions::MAX_RANGE_LEN;
pub use scope::{EmptyScope, Scope};
pub use template::{
    evaluate_condition, evaluate_rhs, is_template, render, render_value, validate_template,
};
pub use value::{is_truthy, to_display};

use engine::ExpressionEngine;

/// Evaluate a bare expression
pub fn evaluate(src: &str, scope: &dyn Scope) -> ExprResult<Value> {
    ExpressionEngine::global().evaluate(src, scope)
}

/// Check that an expression compiles
pub fn validate(src: &str) -> ExprResult<()> {
    ExpressionEngine::global().validate(src)
}
