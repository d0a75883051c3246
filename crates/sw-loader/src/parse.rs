//! Step classification
//!
//! Each raw step mapping is keyed by exactly one discriminant:
//!
//! - `action` - leaf action (`params`/`with`, extra keys become params,
//!   `save_as`)
//! - `if` - conditional (`then`, `elif`, `else`)
//! - `for` - loop (`"item in source"` or `"key, value in source"`, `steps`)
//! - `try` - error handling (`catch`, `finally`, `as`)
//! - `set` - assignment (`"name = expr"`, a list of those, or a mapping)
//! - `include` / `compose` - composed script (resolved by the loader)
//!
//! plus the common keys `description`, `optional`, `condition` and
//! `max_retries`. A bare string step is shorthand for an action with no
//! parameters.

use crate::document::IncludeRef;
use crate::error::{LoaderError, LoaderResult};
use crate::step::{AssignValue, Assignment, Branch, Composition, LoopBinding, Step, StepKind};
use regex::Regex;
use serde_json::{Map, Value};
use std::sync::OnceLock;

const DISCRIMINANTS: [&str; 7] = ["action", "if", "for", "try", "set", "include", "compose"];
const COMMON_KEYS: [&str; 4] = ["description", "optional", "condition", "max_retries"];

fn loop_header() -> &'static Regex {
    static HEADER: OnceLock<Regex> = OnceLock::new();
    HEADER.get_or_init(|| {
        Regex::new(r"^\s*([A-Za-z_]\w*)(?:\s*,\s*([A-Za-z_]\w*))?\s+in\s+(.+?)\s*$")
            .expect("loop header pattern is valid")
    })
}

fn assignment_pattern() -> &'static Regex {
    static ASSIGNMENT: OnceLock<Regex> = OnceLock::new();
    ASSIGNMENT.get_or_init(|| {
        Regex::new(r"^\s*([A-Za-z_]\w*)\s*=(.*)$").expect("assignment pattern is valid")
    })
}

/// Expands `include`/`compose` references found while parsing
pub(crate) trait ComposeResolver {
    fn compose(&self, reference: &IncludeRef) -> LoaderResult<Composition>;
}

/// Converts raw step values of one document into step trees
pub(crate) struct StepParser<'a> {
    reference: &'a str,
    resolver: &'a dyn ComposeResolver,
}

impl<'a> StepParser<'a> {
    pub fn new(reference: &'a str, resolver: &'a dyn ComposeResolver) -> Self {
        Self {
            reference,
            resolver,
        }
    }

    fn err(&self, path: &str, message: impl Into<String>) -> LoaderError {
        LoaderError::step(self.reference, path, message)
    }

    fn check_expr(&self, path: &str, src: &str) -> LoaderResult<()> {
        let checked = if sw_expr::is_template(src) {
            sw_expr::validate_template(src)
        } else {
            sw_expr::validate(src)
        };
        checked.map_err(|source| LoaderError::Expression {
            reference: self.reference.to_string(),
            path: path.to_string(),
            source,
        })
    }

    fn check_templates(&self, path: &str, value: &Value) -> LoaderResult<()> {
        match value {
            Value::String(s) if sw_expr::is_template(s) => sw_expr::validate_template(s)
                .map_err(|source| LoaderError::Expression {
                    reference: self.reference.to_string(),
                    path: path.to_string(),
                    source,
                }),
            Value::Array(items) => items
                .iter()
                .enumerate()
                .try_for_each(|(i, v)| self.check_templates(&format!("{}[{}]", path, i), v)),
            Value::Object(map) => map
                .iter()
                .try_for_each(|(k, v)| self.check_templates(&format!("{}.{}", path, k), v)),
            _ => Ok(()),
        }
    }

    /// Parse a step list
    pub fn parse_list(&self, path: &str, values: &[Value]) -> LoaderResult<Vec<Step>> {
        values
            .iter()
            .enumerate()
            .map(|(i, v)| self.parse_step(&format!("{}[{}]", path, i), v))
            .collect()
    }

    /// Parse an optional nested step list
    fn parse_value_list(&self, path: &str, value: Option<&Value>) -> LoaderResult<Vec<Step>> {
        match value {
            None | Some(Value::Null) => Ok(Vec::new()),
            Some(Value::Array(items)) => self.parse_list(path, items),
            Some(single @ Value::Object(_)) => self.parse_list(path, std::slice::from_ref(single)),
            Some(_) => Err(self.err(path, "expected a list of steps")),
        }
    }

    /// Parse one raw step
    pub fn parse_step(&self, path: &str, value: &Value) -> LoaderResult<Step> {
        let map = match value {
            Value::String(action) if !action.trim().is_empty() => {
                return Ok(Step::action(action.trim(), Map::new()))
            }
            Value::Object(map) => map,
            _ => return Err(self.err(path, "step must be a mapping or an action name")),
        };

        let present: Vec<&str> = DISCRIMINANTS
            .iter()
            .copied()
            .filter(|k| map.contains_key(*k))
            .collect();
        let discriminant = match present.as_slice() {
            [one] => *one,
            [] => return Err(self.err(path, "missing action identifier")),
            many => {
                return Err(self.err(
                    path,
                    format!("ambiguous step, found keys: {}", many.join(", ")),
                ))
            }
        };

        let mut common = Step::new(StepKind::Set {
            assignments: Vec::new(),
        });
        self.parse_common(path, map, &mut common)?;

        let kind = match discriminant {
            "action" => self.parse_action(path, map)?,
            "if" => self.parse_if(path, map)?,
            "for" => self.parse_for(path, map)?,
            "try" => self.parse_try(path, map)?,
            "set" => self.parse_set(path, map)?,
            _ => {
                let reference = self.parse_include(path, map, discriminant)?;
                StepKind::Compose(self.resolver.compose(&reference)?)
            }
        };
        common.kind = kind;
        Ok(common)
    }

    fn parse_common(&self, path: &str, map: &Map<String, Value>, step: &mut Step) -> LoaderResult<()> {
        step.description = match map.get("description") {
            None | Some(Value::Null) => None,
            Some(Value::String(s)) => Some(s.clone()),
            Some(other) => Some(sw_expr::to_display(other)),
        };
        step.optional = match map.get("optional") {
            None | Some(Value::Null) => false,
            Some(Value::Bool(b)) => *b,
            Some(_) => return Err(self.err(path, "'optional' must be a boolean")),
        };
        step.condition = match map.get("condition") {
            None | Some(Value::Null) => None,
            Some(Value::String(s)) => {
                self.check_expr(&format!("{}.condition", path), s)?;
                Some(s.clone())
            }
            Some(Value::Bool(b)) => Some(b.to_string()),
            Some(_) => return Err(self.err(path, "'condition' must be an expression string")),
        };
        step.max_retries = match map.get("max_retries") {
            None | Some(Value::Null) => None,
            Some(v) => Some(
                v.as_u64()
                    .and_then(|n| u32::try_from(n).ok())
                    .ok_or_else(|| self.err(path, "'max_retries' must be a non-negative integer"))?,
            ),
        };
        Ok(())
    }

    fn parse_action(&self, path: &str, map: &Map<String, Value>) -> LoaderResult<StepKind> {
        let action = match map.get("action") {
            Some(Value::String(s)) if !s.trim().is_empty() => s.trim().to_string(),
            _ => return Err(self.err(path, "missing action identifier")),
        };

        let mut params = Map::new();
        for key in ["params", "with"] {
            match map.get(key) {
                None | Some(Value::Null) => {}
                Some(Value::Object(explicit)) => {
                    params.extend(explicit.iter().map(|(k, v)| (k.clone(), v.clone())))
                }
                Some(_) => return Err(self.err(path, format!("'{}' must be a mapping", key))),
            }
        }
        for (key, value) in map {
            let reserved = matches!(key.as_str(), "action" | "params" | "with" | "save_as")
                || COMMON_KEYS.contains(&key.as_str());
            if !reserved {
                params.insert(key.clone(), value.clone());
            }
        }
        self.check_templates(&format!("{}.params", path), &Value::Object(params.clone()))?;

        let save_as = match map.get("save_as") {
            None | Some(Value::Null) => None,
            Some(Value::String(name)) if is_identifier(name) => Some(name.clone()),
            Some(_) => return Err(self.err(path, "'save_as' must be a variable name")),
        };

        Ok(StepKind::Action {
            action,
            params,
            save_as,
        })
    }

    fn parse_if(&self, path: &str, map: &Map<String, Value>) -> LoaderResult<StepKind> {
        let mut branches = vec![self.parse_branch(path, map, "if")?];

        match map.get("elif") {
            None | Some(Value::Null) => {}
            Some(Value::Array(arms)) => {
                for (i, arm) in arms.iter().enumerate() {
                    let arm_path = format!("{}.elif[{}]", path, i);
                    let arm_map = arm
                        .as_object()
                        .ok_or_else(|| self.err(&arm_path, "elif arm must be a mapping"))?;
                    let key = if arm_map.contains_key("if") { "if" } else { "condition" };
                    branches.push(self.parse_branch(&arm_path, arm_map, key)?);
                }
            }
            Some(Value::Object(arm_map)) => {
                let key = if arm_map.contains_key("if") { "if" } else { "condition" };
                branches.push(self.parse_branch(&format!("{}.elif", path), arm_map, key)?);
            }
            Some(_) => return Err(self.err(path, "'elif' must be a list of branches")),
        }

        let otherwise = self.parse_value_list(&format!("{}.else", path), map.get("else"))?;
        Ok(StepKind::If {
            branches,
            otherwise,
        })
    }

    fn parse_branch(
        &self,
        path: &str,
        map: &Map<String, Value>,
        condition_key: &str,
    ) -> LoaderResult<Branch> {
        let condition = match map.get(condition_key) {
            Some(Value::String(s)) => s.clone(),
            Some(Value::Bool(b)) => b.to_string(),
            _ => return Err(self.err(path, format!("'{}' must be an expression", condition_key))),
        };
        self.check_expr(&format!("{}.{}", path, condition_key), &condition)?;

        if !map.contains_key("then") {
            return Err(self.err(path, "conditional is missing 'then'"));
        }
        let steps = self.parse_value_list(&format!("{}.then", path), map.get("then"))?;
        Ok(Branch { condition, steps })
    }

    fn parse_for(&self, path: &str, map: &Map<String, Value>) -> LoaderResult<StepKind> {
        let header = map
            .get("for")
            .and_then(Value::as_str)
            .ok_or_else(|| self.err(path, "'for' must be a string like 'item in items'"))?;
        let captures = loop_header()
            .captures(header)
            .ok_or_else(|| self.err(path, format!("malformed loop header '{}'", header)))?;

        let first = captures[1].to_string();
        let binding = match captures.get(2) {
            Some(second) => LoopBinding::Pair(first, second.as_str().to_string()),
            None => LoopBinding::Single(first),
        };
        let source = captures[3].to_string();
        self.check_expr(&format!("{}.for", path), &source)?;

        let body = map.get("steps").or_else(|| map.get("do"));
        if body.is_none() {
            return Err(self.err(path, "loop is missing 'steps'"));
        }
        let steps = self.parse_value_list(&format!("{}.steps", path), body)?;
        Ok(StepKind::For {
            binding,
            source,
            steps,
        })
    }

    fn parse_try(&self, path: &str, map: &Map<String, Value>) -> LoaderResult<StepKind> {
        let body = self.parse_value_list(&format!("{}.try", path), map.get("try"))?;
        let catch = self.parse_value_list(&format!("{}.catch", path), map.get("catch"))?;
        let finally = self.parse_value_list(&format!("{}.finally", path), map.get("finally"))?;

        let error_var = match map.get("as") {
            None | Some(Value::Null) => "error".to_string(),
            Some(Value::String(name)) if is_identifier(name) => name.clone(),
            Some(_) => return Err(self.err(path, "'as' must be a variable name")),
        };

        Ok(StepKind::Try {
            body,
            catch,
            finally,
            error_var,
        })
    }

    fn parse_set(&self, path: &str, map: &Map<String, Value>) -> LoaderResult<StepKind> {
        let set_path = format!("{}.set", path);
        let assignments = match map.get("set") {
            Some(Value::String(line)) => vec![self.parse_assignment(&set_path, line)?],
            Some(Value::Array(lines)) => lines
                .iter()
                .enumerate()
                .map(|(i, line)| {
                    let line_path = format!("{}[{}]", set_path, i);
                    match line {
                        Value::String(line) => self.parse_assignment(&line_path, line),
                        _ => Err(self.err(&line_path, "expected 'name = expression'")),
                    }
                })
                .collect::<LoaderResult<Vec<_>>>()?,
            Some(Value::Object(values)) => {
                let mut assignments = Vec::with_capacity(values.len());
                for (name, value) in values {
                    if !is_identifier(name) {
                        return Err(self.err(&set_path, format!("invalid variable name '{}'", name)));
                    }
                    self.check_templates(&format!("{}.{}", set_path, name), value)?;
                    assignments.push(Assignment {
                        name: name.clone(),
                        value: AssignValue::Template(value.clone()),
                    });
                }
                assignments
            }
            _ => return Err(self.err(path, "'set' must be an assignment or a mapping")),
        };
        if assignments.is_empty() {
            return Err(self.err(path, "'set' has no assignments"));
        }
        Ok(StepKind::Set { assignments })
    }

    fn parse_assignment(&self, path: &str, line: &str) -> LoaderResult<Assignment> {
        let captures = assignment_pattern()
            .captures(line)
            .ok_or_else(|| self.err(path, format!("expected 'name = expression', got '{}'", line)))?;
        let source = captures[2].trim().to_string();
        if source.is_empty() {
            return Err(self.err(path, "assignment has no value"));
        }
        if sw_expr::is_template(&source) {
            self.check_expr(path, &source)?;
        }
        Ok(Assignment {
            name: captures[1].to_string(),
            value: AssignValue::Expression(source),
        })
    }

    fn parse_include(
        &self,
        path: &str,
        map: &Map<String, Value>,
        key: &str,
    ) -> LoaderResult<IncludeRef> {
        let value = map.get(key).unwrap_or(&Value::Null);
        let mut reference = IncludeRef::from_value(value)
            .ok_or_else(|| self.err(path, format!("'{}' must name a script", key)))?;
        match map.get("params").or_else(|| map.get("with")) {
            None | Some(Value::Null) => {}
            Some(Value::Object(params)) => {
                reference
                    .params
                    .extend(params.iter().map(|(k, v)| (k.clone(), v.clone())));
            }
            Some(_) => return Err(self.err(path, "'params' must be a mapping")),
        }
        self.check_templates(
            &format!("{}.params", path),
            &Value::Object(reference.params.clone()),
        )?;
        Ok(reference)
    }
}

/// Check if a string is a valid variable name
pub(crate) fn is_identifier(name: &str) -> bool {
    let mut chars = name.chars();
    matches!(chars.next(), Some(c) if c.is_ascii_alphabetic() || c == '_')
        && chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    /// Expands every include into an empty composition
    struct Stub;

    impl ComposeResolver for Stub {
        fn compose(&self, reference: &IncludeRef) -> LoaderResult<Composition> {
            Ok(Composition {
                script: reference.script.clone(),
                params: reference.params.clone(),
                defaults: Map::new(),
                steps: Vec::new(),
                teardown: Vec::new(),
            })
        }
    }

    fn parse(value: Value) -> LoaderResult<Step> {
        StepParser::new("test", &Stub).parse_step("steps[0]", &value)
    }

    fn step(value: Value) -> Step {
        parse(value).unwrap()
    }

    #[test]
    fn test_action_params() {
        let s = step(json!({
            "action": "type",
            "target": "#email",
            "params": {"text": "{{ user.email }}"},
            "save_as": "typed",
            "description": "Enter email",
            "max_retries": 2,
        }));
        assert_eq!(s.description.as_deref(), Some("Enter email"));
        assert_eq!(s.max_retries, Some(2));
        match s.kind {
            StepKind::Action {
                action,
                params,
                save_as,
            } => {
                assert_eq!(action, "type");
                assert_eq!(params["target"], json!("#email"));
                assert_eq!(params["text"], json!("{{ user.email }}"));
                assert_eq!(save_as.as_deref(), Some("typed"));
            }
            other => panic!("expected action, got {:?}", other),
        }
    }

    #[test]
    fn test_bare_string_step() {
        assert_eq!(step(json!("click")).action_name(), "click");
    }

    #[test]
    fn test_missing_action_identifier() {
        assert!(matches!(
            parse(json!({"description": "nothing"})),
            Err(LoaderError::InvalidStep { message, .. }) if message.contains("missing action")
        ));
        assert!(parse(json!({"action": ""})).is_err());
    }

    #[test]
    fn test_ambiguous_step() {
        assert!(matches!(
            parse(json!({"action": "click", "for": "i in x", "steps": []})),
            Err(LoaderError::InvalidStep { message, .. }) if message.contains("ambiguous")
        ));
    }

    #[test]
    fn test_conditional() {
        let s = step(json!({
            "if": "count > 1",
            "then": [{"action": "a"}],
            "elif": [{"if": "count == 1", "then": [{"action": "b"}]}],
            "else": [{"action": "c"}],
        }));
        match s.kind {
            StepKind::If {
                branches,
                otherwise,
            } => {
                assert_eq!(branches.len(), 2);
                assert_eq!(branches[1].condition, "count == 1");
                assert_eq!(otherwise.len(), 1);
            }
            other => panic!("expected if, got {:?}", other),
        }
        assert!(parse(json!({"if": "x"})).is_err());
    }

    #[test]
    fn test_loop_headers() {
        let s = step(json!({"for": "item in [1, 2, 3]", "steps": ["click"]}));
        match s.kind {
            StepKind::For {
                binding, source, ..
            } => {
                assert_eq!(binding, LoopBinding::Single("item".into()));
                assert_eq!(source, "[1, 2, 3]");
            }
            other => panic!("expected for, got {:?}", other),
        }

        let s = step(json!({"for": "k, v in {{ data }}", "steps": []}));
        assert!(matches!(
            s.kind,
            StepKind::For { binding: LoopBinding::Pair(..), .. }
        ));

        assert!(parse(json!({"for": "items", "steps": []})).is_err());
        assert!(parse(json!({"for": "i in", "steps": []})).is_err());
        assert!(parse(json!({"for": "i in x"})).is_err());
    }

    #[test]
    fn test_try_defaults() {
        let s = step(json!({"try": [{"action": "a"}], "finally": ["b"]}));
        match s.kind {
            StepKind::Try {
                body,
                catch,
                finally,
                error_var,
            } => {
                assert_eq!(body.len(), 1);
                assert!(catch.is_empty());
                assert_eq!(finally.len(), 1);
                assert_eq!(error_var, "error");
            }
            other => panic!("expected try, got {:?}", other),
        }
    }

    #[test]
    fn test_set_forms() {
        let s = step(json!({"set": "x = {{x}} + {{i}}"}));
        assert_eq!(
            s.kind,
            StepKind::Set {
                assignments: vec![Assignment {
                    name: "x".into(),
                    value: AssignValue::Expression("{{x}} + {{i}}".into()),
                }]
            }
        );

        let s = step(json!({"set": {"greeting": "hi {{ name }}", "n": 3}}));
        match s.kind {
            StepKind::Set { assignments } => {
                assert_eq!(assignments.len(), 2);
                assert_eq!(assignments[1].value, AssignValue::Template(json!(3)));
            }
            other => panic!("expected set, got {:?}", other),
        }

        assert!(parse(json!({"set": "no equals sign"})).is_err());
        assert!(parse(json!({"set": "x = "})).is_err());
        assert!(parse(json!({"set": {"bad name": 1}})).is_err());
    }

    #[test]
    fn test_expression_errors_at_load() {
        assert!(matches!(
            parse(json!({"action": "click", "condition": "x =="})),
            Err(LoaderError::Expression { .. })
        ));
        assert!(matches!(
            parse(json!({"action": "type", "text": "{{ user. }}"})),
            Err(LoaderError::Expression { .. })
        ));
    }

    #[test]
    fn test_include_reference() {
        let s = step(json!({"include": "login", "params": {"user": "bob"}, "optional": true}));
        assert!(s.optional);
        match s.kind {
            StepKind::Compose(composition) => {
                assert_eq!(composition.script, "login");
                assert_eq!(composition.params["user"], json!("bob"));
            }
            other => panic!("expected compose, got {:?}", other),
        }
    }

    #[test]
    fn test_nested_include() {
        let s = step(json!({"for": "u in users", "steps": [{"compose": "login"}]}));
        match s.kind {
            StepKind::For { steps, .. } => {
                assert!(matches!(steps[0].kind, StepKind::Compose(_)))
            }
            other => panic!("expected for, got {:?}", other),
        }
    }

    #[test]
    fn test_identifiers() {
        assert!(is_identifier("_x1"));
        assert!(!is_identifier("1x"));
        assert!(!is_identifier("a-b"));
    }
}
