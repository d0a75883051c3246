//! Execution context
//!
//! Variables live in a stack of frames. The global frame belongs to the run;
//! each composed script call pushes an isolated frame that sees only the
//! parameters it was called with. Within a frame, loop iterations and catch
//! branches push binding-only scopes on top of the frame's base scope.

use crate::error::{EngineError, EngineResult};
use indexmap::IndexMap;
use serde_json::Value;
use sw_expr::Scope;

/// Maximum nesting of composed script calls
pub const MAX_CALL_DEPTH: usize = 32;

/// Kind of a variable scope
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScopeKind {
    /// Run-wide variables
    Global,
    /// Base scope of a composed call
    Frame,
    /// Iteration variables of a loop
    Loop,
    /// Error variable of a catch branch
    Catch,
}

#[derive(Debug, Clone)]
struct ScopeLayer {
    kind: ScopeKind,
    vars: IndexMap<String, Value>,
}

#[derive(Debug, Clone)]
struct Frame {
    script: String,
    scopes: Vec<ScopeLayer>,
}

impl Frame {
    fn new(script: impl Into<String>, kind: ScopeKind, vars: IndexMap<String, Value>) -> Self {
        Self {
            script: script.into(),
            scopes: vec![ScopeLayer { kind, vars }],
        }
    }
}

/// Scoped variable container owned by a run
#[derive(Debug, Clone)]
pub struct ExecutionContext {
    frames: Vec<Frame>,
}

impl Default for ExecutionContext {
    fn default() -> Self {
        Self::new()
    }
}

impl ExecutionContext {
    /// Create an empty context
    pub fn new() -> Self {
        Self::with_variables(IndexMap::new())
    }

    /// Create a context seeded with global variables
    pub fn with_variables(vars: IndexMap<String, Value>) -> Self {
        Self {
            frames: vec![Frame::new("", ScopeKind::Global, vars)],
        }
    }

    fn frame(&self) -> &Frame {
        // the global frame is never popped
        &self.frames[self.frames.len() - 1]
    }

    fn frame_mut(&mut self) -> &mut Frame {
        let last = self.frames.len() - 1;
        &mut self.frames[last]
    }

    /// Look up a variable visible in the current frame
    pub fn get(&self, name: &str) -> Option<&Value> {
        self.frame()
            .scopes
            .iter()
            .rev()
            .find_map(|scope| scope.vars.get(name))
    }

    /// Check if a variable is visible
    pub fn contains(&self, name: &str) -> bool {
        self.get(name).is_some()
    }

    /// Assign a variable
    ///
    /// Updates the innermost visible binding of `name`; a new variable is
    /// created in the frame's base scope, so it outlives any loop or catch
    /// scope it was assigned in.
    pub fn set(&mut self, name: impl Into<String>, value: Value) {
        let name = name.into();
        let frame = self.frame_mut();
        if let Some(slot) = frame
            .scopes
            .iter_mut()
            .rev()
            .find_map(|scope| scope.vars.get_mut(&name))
        {
            *slot = value;
            return;
        }
        frame.scopes[0].vars.insert(name, value);
    }

    /// Push a binding-only scope
    pub fn push_scope(&mut self, kind: ScopeKind, bindings: IndexMap<String, Value>) {
        self.frame_mut().scopes.push(ScopeLayer {
            kind,
            vars: bindings,
        });
    }

    /// Pop the innermost scope, returning its bindings
    ///
    /// The base scope of a frame is never popped.
    pub fn pop_scope(&mut self) -> Option<IndexMap<String, Value>> {
        let frame = self.frame_mut();
        if frame.scopes.len() > 1 {
            frame.scopes.pop().map(|scope| scope.vars)
        } else {
            None
        }
    }

    /// Kind of the innermost scope
    pub fn scope_kind(&self) -> ScopeKind {
        self.frame()
            .scopes
            .last()
            .map(|scope| scope.kind)
            .unwrap_or(ScopeKind::Global)
    }

    /// Enter a composed script with only the given variables visible
    pub fn push_frame(
        &mut self,
        script: impl Into<String>,
        vars: IndexMap<String, Value>,
    ) -> EngineResult<()> {
        let script = script.into();
        if self.frames.len() > MAX_CALL_DEPTH {
            return Err(EngineError::CallDepth {
                script,
                depth: MAX_CALL_DEPTH,
            });
        }
        self.frames.push(Frame::new(script, ScopeKind::Frame, vars));
        Ok(())
    }

    /// Leave a composed script, returning its variables
    pub fn pop_frame(&mut self) -> Option<IndexMap<String, Value>> {
        if self.frames.len() > 1 {
            self.frames
                .pop()
                .and_then(|frame| frame.scopes.into_iter().next())
                .map(|scope| scope.vars)
        } else {
            None
        }
    }

    /// Number of composed calls currently active
    pub fn call_depth(&self) -> usize {
        self.frames.len() - 1
    }

    /// Script of the current frame, `None` at the top level
    pub fn current_script(&self) -> Option<&str> {
        (self.frames.len() > 1).then(|| self.frame().script.as_str())
    }

    /// Variables visible in the current frame, inner bindings shadowing outer
    pub fn snapshot(&self) -> IndexMap<String, Value> {
        let mut vars = IndexMap::new();
        for scope in &self.frame().scopes {
            for (name, value) in &scope.vars {
                vars.insert(name.clone(), value.clone());
            }
        }
        vars
    }

    /// Run-wide variables
    pub fn globals(&self) -> &IndexMap<String, Value> {
        &self.frames[0].scopes[0].vars
    }

    /// Replace all state with the given global variables
    pub fn restore(&mut self, vars: IndexMap<String, Value>) {
        self.frames = vec![Frame::new("", ScopeKind::Global, vars)];
    }
}

impl Scope for ExecutionContext {
    fn lookup(&self, name: &str) -> Option<&Value> {
        self.get(name)
    }

    fn names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = Vec::new();
        for scope in &self.frame().scopes {
            for name in scope.vars.keys() {
                if !names.contains(&name.as_str()) {
                    names.push(name);
                }
            }
        }
        names
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn bindings(pairs: &[(&str, Value)]) -> IndexMap<String, Value> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.clone()))
            .collect()
    }

    #[test]
    fn test_set_and_get() {
        let mut ctx = ExecutionContext::new();
        ctx.set("x", json!(1));
        assert_eq!(ctx.get("x"), Some(&json!(1)));
        ctx.set("x", json!(2));
        assert_eq!(ctx.get("x"), Some(&json!(2)));
        assert!(ctx.get("y").is_none());
    }

    #[test]
    fn test_loop_scope_discards_binding_only() {
        let mut ctx = ExecutionContext::new();
        ctx.set("total", json!(0));

        ctx.push_scope(ScopeKind::Loop, bindings(&[("item", json!("a"))]));
        assert_eq!(ctx.scope_kind(), ScopeKind::Loop);
        ctx.set("total", json!(1));
        ctx.set("seen", json!(true));
        assert_eq!(ctx.get("item"), Some(&json!("a")));
        let popped = ctx.pop_scope().unwrap();
        assert!(popped.contains_key("item"));

        assert!(ctx.get("item").is_none());
        assert_eq!(ctx.get("total"), Some(&json!(1)));
        assert_eq!(ctx.get("seen"), Some(&json!(true)));
        assert!(ctx.pop_scope().is_none());
    }

    #[test]
    fn test_shadowing_updates_innermost() {
        let mut ctx = ExecutionContext::with_variables(bindings(&[("item", json!("outer"))]));
        ctx.push_scope(ScopeKind::Loop, bindings(&[("item", json!("inner"))]));
        ctx.set("item", json!("changed"));
        ctx.pop_scope();
        assert_eq!(ctx.get("item"), Some(&json!("outer")));
    }

    #[test]
    fn test_frames_are_isolated() {
        let mut ctx = ExecutionContext::with_variables(bindings(&[("secret", json!(42))]));
        ctx.push_frame("login", bindings(&[("user", json!("bob"))]))
            .unwrap();

        assert_eq!(ctx.current_script(), Some("login"));
        assert!(ctx.get("secret").is_none());
        assert_eq!(ctx.get("user"), Some(&json!("bob")));
        ctx.set("result", json!("ok"));

        let vars = ctx.pop_frame().unwrap();
        assert_eq!(vars["result"], json!("ok"));
        assert!(ctx.get("result").is_none());
        assert!(ctx.get("user").is_none());
        assert_eq!(ctx.get("secret"), Some(&json!(42)));
        assert!(ctx.pop_frame().is_none());
    }

    #[test]
    fn test_call_depth_limit() {
        let mut ctx = ExecutionContext::new();
        for _ in 0..MAX_CALL_DEPTH {
            ctx.push_frame("r", IndexMap::new()).unwrap();
        }
        assert!(matches!(
            ctx.push_frame("r", IndexMap::new()),
            Err(EngineError::CallDepth { .. })
        ));
    }

    #[test]
    fn test_snapshot_and_restore() {
        let mut ctx = ExecutionContext::new();
        ctx.set("a", json!(1));
        ctx.push_scope(ScopeKind::Catch, bindings(&[("error", json!({"kind": "x"}))]));
        let snap = ctx.snapshot();
        assert_eq!(snap.len(), 2);

        ctx.restore(bindings(&[("b", json!(2))]));
        assert!(ctx.get("a").is_none());
        assert!(ctx.get("error").is_none());
        assert_eq!(ctx.globals()["b"], json!(2));
    }

    #[test]
    fn test_context_is_a_scope() {
        let mut ctx = ExecutionContext::new();
        ctx.set("x", json!(3));
        assert_eq!(sw_expr::evaluate("x * 2", &ctx).unwrap(), json!(6));
    }

    #[test]
    fn test_scope_sees_innermost_binding() {
        let mut ctx = ExecutionContext::new();
        ctx.set("item", json!("outer"));
        ctx.set("total", json!(1));
        ctx.push_scope(ScopeKind::Loop, bindings(&[("item", json!("inner"))]));

        assert_eq!(ctx.names(), vec!["item", "total"]);
        assert_eq!(
            sw_expr::evaluate("item ~ total", &ctx).unwrap(),
            json!("inner1")
        );
    }
}
