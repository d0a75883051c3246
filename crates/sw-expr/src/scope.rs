//! Variable scopes visible to expressions

use crate::functions;
use indexmap::IndexMap;
use minijinja::value::{Enumerator, Object, ObjectRepr, Value as JinjaValue};
use serde_json::{Map, Value};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};

/// Variable lookup used by the evaluator
pub trait Scope {
    /// Look up a top-level variable
    fn lookup(&self, name: &str) -> Option<&Value>;

    /// Names of every visible variable
    fn names(&self) -> Vec<&str>;
}

impl Scope for Map<String, Value> {
    fn lookup(&self, name: &str) -> Option<&Value> {
        self.get(name)
    }

    fn names(&self) -> Vec<&str> {
        self.keys().map(String::as_str).collect()
    }
}

impl Scope for HashMap<String, Value> {
    fn lookup(&self, name: &str) -> Option<&Value> {
        self.get(name)
    }

    fn names(&self) -> Vec<&str> {
        self.keys().map(String::as_str).collect()
    }
}

impl Scope for IndexMap<String, Value> {
    fn lookup(&self, name: &str) -> Option<&Value> {
        self.get(name)
    }

    fn names(&self) -> Vec<&str> {
        self.keys().map(String::as_str).collect()
    }
}

/// A scope with no variables
pub struct EmptyScope;

impl Scope for EmptyScope {
    fn lookup(&self, _name: &str) -> Option<&Value> {
        None
    }

    fn names(&self) -> Vec<&str> {
        Vec::new()
    }
}

/// Names looked up during one evaluation that the scope did not define
pub(crate) type Missing = Arc<Mutex<Vec<String>>>;

/// A scope captured as the root object of a minijinja evaluation
#[derive(Debug)]
pub(crate) struct Variables {
    values: Map<String, Value>,
    missing: Missing,
}

impl Variables {
    /// Capture the visible variables of a scope
    ///
    /// Returns the evaluation context and the list that collects names the
    /// expression referenced without the scope defining them.
    pub fn capture(scope: &dyn Scope) -> (JinjaValue, Missing) {
        let values = scope
            .names()
            .into_iter()
            .filter_map(|name| {
                scope
                    .lookup(name)
                    .map(|value| (name.to_string(), value.clone()))
            })
            .collect();
        let missing = Missing::default();
        let context = JinjaValue::from_object(Variables {
            values,
            missing: missing.clone(),
        });
        (context, missing)
    }
}

impl Object for Variables {
    fn repr(self: &Arc<Self>) -> ObjectRepr {
        ObjectRepr::Map
    }

    fn get_value(self: &Arc<Self>, key: &JinjaValue) -> Option<JinjaValue> {
        let name = key.as_str()?;
        match self.values.get(name) {
            Some(value) => Some(JinjaValue::from_serialize(value)),
            None => {
                // globals such as `range` resolve after the context misses
                if !functions::is_global(name) {
                    if let Ok(mut missing) = self.missing.lock() {
                        missing.push(name.to_string());
                    }
                }
                None
            }
        }
    }

    fn enumerate(self: &Arc<Self>) -> Enumerator {
        Enumerator::Values(
            self.values
                .keys()
                .map(|name| JinjaValue::from(name.as_str()))
                .collect(),
        )
    }
}
