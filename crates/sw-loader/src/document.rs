//! Script documents

use crate::error::{LoaderError, LoaderResult};
use crate::step::Step;
use indexmap::IndexMap;
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::{Map, Value};

/// Deserialize a field that can be either a single string or a list of strings
fn string_or_vec<'de, D>(deserializer: D) -> Result<Vec<String>, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum StringOrVec {
        String(String),
        Vec(Vec<String>),
    }

    Ok(match Option::<StringOrVec>::deserialize(deserializer)? {
        Some(StringOrVec::String(s)) => vec![s],
        Some(StringOrVec::Vec(v)) => v,
        None => Vec::new(),
    })
}

/// Parameters declared either as a mapping of defaults or a list of names
fn param_declarations<'de, D>(deserializer: D) -> Result<IndexMap<String, Value>, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Declarations {
        Defaults(IndexMap<String, Value>),
        Names(Vec<String>),
    }

    Ok(match Option::<Declarations>::deserialize(deserializer)? {
        Some(Declarations::Defaults(map)) => map,
        Some(Declarations::Names(names)) => {
            names.into_iter().map(|n| (n, Value::Null)).collect()
        }
        None => IndexMap::new(),
    })
}

/// Reference to a composed script with caller-supplied parameters
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IncludeRef {
    pub script: String,
    #[serde(default)]
    pub params: Map<String, Value>,
}

impl IncludeRef {
    pub(crate) fn from_value(value: &Value) -> Option<Self> {
        match value {
            Value::String(script) => Some(Self {
                script: script.clone(),
                params: Map::new(),
            }),
            Value::Object(_) => serde_json::from_value(value.clone()).ok(),
            _ => None,
        }
    }
}

/// Document as written, before step classification and resolution
#[derive(Debug, Clone, Default, Deserialize)]
pub(crate) struct RawDocument {
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default, deserialize_with = "param_declarations")]
    pub params: IndexMap<String, Value>,
    #[serde(default)]
    pub variables: IndexMap<String, Value>,
    #[serde(default)]
    pub setup: Vec<Value>,
    #[serde(default)]
    pub steps: Vec<Value>,
    #[serde(default)]
    pub teardown: Vec<Value>,
    #[serde(default, deserialize_with = "string_or_vec")]
    pub extends: Vec<String>,
    #[serde(default, alias = "compose")]
    pub include: Vec<Value>,
}

impl RawDocument {
    /// Parse YAML content
    ///
    /// A document whose root is a list is shorthand for `steps:`.
    pub fn parse(reference: &str, content: &str) -> LoaderResult<Self> {
        let yaml_err = |source| LoaderError::Yaml {
            reference: reference.to_string(),
            source,
        };
        let root: serde_yaml::Value = serde_yaml::from_str(content).map_err(yaml_err)?;
        match root {
            serde_yaml::Value::Sequence(_) => Ok(Self {
                steps: serde_yaml::from_value(root).map_err(yaml_err)?,
                ..Self::default()
            }),
            serde_yaml::Value::Mapping(_) => serde_yaml::from_value(root).map_err(yaml_err),
            serde_yaml::Value::Null => Err(LoaderError::InvalidDocument {
                reference: reference.to_string(),
                message: "document is empty".to_string(),
            }),
            _ => Err(LoaderError::InvalidDocument {
                reference: reference.to_string(),
                message: "expected a mapping or a list of steps".to_string(),
            }),
        }
    }
}

/// A loaded script with `extends` and `include` fully resolved
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScriptDocument {
    /// Reference the document was loaded from
    pub reference: String,
    /// Declared name, defaults to the reference
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    /// Declared parameters; `null` marks a required parameter
    #[serde(default)]
    pub params: IndexMap<String, Value>,
    /// Initial variables
    #[serde(default)]
    pub variables: IndexMap<String, Value>,
    #[serde(default)]
    pub setup: Vec<Step>,
    pub steps: Vec<Step>,
    #[serde(default)]
    pub teardown: Vec<Step>,
    /// Direct parents, in declaration order
    #[serde(default)]
    pub extends: Vec<String>,
    /// Fingerprint of the content this document was parsed from
    pub fingerprint: String,
}

impl ScriptDocument {
    /// Parameters that have no default
    pub fn required_params(&self) -> impl Iterator<Item = &str> {
        self.params
            .iter()
            .filter(|(_, v)| v.is_null())
            .map(|(k, _)| k.as_str())
    }

    /// Total number of leaf actions in the main step list
    pub fn leaf_count(&self) -> usize {
        self.steps.iter().map(Step::leaf_count).sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_raw_document_fields() {
        let raw = RawDocument::parse(
            "main",
            r#"
name: Checkout
extends: base
params:
  user: null
  retries: 2
include:
  - login
  - script: cart
    params:
      item: book
steps:
  - action: click
"#,
        )
        .unwrap();

        assert_eq!(raw.name.as_deref(), Some("Checkout"));
        assert_eq!(raw.extends, vec!["base"]);
        assert_eq!(raw.params["user"], Value::Null);
        assert_eq!(raw.params["retries"], json!(2));
        assert_eq!(raw.include.len(), 2);
        assert_eq!(
            IncludeRef::from_value(&raw.include[1]).unwrap().params["item"],
            json!("book")
        );
        assert_eq!(raw.steps.len(), 1);
    }

    #[test]
    fn test_list_root_is_steps() {
        let raw = RawDocument::parse("flow", "- action: click\n- action: hover\n").unwrap();
        assert_eq!(raw.steps.len(), 2);
    }

    #[test]
    fn test_param_names_list() {
        let raw = RawDocument::parse("p", "params: [a, b]\nsteps: []").unwrap();
        assert_eq!(raw.params.len(), 2);
        assert!(raw.params.values().all(Value::is_null));
    }

    #[test]
    fn test_partial_documents_fail() {
        assert!(matches!(
            RawDocument::parse("x", ""),
            Err(LoaderError::InvalidDocument { .. }) | Err(LoaderError::Yaml { .. })
        ));
        assert!(matches!(
            RawDocument::parse("x", "steps:\n  - action: [click"),
            Err(LoaderError::Yaml { .. })
        ));
        assert!(matches!(
            RawDocument::parse("x", "42"),
            Err(LoaderError::InvalidDocument { .. })
        ));
    }
}
