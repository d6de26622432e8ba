//! Data model records (§3).

use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// A property or attribute definition carried by a [`TypeRecord`]: an
/// optional default (literal or function string), its declared type
/// (including `list:T` / `map:T` entry-schema), and whether it is
/// required.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct FieldDefinition {
    pub default: Option<String>,
    #[serde(rename = "type")]
    pub type_name: String,
    #[serde(default)]
    pub required: bool,
    /// Entry type for `list:T` / `map:T`; `None` means `T = string`.
    #[serde(default)]
    pub entry_schema: Option<String>,
}

/// Named type forming a single-parent inheritance chain via
/// `derived_from`. Immutable once loaded.
#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq, Eq)]
pub struct TypeRecord {
    pub name: String,
    pub derived_from: Option<String>,
    #[serde(default)]
    pub properties: HashMap<String, FieldDefinition>,
    #[serde(default)]
    pub attributes: HashMap<String, FieldDefinition>,
}

/// One requirement of a node template: a target node plus the
/// relationship type binding them.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Requirement {
    pub name: String,
    pub node: Option<String>,
    pub relationship: Option<String>,
    pub capability: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq, Eq)]
pub struct CapabilityTemplate {
    #[serde(rename = "type")]
    pub type_name: String,
    #[serde(default)]
    pub properties: HashMap<String, String>,
    #[serde(default)]
    pub attributes: HashMap<String, String>,
}

/// Instance of a [`TypeRecord`], with per-template property/attribute
/// overrides and an ordered requirement list.
#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq, Eq)]
pub struct NodeTemplate {
    pub name: String,
    #[serde(rename = "type")]
    pub type_name: String,
    #[serde(default)]
    pub properties: HashMap<String, String>,
    #[serde(default)]
    pub attributes: HashMap<String, String>,
    #[serde(default)]
    pub requirements: Vec<Requirement>,
    #[serde(default)]
    pub capabilities: HashMap<String, CapabilityTemplate>,
}

/// An exposed attribute of a substitution mapping, keyed by
/// `"<capability>.<attrName>"` on the owning node.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SubstitutionMappingAttribute {
    pub node_name: String,
    pub capability: String,
    pub attribute: String,
}

/// The TOSCA node lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeState {
    Initial,
    Creating,
    Created,
    Configuring,
    Configured,
    Starting,
    Started,
    Stopping,
    Stopped,
    Deleting,
    Deleted,
    Error,
}

impl std::fmt::Display for NodeState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = serde_json::to_value(self).unwrap_or_default();
        write!(f, "{}", s.as_str().unwrap_or("initial"))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum TaskType {
    Deploy,
    Undeploy,
    ScaleOut,
    ScaleIn,
    Custom,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Initial,
    Running,
    Done,
    Failed,
    Canceled,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepStatus {
    Initial,
    Running,
    Done,
    Error,
    Canceled,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum CheckType {
    Tcp,
    Http,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum CheckStatus {
    Passing,
    Warning,
    Critical,
}
