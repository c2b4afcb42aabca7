use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// The declared type of one template parameter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ParamType {
    String,
    Number,
    Boolean,
    Array,
    Object,
}

impl ParamType {
    pub fn matches(&self, value: &Value) -> bool {
        match self {
            ParamType::String => value.is_string(),
            ParamType::Number => value.is_number(),
            ParamType::Boolean => value.is_boolean(),
            ParamType::Array => value.is_array(),
            ParamType::Object => value.is_object(),
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            ParamType::String => "string",
            ParamType::Number => "number",
            ParamType::Boolean => "boolean",
            ParamType::Array => "array",
            ParamType::Object => "object",
        }
    }
}

/// One declared parameter on a [`Template`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ParamSpec {
    pub name: String,
    #[serde(rename = "type")]
    pub ty: ParamType,
    pub required: bool,
    pub default: Option<Value>,
}

/// A parameterized pipeline blueprint (spec §3, supplemented).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Template {
    pub template_id: String,
    pub name: String,
    pub version: String,
    pub category: Option<String>,
    pub description: Option<String>,
    pub content: Value,
    pub parameters: Vec<ParamSpec>,
}

/// A rendered, runnable pipeline document (spec §3, C3 output).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Pipeline {
    pub task_id: String,
    pub task_name: String,
    pub task_description: Option<String>,
    pub steps: Vec<Value>,
    pub metadata: PipelineMetadata,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineMetadata {
    pub template_id: Option<String>,
    pub template_version: Option<String>,
    pub generated_at: DateTime<Utc>,
    pub parameters: HashMap<String, Value>,
}
