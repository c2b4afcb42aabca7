use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// A stored workflow/task result (spec §3, C1).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResultRecord {
    pub workflow_id: String,
    pub task_id: Option<String>,
    pub schema_id: String,
    pub payload: Value,
    pub timestamp: DateTime<Utc>,
}

impl ResultRecord {
    /// `result_key = "{workflow_id}_{task_id}"`, or bare `workflow_id` when
    /// `task_id` is absent (spec §4.8 resolution note).
    pub fn result_key(workflow_id: &str, task_id: Option<&str>) -> String {
        match task_id {
            Some(t) => format!("{workflow_id}_{t}"),
            None => workflow_id.to_string(),
        }
    }
}

/// The declared type of one schema property.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SchemaPropertyType {
    Bool,
    String,
    Object,
    Array,
    Number,
    Any,
}

#[derive(Debug, Clone)]
pub struct SchemaProperty {
    pub ty: SchemaPropertyType,
    pub required: bool,
    pub default: Option<Value>,
}

impl SchemaProperty {
    pub fn required(ty: SchemaPropertyType) -> Self {
        SchemaProperty {
            ty,
            required: true,
            default: None,
        }
    }

    pub fn optional(ty: SchemaPropertyType) -> Self {
        SchemaProperty {
            ty,
            required: false,
            default: None,
        }
    }

    fn matches(&self, value: &Value) -> bool {
        match self.ty {
            SchemaPropertyType::Bool => value.is_boolean(),
            SchemaPropertyType::String => value.is_string(),
            SchemaPropertyType::Object => value.is_object(),
            SchemaPropertyType::Array => value.is_array(),
            SchemaPropertyType::Number => value.is_number(),
            SchemaPropertyType::Any => true,
        }
    }
}

/// A named, versioned result schema (spec §4.8).
#[derive(Debug, Clone)]
pub struct ResultSchema {
    pub id: String,
    pub properties: HashMap<String, SchemaProperty>,
}

impl ResultSchema {
    pub fn generic() -> Self {
        ResultSchema {
            id: "generic".into(),
            properties: HashMap::from([
                ("success".into(), SchemaProperty::required(SchemaPropertyType::Bool)),
                ("result".into(), SchemaProperty::optional(SchemaPropertyType::Object)),
                ("error".into(), SchemaProperty::optional(SchemaPropertyType::String)),
                ("timestamp".into(), SchemaProperty::optional(SchemaPropertyType::String)),
            ]),
        }
    }

    pub fn containerized_workflow() -> Self {
        let mut schema = Self::generic();
        schema.id = "containerized_workflow".into();
        schema
            .properties
            .insert("container_id".into(), SchemaProperty::required(SchemaPropertyType::String));
        schema
            .properties
            .insert("container_status".into(), SchemaProperty::optional(SchemaPropertyType::String));
        schema
            .properties
            .insert("logs".into(), SchemaProperty::optional(SchemaPropertyType::Any));
        schema
    }

    pub fn dagger_pipeline() -> Self {
        let mut schema = Self::generic();
        schema.id = "dagger_pipeline".into();
        schema
            .properties
            .insert("pipeline_id".into(), SchemaProperty::required(SchemaPropertyType::String));
        schema
            .properties
            .insert("pipeline_status".into(), SchemaProperty::optional(SchemaPropertyType::String));
        schema
            .properties
            .insert("steps".into(), SchemaProperty::optional(SchemaPropertyType::Array));
        schema
    }

    /// Validates required fields and property types; returns a
    /// human-readable description of the first violation found.
    pub fn validate(&self, payload: &Value) -> Result<(), String> {
        let obj = payload
            .as_object()
            .ok_or_else(|| "payload must be a JSON object".to_string())?;

        for (name, prop) in &self.properties {
            match obj.get(name) {
                Some(value) if !value.is_null() => {
                    if !prop.matches(value) {
                        return Err(format!("property '{name}' has the wrong type"));
                    }
                }
                _ if prop.required => {
                    return Err(format!("missing required property '{name}'"));
                }
                _ => {}
            }
        }
        Ok(())
    }

    /// Fills in declared defaults and stamps `timestamp` if the schema
    /// defines it and the caller omitted it.
    pub fn normalize(&self, mut payload: Value) -> Value {
        if let Some(obj) = payload.as_object_mut() {
            for (name, prop) in &self.properties {
                if !obj.contains_key(name) {
                    if let Some(default) = &prop.default {
                        obj.insert(name.clone(), default.clone());
                    }
                }
            }
            if self.properties.contains_key("timestamp")
                && obj.get("timestamp").is_none_or(|v| v.is_null())
            {
                obj.insert("timestamp".into(), Value::String(Utc::now().to_rfc3339()));
            }
        }
        payload
    }
}
