//! Pipeline Converter (C3): renders a [`Pipeline`] from a [`Template`] +
//! parameters + task, with `${...}` substitution, validation, and a
//! render cache (spec §4.6).

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use chrono::Utc;
use serde_json::Value;
use sha2::{Digest, Sha256};

use crate::error::PipelineError;
use crate::models::{ParamType, Pipeline, PipelineMetadata, Template};
use crate::ports::TaskSnapshot;

/// Resolves `template_id -> Template`. An in-memory/static registry is
/// sufficient (template authoring/storage is out of scope, spec §1); this is
/// a constructor dependency of the converter, not a network port.
pub trait TemplateRegistry: Send + Sync {
    fn get(&self, template_id: &str) -> Option<Template>;
}

/// A plain in-memory registry, the default the composition root wires up.
#[derive(Default)]
pub struct InMemoryTemplateRegistry {
    templates: HashMap<String, Template>,
}

impl InMemoryTemplateRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, template: Template) {
        self.templates.insert(template.template_id.clone(), template);
    }
}

impl TemplateRegistry for InMemoryTemplateRegistry {
    fn get(&self, template_id: &str) -> Option<Template> {
        self.templates.get(template_id).cloned()
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CacheStats {
    pub size: usize,
}

/// Canonical JSON (lexicographically sorted object keys) of a parameter map,
/// used both for the render cache key here and the Workflow Cache (C2) key.
pub fn canonical_json(params: &HashMap<String, Value>) -> String {
    let sorted: std::collections::BTreeMap<&String, &Value> = params.iter().collect();
    serde_json::to_string(&sorted).expect("maps of JSON values always serialize")
}

fn render_cache_key(task_id: &str, template_id: &str, params: &HashMap<String, Value>) -> String {
    let mut hasher = Sha256::new();
    hasher.update(task_id.as_bytes());
    hasher.update(b"_");
    hasher.update(template_id.as_bytes());
    hasher.update(b"_");
    hasher.update(canonical_json(params).as_bytes());
    hex::encode(hasher.finalize())
}

enum Placeholder {
    TaskId,
    TaskName,
    TaskDescription,
    Param(String),
}

fn parse_placeholder(inner: &str) -> Placeholder {
    match inner {
        "task.id" => Placeholder::TaskId,
        "task.name" => Placeholder::TaskName,
        "task.description" => Placeholder::TaskDescription,
        other => match other.strip_prefix("parameters.") {
            Some(name) => Placeholder::Param(name.to_string()),
            None => Placeholder::Param(other.to_string()),
        },
    }
}

fn resolve_placeholder(placeholder: &Placeholder, task: &TaskSnapshot, params: &HashMap<String, Value>) -> Option<Value> {
    match placeholder {
        Placeholder::TaskId => Some(Value::String(task.task_id.clone())),
        Placeholder::TaskName => Some(Value::String(task.name.clone())),
        Placeholder::TaskDescription => Some(Value::String(task.description.clone().unwrap_or_default())),
        Placeholder::Param(name) => params.get(name).cloned(),
    }
}

/// Scans `s` for non-nested `${...}` spans, returning `(start, end, inner)`.
fn scan_placeholders(s: &str) -> Vec<(usize, usize, &str)> {
    let mut spans = Vec::new();
    let bytes = s.as_bytes();
    let mut i = 0;
    while i + 1 < bytes.len() {
        if bytes[i] == b'$' && bytes[i + 1] == b'{' {
            if let Some(rel_end) = s[i + 2..].find('}') {
                let end = i + 2 + rel_end;
                spans.push((i, end + 1, &s[i + 2..end]));
                i = end + 1;
                continue;
            }
        }
        i += 1;
    }
    spans
}

fn scalar_to_string(value: &Value) -> Option<String> {
    match value {
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        Value::Bool(b) => Some(b.to_string()),
        _ => None,
    }
}

fn render_string(s: &str, task: &TaskSnapshot, params: &HashMap<String, Value>) -> Result<Value, PipelineError> {
    let spans = scan_placeholders(s);
    if spans.is_empty() {
        return Ok(Value::String(s.to_string()));
    }

    // A string that is *exactly* one placeholder substitutes the raw value
    // (preserving its type); embedded placeholders must be scalar.
    if spans.len() == 1 && spans[0].0 == 0 && spans[0].1 == s.len() {
        let placeholder = parse_placeholder(spans[0].2);
        return Ok(resolve_placeholder(&placeholder, task, params).unwrap_or_else(|| Value::String(s.to_string())));
    }

    let mut out = String::new();
    let mut cursor = 0;
    for (start, end, inner) in spans {
        out.push_str(&s[cursor..start]);
        let placeholder = parse_placeholder(inner);
        match resolve_placeholder(&placeholder, task, params) {
            Some(value) => match scalar_to_string(&value) {
                Some(text) => out.push_str(&text),
                None => {
                    return Err(PipelineError::InvalidPipeline(format!(
                        "parameter '{inner}' is an object/array and cannot appear inside a string placeholder"
                    )))
                }
            },
            None => out.push_str(&s[start..end]),
        }
        cursor = end;
    }
    out.push_str(&s[cursor..]);
    Ok(Value::String(out))
}

fn render_value(value: &Value, task: &TaskSnapshot, params: &HashMap<String, Value>) -> Result<Value, PipelineError> {
    match value {
        Value::String(s) => render_string(s, task, params),
        Value::Array(items) => {
            let rendered: Result<Vec<Value>, PipelineError> =
                items.iter().map(|v| render_value(v, task, params)).collect();
            Ok(Value::Array(rendered?))
        }
        Value::Object(map) => {
            let mut rendered = serde_json::Map::new();
            for (k, v) in map {
                rendered.insert(k.clone(), render_value(v, task, params)?);
            }
            Ok(Value::Object(rendered))
        }
        other => Ok(other.clone()),
    }
}

/// Validates a declared parameter against its spec.
fn validate_param(value: &Value, ty: ParamType) -> Result<(), PipelineError> {
    if !ty.matches(value) {
        return Err(PipelineError::TypeMismatch {
            name: String::new(),
            expected: ty.name(),
            actual: match value {
                Value::Null => "null",
                Value::Bool(_) => "boolean",
                Value::Number(_) => "number",
                Value::String(_) => "string",
                Value::Array(_) => "array",
                Value::Object(_) => "object",
            },
        });
    }
    Ok(())
}

pub struct PipelineConverter {
    templates: Arc<dyn TemplateRegistry>,
    render_cache: Mutex<HashMap<String, Pipeline>>,
}

impl PipelineConverter {
    pub fn new(templates: Arc<dyn TemplateRegistry>) -> Self {
        PipelineConverter { templates, render_cache: Mutex::new(HashMap::new()) }
    }

    /// Renders a Pipeline from a template, in precedence order: template
    /// defaults -> task's own `pipeline_parameters` -> caller overrides.
    pub fn convert(
        &self,
        task: &TaskSnapshot,
        template_id: &str,
        overrides: &HashMap<String, Value>,
    ) -> Result<Pipeline, PipelineError> {
        let template = self
            .templates
            .get(template_id)
            .ok_or_else(|| PipelineError::TemplateNotFound(template_id.to_string()))?;

        let mut effective = HashMap::new();
        for param in &template.parameters {
            if let Some(default) = &param.default {
                effective.insert(param.name.clone(), default.clone());
            }
        }
        effective.extend(task.pipeline_parameters.clone());
        effective.extend(overrides.clone());

        for param in &template.parameters {
            match effective.get(&param.name) {
                Some(value) => validate_param(value, param.ty).map_err(|e| match e {
                    PipelineError::TypeMismatch { expected, actual, .. } => {
                        PipelineError::TypeMismatch { name: param.name.clone(), expected, actual }
                    }
                    other => other,
                })?,
                None if param.required => return Err(PipelineError::MissingParameter(param.name.clone())),
                None => {}
            }
        }

        let cache_key = render_cache_key(&task.task_id, template_id, &effective);
        if let Some(cached) = self.render_cache.lock().unwrap().get(&cache_key) {
            return Ok(cached.clone());
        }

        let rendered_content = render_value(&template.content, task, &effective)?;
        let steps = rendered_content
            .get("steps")
            .and_then(|v| v.as_array())
            .cloned()
            .unwrap_or_default();

        let pipeline = Pipeline {
            task_id: task.task_id.clone(),
            task_name: task.name.clone(),
            task_description: task.description.clone(),
            steps,
            metadata: PipelineMetadata {
                template_id: Some(template.template_id.clone()),
                template_version: Some(template.version.clone()),
                generated_at: Utc::now(),
                parameters: effective,
            },
        };

        self.render_cache.lock().unwrap().insert(cache_key, pipeline.clone());
        Ok(pipeline)
    }

    /// Skips template resolution but still performs task-field injection and
    /// metadata stamping.
    pub fn create_custom_pipeline(&self, task: &TaskSnapshot, definition: &Value) -> Result<Pipeline, PipelineError> {
        let params = HashMap::new();
        let rendered = render_value(definition, task, &params)?;
        let steps = rendered.get("steps").and_then(|v| v.as_array()).cloned().unwrap_or_default();

        Ok(Pipeline {
            task_id: task.task_id.clone(),
            task_name: task.name.clone(),
            task_description: task.description.clone(),
            steps,
            metadata: PipelineMetadata {
                template_id: None,
                template_version: None,
                generated_at: Utc::now(),
                parameters: HashMap::new(),
            },
        })
    }

    /// `ValidatePipeline`: required top-level fields `task_id, task_name`;
    /// `steps`, if present, must be an array of objects each with `name`.
    pub fn validate_pipeline(doc: &Value) -> Result<(), PipelineError> {
        let obj = doc
            .as_object()
            .ok_or_else(|| PipelineError::InvalidPipeline("pipeline must be a JSON object".into()))?;

        if !obj.get("task_id").is_some_and(|v| v.is_string()) {
            return Err(PipelineError::InvalidPipeline("missing required field 'task_id'".into()));
        }
        if !obj.get("task_name").is_some_and(|v| v.is_string()) {
            return Err(PipelineError::InvalidPipeline("missing required field 'task_name'".into()));
        }
        if let Some(steps) = obj.get("steps") {
            let steps = steps
                .as_array()
                .ok_or_else(|| PipelineError::InvalidPipeline("'steps' must be an array".into()))?;
            for step in steps {
                let step_obj = step
                    .as_object()
                    .ok_or_else(|| PipelineError::InvalidPipeline("each step must be an object".into()))?;
                if !step_obj.get("name").is_some_and(|v| v.is_string()) {
                    return Err(PipelineError::InvalidPipeline("each step requires a 'name'".into()));
                }
            }
        }
        Ok(())
    }

    pub fn clear_cache(&self) {
        self.render_cache.lock().unwrap().clear();
    }

    pub fn cache_stats(&self) -> CacheStats {
        CacheStats { size: self.render_cache.lock().unwrap().len() }
    }
}
