use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

use ganglion_core::domain::execution::ExecutionResult;
use ganglion_core::domain::session::{ContextMap, SessionId};

use crate::runtime::{EngineError, ExecutionEngine, ExecutionRequest};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CapabilityKind {
    /// Produces feedback; the loop continues.
    Routine,
    /// Ends the loop and carries its return value out.
    Terminal,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ParamKind {
    String,
    Integer,
    Number,
    Boolean,
    Json,
}

impl ParamKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::String => "string",
            Self::Integer => "integer",
            Self::Number => "number",
            Self::Boolean => "boolean",
            Self::Json => "json",
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ParameterSpec {
    pub name: String,
    pub description: String,
    pub kind: ParamKind,
    pub required: bool,
}

impl ParameterSpec {
    pub fn required(
        name: impl Into<String>,
        description: impl Into<String>,
        kind: ParamKind,
    ) -> Self {
        Self { name: name.into(), description: description.into(), kind, required: true }
    }

    pub fn optional(
        name: impl Into<String>,
        description: impl Into<String>,
        kind: ParamKind,
    ) -> Self {
        Self { name: name.into(), description: description.into(), kind, required: false }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct CapabilitySpec {
    pub name: String,
    pub description: String,
    pub parameters: Vec<ParameterSpec>,
    pub kind: CapabilityKind,
}

impl CapabilitySpec {
    pub fn routine(name: impl Into<String>, description: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            description: description.into(),
            parameters: Vec::new(),
            kind: CapabilityKind::Routine,
        }
    }

    pub fn terminal(name: impl Into<String>, description: impl Into<String>) -> Self {
        Self { kind: CapabilityKind::Terminal, ..Self::routine(name, description) }
    }

    pub fn with_parameter(mut self, parameter: ParameterSpec) -> Self {
        self.parameters.push(parameter);
        self
    }

    pub fn parameter(&self, name: &str) -> Option<&ParameterSpec> {
        self.parameters.iter().find(|parameter| parameter.name == name)
    }

    pub fn is_terminal(&self) -> bool {
        self.kind == CapabilityKind::Terminal
    }
}

#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum ArgumentError {
    #[error("missing required parameter `{0}`")]
    Missing(String),
    #[error("`{0}` is not a declared parameter")]
    Undeclared(String),
    #[error("parameter `{name}` must be {expected}, got `{found}`")]
    WrongKind { name: String, expected: &'static str, found: String },
}

/// Arguments that passed validation against a [`CapabilitySpec`]: every
/// required parameter present, nothing undeclared, each value of its
/// declared kind.
#[derive(Clone, Debug, Default, PartialEq, Serialize)]
#[serde(transparent)]
pub struct Arguments(BTreeMap<String, Value>);

impl Arguments {
    pub fn validate(
        spec: &CapabilitySpec,
        raw: BTreeMap<String, Value>,
    ) -> Result<Self, Vec<ArgumentError>> {
        let mut errors = Vec::new();
        let mut values = BTreeMap::new();

        for (name, value) in raw {
            let Some(parameter) = spec.parameter(&name) else {
                errors.push(ArgumentError::Undeclared(name));
                continue;
            };
            if value.is_null() {
                continue;
            }
            match coerce(parameter, value) {
                Ok(value) => {
                    values.insert(name, value);
                }
                Err(error) => errors.push(error),
            }
        }

        for parameter in spec.parameters.iter().filter(|parameter| parameter.required) {
            let mistyped = errors.iter().any(|error| {
                matches!(error, ArgumentError::WrongKind { name, .. } if name == &parameter.name)
            });
            if !values.contains_key(&parameter.name) && !mistyped {
                errors.push(ArgumentError::Missing(parameter.name.clone()));
            }
        }

        if errors.is_empty() {
            Ok(Self(values))
        } else {
            Err(errors)
        }
    }

    pub fn get(&self, name: &str) -> Option<&Value> {
        self.0.get(name)
    }

    pub fn str(&self, name: &str) -> Option<&str> {
        self.0.get(name).and_then(Value::as_str)
    }

    pub fn i64(&self, name: &str) -> Option<i64> {
        self.0.get(name).and_then(Value::as_i64)
    }

    pub fn f64(&self, name: &str) -> Option<f64> {
        self.0.get(name).and_then(Value::as_f64)
    }

    pub fn bool(&self, name: &str) -> Option<bool> {
        self.0.get(name).and_then(Value::as_bool)
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn into_inner(self) -> BTreeMap<String, Value> {
        self.0
    }
}

fn coerce(parameter: &ParameterSpec, value: Value) -> Result<Value, ArgumentError> {
    let wrong = |found: &Value| ArgumentError::WrongKind {
        name: parameter.name.clone(),
        expected: parameter.kind.as_str(),
        found: found.to_string(),
    };

    match parameter.kind {
        ParamKind::String => match value {
            Value::String(_) => Ok(value),
            Value::Number(number) => Ok(Value::String(number.to_string())),
            Value::Bool(flag) => Ok(Value::String(flag.to_string())),
            other => Err(wrong(&other)),
        },
        ParamKind::Integer => match &value {
            Value::Number(number) if number.is_i64() || number.is_u64() => Ok(value.clone()),
            Value::Number(number) => match number.as_f64() {
                Some(float) if float.fract() == 0.0 && float.abs() < i64::MAX as f64 => {
                    Ok(Value::from(float as i64))
                }
                _ => Err(wrong(&value)),
            },
            Value::String(text) => {
                text.trim().parse::<i64>().map(Value::from).map_err(|_| wrong(&value))
            }
            _ => Err(wrong(&value)),
        },
        ParamKind::Number => match &value {
            Value::Number(_) => Ok(value.clone()),
            Value::String(text) => text
                .trim()
                .parse::<f64>()
                .ok()
                .and_then(serde_json::Number::from_f64)
                .map(Value::Number)
                .ok_or_else(|| wrong(&value)),
            _ => Err(wrong(&value)),
        },
        ParamKind::Boolean => match &value {
            Value::Bool(_) => Ok(value.clone()),
            Value::String(text) => match text.trim().to_ascii_lowercase().as_str() {
                "true" | "yes" => Ok(Value::Bool(true)),
                "false" | "no" => Ok(Value::Bool(false)),
                _ => Err(wrong(&value)),
            },
            _ => Err(wrong(&value)),
        },
        ParamKind::Json => match value {
            Value::String(text) => {
                let trimmed = text.trim();
                if trimmed.starts_with('{') || trimmed.starts_with('[') {
                    Ok(serde_json::from_str(trimmed).unwrap_or(Value::String(text)))
                } else {
                    Ok(Value::String(text))
                }
            }
            other => Ok(other),
        },
    }
}

/// What a capability handler sees of the running execution.
pub struct InvocationContext<'a> {
    engine: &'a ExecutionEngine,
    session_id: &'a SessionId,
    depth: u32,
    lineage: &'a [SessionId],
    context: &'a mut ContextMap,
    dirty: bool,
}

impl<'a> InvocationContext<'a> {
    pub(crate) fn new(
        engine: &'a ExecutionEngine,
        session_id: &'a SessionId,
        depth: u32,
        lineage: &'a [SessionId],
        context: &'a mut ContextMap,
    ) -> Self {
        Self { engine, session_id, depth, lineage, context, dirty: false }
    }

    pub fn session_id(&self) -> &SessionId {
        self.session_id
    }

    pub fn depth(&self) -> u32 {
        self.depth
    }

    pub fn context(&self) -> &ContextMap {
        self.context
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.context.get(key)
    }

    pub fn set(&mut self, key: impl Into<String>, value: Value) -> Option<Value> {
        self.dirty = true;
        self.context.insert(key.into(), value)
    }

    pub fn remove(&mut self, key: &str) -> Option<Value> {
        let removed = self.context.remove(key);
        self.dirty |= removed.is_some();
        removed
    }

    pub fn is_dirty(&self) -> bool {
        self.dirty
    }

    /// Runs a fresh, isolated execution one level deeper. Only its result
    /// comes back; its conversation stays its own.
    pub async fn execute_nested(
        &self,
        request: ExecutionRequest,
    ) -> Result<ExecutionResult, EngineError> {
        let mut lineage = self.lineage.to_vec();
        lineage.push(self.session_id.clone());
        self.engine.run(request, self.depth + 1, lineage).await
    }
}

#[async_trait]
pub trait Capability: Send + Sync {
    fn spec(&self) -> &CapabilitySpec;

    async fn invoke(
        &self,
        args: Arguments,
        ctx: &mut InvocationContext<'_>,
    ) -> anyhow::Result<Value>;
}

#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum RegistryError {
    #[error("capability `{0}` is registered twice")]
    Duplicate(String),
    #[error("capability name `{0}` must be non-empty and use only letters, digits, `_` or `-`")]
    InvalidName(String),
    #[error("unknown capability `{0}`")]
    UnknownCapability(String),
}

/// Immutable name -> capability map, shared across sessions.
pub struct CapabilityRegistry {
    capabilities: HashMap<String, Arc<dyn Capability>>,
    order: Vec<String>,
}

#[derive(Default)]
pub struct CapabilityRegistryBuilder {
    entries: Vec<Arc<dyn Capability>>,
}

impl CapabilityRegistryBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register<C>(mut self, capability: C) -> Self
    where
        C: Capability + 'static,
    {
        self.entries.push(Arc::new(capability));
        self
    }

    pub fn register_arc(mut self, capability: Arc<dyn Capability>) -> Self {
        self.entries.push(capability);
        self
    }

    pub fn build(self) -> Result<CapabilityRegistry, RegistryError> {
        let mut capabilities = HashMap::new();
        let mut order = Vec::new();
        for capability in self.entries {
            let name = capability.spec().name.clone();
            if !valid_capability_name(&name) {
                return Err(RegistryError::InvalidName(name));
            }
            if capabilities.contains_key(&name) {
                return Err(RegistryError::Duplicate(name));
            }
            order.push(name.clone());
            capabilities.insert(name, capability);
        }
        Ok(CapabilityRegistry { capabilities, order })
    }
}

fn valid_capability_name(name: &str) -> bool {
    !name.is_empty() && name.chars().all(|ch| ch.is_ascii_alphanumeric() || matches!(ch, '_' | '-'))
}

impl CapabilityRegistry {
    pub fn builder() -> CapabilityRegistryBuilder {
        CapabilityRegistryBuilder::new()
    }

    pub fn get(&self, name: &str) -> Option<&Arc<dyn Capability>> {
        self.capabilities.get(name)
    }

    pub fn names(&self) -> &[String] {
        &self.order
    }

    pub fn len(&self) -> usize {
        self.order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }

    pub fn all(&self) -> CapabilitySet {
        CapabilitySet {
            entries: self
                .order
                .iter()
                .filter_map(|name| self.capabilities.get(name).cloned())
                .collect(),
        }
    }

    /// Visible subset for one invocation, in the order given.
    pub fn select<S: AsRef<str>>(&self, names: &[S]) -> Result<CapabilitySet, RegistryError> {
        let mut entries: Vec<Arc<dyn Capability>> = Vec::with_capacity(names.len());
        for name in names {
            let name = name.as_ref();
            let capability = self
                .capabilities
                .get(name)
                .ok_or_else(|| RegistryError::UnknownCapability(name.to_string()))?;
            if !entries.iter().any(|entry| entry.spec().name == name) {
                entries.push(capability.clone());
            }
        }
        Ok(CapabilitySet { entries })
    }
}

#[derive(Clone)]
pub struct CapabilitySet {
    entries: Vec<Arc<dyn Capability>>,
}

impl CapabilitySet {
    pub fn get(&self, name: &str) -> Option<&Arc<dyn Capability>> {
        self.entries.iter().find(|entry| entry.spec().name == name)
    }

    pub fn names(&self) -> Vec<String> {
        self.entries.iter().map(|entry| entry.spec().name.clone()).collect()
    }

    pub fn specs(&self) -> Vec<&CapabilitySpec> {
        self.entries.iter().map(|entry| entry.spec()).collect()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;

    use serde_json::{json, Value};

    use super::{
        ArgumentError, Arguments, CapabilityRegistry, CapabilitySpec, ParamKind, ParameterSpec,
        RegistryError,
    };
    use crate::builtin::{Finish, Remember};

    fn raw(pairs: &[(&str, Value)]) -> BTreeMap<String, Value> {
        pairs.iter().map(|(key, value)| (key.to_string(), value.clone())).collect()
    }

    fn read_file_spec() -> CapabilitySpec {
        CapabilitySpec::routine("read_file", "read a file")
            .with_parameter(ParameterSpec::required("path", "file path", ParamKind::String))
            .with_parameter(ParameterSpec::optional("limit", "max lines", ParamKind::Integer))
            .with_parameter(ParameterSpec::optional("follow", "follow links", ParamKind::Boolean))
    }

    #[test]
    fn coerces_values_to_declared_kinds() {
        let args = Arguments::validate(
            &read_file_spec(),
            raw(&[("path", json!("/etc/app.toml")), ("limit", json!("40")), ("follow", json!("yes"))]),
        )
        .expect("valid arguments");

        assert_eq!(args.str("path"), Some("/etc/app.toml"));
        assert_eq!(args.i64("limit"), Some(40));
        assert_eq!(args.bool("follow"), Some(true));
    }

    #[test]
    fn reports_missing_undeclared_and_mistyped() {
        let errors = Arguments::validate(
            &read_file_spec(),
            raw(&[("limit", json!("many")), ("colour", json!("red"))]),
        )
        .expect_err("invalid arguments");

        assert!(errors.contains(&ArgumentError::Missing("path".to_string())));
        assert!(errors.contains(&ArgumentError::Undeclared("colour".to_string())));
        assert!(errors
            .iter()
            .any(|error| matches!(error, ArgumentError::WrongKind { name, .. } if name == "limit")));
    }

    #[test]
    fn null_required_value_counts_as_missing() {
        let errors = Arguments::validate(&read_file_spec(), raw(&[("path", Value::Null)]))
            .expect_err("null path");
        assert_eq!(errors, vec![ArgumentError::Missing("path".to_string())]);
    }

    #[test]
    fn builder_rejects_duplicates_and_select_rejects_unknown_names() {
        let duplicate =
            CapabilityRegistry::builder().register(Finish::new()).register(Finish::new()).build();
        assert!(matches!(duplicate, Err(RegistryError::Duplicate(name)) if name == "finish"));

        let registry = CapabilityRegistry::builder()
            .register(Finish::new())
            .register(Remember::new())
            .build()
            .expect("registry");
        let selected = registry.select(&["remember", "finish", "remember"]).expect("subset");
        assert_eq!(selected.names(), vec!["remember".to_string(), "finish".to_string()]);

        assert!(matches!(
            registry.select(&["search"]),
            Err(RegistryError::UnknownCapability(name)) if name == "search"
        ));
    }
}
