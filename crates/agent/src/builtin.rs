use async_trait::async_trait;
use serde_json::{json, Value};
use tracing::debug;

use crate::runtime::ExecutionRequest;
use crate::tools::{
    Arguments, Capability, CapabilitySpec, InvocationContext, ParamKind, ParameterSpec,
};

const DELEGATE_PERSONA: &str = "You are a focused helper working on a single sub-task for another \
                                agent. When you have the answer, call `finish` with it.";

/// Ends the loop and hands `result` back to the caller.
pub struct Finish {
    spec: CapabilitySpec,
}

impl Finish {
    pub fn new() -> Self {
        Self {
            spec: CapabilitySpec::terminal("finish", "Finish the task and return the final answer.")
                .with_parameter(ParameterSpec::required(
                    "result",
                    "the final answer to hand back",
                    ParamKind::Json,
                )),
        }
    }
}

impl Default for Finish {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Capability for Finish {
    fn spec(&self) -> &CapabilitySpec {
        &self.spec
    }

    async fn invoke(
        &self,
        args: Arguments,
        _ctx: &mut InvocationContext<'_>,
    ) -> anyhow::Result<Value> {
        Ok(args.get("result").cloned().unwrap_or(Value::Null))
    }
}

/// Writes one key into the session's scratch context.
pub struct Remember {
    spec: CapabilitySpec,
}

impl Remember {
    pub fn new() -> Self {
        Self {
            spec: CapabilitySpec::routine(
                "remember",
                "Store a value in working memory under a key.",
            )
            .with_parameter(ParameterSpec::required("key", "name to store under", ParamKind::String))
            .with_parameter(ParameterSpec::required("value", "value to keep", ParamKind::Json)),
        }
    }
}

impl Default for Remember {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Capability for Remember {
    fn spec(&self) -> &CapabilitySpec {
        &self.spec
    }

    async fn invoke(
        &self,
        args: Arguments,
        ctx: &mut InvocationContext<'_>,
    ) -> anyhow::Result<Value> {
        let key = args
            .str("key")
            .ok_or_else(|| anyhow::anyhow!("`key` is required"))?
            .to_string();
        let value = args.get("value").cloned().unwrap_or(Value::Null);
        let replaced = ctx.set(key.clone(), value).is_some();
        Ok(json!(if replaced { format!("updated `{key}`") } else { format!("stored `{key}`") }))
    }
}

/// Runs a sub-task as a nested, isolated execution.
pub struct Delegate {
    spec: CapabilitySpec,
}

impl Delegate {
    pub fn new() -> Self {
        Self {
            spec: CapabilitySpec::routine(
                "delegate",
                "Hand a self-contained sub-task to a helper agent and get its answer back.",
            )
            .with_parameter(ParameterSpec::required(
                "task",
                "the sub-task to perform",
                ParamKind::String,
            ))
            .with_parameter(ParameterSpec::optional(
                "persona",
                "role description for the helper",
                ParamKind::String,
            ))
            .with_parameter(ParameterSpec::optional(
                "capabilities",
                "list of capability names the helper may use",
                ParamKind::Json,
            )),
        }
    }
}

impl Default for Delegate {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Capability for Delegate {
    fn spec(&self) -> &CapabilitySpec {
        &self.spec
    }

    async fn invoke(
        &self,
        args: Arguments,
        ctx: &mut InvocationContext<'_>,
    ) -> anyhow::Result<Value> {
        let task = args.str("task").ok_or_else(|| anyhow::anyhow!("`task` is required"))?;
        let persona = args.str("persona").unwrap_or(DELEGATE_PERSONA);

        let mut request = ExecutionRequest::new(persona, task);
        if let Some(names) = args.get("capabilities") {
            let names = serde_json::from_value::<Vec<String>>(names.clone()).map_err(|error| {
                anyhow::anyhow!("`capabilities` must be a list of names: {error}")
            })?;
            request = request.with_capabilities(names);
        }

        debug!(
            event_name = "capability.delegate.started",
            session_id = %ctx.session_id(),
            depth = ctx.depth() + 1,
            "delegating sub-task"
        );
        let result = ctx.execute_nested(request).await?;
        Ok(Value::String(result.value.render()))
    }
}
