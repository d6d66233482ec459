use serde::Serialize;
use tera::{Context, Tera};
use thiserror::Error;

use crate::tools::CapabilitySpec;

const CATALOGUE: &str = "catalogue";
const REPROMPT: &str = "reprompt";
const DISAMBIGUATE: &str = "disambiguate";
const NEGOTIATE_SYSTEM: &str = "negotiate_system";
const NEGOTIATE_INTENT: &str = "negotiate_intent";
const CLARIFY: &str = "clarify";

const CATALOGUE_TEMPLATE: &str = r#"{{ persona }}

You act by naming capabilities in your reply. Available capabilities:
{%- for capability in capabilities %}
- {{ capability.name }}{% if capability.terminal %} (ends the task){% endif %}: {{ capability.description }}
{%- for parameter in capability.parameters %}
    - {{ parameter.name }} ({{ parameter.kind }}{% if not parameter.required %}, optional{% endif %}): {{ parameter.description }}
{%- endfor %}
{%- endfor %}

Say plainly which capability you want to run now. Arguments are collected from your reply afterwards."#;

const REPROMPT_TEMPLATE: &str = r#"No capability was selected in your last reply, so nothing happened.
Name the capability you want to run now, one of: {{ names | join(sep=", ") }}.
{%- if terminal %} When the task is complete, use {{ terminal | join(sep=" or ") }}.{% endif %}"#;

const DISAMBIGUATE_TEMPLATE: &str = r#"You review an agent's reply and decide which capabilities it wants to run right now.
Only these names may appear in your answer: {{ mentioned | join(sep=", ") }}.
Ignore capabilities that are only discussed, planned for later, or ruled out.
List them in the order they should run. A name may repeat if it should run more than once.
Answer with a single line:
ACTIONS: name, name
Use `ACTIONS: none` if nothing should run now."#;

const NEGOTIATE_SYSTEM_TEMPLATE: &str = r#"You turn a request into arguments for the capability `{{ name }}`: {{ description }}
Parameters:
{%- for parameter in parameters %}
- {{ parameter.name }} ({{ parameter.kind }}, {% if parameter.required %}required{% else %}optional{% endif %}): {{ parameter.description }}
{%- endfor %}
{%- if not parameters %} (none){% endif %}

Reply in exactly one of these shapes:

STATUS: READY
PARAMS:
name: value

STATUS: ASK
QUESTION: what you need to know

STATUS: NOT_TO_RUN
REASON: why the requester does not actually want `{{ name }}` now

Only answer READY when every required parameter has a value taken from the request or the answers you received. Never invent values."#;

const NEGOTIATE_INTENT_TEMPLATE: &str = r#"Request:
{{ intent }}"#;

const CLARIFY_TEMPLATE: &str = r#"To run `{{ name }}` I need more information: {{ question }}
Answer the question directly and briefly."#;

#[derive(Debug, Error)]
#[error("prompt `{template}` failed to render: {message}")]
pub struct PromptError {
    pub template: &'static str,
    pub message: String,
}

#[derive(Serialize)]
struct CapabilityView<'a> {
    name: &'a str,
    description: &'a str,
    terminal: bool,
    parameters: Vec<ParameterView<'a>>,
}

#[derive(Serialize)]
struct ParameterView<'a> {
    name: &'a str,
    description: &'a str,
    kind: &'static str,
    required: bool,
}

impl<'a> CapabilityView<'a> {
    fn from_spec(spec: &'a CapabilitySpec) -> Self {
        Self {
            name: &spec.name,
            description: &spec.description,
            terminal: spec.is_terminal(),
            parameters: spec
                .parameters
                .iter()
                .map(|parameter| ParameterView {
                    name: &parameter.name,
                    description: &parameter.description,
                    kind: parameter.kind.as_str(),
                    required: parameter.required,
                })
                .collect(),
        }
    }
}

/// Every prompt the engine sends, compiled once.
pub struct PromptLibrary {
    tera: Tera,
}

impl PromptLibrary {
    pub fn new() -> Result<Self, PromptError> {
        let mut tera = Tera::default();
        tera.add_raw_templates(vec![
            (CATALOGUE, CATALOGUE_TEMPLATE),
            (REPROMPT, REPROMPT_TEMPLATE),
            (DISAMBIGUATE, DISAMBIGUATE_TEMPLATE),
            (NEGOTIATE_SYSTEM, NEGOTIATE_SYSTEM_TEMPLATE),
            (NEGOTIATE_INTENT, NEGOTIATE_INTENT_TEMPLATE),
            (CLARIFY, CLARIFY_TEMPLATE),
        ])
        .map_err(|error| PromptError { template: "library", message: error.to_string() })?;
        Ok(Self { tera })
    }

    /// System turn for a fresh session: the persona followed by the capability catalogue.
    pub fn catalogue(
        &self,
        persona: &str,
        capabilities: &[&CapabilitySpec],
    ) -> Result<String, PromptError> {
        let mut context = Context::new();
        context.insert("persona", persona);
        context.insert(
            "capabilities",
            &capabilities.iter().map(|spec| CapabilityView::from_spec(spec)).collect::<Vec<_>>(),
        );
        self.render(CATALOGUE, &context)
    }

    pub fn reprompt(&self, capabilities: &[&CapabilitySpec]) -> Result<String, PromptError> {
        let names: Vec<&str> = capabilities.iter().map(|spec| spec.name.as_str()).collect();
        let terminal: Vec<&str> = capabilities
            .iter()
            .filter(|spec| spec.is_terminal())
            .map(|spec| spec.name.as_str())
            .collect();
        let mut context = Context::new();
        context.insert("names", &names);
        context.insert("terminal", &terminal);
        self.render(REPROMPT, &context)
    }

    pub fn disambiguate(&self, mentioned: &[String]) -> Result<String, PromptError> {
        let mut context = Context::new();
        context.insert("mentioned", mentioned);
        self.render(DISAMBIGUATE, &context)
    }

    pub fn negotiate_system(&self, spec: &CapabilitySpec) -> Result<String, PromptError> {
        let view = CapabilityView::from_spec(spec);
        let mut context = Context::new();
        context.insert("name", view.name);
        context.insert("description", view.description);
        context.insert("parameters", &view.parameters);
        self.render(NEGOTIATE_SYSTEM, &context)
    }

    pub fn negotiate_intent(&self, intent: &str) -> Result<String, PromptError> {
        let mut context = Context::new();
        context.insert("intent", intent);
        self.render(NEGOTIATE_INTENT, &context)
    }

    pub fn clarify(&self, capability: &str, question: &str) -> Result<String, PromptError> {
        let mut context = Context::new();
        context.insert("name", capability);
        context.insert("question", question);
        self.render(CLARIFY, &context)
    }

    fn render(&self, template: &'static str, context: &Context) -> Result<String, PromptError> {
        self.tera
            .render(template, context)
            .map_err(|error| PromptError { template, message: error.to_string() })
    }
}
