use std::collections::BTreeMap;
use std::sync::Arc;

use serde_json::Value;
use thiserror::Error;
use tracing::debug;

use ganglion_core::domain::conversation::{Conversation, Turn};

use crate::llm::{LlmClient, LlmError, ServiceId};
use crate::prompts::{PromptError, PromptLibrary};
use crate::retry::{retry_extract, ExtractError, ParseOutcome};
use crate::tools::{Arguments, CapabilitySpec};

/// One parsed negotiation reply. Never persisted.
#[derive(Clone, Debug, PartialEq)]
pub enum RoundReply {
    Ready(Arguments),
    Ask(String),
    NotToRun(String),
}

#[derive(Clone, Debug, PartialEq)]
pub enum NegotiationOutcome {
    Ready(Arguments),
    /// The requester did not actually want this capability. Not a failure.
    NotToRun { reason: String },
}

#[derive(Clone, Debug, PartialEq)]
pub struct Negotiated {
    pub outcome: NegotiationOutcome,
    pub rounds: u32,
}

#[derive(Debug, Error)]
pub enum NegotiationError {
    #[error("{service} service failed during negotiation: {source}")]
    Llm {
        service: ServiceId,
        #[source]
        source: LlmError,
    },
    #[error("arguments for `{capability}` were not settled within {rounds} rounds")]
    RoundsExhausted { capability: String, rounds: u32 },
    #[error("negotiation replies for `{capability}` stayed unparseable after {attempts} attempts")]
    Unparseable { capability: String, attempts: u32 },
    #[error(transparent)]
    Prompt(#[from] PromptError),
}

/// Turns an intent into validated arguments through a bounded dialogue:
/// the negotiation service proposes, asks, or declines; questions go to the
/// reasoning service with the caller's history as context.
pub struct NegotiationEngine {
    prompts: Arc<PromptLibrary>,
    max_rounds: u32,
    parse_attempts: u32,
}

impl NegotiationEngine {
    pub fn new(prompts: Arc<PromptLibrary>, max_rounds: u32, parse_attempts: u32) -> Self {
        Self { prompts, max_rounds: max_rounds.max(1), parse_attempts }
    }

    pub fn max_rounds(&self) -> u32 {
        self.max_rounds
    }

    /// `negotiator_id` names the backend actually behind `negotiator`, which
    /// is the reasoning service when negotiation has fallen back to it.
    pub async fn negotiate(
        &self,
        negotiator: &dyn LlmClient,
        negotiator_id: ServiceId,
        reasoning: &dyn LlmClient,
        history: &Conversation,
        intent: &str,
        spec: &CapabilitySpec,
    ) -> Result<Negotiated, NegotiationError> {
        let mut conversation = Conversation::from(vec![
            Turn::system(self.prompts.negotiate_system(spec)?),
            Turn::user(self.prompts.negotiate_intent(intent)?),
        ]);

        for round in 1..=self.max_rounds {
            let reply = retry_extract(
                negotiator,
                &mut conversation,
                |text| parse_reply(text, spec),
                self.parse_attempts,
            )
            .await
            .map_err(|error| match error {
                ExtractError::Llm(source) => NegotiationError::Llm { service: negotiator_id, source },
                ExtractError::Exhausted { attempts, .. } => {
                    NegotiationError::Unparseable { capability: spec.name.clone(), attempts }
                }
            })?;

            debug!(
                event_name = "negotiate.round.completed",
                capability = %spec.name,
                round,
                reply = reply_label(&reply),
                "negotiation round completed"
            );

            let question = match reply {
                RoundReply::Ready(args) => {
                    return Ok(Negotiated { outcome: NegotiationOutcome::Ready(args), rounds: round })
                }
                RoundReply::NotToRun(reason) => {
                    return Ok(Negotiated {
                        outcome: NegotiationOutcome::NotToRun { reason },
                        rounds: round,
                    })
                }
                RoundReply::Ask(question) => question,
            };

            conversation.push(Turn::assistant(format!("STATUS: ASK\nQUESTION: {question}")));
            if round == self.max_rounds {
                break;
            }

            let mut clarification = history.clone();
            clarification.push(Turn::user(self.prompts.clarify(&spec.name, &question)?));
            let answer = reasoning
                .complete(clarification.turns())
                .await
                .map_err(|source| NegotiationError::Llm { service: ServiceId::Reasoning, source })?;
            conversation.push(Turn::user(format!("ANSWER: {}", answer.content.trim())));
        }

        Err(NegotiationError::RoundsExhausted {
            capability: spec.name.clone(),
            rounds: self.max_rounds,
        })
    }
}

fn reply_label(reply: &RoundReply) -> &'static str {
    match reply {
        RoundReply::Ready(_) => "ready",
        RoundReply::Ask(_) => "ask",
        RoundReply::NotToRun(_) => "not_to_run",
    }
}

#[derive(Default)]
struct Sections {
    status: Option<String>,
    params: String,
    question: String,
    reason: String,
}

#[derive(Clone, Copy)]
enum Section {
    Status,
    Params,
    Question,
    Reason,
}

impl Sections {
    /// Inside PARAMS, a line keyed by one of the capability's own parameter
    /// names is a parameter even when the key doubles as a section name.
    fn parse(text: &str, spec: &CapabilitySpec) -> Self {
        let mut sections = Self::default();
        let mut current: Option<Section> = None;

        for line in text.lines() {
            if let Some((section, rest)) = section_header(line) {
                let shadowed = matches!(current, Some(Section::Params))
                    && line_key(line).is_some_and(|key| declared(spec, key));
                if !shadowed {
                    current = Some(section);
                    sections.append(section, rest);
                    continue;
                }
            }
            if let Some(section) = current {
                sections.append(section, line);
            }
        }
        sections
    }

    fn append(&mut self, section: Section, text: &str) {
        match section {
            Section::Status => {
                if self.status.is_none() && !text.trim().is_empty() {
                    self.status = Some(text.trim().trim_matches('*').trim().to_string());
                }
            }
            Section::Params => push_line(&mut self.params, text),
            Section::Question => push_line(&mut self.question, text),
            Section::Reason => push_line(&mut self.reason, text),
        }
    }
}

fn push_line(target: &mut String, line: &str) {
    if line.trim().is_empty() && target.is_empty() {
        return;
    }
    if !target.is_empty() {
        target.push('\n');
    }
    target.push_str(line);
}

fn section_header(line: &str) -> Option<(Section, &str)> {
    let stripped = line.trim().trim_start_matches(['*', '#', ' ']);
    let (head, rest) = stripped.split_once(':')?;
    let section = match head.trim_end_matches('*').trim().to_ascii_uppercase().as_str() {
        "STATUS" => Section::Status,
        "PARAMS" | "PARAMETERS" | "ARGS" | "ARGUMENTS" => Section::Params,
        "QUESTION" => Section::Question,
        "REASON" => Section::Reason,
        _ => return None,
    };
    Some((section, rest.trim_start_matches('*')))
}

/// `name` of a `name: value` line, with list markers and quoting removed.
fn line_key(line: &str) -> Option<&str> {
    let line = line.trim().trim_start_matches(['-', '*', '#', ' ']);
    let (key, _) = line.split_once(':')?;
    let key = key.trim().trim_matches(['`', '"', '\'', '*']);
    (!key.is_empty() && !key.contains(char::is_whitespace)).then_some(key)
}

fn declared(spec: &CapabilitySpec, key: &str) -> bool {
    canonical(spec, key).is_some()
}

fn canonical<'a>(spec: &'a CapabilitySpec, key: &str) -> Option<&'a str> {
    spec.parameters
        .iter()
        .find(|parameter| parameter.name.eq_ignore_ascii_case(key))
        .map(|parameter| parameter.name.as_str())
}

pub(crate) fn parse_reply(text: &str, spec: &CapabilitySpec) -> ParseOutcome<RoundReply> {
    let sections = Sections::parse(text, spec);
    let status = sections
        .status
        .as_deref()
        .map(|status| status.to_ascii_uppercase().replace([' ', '-'], "_"))
        .unwrap_or_default();

    match status.as_str() {
        "READY" => {
            let raw = match parse_params(&sections.params, spec) {
                Ok(raw) => raw,
                Err(feedback) => return ParseOutcome::Retry(feedback),
            };
            match Arguments::validate(spec, raw) {
                Ok(args) => ParseOutcome::Parsed(RoundReply::Ready(args)),
                Err(errors) => {
                    let problems =
                        errors.iter().map(ToString::to_string).collect::<Vec<_>>().join("; ");
                    ParseOutcome::Retry(format!(
                        "Those arguments are not usable: {problems}. Fix them, or reply with \
                         STATUS: ASK and a QUESTION if information is missing."
                    ))
                }
            }
        }
        "ASK" => {
            let question = sections.question.trim();
            if question.is_empty() {
                ParseOutcome::Retry("STATUS: ASK needs a `QUESTION:` line.".to_string())
            } else {
                ParseOutcome::Parsed(RoundReply::Ask(question.to_string()))
            }
        }
        "NOT_TO_RUN" => {
            let reason = sections.reason.trim();
            let reason = if reason.is_empty() { "no reason given" } else { reason };
            ParseOutcome::Parsed(RoundReply::NotToRun(reason.to_string()))
        }
        _ => ParseOutcome::Retry(
            "Start your reply with `STATUS: READY`, `STATUS: ASK` or `STATUS: NOT_TO_RUN`."
                .to_string(),
        ),
    }
}

/// Reads PARAMS as a JSON object or as `name: value` lines. A line that does
/// not open a declared parameter continues the previous value, so multi-line
/// values survive as strings.
fn parse_params(
    block: &str,
    spec: &CapabilitySpec,
) -> Result<BTreeMap<String, Value>, String> {
    let body: String = block
        .lines()
        .filter(|line| !line.trim_start().starts_with("```"))
        .collect::<Vec<_>>()
        .join("\n");
    let body = body.trim();
    if body.is_empty() || body.eq_ignore_ascii_case("none") {
        return Ok(BTreeMap::new());
    }

    if body.starts_with('{') {
        let end = body.rfind('}').unwrap_or(body.len() - 1);
        return serde_json::from_str::<BTreeMap<String, Value>>(&body[..=end]).map_err(|error| {
            format!("PARAMS looked like JSON but did not parse ({error}). Use `name: value` lines.")
        });
    }

    let mut entries: Vec<(String, Vec<String>)> = Vec::new();
    for line in body.lines() {
        let opens = line_key(line).filter(|key| entries.is_empty() || declared(spec, key));
        match (opens, entries.last_mut()) {
            (Some(key), _) => {
                let value = line.split_once(':').map(|(_, value)| value.trim()).unwrap_or_default();
                let key = canonical(spec, key).unwrap_or(key);
                entries.push((key.to_string(), vec![value.to_string()]));
            }
            (None, Some((_, lines))) => lines.push(line.trim_end().to_string()),
            (None, None) => {
                let line = line.trim();
                if line.is_empty() {
                    continue;
                }
                return Err(format!(
                    "Could not read `{line}`. Write each parameter as `name: value`."
                ));
            }
        }
    }

    Ok(entries
        .into_iter()
        .map(|(key, mut lines)| {
            while lines.len() > 1 && lines.last().is_some_and(|line| line.trim().is_empty()) {
                lines.pop();
            }
            let value = if lines.len() == 1 {
                scalar(&lines[0])
            } else {
                Value::String(lines.join("\n").trim().to_string())
            };
            (key, value)
        })
        .collect())
}

fn scalar(raw: &str) -> Value {
    match serde_json::from_str::<Value>(raw) {
        Ok(value) => value,
        Err(_) => Value::String(raw.trim_matches('`').to_string()),
    }
}
