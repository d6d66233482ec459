use thiserror::Error;
use tracing::debug;

use ganglion_core::domain::conversation::{Conversation, Turn};

use crate::llm::{LlmClient, LlmError};

/// Result of parsing one reply.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ParseOutcome<T> {
    Parsed(T),
    /// Natural-language correction sent back before the next attempt.
    Retry(String),
}

#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum ExtractError {
    #[error(transparent)]
    Llm(#[from] LlmError),
    #[error("no parseable reply after {attempts} attempts: {last_feedback}")]
    Exhausted { attempts: u32, last_feedback: String },
}

/// Calls `client` until `parse` accepts a reply or `max_attempts` is spent.
///
/// Each rejected reply stays in `conversation`, followed by the parser's
/// feedback as a user turn, so the model sees what it got wrong.
pub async fn retry_extract<T, F>(
    client: &dyn LlmClient,
    conversation: &mut Conversation,
    mut parse: F,
    max_attempts: u32,
) -> Result<T, ExtractError>
where
    T: Send,
    F: FnMut(&str) -> ParseOutcome<T> + Send,
{
    let max_attempts = max_attempts.max(1);
    let mut last_feedback = String::new();

    for attempt in 1..=max_attempts {
        let reply = client.complete(conversation.turns()).await?;
        match parse(&reply.content) {
            ParseOutcome::Parsed(value) => return Ok(value),
            ParseOutcome::Retry(feedback) => {
                debug!(
                    event_name = "extract.reply.rejected",
                    attempt,
                    max_attempts,
                    feedback = %feedback,
                    "reply did not parse"
                );
                conversation.push(Turn::assistant(reply.content));
                conversation.push(Turn::user(feedback.clone()));
                last_feedback = feedback;
            }
        }
    }

    Err(ExtractError::Exhausted { attempts: max_attempts, last_feedback })
}
