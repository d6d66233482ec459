use std::sync::Arc;

use thiserror::Error;
use tracing::debug;

use ganglion_core::domain::conversation::{Conversation, Turn};

use crate::llm::{LlmClient, LlmError};
use crate::prompts::{PromptError, PromptLibrary};
use crate::retry::{retry_extract, ExtractError, ParseOutcome};

#[derive(Debug, Error)]
pub enum DetectError {
    #[error(transparent)]
    Llm(LlmError),
    #[error("capability selection still unparseable after {attempts} attempts")]
    Unresolved { attempts: u32 },
    #[error(transparent)]
    Prompt(#[from] PromptError),
}

impl From<ExtractError> for DetectError {
    fn from(value: ExtractError) -> Self {
        match value {
            ExtractError::Llm(error) => Self::Llm(error),
            ExtractError::Exhausted { attempts, .. } => Self::Unresolved { attempts },
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Detection {
    /// Names to execute, in order. May repeat.
    pub names: Vec<String>,
    /// Every whole-word occurrence in the text, in order. May repeat.
    pub mentioned: Vec<String>,
    pub disambiguated: bool,
}

pub struct ActionDetector {
    prompts: Arc<PromptLibrary>,
    max_attempts: u32,
}

impl ActionDetector {
    pub fn new(prompts: Arc<PromptLibrary>, max_attempts: u32) -> Self {
        Self { prompts, max_attempts }
    }

    /// Which of `available` the text means to run now.
    ///
    /// Asks the reasoning service only when there is more than one mention,
    /// repeats of the same name included.
    pub async fn detect(
        &self,
        reasoning: &dyn LlmClient,
        text: &str,
        available: &[String],
    ) -> Result<Detection, DetectError> {
        let mentioned = scan_mentions(text, available);
        if mentioned.len() <= 1 {
            return Ok(Detection { names: mentioned.clone(), mentioned, disambiguated: false });
        }

        let vocabulary = distinct(&mentioned);
        let mut conversation = Conversation::from(vec![
            Turn::system(self.prompts.disambiguate(&vocabulary)?),
            Turn::user(text),
        ]);
        let names = retry_extract(
            reasoning,
            &mut conversation,
            |reply| parse_actions(reply, &vocabulary),
            self.max_attempts,
        )
        .await?;

        debug!(
            event_name = "detect.disambiguated",
            mentioned = ?mentioned,
            selected = ?names,
            "capability mentions disambiguated"
        );
        Ok(Detection { names, mentioned, disambiguated: true })
    }
}

/// Capability names that occur in `text` as exact whole words, one entry per
/// occurrence in text order. Longer names are matched first and claim their
/// span, so `search` never matches inside `search_deep`.
pub fn scan_mentions<S: AsRef<str>>(text: &str, names: &[S]) -> Vec<String> {
    let mut candidates: Vec<&str> =
        names.iter().map(AsRef::as_ref).filter(|name| !name.is_empty()).collect();
    candidates.sort_by(|a, b| b.len().cmp(&a.len()).then_with(|| a.cmp(b)));
    candidates.dedup();

    let mut claimed = vec![false; text.len()];
    let mut hits: Vec<(usize, &str)> = Vec::new();

    for name in candidates {
        let mut from = 0;
        while let Some(offset) = text[from..].find(name) {
            let start = from + offset;
            let end = start + name.len();
            from = end;

            if claimed[start..end].iter().any(|taken| *taken) || !is_whole_word(text, start, end) {
                continue;
            }
            claimed[start..end].iter_mut().for_each(|taken| *taken = true);
            hits.push((start, name));
        }
    }

    hits.sort_by_key(|(start, _)| *start);
    hits.into_iter().map(|(_, name)| name.to_string()).collect()
}

fn distinct(names: &[String]) -> Vec<String> {
    let mut seen: Vec<String> = Vec::with_capacity(names.len());
    for name in names {
        if !seen.contains(name) {
            seen.push(name.clone());
        }
    }
    seen
}

fn is_word_char(ch: char) -> bool {
    ch.is_alphanumeric() || ch == '_'
}

fn is_whole_word(text: &str, start: usize, end: usize) -> bool {
    let before = text[..start].chars().next_back();
    let after = text[end..].chars().next();
    !before.is_some_and(is_word_char) && !after.is_some_and(is_word_char)
}

fn parse_actions(reply: &str, mentioned: &[String]) -> ParseOutcome<Vec<String>> {
    let allowed = mentioned.join(", ");
    let line = reply.lines().find_map(|line| {
        let line = line.trim().trim_start_matches(['*', '#', '-', '>', ' ']);
        let (head, rest) = line.split_once(':')?;
        head.trim_end_matches('*').trim().eq_ignore_ascii_case("actions").then_some(rest)
    });
    let Some(line) = line else {
        return ParseOutcome::Retry(format!(
            "Reply with one line of the form `ACTIONS: name, name` using only: {allowed}."
        ));
    };

    let items: Vec<&str> = line
        .split(',')
        .map(|item| item.trim().trim_matches(['`', '"', '\'', '*', '.', ' ']))
        .filter(|item| !item.is_empty())
        .collect();

    if items.is_empty() || (items.len() == 1 && items[0].eq_ignore_ascii_case("none")) {
        return ParseOutcome::Parsed(Vec::new());
    }

    if let Some(unknown) = items.iter().find(|item| !mentioned.iter().any(|name| name == *item)) {
        return ParseOutcome::Retry(format!(
            "`{unknown}` is not an allowed name. Answer again using only: {allowed}."
        ));
    }

    ParseOutcome::Parsed(items.into_iter().map(str::to_string).collect())
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::{parse_actions, scan_mentions, ActionDetector, DetectError};
    use crate::prompts::PromptLibrary;
    use crate::retry::ParseOutcome;
    use crate::testing::ScriptedLlm;

    fn names(list: &[&str]) -> Vec<String> {
        list.iter().map(|name| name.to_string()).collect()
    }

    fn detector() -> ActionDetector {
        ActionDetector::new(Arc::new(PromptLibrary::new().expect("templates")), 3)
    }

    #[test]
    fn longer_names_are_not_masked_by_prefixes() {
        let available = names(&["send_email", "send_email_draft"]);
        assert_eq!(
            scan_mentions("I will send_email_draft now.", &available),
            names(&["send_email_draft"])
        );
        assert_eq!(
            scan_mentions("send_email_draft first, then send_email.", &available),
            names(&["send_email_draft", "send_email"])
        );
    }

    #[test]
    fn only_whole_words_and_available_names_match() {
        let available = names(&["search", "read"]);
        assert_eq!(scan_mentions("researching the already-read thread", &available), names(&["read"]));
        assert!(scan_mentions("use browse to open it", &available).is_empty());
        assert_eq!(
            scan_mentions("search, then search again", &available),
            names(&["search", "search"])
        );
        assert!(scan_mentions("Search the docs", &available).is_empty());
    }

    #[tokio::test]
    async fn repeated_mentions_are_disambiguated_over_distinct_names() {
        let llm = ScriptedLlm::replies(["ACTIONS: search, search"]);
        let detection = detector()
            .detect(
                &llm,
                "I will search for rust, then search for tokio.",
                &names(&["search", "finish"]),
            )
            .await
            .expect("detect");

        assert_eq!(detection.mentioned, names(&["search", "search"]));
        assert_eq!(detection.names, names(&["search", "search"]));
        assert!(detection.disambiguated);
        let calls = llm.calls();
        assert!(calls[0][0].content.contains("Only these names may appear in your answer: search."));
    }

    #[test]
    fn parse_accepts_duplicates_and_none() {
        let mentioned = names(&["search", "finish"]);
        assert_eq!(
            parse_actions("ACTIONS: search, search, finish", &mentioned),
            ParseOutcome::Parsed(names(&["search", "search", "finish"]))
        );
        assert_eq!(parse_actions("**Actions:** none", &mentioned), ParseOutcome::Parsed(vec![]));
        assert!(matches!(parse_actions("ACTIONS: browse", &mentioned), ParseOutcome::Retry(_)));
        assert!(matches!(parse_actions("search I think", &mentioned), ParseOutcome::Retry(_)));
    }

    #[tokio::test]
    async fn single_mention_costs_no_reasoning_call() {
        let llm = ScriptedLlm::new();
        let detection = detector()
            .detect(&llm, "All done, calling finish.", &names(&["search", "finish"]))
            .await
            .expect("detect");

        assert_eq!(detection.names, names(&["finish"]));
        assert!(!detection.disambiguated);
        assert_eq!(llm.call_count(), 0);
    }

    #[tokio::test]
    async fn ambiguous_prefix_requires_disambiguation() {
        let llm = ScriptedLlm::replies(["ACTIONS: search_deep"]);
        let detection = detector()
            .detect(
                &llm,
                "A plain search found nothing, so I'll run search_deep on the archive.",
                &names(&["search", "search_deep", "finish"]),
            )
            .await
            .expect("detect");

        assert_eq!(detection.mentioned, names(&["search", "search_deep"]));
        assert_eq!(detection.names, names(&["search_deep"]));
        assert_eq!(llm.call_count(), 1);
        let calls = llm.calls();
        let prompt = &calls[0][0].content;
        assert!(prompt.contains("search, search_deep"));
    }

    #[tokio::test]
    async fn out_of_vocabulary_answers_are_retried_then_reported() {
        let llm = ScriptedLlm::replies(["ACTIONS: finish", "ACTIONS: finish", "ACTIONS: finish"]);
        let error = detector()
            .detect(&llm, "search or search_deep?", &names(&["search", "search_deep", "finish"]))
            .await
            .expect_err("never valid");

        assert!(matches!(error, DetectError::Unresolved { attempts: 3 }));
        assert_eq!(llm.call_count(), 3);
    }
}
