use crate::database::RetrievedContext;
use crate::error::{RagError, Result};
use crate::generation::LanguageModel;
use crate::retry::{bounded, RetryPolicy};
use log::{debug, info};
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;

/// Grounding and abstention instruction placed at the top of every prompt
pub const GROUNDING_INSTRUCTION: &str = "Answer the question based only on the following context in brief.\nIf the context does not contain the answer, just say that you don't know. Do not make up an answer.";

const SEGMENT_SEPARATOR: &str = "\n\n";

/// A grounded answer and the segments it was built from
#[derive(Debug, Clone, Serialize)]
pub struct Answer {
    pub answer: String,
    pub sources: RetrievedContext,
}

/// A prompt ready for the model, with the context that fit the budget
#[derive(Debug, Clone)]
pub struct Prompt {
    pub text: String,
    pub context: RetrievedContext,
}

/// Generation settings applied to every question
#[derive(Debug, Clone, Copy)]
pub struct ComposerSettings {
    pub max_prompt_chars: usize,
    pub max_tokens: u32,
    pub temperature: f32,
    pub timeout: Duration,
    pub retry: RetryPolicy,
}

/// Turns a question plus retrieved segments into one model call
#[derive(Clone)]
pub struct AnswerComposer {
    llm: Arc<dyn LanguageModel>,
    settings: ComposerSettings,
}

impl AnswerComposer {
    pub fn new(llm: Arc<dyn LanguageModel>, settings: ComposerSettings) -> Self {
        AnswerComposer { llm, settings }
    }

    /// Ask the model once; provider failures are returned, never papered over
    pub async fn compose(&self, question: &str, context: RetrievedContext) -> Result<Answer> {
        let prompt = build_prompt(question, context, self.settings.max_prompt_chars)?;
        debug!(
            "Prompt is {} chars with {} context segments",
            prompt.text.chars().count(),
            prompt.context.len()
        );

        let settings = self.settings;
        let answer = settings
            .retry
            .run("generation", || {
                bounded(
                    settings.timeout,
                    RagError::Generation,
                    self.llm
                        .generate(&prompt.text, settings.max_tokens, settings.temperature),
                )
            })
            .await?;

        let answer = answer.trim();
        if answer.is_empty() {
            return Err(RagError::Generation(
                "model returned an empty answer".to_string(),
            ));
        }

        info!("Answered with model {}", self.llm.model_id());
        Ok(Answer {
            answer: answer.to_string(),
            sources: prompt.context,
        })
    }
}

/// Assemble the prompt, dropping the lowest-ranked segments until it fits
///
/// Segments are kept as a prefix of `context`, so a segment is only dropped
/// when every segment ranked below it has been dropped too.
pub fn build_prompt(question: &str, context: RetrievedContext, max_chars: usize) -> Result<Prompt> {
    let question = question.trim();
    if question.is_empty() {
        return Err(RagError::InvalidRequest("No question provided".to_string()));
    }

    let overhead = render(question, "").chars().count();
    if overhead > max_chars {
        return Err(RagError::InvalidRequest(format!(
            "question does not fit the prompt budget of {} characters",
            max_chars
        )));
    }

    let separator_len = SEGMENT_SEPARATOR.chars().count();
    let mut used = 0;
    let mut kept = 0;
    for scored in context.iter() {
        let extra = if kept == 0 { 0 } else { separator_len };
        let len = scored.segment.text.chars().count();
        if overhead + used + extra + len > max_chars {
            break;
        }
        used += extra + len;
        kept += 1;
    }

    let mut matches = context.matches;
    if kept < matches.len() {
        debug!(
            "Dropping {} lowest-ranked segments to fit the prompt budget",
            matches.len() - kept
        );
        matches.truncate(kept);
    }

    let joined = matches
        .iter()
        .map(|m| m.segment.text.as_str())
        .collect::<Vec<&str>>()
        .join(SEGMENT_SEPARATOR);

    Ok(Prompt {
        text: render(question, &joined),
        context: RetrievedContext { matches },
    })
}

fn render(question: &str, context: &str) -> String {
    format!(
        "{}\n\nCONTEXT:\n{}\n\nQUESTION:\n{}\n\nANSWER:",
        GROUNDING_INSTRUCTION, context, question
    )
}
