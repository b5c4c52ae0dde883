//! Pre-flight prompt validation against model context windows.
//!
//! Runs before any budget is consumed: a prompt that cannot fit the target
//! model's context window is rejected with suggested alternatives instead
//! of burning rate and cost counters on a request the provider would
//! refuse anyway. Unknown models (and models the caller overrides away)
//! pass validation untouched; the table is advisory, not a gate on new
//! model names.
//!
//! The validator never turns a policy decision into an `Err`; only
//! tokenizer I/O failures propagate.

use ahash::HashMap as AHashMap;
use once_cell::sync::Lazy;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use thiserror::Error;

/// Tokenizer abstraction. Implementations are caller-supplied; the crate
/// ships none.
pub trait Tokenizer {
    /// Counts the tokens `text` occupies under the target model's
    /// encoding.
    fn count_tokens(&self, text: &str) -> Result<u32, TokenizerError>;
}

/// I/O failure inside a tokenizer. The only error the validator surfaces.
#[derive(Debug, Error)]
#[error("tokenizer failed: {0}")]
pub struct TokenizerError(pub String);

/// Context-window facts for one model.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ModelLimits {
    pub provider: String,
    /// Context window in tokens: prompt plus requested output must fit.
    pub max_input_tokens: u32,
    pub max_output_tokens: u32,
}

impl ModelLimits {
    fn of(provider: &str, max_input_tokens: u32, max_output_tokens: u32) -> Self {
        Self {
            provider: provider.to_string(),
            max_input_tokens,
            max_output_tokens,
        }
    }
}

/// Built-in model table. Caller-supplied `custom_limits` entries override
/// rows here field-for-field by model name.
static BUILTIN_MODEL_LIMITS: Lazy<AHashMap<&'static str, ModelLimits>> = Lazy::new(|| {
    let mut table = AHashMap::default();
    table.insert("gpt-3.5-turbo", ModelLimits::of("openai", 16_385, 4_096));
    table.insert("gpt-4", ModelLimits::of("openai", 8_192, 4_096));
    table.insert("gpt-4-turbo", ModelLimits::of("openai", 128_000, 4_096));
    table.insert("gpt-4o", ModelLimits::of("openai", 128_000, 16_384));
    table.insert("gpt-4o-mini", ModelLimits::of("openai", 128_000, 16_384));
    table.insert("o1", ModelLimits::of("openai", 200_000, 100_000));
    table.insert("claude-3-haiku", ModelLimits::of("anthropic", 200_000, 4_096));
    table.insert("claude-3-opus", ModelLimits::of("anthropic", 200_000, 4_096));
    table.insert("claude-3-5-sonnet", ModelLimits::of("anthropic", 200_000, 8_192));
    table.insert("gemini-1.5-flash", ModelLimits::of("google", 1_000_000, 8_192));
    table.insert("gemini-1.5-pro", ModelLimits::of("google", 2_000_000, 8_192));
    table.insert("mistral-large", ModelLimits::of("mistral", 128_000, 4_096));
    table.insert("llama-3-70b", ModelLimits::of("meta", 8_192, 4_096));
    table
});

/// A chat message, for callers validating message arrays rather than a
/// flat prompt.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    pub role: String,
    pub content: String,
}

/// What to validate: a flat prompt or a message array.
#[derive(Debug, Clone)]
pub enum PromptInput<'a> {
    Text(&'a str),
    Messages(&'a [Message]),
}

/// One validation request.
#[derive(Debug, Clone)]
pub struct ValidationRequest<'a> {
    pub model: &'a str,
    pub input: PromptInput<'a>,
    /// Output budget the caller intends to request from the provider.
    pub max_output_tokens: Option<u32>,
    /// Per-call overrides merged over the built-in table.
    pub custom_limits: Option<&'a HashMap<String, ModelLimits>>,
}

/// Structured validation result. `valid == false` is a policy outcome,
/// not an error.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ValidationOutcome {
    pub valid: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    pub input_tokens: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_input_tokens: Option<u32>,
    /// Up to three alternative models that fit, same provider preferred.
    pub suggested_models: Vec<String>,
}

impl ValidationOutcome {
    fn valid(input_tokens: u32, max_input_tokens: Option<u32>) -> Self {
        Self {
            valid: true,
            reason: None,
            input_tokens,
            max_input_tokens,
            suggested_models: Vec::new(),
        }
    }
}

/// Effective limits for `model`: the override when present, else the
/// built-in row.
fn lookup_limits(
    model: &str,
    custom_limits: Option<&HashMap<String, ModelLimits>>,
) -> Option<ModelLimits> {
    if let Some(custom) = custom_limits {
        if let Some(limits) = custom.get(model) {
            return Some(limits.clone());
        }
    }
    BUILTIN_MODEL_LIMITS.get(model).cloned()
}

/// Up to three models whose context window fits `required` tokens.
/// Same-provider candidates are preferred; when none fit, any provider
/// qualifies. Smaller windows are suggested first so callers land on the
/// cheapest sufficient model.
fn suggest_models(
    model: &str,
    provider: &str,
    required: u64,
    custom_limits: Option<&HashMap<String, ModelLimits>>,
) -> Vec<String> {
    let mut candidates: Vec<(String, ModelLimits)> = BUILTIN_MODEL_LIMITS
        .iter()
        .map(|(name, limits)| (name.to_string(), limits.clone()))
        .collect();
    if let Some(custom) = custom_limits {
        for (name, limits) in custom {
            candidates.retain(|(existing, _)| existing != name);
            candidates.push((name.clone(), limits.clone()));
        }
    }
    candidates.retain(|(name, limits)| name != model && u64::from(limits.max_input_tokens) >= required);
    candidates.sort_by_key(|(name, limits)| (limits.max_input_tokens, name.clone()));

    let same_provider: Vec<String> = candidates
        .iter()
        .filter(|(_, limits)| limits.provider == provider)
        .map(|(name, _)| name.clone())
        .take(3)
        .collect();
    if !same_provider.is_empty() {
        return same_provider;
    }
    candidates.into_iter().map(|(name, _)| name).take(3).collect()
}

/// Validates one prompt against the target model's context window.
///
/// The prompt is tokenized exactly once. Three checks apply when the model
/// is known: prompt tokens within the window, requested output within the
/// model's output ceiling, and prompt plus requested output within the
/// window. An unknown model with no override validates trivially.
pub fn validate_prompt(
    request: &ValidationRequest<'_>,
    tokenizer: &dyn Tokenizer,
) -> Result<ValidationOutcome, TokenizerError> {
    let text = match request.input {
        PromptInput::Text(text) => text.to_string(),
        PromptInput::Messages(messages) => {
            let mut joined = String::new();
            for message in messages {
                if !joined.is_empty() {
                    joined.push('\n');
                }
                joined.push_str(&message.content);
            }
            joined
        }
    };
    let input_tokens = tokenizer.count_tokens(&text)?;

    let Some(limits) = lookup_limits(request.model, request.custom_limits) else {
        // Opaque model: nothing to check against.
        return Ok(ValidationOutcome::valid(input_tokens, None));
    };

    let max_output = request.max_output_tokens.unwrap_or(0);
    let required = u64::from(input_tokens) + u64::from(max_output);

    let reason = if input_tokens > limits.max_input_tokens {
        Some(format!(
            "prompt is {} tokens but {} accepts at most {}",
            input_tokens, request.model, limits.max_input_tokens
        ))
    } else if max_output > limits.max_output_tokens {
        Some(format!(
            "requested {} output tokens but {} produces at most {}",
            max_output, request.model, limits.max_output_tokens
        ))
    } else if required > u64::from(limits.max_input_tokens) {
        Some(format!(
            "prompt plus requested output is {} tokens but {}'s context window is {}",
            required, request.model, limits.max_input_tokens
        ))
    } else {
        None
    };

    match reason {
        None => Ok(ValidationOutcome::valid(input_tokens, Some(limits.max_input_tokens))),
        Some(reason) => Ok(ValidationOutcome {
            valid: false,
            reason: Some(reason),
            input_tokens,
            max_input_tokens: Some(limits.max_input_tokens),
            suggested_models: suggest_models(
                request.model,
                &limits.provider,
                required.max(u64::from(input_tokens)),
                request.custom_limits,
            ),
        }),
    }
}
