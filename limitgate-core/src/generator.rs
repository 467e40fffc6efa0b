//! Mock OpenAI response generator.
//!
//! Stands in for real inference: a pure function of the request plus one
//! sampled completion length. `prompt_tokens` in the usage block comes from
//! the same tokenizer the handler used for admission, so the committed
//! input cost and the reported count cannot diverge.

use chrono::Utc;
use rand::seq::IndexedRandom;
use uuid::Uuid;

use crate::endpoints::chat_completions::{
    AssistantMessage, ChatCompletion, ChatCompletionChoice, ChatCompletionParams, CompletionUsage,
};
use crate::tokens;

const RESPONSE_TEMPLATES: &[&str] = &[
    "I understand you're asking about: {topic}. Let me provide a comprehensive response...",
    "Based on your question regarding {topic}, here's my analysis...",
    "Regarding {topic}, I can share the following insights...",
    "Let me help you with your question about {topic}...",
];

const FILLER_SENTENCES: &[&str] = &[
    "This is an important consideration in modern applications.",
    "The implications are significant for system design.",
    "Multiple factors should be taken into account.",
    "This approach offers several advantages.",
    "Let me elaborate on this point further.",
    "The technical details are quite fascinating.",
    "This represents a common challenge in the field.",
    "Understanding these concepts is crucial for success.",
];

const TOPIC_PREVIEW_CHARS: usize = 50;

/// Words per token, matching the coarse ratio used by the tokenizer.
const WORDS_PER_TOKEN: f64 = 0.75;

#[derive(Clone, Copy, Debug)]
pub struct MockResponseConfig {
    pub min_output_tokens: u64,
    pub max_output_tokens: u64,
}

impl Default for MockResponseConfig {
    fn default() -> Self {
        Self {
            min_output_tokens: 50,
            max_output_tokens: 500,
        }
    }
}

#[derive(Clone, Debug)]
pub struct MockResponseGenerator {
    config: MockResponseConfig,
}

impl MockResponseGenerator {
    pub fn new(config: MockResponseConfig) -> Self {
        Self { config }
    }

    /// Produce a completion, sampling the output length from the configured
    /// distribution capped by the request's `max_tokens`.
    pub fn generate(&self, params: &ChatCompletionParams, request_cap: u64) -> ChatCompletion {
        let output_tokens = tokens::sample_output(
            self.config.min_output_tokens,
            self.config.max_output_tokens,
            request_cap,
        );
        self.generate_with_output_tokens(params, output_tokens)
    }

    /// The deterministic part: everything except the length sample.
    pub fn generate_with_output_tokens(
        &self,
        params: &ChatCompletionParams,
        output_tokens: u64,
    ) -> ChatCompletion {
        let prompt_tokens = tokens::count_input(&params.messages);
        let content = generate_content(params, output_tokens);

        ChatCompletion {
            id: format!("mock_req_{}", Uuid::new_v4().simple()),
            object: "chat.completion".to_string(),
            created: Utc::now().timestamp(),
            model: params.model.clone(),
            choices: vec![ChatCompletionChoice {
                index: 0,
                message: AssistantMessage {
                    role: "assistant".to_string(),
                    content,
                },
                finish_reason: "stop".to_string(),
            }],
            usage: CompletionUsage {
                prompt_tokens,
                completion_tokens: output_tokens,
                total_tokens: prompt_tokens + output_tokens,
            },
        }
    }
}

fn generate_content(params: &ChatCompletionParams, target_tokens: u64) -> String {
    let Some(last_message) = params.messages.last() else {
        return "Hello! I'm a mock AI assistant. How can I help you today?".to_string();
    };

    let mut rng = rand::rng();
    let topic: String = if last_message.content.chars().count() > TOPIC_PREVIEW_CHARS {
        let preview: String = last_message.content.chars().take(TOPIC_PREVIEW_CHARS).collect();
        format!("{preview}...")
    } else {
        last_message.content.clone()
    };

    let template = RESPONSE_TEMPLATES
        .choose(&mut rng)
        .unwrap_or(&RESPONSE_TEMPLATES[0]);
    let mut response = template.replace("{topic}", &topic);

    let target_words = (target_tokens as f64 * WORDS_PER_TOKEN) as usize;
    while response.split_whitespace().count() < target_words {
        let filler = FILLER_SENTENCES
            .choose(&mut rng)
            .unwrap_or(&FILLER_SENTENCES[0]);
        response.push(' ');
        response.push_str(filler);
    }

    let words: Vec<&str> = response.split_whitespace().collect();
    if words.len() > target_words && target_words > 0 {
        words[..target_words].join(" ")
    } else {
        response
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::endpoints::chat_completions::ChatMessage;

    fn params(content: &str) -> ChatCompletionParams {
        ChatCompletionParams {
            model: "gpt-3.5-turbo".to_string(),
            messages: vec![ChatMessage {
                role: "user".to_string(),
                content: content.to_string(),
            }],
            max_tokens: Some(100),
            temperature: None,
            stream: false,
        }
    }

    #[test]
    fn test_response_shape() {
        let generator = MockResponseGenerator::new(MockResponseConfig::default());
        let completion = generator.generate_with_output_tokens(&params("hello"), 80);
        assert!(completion.id.starts_with("mock_"));
        assert_eq!(completion.object, "chat.completion");
        assert_eq!(completion.model, "gpt-3.5-turbo");
        assert_eq!(completion.choices.len(), 1);
        assert_eq!(completion.choices[0].message.role, "assistant");
        assert_eq!(completion.choices[0].finish_reason, "stop");
        assert!(!completion.choices[0].message.content.is_empty());
    }

    #[test]
    fn test_usage_matches_shared_tokenizer() {
        let generator = MockResponseGenerator::new(MockResponseConfig::default());
        let request = params("What is the capital of France?");
        let completion = generator.generate_with_output_tokens(&request, 64);
        assert_eq!(
            completion.usage.prompt_tokens,
            tokens::count_input(&request.messages)
        );
        assert_eq!(completion.usage.completion_tokens, 64);
        assert_eq!(
            completion.usage.total_tokens,
            completion.usage.prompt_tokens + 64
        );
    }

    #[test]
    fn test_sampled_output_respects_request_cap() {
        let generator = MockResponseGenerator::new(MockResponseConfig::default());
        for _ in 0..50 {
            let completion = generator.generate(&params("hi"), 10);
            assert!((1..=10).contains(&completion.usage.completion_tokens));
        }
    }

    #[test]
    fn test_long_prompts_are_previewed_in_content() {
        let generator = MockResponseGenerator::new(MockResponseConfig::default());
        let long = "x".repeat(400);
        let completion = generator.generate_with_output_tokens(&params(&long), 200);
        // The full prompt must not be echoed back verbatim.
        assert!(!completion.choices[0].message.content.contains(&long));
    }
}
