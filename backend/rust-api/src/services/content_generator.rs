use std::time::Duration;

use async_trait::async_trait;
use lazy_static::lazy_static;
use regex::Regex;
use reqwest::Client;
use serde::{Deserialize, Serialize};

use crate::config::GeneratorSettings;
use crate::error::GeneratorError;
use crate::models::job::GenerateFeedbackPayload;
use crate::models::session::Difficulty;

const ANTHROPIC_VERSION: &str = "2023-06-01";
const FEEDBACK_MAX_TOKENS: u32 = 512;

lazy_static! {
    static ref JSON_OBJECT: Regex = Regex::new(r"\{[\s\S]*\}").unwrap();
}

#[derive(Debug, Clone, PartialEq)]
pub struct GeneratedProblem {
    pub problem_text: String,
    pub final_answer: f64,
}

/// External text generator used by both workers.
#[async_trait]
pub trait ContentGenerator: Send + Sync {
    async fn generate_problem(
        &self,
        difficulty: Difficulty,
    ) -> Result<GeneratedProblem, GeneratorError>;

    /// Free-form encouraging feedback; never empty on success.
    async fn generate_feedback(
        &self,
        payload: &GenerateFeedbackPayload,
    ) -> Result<String, GeneratorError>;
}

fn difficulty_instruction(difficulty: Difficulty) -> &'static str {
    match difficulty {
        Difficulty::Easy => "simple addition or subtraction with numbers under 50",
        Difficulty::Medium => {
            "multiplication, division, or multi-step problems with numbers under 100"
        }
        Difficulty::Hard => {
            "complex multi-step word problems with fractions, decimals, or larger numbers"
        }
    }
}

pub fn problem_prompt(difficulty: Difficulty) -> String {
    format!(
        "Generate a math word problem suitable for a Primary 5 student (age 10-11).\n\
         Difficulty level: {} - {}.\n\n\
         Requirements:\n\
         1. The problem should be engaging and relatable to 10-11 year olds\n\
         2. Include real-world scenarios (shopping, sports, cooking, etc.)\n\
         3. The problem should require logical thinking and calculation\n\
         4. Provide ONLY a JSON response with this exact format:\n\
         {{\n  \"problem_text\": \"A detailed word problem here...\",\n  \"final_answer\": [numeric answer]\n}}\n\n\
         Do not include any other text or explanation outside the JSON.",
        difficulty.as_str(),
        difficulty_instruction(difficulty)
    )
}

pub fn feedback_prompt(payload: &GenerateFeedbackPayload) -> String {
    format!(
        "You are a supportive math teacher for Primary 5 students (age 10-11).\n\n\
         Problem: {}\n\
         Correct Answer: {}\n\
         Student's Answer: {}\n\
         Result: {}\n\n\
         Generate personalized, encouraging feedback for the student.\n\n\
         If correct:\n\
         - Celebrate their success\n\
         - Briefly explain why the answer is correct\n\
         - Encourage them to try more problems\n\n\
         If incorrect:\n\
         - Be kind and supportive\n\
         - Explain what went wrong in simple terms\n\
         - Give a hint on how to approach it correctly\n\
         - Encourage them to try again\n\n\
         Keep the feedback concise (2-3 sentences) and age-appropriate.",
        payload.problem_text,
        payload.correct_answer,
        payload.user_answer,
        if payload.is_correct {
            "CORRECT"
        } else {
            "INCORRECT"
        }
    )
}

#[derive(Deserialize)]
struct RawProblem {
    problem_text: String,
    final_answer: serde_json::Value,
}

/// Pulls the outermost `{...}` out of a model reply and reads the problem
/// from it. `final_answer` may come back as a number or a numeric string.
pub fn parse_problem(text: &str) -> Result<GeneratedProblem, GeneratorError> {
    let json = JSON_OBJECT
        .find(text)
        .ok_or_else(|| GeneratorError::Malformed("no JSON object in response".to_string()))?;

    let raw: RawProblem = serde_json::from_str(json.as_str())
        .map_err(|e| GeneratorError::Malformed(format!("invalid problem JSON: {e}")))?;

    let final_answer = match &raw.final_answer {
        serde_json::Value::Number(n) => n.as_f64(),
        serde_json::Value::String(s) => s.trim().parse::<f64>().ok(),
        _ => None,
    }
    .filter(|answer| answer.is_finite())
    .ok_or_else(|| {
        GeneratorError::Malformed(format!("final_answer is not numeric: {}", raw.final_answer))
    })?;

    let problem_text = raw.problem_text.trim().to_string();
    if problem_text.is_empty() {
        return Err(GeneratorError::Empty);
    }

    Ok(GeneratedProblem {
        problem_text,
        final_answer,
    })
}

#[derive(Serialize)]
struct MessagesRequest<'a> {
    model: &'a str,
    max_tokens: u32,
    messages: [Message<'a>; 1],
}

#[derive(Serialize)]
struct Message<'a> {
    role: &'static str,
    content: &'a str,
}

#[derive(Deserialize)]
struct MessagesResponse {
    #[serde(default)]
    content: Vec<ContentBlock>,
}

#[derive(Deserialize)]
struct ContentBlock {
    #[serde(rename = "type")]
    kind: String,
    #[serde(default)]
    text: String,
}

/// Messages-API client for the hosted model.
pub struct HttpContentGenerator {
    client: Client,
    settings: GeneratorSettings,
}

impl HttpContentGenerator {
    pub fn new(settings: GeneratorSettings) -> Result<Self, GeneratorError> {
        let client = Client::builder()
            .timeout(Duration::from_secs(settings.timeout_secs))
            .build()
            .map_err(|e| GeneratorError::Provider(format!("failed to build HTTP client: {e}")))?;
        Ok(Self { client, settings })
    }

    async fn complete(&self, prompt: &str, max_tokens: u32) -> Result<String, GeneratorError> {
        let body = MessagesRequest {
            model: &self.settings.model,
            max_tokens,
            messages: [Message {
                role: "user",
                content: prompt,
            }],
        };

        let mut request = self
            .client
            .post(&self.settings.endpoint)
            .header("anthropic-version", ANTHROPIC_VERSION)
            .json(&body);
        if let Some(key) = &self.settings.api_key {
            request = request.header("x-api-key", key);
        }

        let response = request.send().await.map_err(|e| {
            if e.is_timeout() {
                GeneratorError::Timeout(Duration::from_secs(self.settings.timeout_secs))
            } else {
                GeneratorError::Provider(e.to_string())
            }
        })?;

        if !response.status().is_success() {
            let status = response.status();
            let error_text = response
                .text()
                .await
                .unwrap_or_else(|_| "Unknown error".to_string());
            return Err(GeneratorError::Provider(format!(
                "generator returned {}: {}",
                status, error_text
            )));
        }

        let parsed: MessagesResponse = response
            .json()
            .await
            .map_err(|e| GeneratorError::Malformed(e.to_string()))?;

        parsed
            .content
            .into_iter()
            .find(|block| block.kind == "text")
            .map(|block| block.text)
            .filter(|text| !text.trim().is_empty())
            .ok_or(GeneratorError::Empty)
    }
}

#[async_trait]
impl ContentGenerator for HttpContentGenerator {
    async fn generate_problem(
        &self,
        difficulty: Difficulty,
    ) -> Result<GeneratedProblem, GeneratorError> {
        let text = self
            .complete(&problem_prompt(difficulty), self.settings.max_tokens)
            .await?;
        parse_problem(&text)
    }

    async fn generate_feedback(
        &self,
        payload: &GenerateFeedbackPayload,
    ) -> Result<String, GeneratorError> {
        let text = self
            .complete(&feedback_prompt(payload), FEEDBACK_MAX_TOKENS)
            .await?;
        Ok(text.trim().to_string())
    }
}
