//! Rule-based scoring of stage output.
//!
//! Each broken rule adds a violation and lowers the score from 1.0:
//!
//! | rule | penalty |
//! |---|---|
//! | required file missing | 0.3 |
//! | code block missing | 0.2 |
//! | shorter than `min_length` | 0.15 |
//! | longer than `max_length` | 0.1 |
//! | each missing required keyword | 0.1 |
//! | each forbidden keyword present | 0.1 |
//! | syntax validator failure | 0.2 |

use std::sync::Arc;

use async_trait::async_trait;
use conductor_types::{AgentResult, StageValidationConfig};

/// Result of validating one output.
#[derive(Debug, Clone, PartialEq)]
pub struct ValidationOutcome {
    pub valid: bool,
    /// Normalized into `[0, 1]`.
    pub score: f64,
    pub violations: Vec<String>,
    pub suggestions: Vec<String>,
}

#[async_trait]
pub trait OutputValidator: Send + Sync {
    async fn validate(&self, result: &AgentResult, config: &StageValidationConfig)
        -> ValidationOutcome;
}

// ---------------------------------------------------------------------------
// Syntax validation
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq)]
pub struct SyntaxCheck {
    pub valid: bool,
    pub message: String,
    pub errors: Vec<String>,
}

impl SyntaxCheck {
    pub fn ok(message: impl Into<String>) -> Self {
        Self {
            valid: true,
            message: message.into(),
            errors: Vec::new(),
        }
    }
}

/// Checks that a file written by an agent parses in the given language.
#[async_trait]
pub trait SyntaxValidator: Send + Sync {
    async fn validate(&self, language: &str, file: &str) -> SyntaxCheck;
}

/// Runs the language's own compiler or interpreter in check mode.
///
/// Unsupported languages and missing toolchains pass.
#[derive(Debug, Default, Clone)]
pub struct CommandSyntaxValidator;

impl CommandSyntaxValidator {
    fn command_for(language: &str, file: &str) -> Option<(&'static str, Vec<String>, &'static str)> {
        let file = file.to_string();
        match language.to_ascii_lowercase().as_str() {
            "python" | "py" => Some((
                "python3",
                vec!["-m".into(), "py_compile".into(), file],
                "Python",
            )),
            "javascript" | "js" => Some(("node", vec!["--check".into(), file], "JavaScript")),
            "typescript" | "ts" => Some(("tsc", vec!["--noEmit".into(), file], "TypeScript")),
            "rust" | "rs" => Some((
                "rustfmt",
                vec!["--check".into(), "--edition".into(), "2021".into(), file],
                "Rust",
            )),
            _ => None,
        }
    }
}

#[async_trait]
impl SyntaxValidator for CommandSyntaxValidator {
    async fn validate(&self, language: &str, file: &str) -> SyntaxCheck {
        let Some((program, args, label)) = Self::command_for(language, file) else {
            return SyntaxCheck::ok(format!("Unsupported language '{language}', skipping"));
        };
        match tokio::process::Command::new(program).args(&args).output().await {
            Ok(output) if output.status.success() => SyntaxCheck::ok(format!("{label} syntax valid")),
            Ok(output) => {
                let mut text = String::from_utf8_lossy(&output.stdout).into_owned();
                text.push_str(&String::from_utf8_lossy(&output.stderr));
                SyntaxCheck {
                    valid: false,
                    message: format!("{label} syntax errors"),
                    errors: vec![text.trim().to_string()],
                }
            }
            Err(e) => {
                tracing::debug!(program, error = %e, "Syntax validation skipped");
                SyntaxCheck::ok(format!("Validation skipped: {e}"))
            }
        }
    }
}

// ---------------------------------------------------------------------------
// DefaultOutputValidator
// ---------------------------------------------------------------------------

pub struct DefaultOutputValidator {
    syntax: Arc<dyn SyntaxValidator>,
}

impl DefaultOutputValidator {
    pub fn new(syntax: Arc<dyn SyntaxValidator>) -> Self {
        Self { syntax }
    }
}

impl Default for DefaultOutputValidator {
    fn default() -> Self {
        Self::new(Arc::new(CommandSyntaxValidator))
    }
}

#[async_trait]
impl OutputValidator for DefaultOutputValidator {
    async fn validate(
        &self,
        result: &AgentResult,
        config: &StageValidationConfig,
    ) -> ValidationOutcome {
        let mut violations = Vec::new();
        let mut suggestions = Vec::new();
        let mut score = 1.0_f64;
        let output = result.output.as_deref().unwrap_or_default();
        let lowered = output.to_lowercase();
        let length = output.chars().count();

        if let Some(file) = &config.requires_file {
            if !tokio::fs::try_exists(file).await.unwrap_or(false) {
                violations.push(format!("Required file not found: {file}"));
                suggestions.push(format!("Ensure the agent persists output to {file}"));
                score -= 0.3;
            }
        }

        if config.requires_code_block && !output.contains("```") {
            violations.push("Output missing code block".to_string());
            suggestions.push("Ask the agent to wrap code samples inside markdown fences".into());
            score -= 0.2;
        }

        if length < config.min_length {
            violations.push(format!("Output too short ({length} < {})", config.min_length));
            suggestions.push("Request more detailed output for this stage".into());
            score -= 0.15;
        }

        if let Some(max) = config.max_length {
            if length > max {
                violations.push(format!("Output too long ({length} > {max})"));
                suggestions.push("Ask the agent to trim unnecessary details".into());
                score -= 0.1;
            }
        }

        for keyword in &config.required_keywords {
            if !lowered.contains(&keyword.to_lowercase()) {
                violations.push(format!("Missing required keyword: {keyword}"));
                suggestions.push(format!("Ensure the response references '{keyword}'"));
                score -= 0.1;
            }
        }

        for keyword in &config.forbidden_keywords {
            if lowered.contains(&keyword.to_lowercase()) {
                violations.push(format!("Forbidden keyword present: {keyword}"));
                suggestions.push(format!("Remove occurrences of '{keyword}'"));
                score -= 0.1;
            }
        }

        for validator in &config.custom_validators {
            if !validator.kind.eq_ignore_ascii_case("syntax") {
                continue;
            }
            let Some(language) = validator.options.get("language") else {
                continue;
            };
            let Some(file) = validator
                .options
                .get("file")
                .or(config.requires_file.as_ref())
            else {
                continue;
            };
            let check = self.syntax.validate(language, file).await;
            if !check.valid {
                violations.extend(check.errors);
                score -= 0.2;
            }
        }

        let score = score.clamp(0.0, 1.0);
        ValidationOutcome {
            valid: violations.is_empty() && score >= config.min_quality_score,
            score,
            violations,
            suggestions,
        }
    }
}
