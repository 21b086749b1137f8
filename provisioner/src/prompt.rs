// provisioner/src/prompt.rs

use dialoguer::{Input, Password};
use secrecy::{Secret, SecretString};

use crate::error::{ProvisionError, Result};
use crate::sys::proxy::validate_domain_format;

/// The only input that lets the run proceed, matched case-insensitively after
/// trimming ("sì").
pub const AFFIRMATIVE: &str = "s";

pub type Validator = fn(&str) -> std::result::Result<(), String>;

/// Operator interaction, kept behind a trait so the orchestrator can be
/// driven by scripted answers.
pub trait Prompter {
    /// Reads one line. Implementations must only return values `validate` accepts.
    fn input(&mut self, prompt: &str, validate: Validator) -> Result<String>;
    /// Reads a secret without echo.
    fn password(&mut self, prompt: &str) -> Result<SecretString>;
    fn say(&mut self, text: &str);
}

pub fn is_affirmative(answer: &str) -> bool {
    answer.trim().eq_ignore_ascii_case(AFFIRMATIVE)
}

pub fn any_text(_: &str) -> std::result::Result<(), String> {
    Ok(())
}

pub fn domain(value: &str) -> std::result::Result<(), String> {
    validate_domain_format(value).map_err(|e| e.to_string())
}

pub fn email(value: &str) -> std::result::Result<(), String> {
    let valid = match value.split_once('@') {
        Some((local, host)) => {
            !local.is_empty()
                && !value.chars().any(|c| c.is_whitespace() || c == '"' || c == '\'')
                && validate_domain_format(host).is_ok()
        }
        None => false,
    };
    if valid {
        Ok(())
    } else {
        Err(format!("'{value}' is not a valid email address"))
    }
}

pub fn username(value: &str) -> std::result::Result<(), String> {
    if value.is_empty() || value.len() > 64 || value.chars().any(|c| c.is_whitespace() || c.is_control()) {
        Err("username must be 1-64 characters without spaces".to_string())
    } else {
        Ok(())
    }
}

/// Terminal prompts on stdout/stdin.
pub struct DialoguerPrompter;

impl Prompter for DialoguerPrompter {
    fn input(&mut self, prompt: &str, validate: Validator) -> Result<String> {
        let value: String = Input::new()
            .with_prompt(prompt)
            .allow_empty(true)
            .validate_with(|v: &String| validate(v.trim()))
            .interact_text()
            .map_err(|e| ProvisionError::Prompt(e.to_string()))?;
        Ok(value.trim().to_string())
    }

    fn password(&mut self, prompt: &str) -> Result<SecretString> {
        let value = Password::new()
            .with_prompt(prompt)
            .with_confirmation("Repeat password", "Passwords do not match")
            .interact()
            .map_err(|e| ProvisionError::Prompt(e.to_string()))?;
        Ok(Secret::new(value))
    }

    fn say(&mut self, text: &str) {
        println!("{text}");
    }
}
