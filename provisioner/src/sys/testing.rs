// provisioner/src/sys/testing.rs
//
// Scripted stand-ins for the host, shared by the unit tests.

use async_trait::async_trait;
use std::collections::VecDeque;
use std::sync::Mutex;

use crate::error::{ProvisionError, Result};
use crate::sys::traits::{CommandOutput, CommandRunner, CommandSpec};

struct Rule {
    prefix: String,
    responses: VecDeque<CommandOutput>,
}

/// Records every command and answers from a list of prefix rules. Commands
/// with no matching rule succeed with empty output. A rule with several
/// responses hands them out in order and then repeats the last one.
#[derive(Default)]
pub struct ScriptedRunner {
    rules: Mutex<Vec<Rule>>,
    missing: Mutex<Vec<String>>,
    calls: Mutex<Vec<CommandSpec>>,
}

impl ScriptedRunner {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn respond(&self, prefix: &str, responses: Vec<CommandOutput>) -> &Self {
        self.rules.lock().unwrap().push(Rule {
            prefix: prefix.to_string(),
            responses: responses.into(),
        });
        self
    }

    pub fn stdout(&self, prefix: &str, stdout: &str) -> &Self {
        self.respond(prefix, vec![ok(stdout)])
    }

    pub fn fail(&self, prefix: &str, stderr: &str) -> &Self {
        self.respond(prefix, vec![failed(stderr)])
    }

    /// Makes the program look absent from `PATH`.
    pub fn missing_program(&self, program: &str) -> &Self {
        self.missing.lock().unwrap().push(program.to_string());
        self
    }

    pub fn calls(&self) -> Vec<CommandSpec> {
        self.calls.lock().unwrap().clone()
    }

    pub fn command_lines(&self) -> Vec<String> {
        self.calls().iter().map(ToString::to_string).collect()
    }

    pub fn ran(&self, prefix: &str) -> bool {
        self.command_lines().iter().any(|c| c.starts_with(prefix))
    }

    pub fn position(&self, prefix: &str) -> Option<usize> {
        self.command_lines().iter().position(|c| c.starts_with(prefix))
    }

    pub fn count(&self, prefix: &str) -> usize {
        self.command_lines()
            .iter()
            .filter(|c| c.starts_with(prefix))
            .count()
    }
}

pub fn ok(stdout: &str) -> CommandOutput {
    CommandOutput {
        code: Some(0),
        stdout: stdout.to_string(),
        stderr: String::new(),
    }
}

pub fn failed(stderr: &str) -> CommandOutput {
    CommandOutput {
        code: Some(1),
        stdout: String::new(),
        stderr: stderr.to_string(),
    }
}

#[async_trait]
impl CommandRunner for ScriptedRunner {
    async fn run(&self, spec: &CommandSpec) -> Result<CommandOutput> {
        self.calls.lock().unwrap().push(spec.clone());

        if self.missing.lock().unwrap().contains(&spec.program) {
            return Err(ProvisionError::Spawn {
                program: spec.program.clone(),
                source: std::io::Error::from(std::io::ErrorKind::NotFound),
            });
        }

        let line = spec.to_string();
        let mut rules = self.rules.lock().unwrap();
        for rule in rules.iter_mut() {
            if line.starts_with(&rule.prefix) {
                let response = if rule.responses.len() > 1 {
                    rule.responses.pop_front()
                } else {
                    rule.responses.front().cloned()
                };
                return Ok(response.unwrap_or_else(|| ok("")));
            }
        }
        Ok(ok(""))
    }
}
