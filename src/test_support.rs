//! Scripted command client shared by unit tests.

use std::collections::HashMap;
use std::collections::VecDeque;
use std::sync::Mutex;

use async_trait::async_trait;

use crate::commands::{CommandClient, CommandOutput, CommandSpec};
use crate::error::Result;

/// One recorded subprocess invocation.
#[derive(Debug, Clone)]
pub struct RecordedCall {
    pub program: String,
    pub args: Vec<String>,
    pub stdin: Option<String>,
    /// Contents of the `-F` message file at call time, if any.
    pub commit_file: Option<String>,
}

impl RecordedCall {
    pub fn rendered(&self) -> String {
        if self.args.is_empty() {
            self.program.clone()
        } else {
            format!("{} {}", self.program, self.args.join(" "))
        }
    }
}

/// Command client that matches scripted responses by command-line prefix and
/// records every call. Unscripted commands succeed with empty output.
#[derive(Default)]
pub struct ScriptedClient {
    responses: Mutex<HashMap<String, VecDeque<CommandOutput>>>,
    calls: Mutex<Vec<RecordedCall>>,
}

impl ScriptedClient {
    pub fn new() -> Self {
        Self::default()
    }

    /// Script a successful response for commands starting with `prefix`.
    pub fn ok(&self, prefix: &str, stdout: &str) {
        self.push(prefix, CommandOutput {
            exit_code: 0,
            stdout: stdout.to_string(),
            stderr: String::new(),
        });
    }

    /// Script a failing response for commands starting with `prefix`.
    pub fn err_exit(&self, prefix: &str, exit_code: i32, stderr: &str) {
        self.push(prefix, CommandOutput {
            exit_code,
            stdout: String::new(),
            stderr: stderr.to_string(),
        });
    }

    fn push(&self, prefix: &str, output: CommandOutput) {
        self.responses
            .lock()
            .unwrap()
            .entry(prefix.to_string())
            .or_default()
            .push_back(output);
    }

    pub fn calls(&self) -> Vec<RecordedCall> {
        self.calls.lock().unwrap().clone()
    }

    pub fn count_calls(&self, prefix: &str) -> usize {
        self.calls
            .lock()
            .unwrap()
            .iter()
            .filter(|c| c.rendered().starts_with(prefix))
            .count()
    }

    pub fn was_called(&self, prefix: &str) -> bool {
        self.count_calls(prefix) > 0
    }

    /// The rendered command lines, in call order.
    pub fn call_lines(&self) -> Vec<String> {
        self.calls
            .lock()
            .unwrap()
            .iter()
            .map(RecordedCall::rendered)
            .collect()
    }
}

#[async_trait]
impl CommandClient for ScriptedClient {
    async fn output(&self, spec: CommandSpec) -> Result<CommandOutput> {
        let rendered = if spec.args.is_empty() {
            spec.program.clone()
        } else {
            format!("{} {}", spec.program, spec.args.join(" "))
        };

        let commit_file = spec
            .args
            .iter()
            .position(|a| a == "-F")
            .and_then(|i| spec.args.get(i + 1))
            .and_then(|path| std::fs::read_to_string(path).ok());

        self.calls.lock().unwrap().push(RecordedCall {
            program: spec.program.clone(),
            args: spec.args.clone(),
            stdin: spec.stdin.clone(),
            commit_file,
        });

        let mut responses = self.responses.lock().unwrap();
        // Longest matching prefix wins; scripted responses are consumed in
        // order, then the command falls back to a default success.
        let key = responses
            .iter()
            .filter(|(prefix, queue)| rendered.starts_with(prefix.as_str()) && !queue.is_empty())
            .map(|(prefix, _)| prefix.clone())
            .max_by_key(String::len);

        if let Some(key) = key
            && let Some(queue) = responses.get_mut(&key)
            && let Some(output) = queue.pop_front()
        {
            return Ok(output);
        }

        Ok(CommandOutput {
            exit_code: 0,
            stdout: String::new(),
            stderr: String::new(),
        })
    }
}
