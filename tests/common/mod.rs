#![allow(dead_code)]

use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;

use async_trait::async_trait;

use patrol::commands::{CommandClient, CommandOutput, CommandSpec};
use patrol::error::Result;

/// Scripted command client for integration tests. Responses are matched by
/// the longest scripted prefix of the rendered command line and consumed in
/// order; unscripted commands succeed with empty output.
#[derive(Default)]
pub struct ScriptedClient {
    responses: Mutex<HashMap<String, VecDeque<CommandOutput>>>,
    calls: Mutex<Vec<String>>,
}

impl ScriptedClient {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn ok(&self, prefix: &str, stdout: &str) {
        self.push(prefix, CommandOutput {
            exit_code: 0,
            stdout: stdout.to_string(),
            stderr: String::new(),
        });
    }

    pub fn ok_times(&self, prefix: &str, stdout: &str, times: usize) {
        for _ in 0..times {
            self.ok(prefix, stdout);
        }
    }

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

    /// Rendered command lines, in call order.
    pub fn call_lines(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }

    pub fn count_calls(&self, prefix: &str) -> usize {
        self.calls
            .lock()
            .unwrap()
            .iter()
            .filter(|line| line.starts_with(prefix))
            .count()
    }

    pub fn was_called(&self, prefix: &str) -> bool {
        self.count_calls(prefix) > 0
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
        self.calls.lock().unwrap().push(rendered.clone());

        let mut responses = self.responses.lock().unwrap();
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
