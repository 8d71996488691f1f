//! Scripted command runner for tests.
//!
//! Responses are keyed by an argument that must appear in the invocation
//! (usually the engine subcommand) and optionally by repository location.
//! Each rule replays its queued responses in order; the last one repeats.
//! Invocations that match no rule succeed with empty output.

use std::collections::VecDeque;
use std::sync::Mutex;

use futures_util::future::BoxFuture;

use super::{CommandRunner, Invocation, ProcessError, ProcessOutput};

pub type Response = Result<ProcessOutput, ProcessError>;

struct Rule {
    keyword: String,
    location: Option<String>,
    responses: VecDeque<Response>,
}

impl Rule {
    fn matches(&self, invocation: &Invocation) -> bool {
        invocation.args.iter().any(|a| *a == self.keyword)
            && self
                .location
                .as_ref()
                .map_or(true, |loc| invocation.args.iter().any(|a| a == loc))
    }

    fn next(&mut self) -> Response {
        if self.responses.len() > 1 {
            self.responses
                .pop_front()
                .unwrap_or_else(|| Ok(ProcessOutput::default()))
        } else {
            self.responses
                .front()
                .cloned()
                .unwrap_or_else(|| Ok(ProcessOutput::default()))
        }
    }
}

#[derive(Default)]
pub struct ScriptedRunner {
    rules: Mutex<Vec<Rule>>,
    calls: Mutex<Vec<Invocation>>,
}

impl ScriptedRunner {
    pub fn new() -> Self {
        Self::default()
    }

    /// Script responses for any invocation containing `keyword`.
    pub fn on(self, keyword: &str, responses: Vec<Response>) -> Self {
        self.push_rule(keyword, None, responses);
        self
    }

    /// Script responses for invocations containing both `keyword` and `location`.
    pub fn on_repo(self, location: &str, keyword: &str, responses: Vec<Response>) -> Self {
        self.push_rule(keyword, Some(location.to_string()), responses);
        self
    }

    fn push_rule(&self, keyword: &str, location: Option<String>, responses: Vec<Response>) {
        let mut rules = self.rules.lock().unwrap_or_else(|e| e.into_inner());
        // Repository-specific rules take precedence over generic ones.
        let rule = Rule {
            keyword: keyword.to_string(),
            location,
            responses: responses.into(),
        };
        if rule.location.is_some() {
            rules.insert(0, rule);
        } else {
            rules.push(rule);
        }
    }

    /// Every invocation seen so far, in call order.
    pub fn calls(&self) -> Vec<Invocation> {
        self.calls.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    /// Number of invocations containing `keyword`.
    pub fn count(&self, keyword: &str) -> usize {
        self.calls()
            .iter()
            .filter(|inv| inv.args.iter().any(|a| a == keyword))
            .count()
    }

    pub fn ok(stdout: &str) -> Response {
        Ok(ProcessOutput::success(stdout))
    }

    pub fn fail(stderr: &str) -> Response {
        Err(ProcessError::Exit {
            exit_code: 1,
            stdout: String::new(),
            stderr: stderr.to_string(),
        })
    }
}

impl CommandRunner for ScriptedRunner {
    fn run<'a>(
        &'a self,
        invocation: &'a Invocation,
    ) -> BoxFuture<'a, Result<ProcessOutput, ProcessError>> {
        self.calls
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(invocation.clone());

        let response = {
            let mut rules = self.rules.lock().unwrap_or_else(|e| e.into_inner());
            rules
                .iter_mut()
                .find(|rule| rule.matches(invocation))
                .map(Rule::next)
                .unwrap_or_else(|| Ok(ProcessOutput::default()))
        };

        Box::pin(async move { response })
    }
}
