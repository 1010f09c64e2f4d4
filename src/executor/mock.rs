// file: src/executor/mock.rs
// version: 1.0.0
// guid: 0a9c6e83-5f2b-4d17-b8e4-9c1d3a7f6b25

//! Recording executor with scripted responses for tests

use super::{owned_args, CommandExecutor};
use crate::error::{ProvisionError, Result};
use std::collections::{HashMap, VecDeque};
use std::sync::{Mutex, MutexGuard};
use tokio_util::sync::CancellationToken;

/// One recorded call
#[derive(Debug, Clone, PartialEq)]
pub struct Invocation {
    pub program: String,
    pub args: Vec<String>,
    pub input: Option<Vec<u8>>,
    pub dir: Option<String>,
}

impl Invocation {
    /// `program arg1 arg2 ...`, unquoted
    pub fn command_line(&self) -> String {
        std::iter::once(self.program.as_str())
            .chain(self.args.iter().map(String::as_str))
            .collect::<Vec<_>>()
            .join(" ")
    }

    pub fn input_str(&self) -> Option<String> {
        self.input
            .as_ref()
            .map(|i| String::from_utf8_lossy(i).to_string())
    }
}

/// Scripted result of a call
#[derive(Debug, Clone)]
pub enum MockResponse {
    Success(Vec<u8>),
    Failure { exit_code: i64, output: Vec<u8> },
}

impl MockResponse {
    pub fn ok(output: impl AsRef<[u8]>) -> Self {
        Self::Success(output.as_ref().to_vec())
    }

    pub fn fail(exit_code: i64, output: impl AsRef<[u8]>) -> Self {
        Self::Failure {
            exit_code,
            output: output.as_ref().to_vec(),
        }
    }
}

#[derive(Default)]
struct Script {
    /// (substring of the command line, response); checked first, not consumed
    patterns: Vec<(String, MockResponse)>,
    /// one-shot responses per program, consumed in order
    queued: HashMap<String, VecDeque<MockResponse>>,
    /// fallback per program once the queue is empty
    defaults: HashMap<String, MockResponse>,
}

/// Executor double: records every call, answers from a script
///
/// Unscripted calls succeed with empty output.
#[derive(Default)]
pub struct MockExecutor {
    calls: Mutex<Vec<Invocation>>,
    script: Mutex<Script>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

impl MockExecutor {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue a successful response for the next call to `program`
    pub fn respond(&self, program: &str, output: impl AsRef<[u8]>) -> &Self {
        self.push(program, MockResponse::ok(output))
    }

    /// Queue a failing response for the next call to `program`
    pub fn fail(&self, program: &str, exit_code: i64, output: impl AsRef<[u8]>) -> &Self {
        self.push(program, MockResponse::fail(exit_code, output))
    }

    pub fn push(&self, program: &str, response: MockResponse) -> &Self {
        lock(&self.script)
            .queued
            .entry(program.to_string())
            .or_default()
            .push_back(response);
        self
    }

    /// Answer every call to `program` with `response` once its queue is drained
    pub fn default_response(&self, program: &str, response: MockResponse) -> &Self {
        lock(&self.script)
            .defaults
            .insert(program.to_string(), response);
        self
    }

    /// Answer any call whose command line contains `needle`
    pub fn respond_when(&self, needle: &str, response: MockResponse) -> &Self {
        lock(&self.script)
            .patterns
            .push((needle.to_string(), response));
        self
    }

    /// Every call so far, in order
    pub fn calls(&self) -> Vec<Invocation> {
        lock(&self.calls).clone()
    }

    pub fn calls_for(&self, program: &str) -> Vec<Invocation> {
        self.calls()
            .into_iter()
            .filter(|c| c.program == program)
            .collect()
    }

    /// Command lines of every call, in order
    pub fn command_lines(&self) -> Vec<String> {
        self.calls().iter().map(Invocation::command_line).collect()
    }

    pub fn last_call(&self) -> Option<Invocation> {
        lock(&self.calls).last().cloned()
    }

    fn answer(&self, invocation: Invocation) -> Result<Vec<u8>> {
        let line = invocation.command_line();
        let response = {
            let mut script = lock(&self.script);
            let matched = script
                .patterns
                .iter()
                .find(|(needle, _)| line.contains(needle.as_str()))
                .map(|(_, r)| r.clone());
            matched
                .or_else(|| {
                    script
                        .queued
                        .get_mut(&invocation.program)
                        .and_then(VecDeque::pop_front)
                })
                .or_else(|| script.defaults.get(&invocation.program).cloned())
                .unwrap_or(MockResponse::Success(Vec::new()))
        };

        let program = invocation.program.clone();
        let args = invocation.args.clone();
        lock(&self.calls).push(invocation);

        match response {
            MockResponse::Success(output) => Ok(output),
            MockResponse::Failure { exit_code, output } => Err(ProvisionError::command_failed(
                &program,
                &args,
                Some(exit_code),
                &output,
                None,
            )),
        }
    }
}

#[async_trait::async_trait]
impl CommandExecutor for MockExecutor {
    async fn execute(&self, cancel: &CancellationToken, name: &str, args: &[&str]) -> Result<Vec<u8>> {
        if cancel.is_cancelled() {
            return Err(ProvisionError::cancelled(name.to_string()));
        }
        self.answer(Invocation {
            program: name.to_string(),
            args: owned_args(args),
            input: None,
            dir: None,
        })
    }

    async fn execute_with_input(
        &self,
        cancel: &CancellationToken,
        input: &[u8],
        name: &str,
        args: &[&str],
    ) -> Result<Vec<u8>> {
        if cancel.is_cancelled() {
            return Err(ProvisionError::cancelled(name.to_string()));
        }
        self.answer(Invocation {
            program: name.to_string(),
            args: owned_args(args),
            input: Some(input.to_vec()),
            dir: None,
        })
    }

    async fn execute_in_path(
        &self,
        cancel: &CancellationToken,
        dir: &str,
        name: &str,
        args: &[&str],
    ) -> Result<Vec<u8>> {
        if cancel.is_cancelled() {
            return Err(ProvisionError::cancelled(name.to_string()));
        }
        self.answer(Invocation {
            program: name.to_string(),
            args: owned_args(args),
            input: None,
            dir: Some(dir.to_string()),
        })
    }

    fn describe(&self) -> String {
        "mock".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_queue_then_default() {
        let mock = MockExecutor::new();
        mock.respond("kpartx", "add map loop0p1\n")
            .default_response("kpartx", MockResponse::fail(1, "busy"));
        let cancel = CancellationToken::new();

        let first = mock.execute(&cancel, "kpartx", &["-av", "a.img"]).await.unwrap();
        assert_eq!(first, b"add map loop0p1\n");
        let second = mock.execute(&cancel, "kpartx", &["-d", "a.img"]).await;
        assert!(second.is_err());
        assert_eq!(mock.calls_for("kpartx").len(), 2);
        assert_eq!(mock.last_call().unwrap().command_line(), "kpartx -d a.img");
    }

    #[tokio::test]
    async fn test_pattern_wins() {
        let mock = MockExecutor::new();
        mock.respond_when("blkid", MockResponse::ok("ext4\n"));
        let cancel = CancellationToken::new();
        let out = mock
            .execute(&cancel, "sh", &["-c", "blkid -o value -s TYPE /dev/x"])
            .await
            .unwrap();
        assert_eq!(out, b"ext4\n");
    }

    #[tokio::test]
    async fn test_records_input_and_dir() {
        let mock = MockExecutor::new();
        let cancel = CancellationToken::new();
        mock.execute_with_input(&cancel, b"data", "tee", &["/x"]).await.unwrap();
        mock.execute_in_path(&cancel, "/work", "ls", &[]).await.unwrap();
        let calls = mock.calls();
        assert_eq!(calls[0].input_str().as_deref(), Some("data"));
        assert_eq!(calls[1].dir.as_deref(), Some("/work"));
    }
}
