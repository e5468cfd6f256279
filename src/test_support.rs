//! Test support utilities shared across unit and integration tests.

use std::cell::RefCell;
use std::collections::{BTreeSet, VecDeque};
use std::env;
use std::ffi::OsString;
use std::rc::Rc;
use std::sync::{Arc, Mutex as StdMutex};

use tokio::sync::{Mutex, MutexGuard};

use crate::health::{HealthProbe, ProbeFuture, ProbeOutcome, ProbeRequest};
use crate::remote::{CHANGE_MARKER, CommandOutput, CommandRunner, RemoteError};

/// Scripted command runner that returns pre-seeded outputs in FIFO order.
///
/// Used to drive deterministic command outcomes without spawning processes.
#[derive(Clone, Debug, Default)]
pub struct ScriptedRunner {
    responses: Rc<RefCell<VecDeque<CommandOutput>>>,
    invocations: Rc<RefCell<Vec<CommandInvocation>>>,
}

/// Records a single invocation made through [`ScriptedRunner`].
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct CommandInvocation {
    /// Program name as passed to the runner.
    pub program: String,
    /// Arguments passed to the program.
    pub args: Vec<OsString>,
}

impl CommandInvocation {
    /// Returns a shell-like command string for assertions.
    #[must_use]
    pub fn command_string(&self) -> String {
        let mut parts = Vec::with_capacity(self.args.len() + 1);
        parts.push(self.program.clone());
        parts.extend(
            self.args
                .iter()
                .map(|arg| arg.to_string_lossy().into_owned()),
        );
        parts.join(" ")
    }
}

impl ScriptedRunner {
    /// Creates a new runner with no queued responses.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns a snapshot of all invocations recorded so far.
    #[must_use]
    pub fn invocations(&self) -> Vec<CommandInvocation> {
        self.invocations.borrow().clone()
    }

    /// Returns the number of scripted responses not yet consumed.
    #[must_use]
    pub fn pending(&self) -> usize {
        self.responses.borrow().len()
    }

    /// Pushes a successful exit status.
    pub fn push_success(&self) {
        self.push_output(Some(0), "", "");
    }

    /// Pushes `count` successful exit statuses.
    pub fn push_successes(&self, count: usize) {
        for _ in 0..count {
            self.push_success();
        }
    }

    /// Pushes a successful exit status whose stdout carries the change marker.
    pub fn push_changed(&self) {
        self.push_output(Some(0), format!("{CHANGE_MARKER}\n"), "");
    }

    /// Pushes a successful exit status with the given stdout.
    pub fn push_stdout(&self, stdout: impl Into<String>) {
        self.push_output(Some(0), stdout, "");
    }

    /// Pushes a failing exit code with stderr text.
    pub fn push_failure(&self, code: i32) {
        self.push_output(Some(code), "", "simulated failure");
    }

    /// Pushes a response with no exit code to simulate abnormal termination.
    pub fn push_missing_exit_code(&self) {
        self.push_output(None, "", "");
    }

    /// Pushes an explicit command output response.
    pub fn push_output(
        &self,
        code: Option<i32>,
        stdout: impl Into<String>,
        stderr: impl Into<String>,
    ) {
        self.responses.borrow_mut().push_back(CommandOutput {
            code,
            stdout: stdout.into(),
            stderr: stderr.into(),
        });
    }
}

impl CommandRunner for ScriptedRunner {
    fn run(&self, program: &str, args: &[OsString]) -> Result<CommandOutput, RemoteError> {
        self.invocations.borrow_mut().push(CommandInvocation {
            program: program.to_owned(),
            args: args.to_vec(),
        });
        self.responses
            .borrow_mut()
            .pop_front()
            .ok_or_else(|| RemoteError::Spawn {
                program: program.to_owned(),
                message: String::from("no scripted response available"),
            })
    }
}

/// Health probe that replays scripted outcomes and records requested URLs.
///
/// Once the script is exhausted the last outcome repeats, so a single
/// scripted status covers every retry.
#[derive(Clone, Debug, Default)]
pub struct ScriptedProbe {
    outcomes: Arc<StdMutex<VecDeque<ProbeOutcome>>>,
    requests: Arc<StdMutex<Vec<ProbeRequest>>>,
}

impl ScriptedProbe {
    /// Creates a probe with no scripted outcomes.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Queues an HTTP status response.
    pub fn push_status(&self, status: u16) {
        self.push(ProbeOutcome::Status(status));
    }

    /// Queues a transport error.
    pub fn push_error(&self, message: impl Into<String>) {
        self.push(ProbeOutcome::Error(message.into()));
    }

    /// Returns every request observed so far.
    #[must_use]
    pub fn requests(&self) -> Vec<ProbeRequest> {
        self.requests
            .lock()
            .map(|guard| guard.clone())
            .unwrap_or_default()
    }

    fn push(&self, outcome: ProbeOutcome) {
        if let Ok(mut guard) = self.outcomes.lock() {
            guard.push_back(outcome);
        }
    }

    fn next(&self) -> ProbeOutcome {
        let Ok(mut guard) = self.outcomes.lock() else {
            return ProbeOutcome::Error(String::from("probe script poisoned"));
        };
        if guard.len() > 1 {
            return guard
                .pop_front()
                .unwrap_or_else(|| ProbeOutcome::Error(String::from("probe script empty")));
        }
        guard
            .front()
            .cloned()
            .unwrap_or_else(|| ProbeOutcome::Error(String::from("probe script empty")))
    }
}

impl HealthProbe for ScriptedProbe {
    fn probe<'a>(&'a self, request: &'a ProbeRequest) -> ProbeFuture<'a> {
        if let Ok(mut guard) = self.requests.lock() {
            guard.push(request.clone());
        }
        let outcome = self.next();
        Box::pin(async move { outcome })
    }
}

/// Global mutex used to serialise environment mutation in tests.
pub static ENV_LOCK: Mutex<()> = Mutex::const_new(());

/// Guard that holds the env mutex and restores variables on drop.
pub struct EnvGuard {
    previous: Vec<(String, Option<OsString>)>,
    _guard: MutexGuard<'static, ()>,
}

impl EnvGuard {
    /// Sets multiple environment variables while holding a global mutex.
    pub async fn set_vars(pairs: &[(&str, &str)]) -> Self {
        debug_assert!(
            {
                let mut seen = BTreeSet::new();
                pairs.iter().all(|(key, _)| seen.insert(*key))
            },
            "duplicate environment variable keys passed to EnvGuard::set_vars"
        );

        let guard = ENV_LOCK.lock().await;
        let mut previous = Vec::with_capacity(pairs.len());
        for (key, value) in pairs {
            let old = env::var_os(key);
            // SAFETY: Environment mutation is serialised by `ENV_LOCK`, preventing races.
            unsafe { env::set_var(key, value) };
            previous.push(((*key).to_owned(), old));
        }

        Self {
            previous,
            _guard: guard,
        }
    }
}

impl Drop for EnvGuard {
    fn drop(&mut self) {
        for (key, old) in &self.previous {
            // SAFETY: Environment mutation is serialised by holding `_guard`.
            unsafe {
                match old {
                    Some(val) => env::set_var(key, val),
                    None => env::remove_var(key),
                }
            }
        }
    }
}
