//! Dispatcher configuration.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use crate::error::DispatchError;
use crate::supervisor::{InterpreterSpawner, WorkerSpawner};

pub const DEFAULT_MAX_CONCURRENCY: usize = 2;

/// Exit code a worker uses to say "deliberate shutdown, do not restart".
pub const DEFAULT_SHUTDOWN_EXIT_CODE: i32 = 1;

pub const DEFAULT_INTERPRETER: &str = "python";

/// What happens to in-flight requests when the worker crashes.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum CrashPolicy {
    /// Fail every in-flight request with `WorkerCrashed`.
    #[default]
    FailPending,
    /// Put in-flight requests back at the head of the queue and re-send them
    /// to the restarted worker.
    Redeliver,
}

#[derive(Clone)]
pub struct DispatcherConfig {
    pub script_path: PathBuf,
    pub interpreter: String,
    pub args: Vec<String>,
    pub max_concurrency: usize,
    /// Log task start/finish at info level.
    pub log_tasks: bool,
    pub shutdown_exit_code: i32,
    pub crash_policy: CrashPolicy,
    pub restart_delay: Duration,
    /// Give up after this many restarts. `None` restarts forever.
    pub max_restarts: Option<u32>,
    pub request_timeout: Option<Duration>,
    pub spawner: Arc<dyn WorkerSpawner>,
}

impl DispatcherConfig {
    pub fn new(script_path: impl Into<PathBuf>) -> Self {
        Self {
            script_path: script_path.into(),
            interpreter: DEFAULT_INTERPRETER.to_string(),
            args: Vec::new(),
            max_concurrency: DEFAULT_MAX_CONCURRENCY,
            log_tasks: true,
            shutdown_exit_code: DEFAULT_SHUTDOWN_EXIT_CODE,
            crash_policy: CrashPolicy::default(),
            restart_delay: Duration::ZERO,
            max_restarts: None,
            request_timeout: None,
            spawner: Arc::new(InterpreterSpawner),
        }
    }

    pub fn with_interpreter(mut self, interpreter: impl Into<String>) -> Self {
        self.interpreter = interpreter.into();
        self
    }

    pub fn with_args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args = args.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_max_concurrency(mut self, n: usize) -> Self {
        self.max_concurrency = n;
        self
    }

    pub fn with_logging(mut self, log_tasks: bool) -> Self {
        self.log_tasks = log_tasks;
        self
    }

    pub fn with_shutdown_exit_code(mut self, code: i32) -> Self {
        self.shutdown_exit_code = code;
        self
    }

    pub fn with_crash_policy(mut self, policy: CrashPolicy) -> Self {
        self.crash_policy = policy;
        self
    }

    pub fn with_restart_delay(mut self, delay: Duration) -> Self {
        self.restart_delay = delay;
        self
    }

    pub fn with_max_restarts(mut self, max: u32) -> Self {
        self.max_restarts = Some(max);
        self
    }

    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = Some(timeout);
        self
    }

    pub fn with_spawner(mut self, spawner: Arc<dyn WorkerSpawner>) -> Self {
        self.spawner = spawner;
        self
    }

    pub fn script_path(&self) -> &Path {
        &self.script_path
    }

    pub fn validate(&self) -> Result<(), DispatchError> {
        if self.max_concurrency == 0 {
            return Err(DispatchError::Config(
                "max_concurrency must be at least 1".to_string(),
            ));
        }
        if self.interpreter.is_empty() {
            return Err(DispatchError::Config("interpreter is empty".to_string()));
        }
        Ok(())
    }
}

impl std::fmt::Debug for DispatcherConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DispatcherConfig")
            .field("script_path", &self.script_path)
            .field("interpreter", &self.interpreter)
            .field("args", &self.args)
            .field("max_concurrency", &self.max_concurrency)
            .field("log_tasks", &self.log_tasks)
            .field("shutdown_exit_code", &self.shutdown_exit_code)
            .field("crash_policy", &self.crash_policy)
            .field("restart_delay", &self.restart_delay)
            .field("max_restarts", &self.max_restarts)
            .field("request_timeout", &self.request_timeout)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults() {
        let config = DispatcherConfig::new("./worker.py");
        assert_eq!(config.script_path(), Path::new("./worker.py"));
        assert_eq!(config.interpreter, "python");
        assert_eq!(config.max_concurrency, 2);
        assert!(config.log_tasks);
        assert_eq!(config.shutdown_exit_code, 1);
        assert_eq!(config.crash_policy, CrashPolicy::FailPending);
        assert_eq!(config.restart_delay, Duration::ZERO);
        assert!(config.max_restarts.is_none());
        assert!(config.request_timeout.is_none());
        assert!(config.validate().is_ok());
    }

    #[test]
    fn builder_pattern() {
        let config = DispatcherConfig::new("worker.sh")
            .with_interpreter("sh")
            .with_args(["--fast"])
            .with_max_concurrency(8)
            .with_logging(false)
            .with_shutdown_exit_code(3)
            .with_crash_policy(CrashPolicy::Redeliver)
            .with_restart_delay(Duration::from_millis(50))
            .with_max_restarts(5)
            .with_request_timeout(Duration::from_secs(2));

        assert_eq!(config.interpreter, "sh");
        assert_eq!(config.args, ["--fast"]);
        assert_eq!(config.max_concurrency, 8);
        assert!(!config.log_tasks);
        assert_eq!(config.shutdown_exit_code, 3);
        assert_eq!(config.crash_policy, CrashPolicy::Redeliver);
        assert_eq!(config.restart_delay, Duration::from_millis(50));
        assert_eq!(config.max_restarts, Some(5));
        assert_eq!(config.request_timeout, Some(Duration::from_secs(2)));
    }

    #[test]
    fn zero_concurrency_is_rejected() {
        let err = DispatcherConfig::new("worker.py")
            .with_max_concurrency(0)
            .validate()
            .unwrap_err();
        assert!(matches!(err, DispatchError::Config(_)));
    }
}
