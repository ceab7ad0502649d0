//! # Cluster settings (configuration store data).
//!
//! [`Settings`] is the full snapshot the master forks workers from.
//! [`SetupOptions`] is the partial option set accepted by
//! [`Cluster::setup_master`](crate::Cluster::setup_master).
//!
//! ## Rules
//! - Every `setup_master` call produces a **new** snapshot: fields omitted from
//!   the options keep their previous value, nothing else is merged.
//! - A forked worker keeps the snapshot it was forked with; later
//!   `setup_master` calls never affect it.
//! - Validation happens before anything is replaced: an invalid option leaves
//!   the previous snapshot untouched.
//!
//! ## Example
//! ```rust
//! use forkvisor::{ForkMode, Settings, SetupOptions};
//!
//! let opts: SetupOptions = serde_json::from_str(
//!     r#"{ "workers": 3, "args": ["--port", "8080"], "silent": true }"#,
//! ).unwrap();
//! opts.validate().unwrap();
//!
//! let next = opts.apply_to(&Settings::default());
//! assert_eq!(next.workers, 3);
//! assert_eq!(next.fork_mode, ForkMode::Manual);
//! ```

use std::num::NonZeroUsize;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::error::ClusterError;
use crate::policies::ForkMode;

/// Full cluster settings snapshot.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Settings {
    /// Target population for `auto_fork()` without an explicit count.
    pub workers: usize,
    /// Arguments appended after `exec` in every worker's argument vector.
    pub args: Vec<String>,
    /// Absolute path of the worker executable.
    pub exec: PathBuf,
    /// `true` pipes worker stdout/stderr into the master's log instead of inheriting them.
    pub silent: bool,
    /// Crash replacement policy.
    pub fork_mode: ForkMode,
}

impl Default for Settings {
    /// - `workers` = available parallelism (1 if unknown)
    /// - `exec` = the current executable
    /// - no extra args, stdio inherited, manual fork mode
    fn default() -> Self {
        Self {
            workers: std::thread::available_parallelism()
                .map(NonZeroUsize::get)
                .unwrap_or(1),
            args: Vec::new(),
            exec: exec_or_empty(std::env::current_exe()),
            silent: false,
            fork_mode: ForkMode::Manual,
        }
    }
}

/// Resolved default `exec`; empty (so `fork` reports a validation error) if unknown.
fn exec_or_empty(exe: std::io::Result<PathBuf>) -> PathBuf {
    match exe {
        Ok(path) => path,
        Err(e) => {
            tracing::warn!(error = %e, "cannot resolve current executable; set `exec` in setup_master");
            PathBuf::new()
        }
    }
}

impl Settings {
    /// Checks the snapshot before a fork.
    ///
    /// # Errors
    /// [`ClusterError::Validation`] when `exec` is not an absolute path, which
    /// only happens when the default executable could not be resolved.
    pub fn check_exec(&self) -> Result<(), ClusterError> {
        if self.exec.is_absolute() {
            Ok(())
        } else {
            Err(ClusterError::validation(
                "exec",
                format!("{:?} is not an absolute path", self.exec),
            ))
        }
    }
}

/// Options accepted by `setup_master`; `None` keeps the previous value.
///
/// `workers` is signed so that negative values coming from configuration
/// files are reported as a validation error.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct SetupOptions {
    pub workers: Option<i64>,
    pub args: Option<Vec<String>>,
    pub exec: Option<PathBuf>,
    pub silent: Option<bool>,
    #[serde(alias = "forkMode")]
    pub fork_mode: Option<ForkMode>,
}

impl SetupOptions {
    /// Empty option set (replaces the snapshot with an identical copy).
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn workers(mut self, workers: i64) -> Self {
        self.workers = Some(workers);
        self
    }

    #[must_use]
    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args = Some(args.into_iter().map(Into::into).collect());
        self
    }

    #[must_use]
    pub fn exec(mut self, exec: impl Into<PathBuf>) -> Self {
        self.exec = Some(exec.into());
        self
    }

    #[must_use]
    pub fn silent(mut self, silent: bool) -> Self {
        self.silent = Some(silent);
        self
    }

    #[must_use]
    pub fn fork_mode(mut self, mode: ForkMode) -> Self {
        self.fork_mode = Some(mode);
        self
    }

    /// Checks the options without touching any settings.
    ///
    /// # Errors
    /// [`ClusterError::Validation`] when `workers` is negative (or does not fit
    /// in `usize`) or when `exec` is not an absolute path.
    pub fn validate(&self) -> Result<(), ClusterError> {
        if let Some(n) = self.workers {
            if n < 0 {
                return Err(ClusterError::validation("workers", format!("{n} is negative")));
            }
            if usize::try_from(n).is_err() {
                return Err(ClusterError::validation("workers", format!("{n} is too large")));
            }
        }
        if let Some(exec) = &self.exec {
            if !exec.is_absolute() {
                return Err(ClusterError::validation(
                    "exec",
                    format!("{} is not an absolute path", exec.display()),
                ));
            }
        }
        Ok(())
    }

    /// Builds the next snapshot from `prev`. Call [`validate`](Self::validate) first.
    pub fn apply_to(self, prev: &Settings) -> Settings {
        Settings {
            workers: self
                .workers
                .and_then(|n| usize::try_from(n).ok())
                .unwrap_or(prev.workers),
            args: self.args.unwrap_or_else(|| prev.args.clone()),
            exec: self.exec.unwrap_or_else(|| prev.exec.clone()),
            silent: self.silent.unwrap_or(prev.silent),
            fork_mode: self.fork_mode.unwrap_or(prev.fork_mode),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn base() -> Settings {
        Settings {
            workers: 2,
            args: vec!["a".into()],
            exec: PathBuf::from("/bin/true"),
            silent: false,
            fork_mode: ForkMode::Manual,
        }
    }

    #[test]
    fn omitted_fields_carry_forward() {
        let next = SetupOptions::new().silent(true).apply_to(&base());
        assert_eq!(
            next,
            Settings {
                silent: true,
                ..base()
            }
        );
    }

    #[test]
    fn provided_fields_replace() {
        let next = SetupOptions::new()
            .workers(0)
            .args(["custom argument"])
            .fork_mode(ForkMode::Auto)
            .apply_to(&base());
        assert_eq!(next.workers, 0);
        assert_eq!(next.args, vec!["custom argument".to_string()]);
        assert_eq!(next.fork_mode, ForkMode::Auto);
        assert_eq!(next.exec, PathBuf::from("/bin/true"));
    }

    #[test]
    fn negative_workers_rejected() {
        let err = SetupOptions::new().workers(-1).validate().unwrap_err();
        assert_eq!(err.as_label(), "cluster_validation");
        assert!(err.to_string().contains("workers"));
    }

    #[test]
    fn relative_exec_rejected() {
        let err = SetupOptions::new().exec("bin/worker").validate().unwrap_err();
        assert!(matches!(err, ClusterError::Validation { field: "exec", .. }));
    }

    #[test]
    fn parses_json_with_camel_case_fork_mode() {
        let opts: SetupOptions =
            serde_json::from_str(r#"{"workers": 4, "forkMode": "auto"}"#).unwrap();
        assert_eq!(opts.workers, Some(4));
        assert_eq!(opts.fork_mode, Some(ForkMode::Auto));
    }

    #[test]
    fn unknown_option_is_a_parse_error() {
        assert!(serde_json::from_str::<SetupOptions>(r#"{"cpus": 4}"#).is_err());
    }

    #[test]
    fn unresolved_executable_fails_exec_check() {
        let exec = exec_or_empty(Err(std::io::Error::other("no /proc")));
        assert_eq!(exec, PathBuf::new());
        let err = Settings { exec, ..base() }.check_exec().unwrap_err();
        assert!(matches!(err, ClusterError::Validation { field: "exec", .. }));
        assert!(base().check_exec().is_ok());
    }

    #[test]
    fn defaults_are_usable() {
        let s = Settings::default();
        assert!(s.workers >= 1);
        assert_eq!(s.fork_mode, ForkMode::Manual);
        assert!(s.args.is_empty());
        assert!(s.exec.is_absolute());
    }
}
