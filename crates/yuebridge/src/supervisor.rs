//! Worker process lifecycle: spawn, stdio capture, teardown.
//!
//! The checker worker is a Lua runtime executing an entry script, so the
//! spawner sets `LUA_PATH`/`LUA_CPATH` to cover the system trees and the
//! user's luarocks tree.

use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;

use tokio::process::{Child, ChildStdin, ChildStdout, Command};

use crate::error::BridgeError;

/// Launch configuration for the checker worker.
#[derive(Debug, Clone)]
pub struct WorkerConfig {
    pub executable: String,
    pub entry_script: PathBuf,
    pub args: Vec<String>,
    pub lua_version: String,
    /// Overrides `$HOME` for luarocks path construction.
    pub home_dir: Option<PathBuf>,
}

impl WorkerConfig {
    pub fn new(entry_script: impl Into<PathBuf>) -> Self {
        Self {
            executable: "yue".to_string(),
            entry_script: entry_script.into(),
            args: Vec::new(),
            lua_version: "5.4".to_string(),
            home_dir: None,
        }
    }

    pub fn with_executable(mut self, executable: impl Into<String>) -> Self {
        self.executable = executable.into();
        self
    }

    pub fn with_args(mut self, args: Vec<String>) -> Self {
        self.args = args;
        self
    }

    pub fn with_lua_version(mut self, version: impl Into<String>) -> Self {
        self.lua_version = version.into();
        self
    }

    pub fn with_home_dir(mut self, home: impl Into<PathBuf>) -> Self {
        self.home_dir = Some(home.into());
        self
    }

    fn home(&self) -> PathBuf {
        self.home_dir
            .clone()
            .or_else(|| std::env::var_os("HOME").map(PathBuf::from))
            .unwrap_or_else(|| PathBuf::from("."))
    }

    /// `LUA_PATH` covering system trees and the user's luarocks tree.
    pub fn lua_path(&self) -> String {
        let ver = &self.lua_version;
        let rocks = self.home().join(".luarocks/share/lua").join(ver);
        [
            "./?.lua".to_string(),
            format!("/usr/local/share/lua/{ver}/?.lua"),
            format!("/usr/local/share/lua/{ver}/?/init.lua"),
            format!("/usr/local/lib/lua/{ver}/?.lua"),
            format!("/usr/local/lib/lua/{ver}/?/init.lua"),
            format!("/usr/share/lua/{ver}/?.lua"),
            format!("/usr/share/lua/{ver}/?/init.lua"),
            format!("{}/?.lua", rocks.display()),
            format!("{}/?/init.lua", rocks.display()),
        ]
        .join(";")
    }

    /// `LUA_CPATH` for native modules.
    pub fn lua_cpath(&self) -> String {
        let ver = &self.lua_version;
        let rocks = self.home().join(".luarocks/lib/lua").join(ver);
        [
            "./?.so".to_string(),
            format!("/usr/local/lib/lua/{ver}/?.so"),
            format!("/usr/lib/x86_64-linux-gnu/lua/{ver}/?.so"),
            format!("/usr/lib/lua/{ver}/?.so"),
            format!("/usr/local/lib/lua/{ver}/loadall.so"),
            format!("{}/?.so", rocks.display()),
        ]
        .join(";")
    }
}

/// Extension point for different worker spawn strategies.
pub trait WorkerSpawner: Send + Sync {
    fn spawn(&self, config: &WorkerConfig) -> Result<Child, BridgeError>;
}

/// Default spawner: resolves the executable on `PATH` and runs the entry
/// script under the Lua runtime.
pub struct YueSpawner;

impl YueSpawner {
    fn resolve(&self, executable: &str) -> Result<PathBuf, BridgeError> {
        if Path::new(executable).components().count() > 1 {
            return Ok(PathBuf::from(executable));
        }
        which::which(executable)
            .map_err(|_| BridgeError::Launch(format!("{executable} not found in PATH")))
    }
}

impl WorkerSpawner for YueSpawner {
    fn spawn(&self, config: &WorkerConfig) -> Result<Child, BridgeError> {
        let resolved = self.resolve(&config.executable)?;
        tracing::info!(
            executable = %resolved.display(),
            entry = %config.entry_script.display(),
            "spawning checker worker"
        );

        Command::new(&resolved)
            .arg("-e")
            .arg(&config.entry_script)
            .args(&config.args)
            .env("LUA_PATH", config.lua_path())
            .env("LUA_CPATH", config.lua_cpath())
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| BridgeError::Launch(format!("spawning {}: {e}", resolved.display())))
    }
}

/// Handle to a live checker worker.
///
/// Stdio is taken once at session start; the session owns the streams from
/// then on and nothing else touches them.
pub struct WorkerProcess {
    child: Child,
}

impl WorkerProcess {
    pub fn spawn(spawner: &dyn WorkerSpawner, config: &WorkerConfig) -> Result<Self, BridgeError> {
        let child = spawner.spawn(config)?;
        Ok(Self { child })
    }

    pub fn take_stdio(&mut self) -> Result<(ChildStdin, ChildStdout), BridgeError> {
        let stdin = self
            .child
            .stdin
            .take()
            .ok_or_else(|| BridgeError::Launch("stdin not captured".to_string()))?;
        let stdout = self
            .child
            .stdout
            .take()
            .ok_or_else(|| BridgeError::Launch("stdout not captured".to_string()))?;
        Ok((stdin, stdout))
    }

    pub fn id(&self) -> Option<u32> {
        self.child.id()
    }

    /// Scoped shutdown: close the input stream, give the worker a bounded
    /// grace period to exit, then terminate it.
    ///
    /// The input stream must close before any kill signal, since dropping
    /// straight to a kill can truncate an in-flight reply mid-write. The
    /// caller is expected to have dropped the session writer already; any
    /// stdin still held here is closed as well.
    pub async fn stop(mut self, grace: Duration) {
        drop(self.child.stdin.take());

        match tokio::time::timeout(grace, self.child.wait()).await {
            Ok(Ok(status)) => {
                tracing::debug!(?status, "worker exited within grace period");
            }
            Ok(Err(e)) => {
                tracing::warn!(error = %e, "failed to wait for worker");
            }
            Err(_) => {
                tracing::debug!("worker did not exit in time, killing");
                let _ = self.child.kill().await;
            }
        }
    }
}
