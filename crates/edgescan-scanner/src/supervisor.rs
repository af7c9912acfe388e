//! Proxy-core process supervision
//!
//! One external tunnel process is spawned per in-flight probe; it is the
//! system's principal resource cost, so its lifecycle is strict: write the
//! config file, spawn, and on every exit path terminate the whole descendant
//! tree and delete the config. On Unix the child gets its own process group
//! so `killpg` reaps grandchildren; on Windows the tree is cut with
//! `taskkill /T /F`. A time-bounded graceful stop precedes the hard kill.

use edgescan_core::{Error, Result};
use serde_json::Value;
#[cfg(windows)]
use std::os::windows::process::CommandExt;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio::process::{Child, Command};
use tracing::{debug, warn};

/// Grace period between SIGTERM and SIGKILL
const SHUTDOWN_GRACE: Duration = Duration::from_secs(2);

/// Environment variable overriding the core binary location
const BINARY_ENV: &str = "EDGESCAN_XRAY";

/// Locates the proxy-core binary and spawns per-probe tunnel processes
pub struct CoreSupervisor {
    binary: PathBuf,
    config_dir: PathBuf,
    spawned: AtomicU64,
}

impl CoreSupervisor {
    /// Locate the core binary via the platform search path
    ///
    /// Order: `EDGESCAN_XRAY` env var, alongside the current executable,
    /// `<app_dir>/xray_core/`, then bare `xray` resolved through `PATH`.
    /// A missing binary is not fatal here; the per-probe spawn will fail and
    /// the candidate is classified, not the scan.
    pub fn locate(app_dir: &Path) -> Self {
        let name = binary_name();

        let mut candidates: Vec<PathBuf> = Vec::new();
        if let Ok(env_path) = std::env::var(BINARY_ENV) {
            candidates.push(PathBuf::from(env_path));
        }
        if let Ok(exe) = std::env::current_exe() {
            if let Some(dir) = exe.parent() {
                candidates.push(dir.join(name));
            }
        }
        candidates.push(app_dir.join("xray_core").join(name));

        let binary = candidates
            .into_iter()
            .find(|p| p.is_file())
            .unwrap_or_else(|| {
                debug!("proxy core not found near app dir, relying on PATH");
                PathBuf::from(name)
            });

        Self::with_binary(binary, app_dir.to_path_buf())
    }

    /// Use an explicit binary path (CLI `--xray-path` override, tests)
    pub fn with_binary(binary: PathBuf, config_dir: PathBuf) -> Self {
        ensure_executable(&binary);
        Self {
            binary,
            config_dir,
            spawned: AtomicU64::new(0),
        }
    }

    pub fn binary(&self) -> &Path {
        &self.binary
    }

    /// How many core processes this supervisor has spawned
    pub fn spawn_count(&self) -> u64 {
        self.spawned.load(Ordering::Relaxed)
    }

    /// Write `config` to `config_<tag>.json` and spawn the core on it
    pub async fn launch(&self, config: &Value, tag: &str) -> Result<CoreProcess> {
        let config_path = self.config_dir.join(format!("config_{}.json", tag));
        let body = serde_json::to_vec_pretty(config)?;
        tokio::fs::write(&config_path, body).await?;

        let mut cmd = Command::new(&self.binary);
        cmd.arg("-c")
            .arg(&config_path)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null());

        #[cfg(unix)]
        cmd.process_group(0);

        #[cfg(windows)]
        cmd.creation_flags(0x0800_0000); // CREATE_NO_WINDOW

        let child = match cmd.spawn() {
            Ok(child) => child,
            Err(e) => {
                // Spawn failed: nothing to reap, but the config must not leak
                let _ = tokio::fs::remove_file(&config_path).await;
                return Err(Error::ProxyCore(format!(
                    "failed to spawn {}: {}",
                    self.binary.display(),
                    e
                )));
            }
        };

        self.spawned.fetch_add(1, Ordering::Relaxed);
        let pid = child.id();
        debug!("spawned proxy core pid={:?} config={}", pid, config_path.display());

        Ok(CoreProcess {
            child,
            pid,
            config_path,
        })
    }
}

/// A running proxy-core process tied to one probe
///
/// Call [`CoreProcess::shutdown`] on every exit path; it never fails, only
/// logs. No probe may outlive its core process.
#[derive(Debug)]
pub struct CoreProcess {
    child: Child,
    pid: Option<u32>,
    config_path: PathBuf,
}

impl CoreProcess {
    pub fn pid(&self) -> Option<u32> {
        self.pid
    }

    /// Terminate the process tree and delete the config file
    pub async fn shutdown(mut self) {
        self.terminate_tree().await;
        if let Err(e) = tokio::fs::remove_file(&self.config_path).await {
            if e.kind() != std::io::ErrorKind::NotFound {
                warn!("failed to remove {}: {}", self.config_path.display(), e);
            }
        }
    }

    #[cfg(unix)]
    async fn terminate_tree(&mut self) {
        if let Some(pid) = self.pid {
            // The child was spawned in its own process group, so signalling
            // the group reaps grandchildren too.
            unsafe {
                libc::killpg(pid as i32, libc::SIGTERM);
            }
            match tokio::time::timeout(SHUTDOWN_GRACE, self.child.wait()).await {
                Ok(_) => return,
                Err(_) => {
                    warn!("proxy core pid={} ignored SIGTERM, killing group", pid);
                    unsafe {
                        libc::killpg(pid as i32, libc::SIGKILL);
                    }
                }
            }
        }
        if let Err(e) = self.child.kill().await {
            debug!("proxy core kill: {}", e);
        }
    }

    #[cfg(windows)]
    async fn terminate_tree(&mut self) {
        if let Some(pid) = self.pid {
            // taskkill /T is the only reliable way to cut the child tree
            let result = Command::new("taskkill")
                .args(["/PID", &pid.to_string(), "/T", "/F"])
                .stdout(Stdio::null())
                .stderr(Stdio::null())
                .status()
                .await;
            if let Err(e) = result {
                warn!("taskkill for pid {} failed: {}", pid, e);
            }
        }
        if let Err(e) = self.child.kill().await {
            debug!("proxy core kill: {}", e);
        }
        let _ = self.child.wait().await;
    }
}

fn binary_name() -> &'static str {
    if cfg!(windows) {
        "xray.exe"
    } else {
        "xray"
    }
}

/// Make sure the located binary carries execute permission bits
#[cfg(unix)]
fn ensure_executable(path: &Path) {
    use std::os::unix::fs::PermissionsExt;

    if let Ok(meta) = std::fs::metadata(path) {
        let mut perms = meta.permissions();
        if perms.mode() & 0o111 == 0 {
            perms.set_mode(perms.mode() | 0o755);
            if let Err(e) = std::fs::set_permissions(path, perms) {
                warn!("cannot set execute bit on {}: {}", path.display(), e);
            }
        }
    }
}

#[cfg(not(unix))]
fn ensure_executable(_path: &Path) {}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn test_launch_missing_binary_cleans_up() {
        let dir = tempfile::tempdir().unwrap();
        let supervisor = CoreSupervisor::with_binary(
            dir.path().join("definitely-not-here"),
            dir.path().to_path_buf(),
        );

        let err = supervisor
            .launch(&json!({"log": {"loglevel": "none"}}), "1.2.3.4_10500")
            .await
            .unwrap_err();
        assert!(matches!(err, Error::ProxyCore(_)));
        assert_eq!(supervisor.spawn_count(), 0);

        // The config written before the failed spawn must not remain
        assert!(!dir.path().join("config_1.2.3.4_10500.json").exists());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_launch_and_shutdown_removes_config() {
        let dir = tempfile::tempdir().unwrap();
        // Any spawnable binary works for lifecycle purposes
        let supervisor =
            CoreSupervisor::with_binary(PathBuf::from("/bin/sleep"), dir.path().to_path_buf());

        let process = supervisor
            .launch(&json!({"inbounds": []}), "198.51.100.7_11000")
            .await
            .unwrap();

        assert_eq!(supervisor.spawn_count(), 1);
        let config_path = dir.path().join("config_198.51.100.7_11000.json");
        assert!(config_path.exists());
        assert!(process.pid().is_some());

        process.shutdown().await;
        assert!(!config_path.exists());
    }

    #[test]
    fn test_locate_falls_back_to_path() {
        let dir = tempfile::tempdir().unwrap();
        let supervisor = CoreSupervisor::locate(dir.path());
        // Nothing exists near the temp dir, so PATH resolution is used
        assert_eq!(supervisor.binary(), Path::new(binary_name()));
    }
}
