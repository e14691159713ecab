use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use tracing::{debug, warn};

/// Single-instance guard backed by a file holding our PID.
///
/// The file is removed when the guard is dropped.
#[derive(Debug)]
pub struct PidFile {
    path: Option<PathBuf>,
}

impl PidFile {
    /// Claims `path` for this process. An empty path disables the guard.
    ///
    /// Fails if the file names a process that is still running. A file
    /// naming a dead process, or holding garbage, is replaced.
    pub fn acquire(path: &Path) -> Result<Self> {
        if path.as_os_str().is_empty() {
            return Ok(Self { path: None });
        }

        match fs::read_to_string(path) {
            Ok(content) => match content.trim().parse::<u32>() {
                Ok(pid) if process_alive(pid) => {
                    bail!(
                        "another instance is running (pid {pid}, pid file {})",
                        path.display()
                    );
                }
                Ok(pid) => debug!(pid, path = %path.display(), "replacing stale pid file"),
                Err(_) => warn!(path = %path.display(), "replacing unreadable pid file"),
            },
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => {
                return Err(e).with_context(|| format!("reading pid file {}", path.display()));
            }
        }

        fs::write(path, format!("{}\n", std::process::id()))
            .with_context(|| format!("writing pid file {}", path.display()))?;

        Ok(Self {
            path: Some(path.to_path_buf()),
        })
    }

    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }
}

impl Drop for PidFile {
    fn drop(&mut self) {
        if let Some(path) = &self.path {
            if let Err(e) = fs::remove_file(path) {
                warn!(error = %e, path = %path.display(), "removing pid file");
            }
        }
    }
}

fn process_alive(pid: u32) -> bool {
    pid != 0 && Path::new(&format!("/proc/{pid}")).exists()
}
