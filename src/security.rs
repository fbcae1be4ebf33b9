#![forbid(unsafe_code)]

//! Process-level safety checks for the backend binary.

use anyhow::{Result, bail};
use nix::unistd::Uid;

/// Fails fast when the server is started as root. The downloader child
/// process inherits our privileges, so running unprivileged keeps stray
/// writes out of system directories.
pub fn ensure_not_root(process: &str) -> Result<()> {
    ensure_not_root_for(Uid::current(), process)
}

fn ensure_not_root_for(uid: Uid, process: &str) -> Result<()> {
    if uid.is_root() {
        bail!("{process} must not run as root; use a regular user or a dedicated service account");
    }
    Ok(())
}
