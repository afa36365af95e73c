#![forbid(unsafe_code)]

//! Process-level guards shared by the mediagrab binaries.

use anyhow::{Result, bail};
use nix::unistd::Uid;

/// Fails fast when the server is started as root. It spawns an external
/// downloader on arbitrary user-supplied URLs and writes whatever comes back
/// to disk, so it must run under an unprivileged account.
pub fn ensure_not_root(process: &str) -> Result<()> {
    if Uid::current().is_root() {
        bail!("{process} must not be run as root; start it from an unprivileged account");
    }
    Ok(())
}
