use std::time::Duration;

use tokio::process::Command;
use tracing::{debug, warn};

/// Resolve the head commit of a remote branch via `git ls-remote`.
///
/// Any failure (timeout, non-zero exit, unknown branch, unparseable output)
/// returns `None`; cache-key derivation substitutes a fallback marker
/// instead of failing the whole operation.
pub async fn remote_head(repo_url: &str, branch: &str, timeout: Duration) -> Option<String> {
    let refspec = format!("refs/heads/{}", branch);
    debug!(repo = repo_url, branch, "resolving remote head");

    let result = tokio::time::timeout(
        timeout,
        Command::new("git")
            .arg("ls-remote")
            .arg(repo_url)
            .arg(&refspec)
            .output(),
    )
    .await;

    let output = match result {
        Ok(Ok(output)) => output,
        Ok(Err(e)) => {
            warn!(repo = repo_url, branch, error = %e, "git ls-remote failed to run");
            return None;
        }
        Err(_) => {
            warn!(repo = repo_url, branch, "git ls-remote timed out");
            return None;
        }
    };

    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        warn!(repo = repo_url, branch, stderr = %stderr.trim(), "git ls-remote failed");
        return None;
    }

    let stdout = String::from_utf8_lossy(&output.stdout);
    match parse_ls_remote(&stdout) {
        Some(commit) => {
            debug!(repo = repo_url, branch, commit = %commit, "resolved remote head");
            Some(commit)
        }
        None => {
            warn!(repo = repo_url, branch, "branch not found on remote");
            None
        }
    }
}

/// Extract the commit hash from `git ls-remote` output
/// (`<hash>\t<refname>` on the first line).
fn parse_ls_remote(output: &str) -> Option<String> {
    let first = output.lines().next()?;
    let hash = first.split_whitespace().next()?;
    if hash.len() == 40 && hash.chars().all(|c| c.is_ascii_hexdigit()) {
        Some(hash.to_string())
    } else {
        None
    }
}
