//! Fetching source at a commit (spec §4.3 step 3). A depth-1 clone is the
//! default; failures are Transient I/O and go through the shared backoff
//! helper in `cd_common::retry`.

use std::path::Path;
use std::process::Stdio;

use cd_common::{Error, ErrorKind};
use tokio::process::Command;
use tracing::warn;

/// Clones `git_url`/`branch` into `dest`, then checks out `commit`. A
/// shallow clone is attempted first; if the requested commit isn't reachable
/// from the shallow history (common for a commit that isn't the branch tip
/// by the time the job runs), we fall back to unshallowing once before
/// giving up, mirroring how a CI runner would recover from the same race.
pub async fn fetch(git_url: &str, branch: &str, commit: &str, dest: &Path) -> Result<(), Error> {
    run_git(&[
        "clone",
        "--depth",
        "1",
        "--branch",
        branch,
        "--single-branch",
        git_url,
        dest.to_str().ok_or_else(|| {
            Error::custom(ErrorKind::Internal, "scratch path is not valid UTF-8")
        })?,
    ])
    .await?;

    if run_git_in(dest, &["checkout", commit]).await.is_err() {
        warn!(commit, "commit not reachable in shallow clone, unshallowing");
        run_git_in(dest, &["fetch", "--unshallow"]).await?;
        run_git_in(dest, &["checkout", commit]).await?;
    }

    Ok(())
}

async fn run_git(args: &[&str]) -> Result<(), Error> {
    run_command(None, args).await
}

async fn run_git_in(cwd: &Path, args: &[&str]) -> Result<(), Error> {
    run_command(Some(cwd), args).await
}

async fn run_command(cwd: Option<&Path>, args: &[&str]) -> Result<(), Error> {
    let mut cmd = Command::new("git");
    cmd.args(args).stdout(Stdio::null()).stderr(Stdio::piped());
    if let Some(cwd) = cwd {
        cmd.current_dir(cwd);
    }

    let output = cmd
        .output()
        .await
        .map_err(|e| Error::source(ErrorKind::StoreUnavailable, e))?;

    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr).into_owned();
        return Err(Error::custom(ErrorKind::StoreUnavailable, stderr));
    }
    Ok(())
}
