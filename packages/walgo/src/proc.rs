//! Child-process invocation with deadlines.
//!
//! Every external tool walgo drives (site-builder, walrus, sui, suiup) is
//! invoked through here so that deadlines and cancellation behave uniformly:
//! the child is spawned with `kill_on_drop`, so abandoning the future (via
//! timeout or caller cancellation) terminates the process.

use std::{fmt, process::Stdio, time::Duration};

use camino::Utf8Path;
use color_eyre::{
    Result,
    eyre::{Context, bail},
};
use tokio::process::Command;
use tracing::{instrument, trace};

/// Execute a binary with arguments, capturing stdout and stderr, enforcing
/// the provided deadline.
///
/// Returns the raw output regardless of exit status; callers decide whether
/// a non-zero exit is an error, since several tools report useful context on
/// stderr before failing.
#[instrument(skip(args))]
pub async fn invoke_output(
    binary: impl AsRef<Utf8Path> + fmt::Debug,
    args: impl IntoIterator<Item = impl AsRef<str>>,
    deadline: Duration,
) -> Result<std::process::Output> {
    let binary = binary.as_ref();
    let args = args.into_iter().map(|a| a.as_ref().to_string()).collect::<Vec<_>>();
    trace!(?binary, ?args, ?deadline, "invoke tool");

    let mut cmd = Command::new(binary.as_std_path());
    cmd.args(&args);
    cmd.stdin(Stdio::null());
    cmd.stdout(Stdio::piped());
    cmd.stderr(Stdio::piped());
    cmd.kill_on_drop(true);

    let child = cmd
        .spawn()
        .with_context(|| format!("spawn {binary}"))?;

    match tokio::time::timeout(deadline, child.wait_with_output()).await {
        Ok(output) => output.with_context(|| format!("complete {binary} execution")),
        Err(_) => bail!("{binary} did not complete within {deadline:?}"),
    }
}

/// Like [`invoke_output`], but a non-zero exit is an error carrying the
/// tool's stderr.
#[instrument(skip(args))]
pub async fn invoke_checked(
    binary: impl AsRef<Utf8Path> + fmt::Debug,
    args: impl IntoIterator<Item = impl AsRef<str>>,
    deadline: Duration,
) -> Result<std::process::Output> {
    let binary = binary.as_ref();
    let output = invoke_output(binary, args, deadline).await?;
    if !output.status.success() {
        bail!(
            "{binary} exited with status {}: {}",
            output.status,
            String::from_utf8_lossy(&output.stderr).trim()
        );
    }
    Ok(output)
}

/// The first line of a tool's stdout, lossily decoded.
pub fn first_stdout_line(output: &std::process::Output) -> String {
    String::from_utf8_lossy(&output.stdout)
        .lines()
        .next()
        .unwrap_or_default()
        .to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn captures_output() {
        let output = invoke_checked(
            Utf8Path::new("sh"),
            ["-c", "echo hello"],
            Duration::from_secs(5),
        )
        .await
        .unwrap();
        assert_eq!(first_stdout_line(&output), "hello");
    }

    #[tokio::test]
    async fn deadline_kills_the_child() {
        let result = invoke_output(
            Utf8Path::new("sh"),
            ["-c", "sleep 30"],
            Duration::from_millis(100),
        )
        .await;
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn nonzero_exit_is_an_error_when_checked() {
        let result = invoke_checked(
            Utf8Path::new("sh"),
            ["-c", "echo boom >&2; exit 3"],
            Duration::from_secs(5),
        )
        .await;
        let err = format!("{:#}", result.unwrap_err());
        assert!(err.contains("boom"), "stderr should be carried: {err}");
    }
}
