//! Running local conversion tools (pdftoppm, tesseract, ImageMagick)
//!
//! Children are killed when the future running them is dropped, so a caller's
//! timeout also stops the tool.

use std::ffi::OsStr;
use std::process::{Output, Stdio};
use tokio::process::Command;

use crate::error::{Error, Result};

/// Check whether `program` can be spawned
pub fn tool_available(program: &str, version_flag: &str) -> bool {
    // several poppler tools print their version to stderr and exit non-zero
    std::process::Command::new(program)
        .arg(version_flag)
        .stdin(Stdio::null())
        .output()
        .is_ok()
}

/// Run a tool to completion, failing on a non-zero exit
///
/// A missing binary is a `Permanent` error.
pub async fn run_tool<I, S>(program: &str, args: I) -> Result<Output>
where
    I: IntoIterator<Item = S>,
    S: AsRef<OsStr>,
{
    let output = Command::new(program)
        .args(args)
        .stdin(Stdio::null())
        .kill_on_drop(true)
        .output()
        .await
        .map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                Error::permanent(format!("{} is not installed", program))
            } else {
                Error::transient(format!("Failed to run {}: {}", program, e))
            }
        })?;

    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        return Err(Error::permanent(format!(
            "{} exited with {}: {}",
            program,
            output.status,
            stderr.trim()
        )));
    }

    Ok(output)
}
