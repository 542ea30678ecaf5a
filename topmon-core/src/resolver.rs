use crate::catalog::MetricCatalog;
use crate::error::MonitorError;
use crate::transform::Transform;
use std::path::Path;
use std::time::Duration;
use tokio::process::Command;

/// Hard cap on shell-command execution, so a stuck probe cannot starve
/// its own monitor slot forever.
pub const DEFAULT_TIMEOUT_SECS: u64 = 10;

#[derive(Debug)]
pub struct ShellOutput {
    pub code: Option<i32>,
    pub stdout: String,
    pub stderr: String,
}

/// Run a command through the shell, capturing stdout/stderr/exit code.
pub async fn run_shell(cmd: &str, timeout_secs: u64) -> Result<ShellOutput, MonitorError> {
    let output = tokio::time::timeout(
        Duration::from_secs(timeout_secs),
        Command::new("sh")
            .arg("-c")
            .arg(cmd)
            .kill_on_drop(true)
            .output(),
    )
    .await
    .map_err(|_| MonitorError::Timeout { secs: timeout_secs })?
    .map_err(|e| MonitorError::ExecutionFailed {
        code: None,
        stderr: e.to_string(),
    })?;

    Ok(ShellOutput {
        code: output.status.code(),
        stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
        stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
    })
}

/// Strict decimal parse: optional single leading sign, at most one `.`,
/// digits otherwise. Anything else is "not a value" even on exit code 0.
pub fn parse_numeric(raw: &str) -> Result<f64, MonitorError> {
    let trimmed = raw.trim();
    let unsigned = trimmed
        .strip_prefix('-')
        .or_else(|| trimmed.strip_prefix('+'))
        .unwrap_or(trimmed);

    let shape_ok = unsigned.chars().any(|c| c.is_ascii_digit())
        && unsigned.chars().all(|c| c.is_ascii_digit() || c == '.')
        && unsigned.matches('.').count() <= 1;

    if !shape_ok {
        return Err(MonitorError::NotANumber {
            output: trimmed.to_string(),
        });
    }

    trimmed.parse().map_err(|_| MonitorError::NotANumber {
        output: trimmed.to_string(),
    })
}

/// Execute a shell-command monitor: exit 0, empty stderr, numeric stdout.
pub async fn resolve_shell(cmd: &str, timeout_secs: u64) -> Result<f64, MonitorError> {
    let out = run_shell(cmd, timeout_secs).await?;
    if out.code != Some(0) || !out.stderr.is_empty() {
        return Err(MonitorError::ExecutionFailed {
            code: out.code,
            stderr: out.stderr,
        });
    }
    parse_numeric(&out.stdout)
}

/// Resolve a built-in metric key through the catalog.
pub fn resolve_builtin(catalog: &MetricCatalog, key: &str) -> Result<f64, MonitorError> {
    catalog
        .probe(key)
        .ok_or_else(|| MonitorError::SensorUnavailable {
            key: key.to_string(),
        })
}

/// Turn the first capture group of a stream match into a sample value,
/// applying the monitor's transform when one is declared.
pub fn resolve_capture(raw: &str, transform: Option<&Transform>) -> Result<f64, MonitorError> {
    let value = parse_numeric(raw)?;
    match transform {
        None => Ok(value),
        Some(t) => {
            let out = t.apply(value);
            if out.is_finite() {
                Ok(out)
            } else {
                Err(MonitorError::TransformFailed {
                    expr: t.expr().to_string(),
                    reason: format!("non-finite result for input {value}"),
                })
            }
        }
    }
}

/// Check that the executable named by the command's first token can be
/// located, either as an existing path or on the PATH via `which`.
pub async fn locate_command(cmd: &str) -> Result<(), MonitorError> {
    let first = cmd.split_whitespace().next().unwrap_or("");
    if first.is_empty() {
        return Err(MonitorError::CommandNotFound {
            command: cmd.to_string(),
        });
    }
    if Path::new(first).exists() {
        return Ok(());
    }
    let found = Command::new("which")
        .arg(first)
        .output()
        .await
        .map(|out| out.status.success())
        .unwrap_or(false);
    if found {
        Ok(())
    } else {
        Err(MonitorError::CommandNotFound {
            command: first.to_string(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_plain_decimals() {
        assert_eq!(parse_numeric("42.50\n").unwrap(), 42.5);
        assert_eq!(parse_numeric("7").unwrap(), 7.0);
        assert_eq!(parse_numeric("-3.25").unwrap(), -3.25);
        assert_eq!(parse_numeric("+10").unwrap(), 10.0);
    }

    #[test]
    fn rejects_non_values() {
        assert!(matches!(
            parse_numeric("abc"),
            Err(MonitorError::NotANumber { .. })
        ));
        assert!(parse_numeric("1.2.3").is_err());
        assert!(parse_numeric("").is_err());
        assert!(parse_numeric(".").is_err());
        assert!(parse_numeric("4e2").is_err());
        assert!(parse_numeric("12 34").is_err());
    }

    #[test]
    fn capture_applies_transform() {
        let t = Transform::parse("X/255*100").unwrap();
        let v = resolve_capture("128", Some(&t)).unwrap();
        assert!((v - 50.196).abs() < 0.001);
        assert_eq!(resolve_capture("128", None).unwrap(), 128.0);
    }

    #[tokio::test]
    async fn shell_success_and_not_a_number() {
        assert_eq!(
            resolve_shell("echo 42.50", DEFAULT_TIMEOUT_SECS).await.unwrap(),
            42.5
        );
        assert!(matches!(
            resolve_shell("echo abc", DEFAULT_TIMEOUT_SECS).await,
            Err(MonitorError::NotANumber { .. })
        ));
    }

    #[tokio::test]
    async fn shell_failure_classes() {
        assert!(matches!(
            resolve_shell("exit 3", DEFAULT_TIMEOUT_SECS).await,
            Err(MonitorError::ExecutionFailed { code: Some(3), .. })
        ));
        assert!(matches!(
            resolve_shell("echo oops >&2", DEFAULT_TIMEOUT_SECS).await,
            Err(MonitorError::ExecutionFailed { .. })
        ));
        assert!(matches!(
            resolve_shell("sleep 5", 1).await,
            Err(MonitorError::Timeout { secs: 1 })
        ));
    }

    #[tokio::test]
    async fn locates_commands() {
        assert!(locate_command("echo hi").await.is_ok());
        assert!(matches!(
            locate_command("/no/such/binary --flag").await,
            Err(MonitorError::CommandNotFound { .. })
        ));
    }
}
