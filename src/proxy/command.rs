use std::{path::Path, process::Stdio, time::Duration};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CommandError {
    Empty,
    Spawn { program: String, details: String },
    Timeout { program: String },
    Failed { program: String, status: String, stderr: String },
}

impl std::fmt::Display for CommandError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Empty => write!(f, "empty command"),
            Self::Spawn { program, details } => write!(f, "spawn {program}: {details}"),
            Self::Timeout { program } => write!(f, "timeout running {program}"),
            Self::Failed {
                program,
                status,
                stderr,
            } => {
                if stderr.is_empty() {
                    write!(f, "{program} exited with {status}")
                } else {
                    write!(f, "{program} exited with {status}: {stderr}")
                }
            }
        }
    }
}

impl std::error::Error for CommandError {}

/// Splits a command line on whitespace and substitutes `{config}`.
pub fn expand_command(template: &str, config_path: &Path) -> Vec<String> {
    let config = config_path.display().to_string();
    template
        .split_whitespace()
        .map(|part| part.replace("{config}", &config))
        .collect()
}

pub async fn run_command_with_timeout(argv: &[String], timeout: Duration) -> Result<(), CommandError> {
    let (program, args) = argv.split_first().ok_or(CommandError::Empty)?;
    let mut cmd = tokio::process::Command::new(program);
    cmd.args(args);
    cmd.stdin(Stdio::null());
    cmd.stdout(Stdio::null());
    cmd.stderr(Stdio::piped());
    cmd.kill_on_drop(true);

    let output = match tokio::time::timeout(timeout, cmd.output()).await {
        Ok(Ok(output)) => output,
        Ok(Err(err)) => {
            return Err(CommandError::Spawn {
                program: program.clone(),
                details: err.to_string(),
            });
        }
        Err(_) => {
            return Err(CommandError::Timeout {
                program: program.clone(),
            });
        }
    };

    if output.status.success() {
        return Ok(());
    }
    let stderr = String::from_utf8_lossy(&output.stderr);
    Err(CommandError::Failed {
        program: program.clone(),
        status: output.status.to_string(),
        stderr: stderr.trim().chars().take(512).collect(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn expand_command_substitutes_config_path() {
        let argv = expand_command("haproxy -c -f {config}", Path::new("/etc/haproxy/haproxy.cfg"));
        assert_eq!(argv, vec!["haproxy", "-c", "-f", "/etc/haproxy/haproxy.cfg"]);
    }

    #[tokio::test]
    async fn run_command_reports_success_and_failure() {
        run_command_with_timeout(&["true".to_string()], Duration::from_secs(5))
            .await
            .unwrap();

        let err = run_command_with_timeout(
            &["sh".to_string(), "-c".to_string(), "echo bad config >&2; exit 3".to_string()],
            Duration::from_secs(5),
        )
        .await
        .unwrap_err();
        match err {
            CommandError::Failed { stderr, .. } => assert_eq!(stderr, "bad config"),
            other => panic!("unexpected error: {other}"),
        }
    }

    #[tokio::test]
    async fn run_command_times_out() {
        let err = run_command_with_timeout(
            &["sleep".to_string(), "5".to_string()],
            Duration::from_millis(50),
        )
        .await
        .unwrap_err();
        assert!(matches!(err, CommandError::Timeout { .. }));
    }

    #[tokio::test]
    async fn missing_program_is_a_spawn_error() {
        let err = run_command_with_timeout(
            &["definitely-not-a-real-binary-edge-sync".to_string()],
            Duration::from_secs(1),
        )
        .await
        .unwrap_err();
        assert!(matches!(err, CommandError::Spawn { .. }));
        assert_eq!(
            run_command_with_timeout(&[], Duration::from_secs(1)).await,
            Err(CommandError::Empty)
        );
    }
}
