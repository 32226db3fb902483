use std::path::PathBuf;
use std::process::ExitStatus;

use async_trait::async_trait;
use log::{debug, info};
use thiserror::Error;
use tokio::process::Command;

use crate::messages::Transition;

#[derive(Debug, Error)]
pub enum NotifyError {
    #[error("failed to run {}: {source}", .command.display())]
    Spawn {
        command: PathBuf,
        source: std::io::Error,
    },
    #[error("{} exited with {status}\n{output}", .command.display())]
    Failed {
        command: PathBuf,
        status: ExitStatus,
        output: String,
    },
}

/// Receives occupancy transitions.
#[async_trait]
pub trait Notify: Send + Sync {
    async fn notify(&self, transition: &Transition) -> Result<(), NotifyError>;
}

/// Runs the user's notify command on occupancy transitions.
#[derive(Clone, Debug, Default)]
pub struct Notifier {
    command: Option<PathBuf>,
}

impl Notifier {
    pub fn new(command: Option<PathBuf>) -> Self {
        Notifier { command }
    }
}

#[async_trait]
impl Notify for Notifier {
    /// Invoke the command as `<command> here|away <seconds> "<d>d hh:mm:ss"`.
    /// Without a configured command this does nothing.
    async fn notify(&self, transition: &Transition) -> Result<(), NotifyError> {
        let Some(command) = &self.command else {
            return Ok(());
        };

        let keyword = transition.presence.keyword();
        info!("Calling notify [{}] with value [{keyword}]", command.display());

        let output = Command::new(command)
            .arg(keyword)
            .arg(transition.elapsed_seconds().to_string())
            .arg(transition.elapsed())
            .kill_on_drop(true)
            .output()
            .await
            .map_err(|source| NotifyError::Spawn {
                command: command.clone(),
                source,
            })?;

        let mut text = String::from_utf8_lossy(&output.stdout).into_owned();
        text.push_str(&String::from_utf8_lossy(&output.stderr));
        let text = text.trim_end().to_string();

        if !output.status.success() {
            return Err(NotifyError::Failed {
                command: command.clone(),
                status: output.status,
                output: text,
            });
        }

        if !text.is_empty() {
            debug!("** Start of response **\n{text}\n** End of response **");
        }
        Ok(())
    }
}

#[cfg(all(test, unix))]
mod tests {
    use chrono::{Local, TimeDelta, TimeZone as _, Utc};

    use super::*;
    use crate::messages::Presence;
    use crate::occupancy::Period;

    fn leaving() -> Transition {
        Transition {
            presence: Presence::Away,
            prior: None,
        }
    }

    #[tokio::test]
    async fn test_without_command_is_noop() {
        assert!(Notifier::default().notify(&leaving()).await.is_ok());
    }

    #[tokio::test]
    async fn test_successful_command() {
        let notifier = Notifier::new(Some(PathBuf::from("/bin/echo")));
        assert!(notifier.notify(&leaving()).await.is_ok());
    }

    #[tokio::test]
    async fn test_command_arguments() {
        use std::os::unix::fs::PermissionsExt;

        let dir = std::env::temp_dir().join(format!("autoaway-notify-{}", std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();
        let script = dir.join("notify.sh");
        let record = dir.join("args");
        std::fs::write(
            &script,
            format!(
                "#!/bin/sh\nprintf '%s|%s|%s|%s' \"$#\" \"$1\" \"$2\" \"$3\" > '{}'\n",
                record.display()
            ),
        )
        .unwrap();
        std::fs::set_permissions(&script, std::fs::Permissions::from_mode(0o755)).unwrap();

        let start = Utc.with_ymd_and_hms(2026, 3, 1, 8, 0, 0).unwrap().with_timezone(&Local);
        let transition = Transition {
            presence: Presence::Away,
            prior: Some(Period {
                start,
                end: start + TimeDelta::seconds(93_784),
            }),
        };
        let notifier = Notifier::new(Some(script));
        notifier.notify(&transition).await.unwrap();

        let args = std::fs::read_to_string(&record).unwrap();
        std::fs::remove_dir_all(&dir).unwrap();
        assert_eq!(args, "3|away|93784|1d 02:03:04");
    }

    #[tokio::test]
    async fn test_failing_command() {
        let notifier = Notifier::new(Some(PathBuf::from("/bin/false")));
        assert!(matches!(
            notifier.notify(&leaving()).await,
            Err(NotifyError::Failed { .. })
        ));
    }

    #[tokio::test]
    async fn test_missing_command() {
        let notifier = Notifier::new(Some(PathBuf::from("/nonexistent/autoaway-notify")));
        assert!(matches!(
            notifier.notify(&leaving()).await,
            Err(NotifyError::Spawn { .. })
        ));
    }
}
