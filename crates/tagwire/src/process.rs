use std::{process::Stdio, time::Duration};

use tokio::process::{Child, Command};
use tracing::debug;

use crate::{ChannelConfig, ChannelError, StderrMode};

pub(crate) fn build_command(config: &ChannelConfig) -> Command {
    let mut command = Command::new(&config.program);
    command
        .args(&config.args)
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(match config.stderr {
            StderrMode::Inherit => Stdio::inherit(),
            StderrMode::Null => Stdio::null(),
        })
        .kill_on_drop(true);

    if let Some(dir) = &config.current_dir {
        command.current_dir(dir);
    }

    if config.clear_env {
        command.env_clear();
    }

    for (key, value) in &config.env {
        command.env(key, value);
    }

    command
}

/// Spawns `command`, retrying briefly while the executable is busy (a script that was
/// just written may still be open for writing elsewhere).
pub(crate) async fn spawn_with_retry(
    command: &mut Command,
    config: &ChannelConfig,
) -> Result<Child, ChannelError> {
    let mut backoff = Duration::from_millis(2);
    let mut attempt = 0;
    loop {
        match command.spawn() {
            Ok(child) => return Ok(child),
            Err(source) => {
                // ETXTBSY
                let is_busy = source.raw_os_error() == Some(26);
                if is_busy && attempt < 4 {
                    debug!(attempt, "executable busy, retrying spawn");
                    tokio::time::sleep(backoff).await;
                    backoff = std::cmp::min(backoff * 2, Duration::from_millis(50));
                    attempt += 1;
                    continue;
                }
                return Err(ChannelError::Spawn {
                    command: config.describe(),
                    source,
                });
            }
        }
    }
}
