// master/src/aggregator.rs

use std::process::Stdio;
use std::sync::Arc;

use anyhow::{bail, Context};
use async_trait::async_trait;
use sumflow::Aggregator;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tracing::{debug, info};

fn join(texts: &[String]) -> String {
    texts.join("\n")
}

/// Concatena los textos en orden, uno por línea.
pub struct ConcatAggregator;

#[async_trait]
impl Aggregator for ConcatAggregator {
    async fn aggregate(&self, texts: &[String]) -> anyhow::Result<String> {
        Ok(join(texts))
    }
}

/// Pasa el texto unido por stdin a un comando externo (`sh -c`) y usa su
/// stdout como resumen final.
pub struct CommandAggregator {
    command: String,
}

impl CommandAggregator {
    pub fn new(command: impl Into<String>) -> Self {
        Self {
            command: command.into(),
        }
    }
}

#[async_trait]
impl Aggregator for CommandAggregator {
    async fn aggregate(&self, texts: &[String]) -> anyhow::Result<String> {
        let input = join(texts);
        info!(
            "resumiendo {} textos ({} bytes) con '{}'",
            texts.len(),
            input.len(),
            self.command
        );

        let mut child = Command::new("sh")
            .arg("-c")
            .arg(&self.command)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .with_context(|| format!("no se pudo lanzar '{}'", self.command))?;

        if let Some(mut stdin) = child.stdin.take() {
            // un comando que no lee stdin cierra el pipe; lo que importa es su exit code
            if let Err(e) = stdin.write_all(input.as_bytes()).await {
                debug!("'{}' no consumió stdin: {}", self.command, e);
            }
            drop(stdin);
        }

        let output = child.wait_with_output().await?;
        if !output.status.success() {
            bail!(
                "'{}' terminó con {}: {}",
                self.command,
                output.status,
                String::from_utf8_lossy(&output.stderr).trim()
            );
        }
        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }
}

/// `AGGREGATE_CMD` definido -> CommandAggregator; si no, concatenación.
pub fn from_env() -> Arc<dyn Aggregator> {
    match std::env::var("AGGREGATE_CMD") {
        Ok(cmd) if !cmd.trim().is_empty() => Arc::new(CommandAggregator::new(cmd)),
        _ => Arc::new(ConcatAggregator),
    }
}
