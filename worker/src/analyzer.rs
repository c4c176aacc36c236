use std::process::Stdio;
use std::time::Duration;

use anyhow::{bail, Context};
use async_trait::async_trait;
use sumflow::Analyzer;
use tokio::process::Command;
use tracing::debug;

/// Corre `ANALYZE_CMD <archivo>` sobre los bytes del segmento y devuelve su stdout.
///
/// El segmento se escribe a un archivo temporal que se borra al terminar.
/// Un exit code distinto de cero o un timeout es un fallo reintentable.
pub struct CommandAnalyzer {
    command: String,
    timeout: Duration,
}

impl CommandAnalyzer {
    pub fn new(command: impl Into<String>, timeout: Duration) -> Self {
        Self {
            command: command.into(),
            timeout,
        }
    }
}

#[async_trait]
impl Analyzer for CommandAnalyzer {
    async fn analyze(&self, segment: &[u8]) -> anyhow::Result<String> {
        let file = tempfile::NamedTempFile::new().context("creando archivo temporal")?;
        tokio::fs::write(file.path(), segment)
            .await
            .with_context(|| format!("escribiendo {}", file.path().display()))?;

        debug!(
            "analizando {} bytes con '{}' ({})",
            segment.len(),
            self.command,
            file.path().display()
        );

        // la ruta llega como $0 para no tener que escaparla
        let child = Command::new("sh")
            .arg("-c")
            .arg(format!("{} \"$0\"", self.command))
            .arg(file.path())
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .with_context(|| format!("no se pudo lanzar '{}'", self.command))?;

        let output = match tokio::time::timeout(self.timeout, child.wait_with_output()).await {
            Ok(res) => res?,
            Err(_) => bail!("'{}' no terminó en {:?}", self.command, self.timeout),
        };

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
