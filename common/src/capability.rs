//! Capacidades externas que el pipeline invoca sin conocer su implementación:
//! partir la fuente, analizar un segmento y combinar los textos finales.

use std::io::SeekFrom;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use tokio::io::{AsyncReadExt, AsyncSeekExt};

use crate::error::SplitError;

/// Dónde están los bytes de un segmento: un rango `[offset, offset + len)`
/// de un archivo local.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SegmentLocation {
    pub path: PathBuf,
    pub offset: u64,
    pub len: u64,
}

impl SegmentLocation {
    pub fn range(path: impl Into<PathBuf>, offset: u64, len: u64) -> Self {
        Self {
            path: path.into(),
            offset,
            len,
        }
    }

    /// El archivo entero como un solo segmento.
    pub async fn whole_file(path: impl Into<PathBuf>) -> std::io::Result<Self> {
        let path = path.into();
        let len = tokio::fs::metadata(&path).await?.len();
        Ok(Self::range(path, 0, len))
    }

    /// Lee sólo este rango; el resto del archivo no pasa por memoria.
    pub async fn read(&self) -> std::io::Result<Vec<u8>> {
        let mut file = tokio::fs::File::open(&self.path).await?;
        file.seek(SeekFrom::Start(self.offset)).await?;
        let mut buf = vec![0u8; self.len as usize];
        file.read_exact(&mut buf).await?;
        Ok(buf)
    }
}

/// Parte la fuente en segmentos ordenados (el índice es la posición en el Vec).
///
/// Los archivos que haga falta crear van dentro de `workdir`, que el
/// dispatcher mantiene vivo hasta haber subido todos los segmentos.
#[async_trait]
pub trait Segmenter: Send + Sync {
    async fn segment(
        &self,
        source_ref: &str,
        workdir: &Path,
    ) -> Result<Vec<SegmentLocation>, SplitError>;

    async fn read(&self, location: &SegmentLocation) -> std::io::Result<Vec<u8>> {
        location.read().await
    }
}

/// Análisis de un segmento (transcripción, resumen parcial, etc.).
/// Puede ser lento y fallar; los errores se reintentan por re-entrega.
#[async_trait]
pub trait Analyzer: Send + Sync {
    async fn analyze(&self, segment: &[u8]) -> anyhow::Result<String>;
}

/// Combina los textos por segmento, en orden de índice, en el artefacto final.
#[async_trait]
pub trait Aggregator: Send + Sync {
    async fn aggregate(&self, texts: &[String]) -> anyhow::Result<String>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn reads_only_the_requested_range() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("fuente.bin");
        tokio::fs::write(&path, b"0123456789").await.unwrap();

        let loc = SegmentLocation::range(&path, 3, 4);
        assert_eq!(loc.read().await.unwrap(), b"3456");

        let whole = SegmentLocation::whole_file(&path).await.unwrap();
        assert_eq!(whole.len, 10);
        assert_eq!(whole.read().await.unwrap(), b"0123456789");
    }

    #[tokio::test]
    async fn range_past_the_end_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("corto.bin");
        tokio::fs::write(&path, b"abc").await.unwrap();

        let loc = SegmentLocation::range(&path, 2, 5);
        assert!(loc.read().await.is_err());
    }
}
