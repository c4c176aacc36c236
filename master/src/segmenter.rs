// master/src/segmenter.rs

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use glob::glob;
use sumflow::{SegmentLocation, Segmenter, SplitError};
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tracing::{debug, info};

use sumflow::config::{env_or, env_string};

/// Deja la fuente en disco y devuelve su ruta.
///
/// Una ruta local se usa tal cual. Una URL http(s) se baja por partes a
/// `workdir/source`, sin tenerla entera en memoria.
pub async fn local_source(
    client: &reqwest::Client,
    source_ref: &str,
    workdir: &Path,
) -> Result<PathBuf, SplitError> {
    if !is_url(source_ref) {
        let path = PathBuf::from(source_ref);
        let meta = tokio::fs::metadata(&path)
            .await
            .map_err(|e| unreadable(source_ref, e))?;
        if !meta.is_file() {
            return Err(unreadable(source_ref, "no es un archivo"));
        }
        return Ok(path);
    }

    let mut resp = client
        .get(source_ref)
        .send()
        .await
        .map_err(|e| unreadable(source_ref, e))?;
    if !resp.status().is_success() {
        return Err(SplitError::SourceUnreadable(format!(
            "{}: HTTP {}",
            source_ref,
            resp.status()
        )));
    }

    let path = workdir.join("source");
    let mut file = tokio::fs::File::create(&path)
        .await
        .map_err(|e| unreadable(source_ref, e))?;
    let mut total = 0usize;
    while let Some(chunk) = resp.chunk().await.map_err(|e| unreadable(source_ref, e))? {
        total += chunk.len();
        file.write_all(&chunk)
            .await
            .map_err(|e| unreadable(source_ref, e))?;
    }
    file.flush().await.map_err(|e| unreadable(source_ref, e))?;
    debug!("{}: {} bytes descargados en {}", source_ref, total, path.display());
    Ok(path)
}

fn is_url(source_ref: &str) -> bool {
    source_ref.starts_with("http://") || source_ref.starts_with("https://")
}

fn unreadable(source_ref: &str, e: impl std::fmt::Display) -> SplitError {
    SplitError::SourceUnreadable(format!("{}: {}", source_ref, e))
}

/* ---------------- por rangos de bytes ---------------- */

/// Parte la fuente en rangos de `chunk_bytes` (el último puede ser más corto).
/// No lee nada: sólo calcula offsets sobre el archivo.
pub struct ByteRangeSegmenter {
    client: reqwest::Client,
    chunk_bytes: u64,
}

impl ByteRangeSegmenter {
    pub fn new(client: reqwest::Client, chunk_bytes: u64) -> Self {
        Self {
            client,
            chunk_bytes: chunk_bytes.max(1),
        }
    }
}

fn byte_ranges(path: &Path, total: u64, chunk: u64) -> Vec<SegmentLocation> {
    (0..total)
        .step_by(chunk as usize)
        .map(|offset| SegmentLocation::range(path, offset, chunk.min(total - offset)))
        .collect()
}

#[async_trait]
impl Segmenter for ByteRangeSegmenter {
    async fn segment(
        &self,
        source_ref: &str,
        workdir: &Path,
    ) -> Result<Vec<SegmentLocation>, SplitError> {
        let path = local_source(&self.client, source_ref, workdir).await?;
        let total = tokio::fs::metadata(&path)
            .await
            .map_err(|e| unreadable(source_ref, e))?
            .len();
        let ranges = byte_ranges(&path, total, self.chunk_bytes);
        debug!(
            "{}: {} bytes en {} segmentos de hasta {}",
            source_ref,
            total,
            ranges.len(),
            self.chunk_bytes
        );
        Ok(ranges)
    }
}

/* ---------------- por tiempo, con ffmpeg ---------------- */

/// Corta el video en trozos de `segment_time` con `ffmpeg -f segment -c copy`.
pub struct FfmpegSegmenter {
    client: reqwest::Client,
    segment_time: Duration,
    ffmpeg: String,
}

impl FfmpegSegmenter {
    pub fn new(client: reqwest::Client, segment_time: Duration) -> Self {
        Self {
            client,
            segment_time,
            ffmpeg: "ffmpeg".to_string(),
        }
    }
}

#[async_trait]
impl Segmenter for FfmpegSegmenter {
    async fn segment(
        &self,
        source_ref: &str,
        workdir: &Path,
    ) -> Result<Vec<SegmentLocation>, SplitError> {
        // ffmpeg podría leer la URL directo, pero así los errores de red son SourceUnreadable
        let input = local_source(&self.client, source_ref, workdir).await?;
        let pattern = workdir.join("chunk_%05d.mp4");

        info!(
            "partiendo {} con ffmpeg en trozos de {:?}",
            source_ref, self.segment_time
        );
        let output = Command::new(&self.ffmpeg)
            .arg("-hide_banner")
            .args(["-loglevel", "error"])
            .arg("-i")
            .arg(&input)
            .args(["-c", "copy", "-map", "0", "-f", "segment"])
            .arg("-segment_time")
            .arg(self.segment_time.as_secs().max(1).to_string())
            .arg(&pattern)
            .output()
            .await
            .map_err(|e| unreadable(source_ref, format!("no se pudo ejecutar ffmpeg: {}", e)))?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(unreadable(source_ref, stderr.trim()));
        }

        let chunk_glob = workdir.join("chunk_*.mp4");
        let mut chunks: Vec<PathBuf> = glob(&chunk_glob.to_string_lossy())
            .map_err(|e| unreadable(source_ref, e))?
            .flatten()
            .collect();
        // el nombre lleva el índice con ceros a la izquierda
        chunks.sort();

        let mut locations = Vec::with_capacity(chunks.len());
        for chunk in chunks {
            let location = SegmentLocation::whole_file(chunk)
                .await
                .map_err(|e| unreadable(source_ref, e))?;
            locations.push(location);
        }
        Ok(locations)
    }
}

/// Elige el segmentador según `SEGMENTER` (`bytes` o `ffmpeg`).
pub fn from_env(client: reqwest::Client) -> anyhow::Result<Arc<dyn Segmenter>> {
    let kind = env_string("SEGMENTER", "bytes");
    match kind.as_str() {
        "bytes" => Ok(Arc::new(ByteRangeSegmenter::new(
            client,
            env_or("SEGMENT_BYTES", 8 * 1024 * 1024),
        ))),
        "ffmpeg" => Ok(Arc::new(FfmpegSegmenter::new(
            client,
            Duration::from_secs(env_or("SEGMENT_SECONDS", 600)),
        ))),
        other => anyhow::bail!("SEGMENTER desconocido: {} (usar bytes o ffmpeg)", other),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn byte_ranges_keep_order_and_remainder() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("audio.bin");
        tokio::fs::write(&path, b"aaabbbc").await.unwrap();

        let work = tempfile::tempdir().unwrap();
        let seg = ByteRangeSegmenter::new(reqwest::Client::new(), 3);
        let locations = seg
            .segment(&path.to_string_lossy(), work.path())
            .await
            .unwrap();

        // fuente local: rangos sobre el mismo archivo, sin copias
        assert!(locations.iter().all(|l| l.path == path));
        assert_eq!(
            locations.iter().map(|l| (l.offset, l.len)).collect::<Vec<_>>(),
            vec![(0, 3), (3, 3), (6, 1)]
        );

        let mut parts = Vec::new();
        for l in &locations {
            parts.push(seg.read(l).await.unwrap());
        }
        assert_eq!(parts, vec![b"aaa".to_vec(), b"bbb".to_vec(), b"c".to_vec()]);
    }

    #[tokio::test]
    async fn empty_source_gives_no_segments() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("vacio.bin");
        tokio::fs::write(&path, b"").await.unwrap();

        let seg = ByteRangeSegmenter::new(reqwest::Client::new(), 3);
        assert!(seg
            .segment(&path.to_string_lossy(), dir.path())
            .await
            .unwrap()
            .is_empty());
    }

    #[tokio::test]
    async fn missing_file_is_unreadable() {
        let work = tempfile::tempdir().unwrap();
        let seg = ByteRangeSegmenter::new(reqwest::Client::new(), 3);
        let err = seg
            .segment("/no/existe/video.mp4", work.path())
            .await
            .unwrap_err();
        assert!(matches!(err, SplitError::SourceUnreadable(m) if m.contains("/no/existe")));
    }

    #[tokio::test]
    async fn directory_is_not_a_source() {
        let dir = tempfile::tempdir().unwrap();
        let seg = ByteRangeSegmenter::new(reqwest::Client::new(), 3);
        let err = seg
            .segment(&dir.path().to_string_lossy(), dir.path())
            .await
            .unwrap_err();
        assert!(matches!(err, SplitError::SourceUnreadable(_)));
    }

    #[tokio::test]
    async fn ffmpeg_failure_is_unreadable() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("video.mp4");
        tokio::fs::write(&path, b"no es video").await.unwrap();

        let seg = FfmpegSegmenter {
            client: reqwest::Client::new(),
            segment_time: Duration::from_secs(10),
            ffmpeg: "/no/existe/ffmpeg".to_string(),
        };
        let err = seg
            .segment(&path.to_string_lossy(), dir.path())
            .await
            .unwrap_err();
        assert!(matches!(err, SplitError::SourceUnreadable(_)));
    }
}
