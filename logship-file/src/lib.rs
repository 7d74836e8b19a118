//! Rotating JSON-lines file sink for `logship`.
//!
//! One writer task owns the open file; callers hand it work over a channel,
//! so writes are fully serialized per file. Rotation fires on size or on a
//! calendar boundary, rotated segments are optionally gzipped off the write
//! path, and retention prunes old segments by age and by count.

use chrono::{DateTime, Datelike, Utc};
use logship::{
    Batch, FileSinkConfig, ResourceId, ResourceKind, ResourceRegistry, RotationInterval,
    Serializer, Sink, SinkError,
};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::fs::{File, OpenOptions};
use tokio::io::AsyncWriteExt;
use tokio::sync::{mpsc, oneshot};

/// Rotation filename counter bound; exceeding it is a resource failure.
const MAX_ROTATION_CANDIDATES: u32 = 1000;

#[derive(Debug)]
enum Command {
    Write { lines: Vec<Vec<u8>>, done: oneshot::Sender<Result<(), SinkError>> },
    Flush { done: oneshot::Sender<Result<(), SinkError>> },
    Close { done: oneshot::Sender<()> },
}

/// Append-only JSON-lines sink with rotation, compression, and retention.
#[derive(Debug)]
pub struct FileSink {
    serializer: Serializer,
    commands: mpsc::Sender<Command>,
    closed: AtomicBool,
}

impl FileSink {
    pub const NAME: &'static str = "file";

    /// Open (creating the directory if needed) and start the writer task.
    /// A directory that cannot be created is fatal for this sink.
    pub async fn new(
        config: FileSinkConfig,
        serializer: Serializer,
        registry: Arc<ResourceRegistry>,
    ) -> Result<Self, SinkError> {
        let path = PathBuf::from(&config.path);
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                tokio::fs::create_dir_all(parent).await.map_err(|e| {
                    SinkError::new(format!(
                        "invalid log directory '{}': {e}",
                        parent.display()
                    ))
                })?;
            }
        }
        let file = open_append(&path).await?;
        let current_size = file.metadata().await.map_err(|e| SinkError::io(&e))?.len();
        let resource = registry.register(ResourceKind::File, config.path.clone());

        let (tx, rx) = mpsc::channel(64);
        let writer = Writer {
            config,
            path,
            file,
            current_size,
            last_rotation: Utc::now(),
            registry,
            resource,
        };
        tokio::spawn(writer.run(rx));

        Ok(Self { serializer, commands: tx, closed: AtomicBool::new(false) })
    }

    async fn submit<T>(
        &self,
        make: impl FnOnce(oneshot::Sender<T>) -> Command,
    ) -> Result<T, SinkError> {
        let (done_tx, done_rx) = oneshot::channel();
        self.commands
            .send(make(done_tx))
            .await
            .map_err(|_| SinkError::new("file writer is gone"))?;
        done_rx.await.map_err(|_| SinkError::new("file writer dropped the request"))
    }
}

#[async_trait::async_trait]
impl Sink for FileSink {
    fn name(&self) -> &str {
        Self::NAME
    }

    async fn send(&self, batch: &Batch) -> Result<(), SinkError> {
        if self.closed.load(Ordering::Acquire) {
            return Err(SinkError::new("file sink is closed"));
        }
        let lines = self.serializer.serialize_batch(batch);
        self.submit(|done| Command::Write { lines, done }).await?
    }

    async fn flush(&self) -> Result<(), SinkError> {
        if self.closed.load(Ordering::Acquire) {
            return Ok(());
        }
        self.submit(|done| Command::Flush { done }).await?
    }

    async fn close(&self) -> Result<(), SinkError> {
        if self.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        let _ = self.submit(|done| Command::Close { done }).await;
        Ok(())
    }

    async fn check_health(&self) -> bool {
        !self.closed.load(Ordering::Acquire) && !self.commands.is_closed()
    }
}

async fn open_append(path: &Path) -> Result<File, SinkError> {
    OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .await
        .map_err(|e| SinkError::new(format!("cannot open '{}': {e}", path.display())))
}

struct Writer {
    config: FileSinkConfig,
    path: PathBuf,
    file: File,
    current_size: u64,
    last_rotation: DateTime<Utc>,
    registry: Arc<ResourceRegistry>,
    resource: ResourceId,
}

impl Writer {
    async fn run(mut self, mut rx: mpsc::Receiver<Command>) {
        while let Some(command) = rx.recv().await {
            match command {
                Command::Write { lines, done } => {
                    let result = self.write_lines(lines).await;
                    let _ = done.send(result);
                }
                Command::Flush { done } => {
                    let result = self.file.flush().await.map_err(|e| SinkError::io(&e));
                    let _ = done.send(result);
                }
                Command::Close { done } => {
                    if let Err(e) = self.file.flush().await {
                        tracing::warn!(error = %e, "flush on close failed");
                    }
                    self.registry.deregister(self.resource);
                    let _ = done.send(());
                    return;
                }
            }
        }
        // Sink dropped without close; still release the handle.
        self.registry.deregister(self.resource);
    }

    async fn write_lines(&mut self, lines: Vec<Vec<u8>>) -> Result<(), SinkError> {
        for line in &lines {
            self.file.write_all(line).await.map_err(|e| SinkError::io(&e))?;
            self.current_size += line.len() as u64;
        }
        self.file.flush().await.map_err(|e| SinkError::io(&e))?;
        if self.should_rotate() {
            self.rotate().await?;
        }
        Ok(())
    }

    fn should_rotate(&self) -> bool {
        if self.current_size >= self.config.max_size {
            return true;
        }
        match self.config.rotation_interval {
            Some(interval) => crossed_boundary(interval, self.last_rotation, Utc::now()),
            None => false,
        }
    }

    async fn rotate(&mut self) -> Result<(), SinkError> {
        self.file.flush().await.map_err(|e| SinkError::io(&e))?;

        let rotated = self.rotated_path().await?;
        tokio::fs::rename(&self.path, &rotated).await.map_err(|e| SinkError::io(&e))?;
        tracing::info!(
            from = %self.path.display(),
            to = %rotated.display(),
            size = self.current_size,
            "rotated log file"
        );

        if self.config.compress {
            spawn_compression(rotated.clone(), Arc::clone(&self.registry));
        }
        self.apply_retention().await;

        self.file = open_append(&self.path).await?;
        self.current_size = 0;
        self.last_rotation = Utc::now();
        Ok(())
    }

    /// `<stem>.<timestamp>.<counter><ext>` beside the live file; the counter
    /// resolves collisions up to a small bound.
    async fn rotated_path(&self) -> Result<PathBuf, SinkError> {
        let stem = self.path.file_stem().and_then(|s| s.to_str()).unwrap_or("log");
        let ext = self
            .path
            .extension()
            .and_then(|s| s.to_str())
            .map(|e| format!(".{e}"))
            .unwrap_or_default();
        let timestamp = Utc::now().format("%Y-%m-%dT%H-%M-%S%.3fZ");
        let dir = self.path.parent().map(Path::to_path_buf).unwrap_or_default();
        for counter in 1..=MAX_ROTATION_CANDIDATES {
            let candidate = dir.join(format!("{stem}.{timestamp}.{counter}{ext}"));
            let gz = gz_path(&candidate);
            if !path_exists(&candidate).await && !path_exists(&gz).await {
                return Ok(candidate);
            }
        }
        Err(SinkError::new("resource exhausted: no free rotation file name"))
    }

    /// Delete rotated siblings older than `retention_days` plus, after that,
    /// any beyond `max_files` oldest-first. The two delete sets union; the
    /// live file is never considered.
    async fn apply_retention(&self) {
        let (Some(dir), Some(live_name)) =
            (self.path.parent(), self.path.file_name().and_then(|s| s.to_str()))
        else {
            return;
        };
        let stem = self.path.file_stem().and_then(|s| s.to_str()).unwrap_or("log");
        let prefix = format!("{stem}.");

        let mut rotated: Vec<(std::time::SystemTime, PathBuf)> = Vec::new();
        let Ok(mut entries) = tokio::fs::read_dir(dir).await else { return };
        while let Ok(Some(entry)) = entries.next_entry().await {
            let name = entry.file_name();
            let Some(name) = name.to_str() else { continue };
            if name == live_name || !name.starts_with(&prefix) {
                continue;
            }
            let Ok(meta) = entry.metadata().await else { continue };
            if !meta.is_file() {
                continue;
            }
            let modified = meta.modified().unwrap_or(std::time::SystemTime::UNIX_EPOCH);
            rotated.push((modified, entry.path()));
        }
        rotated.sort_by_key(|(mtime, _)| *mtime);

        let mut delete = Vec::new();
        if let Some(days) = self.config.retention_days {
            let horizon = std::time::SystemTime::now()
                .checked_sub(std::time::Duration::from_secs(u64::from(days) * 86_400));
            if let Some(horizon) = horizon {
                for (mtime, path) in &rotated {
                    if *mtime < horizon {
                        delete.push(path.clone());
                    }
                }
            }
        }
        if let Some(max_files) = self.config.max_files {
            let survivors: Vec<_> =
                rotated.iter().filter(|(_, p)| !delete.contains(p)).collect();
            if survivors.len() > max_files {
                let excess = survivors.len() - max_files;
                for (_, path) in survivors.into_iter().take(excess) {
                    delete.push(path.clone());
                }
            }
        }
        for path in delete {
            if let Err(e) = tokio::fs::remove_file(&path).await {
                tracing::warn!(path = %path.display(), error = %e, "retention delete failed");
            } else {
                tracing::debug!(path = %path.display(), "retention deleted rotated file");
            }
        }
    }
}

fn gz_path(path: &Path) -> PathBuf {
    let mut name = path.as_os_str().to_os_string();
    name.push(".gz");
    PathBuf::from(name)
}

async fn path_exists(path: &Path) -> bool {
    tokio::fs::try_exists(path).await.unwrap_or(false)
}

/// Gzip a rotated segment off the writer task, then unlink the original.
fn spawn_compression(rotated: PathBuf, registry: Arc<ResourceRegistry>) {
    tokio::spawn(async move {
        let resource =
            registry.register(ResourceKind::Compression, rotated.display().to_string());
        let target = gz_path(&rotated);
        let source = rotated.clone();
        let result = tokio::task::spawn_blocking(move || -> std::io::Result<()> {
            use flate2::write::GzEncoder;
            use flate2::Compression;
            use std::io::{copy, BufReader, BufWriter};
            let input = std::fs::File::open(&source)?;
            let output = std::fs::File::create(&target)?;
            let mut encoder = GzEncoder::new(BufWriter::new(output), Compression::default());
            copy(&mut BufReader::new(input), &mut encoder)?;
            encoder.finish()?;
            std::fs::remove_file(&source)
        })
        .await;
        match result {
            Ok(Ok(())) => {
                tracing::debug!(path = %rotated.display(), "compressed rotated file")
            }
            Ok(Err(e)) => {
                tracing::warn!(path = %rotated.display(), error = %e, "compression failed")
            }
            Err(e) => tracing::warn!(error = %e, "compression task panicked"),
        }
        registry.deregister(resource);
    });
}

/// Whether `now` has crossed an interval boundary since `last`.
fn crossed_boundary(
    interval: RotationInterval,
    last: DateTime<Utc>,
    now: DateTime<Utc>,
) -> bool {
    match interval {
        RotationInterval::Daily => last.date_naive() != now.date_naive(),
        RotationInterval::Weekly => last.iso_week() != now.iso_week(),
        RotationInterval::Monthly => {
            (last.year(), last.month()) != (now.year(), now.month())
        }
    }
}
