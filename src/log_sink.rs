use std::{io, path::{Path, PathBuf}, time::Duration};

use tokio::{
    fs::{self, OpenOptions},
    io::AsyncWriteExt,
    sync::mpsc,
    task::JoinHandle,
    time::timeout,
};

/// One log session per top-level launch attempt: a timestamp-named file under
/// the logs directory fed by a writer task that owns the file handle. The
/// writer drains its channel to completion and flushes before exiting, so no
/// exit path can leave buffered output behind, and a retry's fresh session
/// can never interleave with this one.
pub struct LogSession {
    path: PathBuf,
    sender: mpsc::Sender<Vec<u8>>,
    writer: JoinHandle<()>,
}

const LOG_CHANNEL_CAPACITY: usize = 64;
const CLOSE_DRAIN_TIMEOUT: Duration = Duration::from_secs(2);

impl LogSession {
    pub async fn create(logs_dir: &Path) -> io::Result<LogSession> {
        fs::create_dir_all(logs_dir).await?;
        let timestamp = chrono::Local::now().format("%Y%m%d-%H%M%S%.3f");
        let path = logs_dir.join(format!("backend-{timestamp}.log"));
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .await?;

        let (sender, mut receiver) = mpsc::channel::<Vec<u8>>(LOG_CHANNEL_CAPACITY);
        let writer_path = path.clone();
        let writer = tokio::spawn(async move {
            while let Some(chunk) = receiver.recv().await {
                if let Err(error) = file.write_all(&chunk).await {
                    eprintln!(
                        "[log sink] write to {} failed: {}",
                        writer_path.display(),
                        error
                    );
                    break;
                }
            }
            if let Err(error) = file.flush().await {
                eprintln!(
                    "[log sink] flush of {} failed: {}",
                    writer_path.display(),
                    error
                );
            }
        });

        Ok(LogSession {
            path,
            sender,
            writer,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Cloneable handle the output pumps write raw stream bytes into.
    /// Ordering within one stream is preserved by the channel; ordering
    /// across stdout and stderr is not guaranteed.
    pub fn sender(&self) -> mpsc::Sender<Vec<u8>> {
        self.sender.clone()
    }

    /// Closes the session: drops this end of the channel and waits for the
    /// writer to drain and flush. Outstanding pump senders keep the channel
    /// open, so the wait is bounded rather than indefinite.
    pub async fn close(self) {
        drop(self.sender);
        if timeout(CLOSE_DRAIN_TIMEOUT, self.writer).await.is_err() {
            eprintln!(
                "[log sink] writer for {} did not drain in time",
                self.path.display()
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn log_session_writes_chunks_in_order_and_flushes_on_close() {
        let dir = tempfile::tempdir().expect("create temp dir");
        let session = LogSession::create(dir.path())
            .await
            .expect("create log session");
        let path = session.path().to_path_buf();

        let sender = session.sender();
        sender
            .send(b"first line\n".to_vec())
            .await
            .expect("send first chunk");
        sender
            .send(b"second line\n".to_vec())
            .await
            .expect("send second chunk");
        drop(sender);
        session.close().await;

        let contents = std::fs::read_to_string(&path).expect("read log file");
        assert_eq!(contents, "first line\nsecond line\n");
    }

    #[tokio::test]
    async fn log_session_files_are_unique_per_launch() {
        let dir = tempfile::tempdir().expect("create temp dir");
        let first = LogSession::create(dir.path())
            .await
            .expect("create first session");
        tokio::time::sleep(Duration::from_millis(5)).await;
        let second = LogSession::create(dir.path())
            .await
            .expect("create second session");

        assert_ne!(first.path(), second.path());
        first.close().await;
        second.close().await;
    }

    #[tokio::test]
    async fn log_session_file_name_carries_timestamp_prefix() {
        let dir = tempfile::tempdir().expect("create temp dir");
        let session = LogSession::create(dir.path())
            .await
            .expect("create log session");
        let name = session
            .path()
            .file_name()
            .expect("file name")
            .to_string_lossy()
            .to_string();
        session.close().await;

        assert!(name.starts_with("backend-"));
        assert!(name.ends_with(".log"));
    }
}
