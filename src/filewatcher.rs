//! Component E — Filewatcher.
//!
//! Polls a growing file's size (~100ms, per spec section 4.E) and notifies a
//! consumer of `filesize_increased`/`file_complete` events over an `mpsc`
//! channel. Portable polling rather than an OS file-watch crate, per spec's
//! explicit preference (section 4.E design note).

use std::path::PathBuf;
use std::time::Duration;

use tokio::sync::mpsc;

const POLL_INTERVAL: Duration = Duration::from_millis(100);

#[derive(Debug, Clone, Copy)]
pub enum FileEvent {
    SizeIncreased { prev: u64, new: u64 },
    Complete { prev: u64, new: u64 },
}

/// Spawns a polling task and returns the receiving end of its notification
/// channel. The task terminates itself once `expected_size` is reached.
pub fn watch(path: PathBuf, expected_size: u64, start_size: u64) -> mpsc::Receiver<FileEvent> {
    let (tx, rx) = mpsc::channel(16);
    tokio::spawn(run(path, expected_size, start_size, tx));
    rx
}

async fn run(path: PathBuf, expected_size: u64, start_size: u64, tx: mpsc::Sender<FileEvent>) {
    let mut prev = start_size;
    let mut ticker = tokio::time::interval(POLL_INTERVAL);

    loop {
        ticker.tick().await;

        let new = match tokio::fs::metadata(&path).await {
            Ok(meta) => meta.len(),
            Err(_) => continue,
        };

        if new == prev {
            continue;
        }

        if new >= expected_size {
            let _ = tx.send(FileEvent::Complete { prev, new }).await;
            return;
        }

        if new > prev {
            if tx
                .send(FileEvent::SizeIncreased { prev, new })
                .await
                .is_err()
            {
                return;
            }
            prev = new;
        }
    }
}
