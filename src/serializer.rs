//! Component C — the Serializer, the heart of the cache.
//!
//! A single `tokio::spawn`ed task owns `filename_to_length` (spec's
//! `pid_to_filename`/`filename_to_length` maps collapsed into one, since in
//! this implementation the downloader handle lives inside the `FileStatus`
//! rather than as a second reverse index) and answers three message kinds
//! (spec section 4.C): `state_query` (+ its bounded follow-up),
//! `download_ended`, and `downloader_terminated`.
//!
//! Grounded on `rattler_cache`'s `PackageCache` coalescing idea
//! (`other_examples/.../rattler_cache-src-package_cache-mod.rs.rs`), adapted
//! from a lock-per-key model into a single-actor-with-mailbox model, which is
//! what spec's ordering guarantee (S1) asks for: invariant-equivalent to a
//! per-key lock, but realized as one cooperative task rather than N mutexes.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use tokio::sync::{mpsc, oneshot};

use crate::key::FileKey;

pub type DownloaderHandle = u64;

const FOLLOW_UP_TIMEOUT: Duration = Duration::from_secs(5);
const MAINTENANCE_INTERVAL: Duration = Duration::from_millis(200);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StateReply {
    Downloading,
    /// A follow-up for this file is outstanding but content-length isn't
    /// known yet — distinct from `Downloading` so the caller polls instead
    /// of racing a HEAD probe against the in-flight follow-up.
    Pending,
    Unknown,
    InvalidPath,
}

#[derive(Debug, Clone)]
pub enum FollowUp {
    ContentLength(u64, DownloaderHandle),
    NotFound,
    Complete,
}

#[derive(Debug, Clone)]
pub enum TerminationStatus {
    Normal,
    Abnormal(String),
}

struct FileStatus {
    content_length: u64,
    downloader: DownloaderHandle,
}

struct PendingEntry {
    deadline: Instant,
}

enum SerializerMsg {
    StateQuery {
        filename: String,
        reply: oneshot::Sender<StateReply>,
    },
    FollowUp {
        filename: String,
        follow_up: FollowUp,
    },
    DownloadEnded {
        filename: FileKey,
        downloader: DownloaderHandle,
    },
    DownloaderTerminated {
        filename: FileKey,
        downloader: DownloaderHandle,
        status: TerminationStatus,
    },
}

/// Cloneable front-end held by every client actor and downloader.
#[derive(Clone)]
pub struct SerializerHandle {
    tx: mpsc::Sender<SerializerMsg>,
}

impl SerializerHandle {
    /// `state_query(from, filename)` (spec 4.C message 1). `filename` is the
    /// raw, percent-decoded request path — the Serializer performs its own
    /// path-traversal check (REDESIGN FLAGS #1) independent of whatever the
    /// caller already validated.
    pub async fn state_query(&self, filename: &str) -> StateReply {
        let (reply_tx, reply_rx) = oneshot::channel();
        if self
            .tx
            .send(SerializerMsg::StateQuery {
                filename: filename.to_string(),
                reply: reply_tx,
            })
            .await
            .is_err()
        {
            return StateReply::Unknown;
        }
        reply_rx.await.unwrap_or(StateReply::Unknown)
    }

    /// Follow-up to a `state_query` that returned `Unknown` (spec 4.C
    /// message 1, follow-up phase). Must be sent within 5s of the query.
    pub async fn follow_up(&self, filename: &str, follow_up: FollowUp) {
        let _ = self
            .tx
            .send(SerializerMsg::FollowUp {
                filename: filename.to_string(),
                follow_up,
            })
            .await;
    }

    /// `download_ended(filename, downloader_handle)` (spec 4.C message 2).
    pub async fn download_ended(&self, filename: FileKey, downloader: DownloaderHandle) {
        let _ = self
            .tx
            .send(SerializerMsg::DownloadEnded { filename, downloader })
            .await;
    }

    /// `downloader_terminated(handle, status)` (spec 4.C message 3) — the
    /// automatic monitor notification. Fire-and-forget from the monitor
    /// task that awaits the downloader's `JoinHandle`.
    pub fn downloader_terminated(
        &self,
        filename: FileKey,
        downloader: DownloaderHandle,
        status: TerminationStatus,
    ) {
        let tx = self.tx.clone();
        tokio::spawn(async move {
            let _ = tx
                .send(SerializerMsg::DownloaderTerminated {
                    filename,
                    downloader,
                    status,
                })
                .await;
        });
    }
}

/// Spawns the Serializer actor and returns a handle to it.
pub fn spawn() -> SerializerHandle {
    let (tx, rx) = mpsc::channel(256);
    tokio::spawn(run(rx));
    SerializerHandle { tx }
}

async fn run(mut rx: mpsc::Receiver<SerializerMsg>) {
    let mut filename_to_length: HashMap<FileKey, FileStatus> = HashMap::new();
    let mut pending: HashMap<FileKey, PendingEntry> = HashMap::new();
    let mut maintenance = tokio::time::interval(MAINTENANCE_INTERVAL);

    loop {
        tokio::select! {
            msg = rx.recv() => {
                match msg {
                    Some(msg) => handle_message(msg, &mut filename_to_length, &mut pending),
                    None => break,
                }
            }
            _ = maintenance.tick() => {
                expire_pending(&mut pending);
            }
        }
    }
}

fn handle_message(
    msg: SerializerMsg,
    filename_to_length: &mut HashMap<FileKey, FileStatus>,
    pending: &mut HashMap<FileKey, PendingEntry>,
) {
    match msg {
        SerializerMsg::StateQuery { filename, reply } => {
            let key = match FileKey::parse(&filename) {
                Ok(k) => k,
                Err(_) => {
                    let _ = reply.send(StateReply::InvalidPath);
                    return;
                }
            };

            let state = if filename_to_length.contains_key(&key) {
                StateReply::Downloading
            } else if pending.contains_key(&key) {
                // A different client's follow-up is outstanding: answering
                // Unknown here would let a second downloader start for the
                // same file. The caller polls on Pending until the
                // follow-up lands and this becomes Downloading.
                StateReply::Pending
            } else {
                pending.insert(
                    key.clone(),
                    PendingEntry {
                        deadline: Instant::now() + FOLLOW_UP_TIMEOUT,
                    },
                );
                StateReply::Unknown
            };

            let _ = reply.send(state);
        }
        SerializerMsg::FollowUp { filename, follow_up } => {
            let Ok(key) = FileKey::parse(&filename) else {
                return;
            };
            pending.remove(&key);
            match follow_up {
                FollowUp::ContentLength(content_length, downloader) => {
                    filename_to_length.insert(
                        key,
                        FileStatus {
                            content_length,
                            downloader,
                        },
                    );
                }
                FollowUp::NotFound | FollowUp::Complete => {
                    // No state change (spec 4.C message 1, follow-up phase).
                }
            }
        }
        SerializerMsg::DownloadEnded { filename, downloader } => {
            if let Some(status) = filename_to_length.get(&filename) {
                if status.downloader == downloader {
                    filename_to_length.remove(&filename);
                }
            }
        }
        SerializerMsg::DownloaderTerminated {
            filename,
            downloader,
            status,
        } => {
            pending.remove(&filename);
            if let Some(existing) = filename_to_length.get(&filename) {
                if existing.downloader == downloader {
                    filename_to_length.remove(&filename);
                }
            }
            if let TerminationStatus::Abnormal(reason) = status {
                log::error!(
                    "downloader {} for {:?} terminated abnormally: {}",
                    downloader,
                    filename.as_str(),
                    reason
                );
            }
        }
    }
}

fn expire_pending(pending: &mut HashMap<FileKey, PendingEntry>) {
    let now = Instant::now();
    pending.retain(|filename, entry| {
        let alive = entry.deadline > now;
        if !alive {
            log::error!(
                "serializer: no follow-up received for {:?} within timeout (protocol violation)",
                filename.as_str()
            );
        }
        alive
    });
}
