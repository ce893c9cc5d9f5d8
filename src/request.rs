//! Component F — the Client Request Actor.
//!
//! One `tokio::spawn`ed task per accepted connection (spec section 4.F).
//! Header parsing is hand-rolled, line-based, no HTTP crate in front of it —
//! grounded on flexo's `read_client_header` approach, ported from blocking
//! `BufReader<TcpStream>` line reads to `AsyncBufReadExt::read_line`.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;
use tokio::time::{timeout, Duration};

use crate::auth;
use crate::config::Config;
use crate::content_length::{ContentLengthCache, LookupResult};
use crate::downloader::{next_handle, Downloader};
use crate::error::{DownloadError, RequestError};
use crate::filewatcher::{self, FileEvent};
use crate::http;
use crate::key::FileKey;
use crate::mirror::MirrorSelector;
use crate::sendfile::send_file_range;
use crate::serializer::{DownloaderHandle, FollowUp, SerializerHandle, StateReply, TerminationStatus};

const SERIALIZER_REPLY_TIMEOUT: Duration = Duration::from_millis(500);
const PENDING_POLL_INTERVAL: Duration = Duration::from_millis(25);
const PENDING_POLL_TIMEOUT: Duration = Duration::from_secs(5);
const POST_BODY_TIMEOUT: Duration = Duration::from_millis(500);
const POST_BODY_LIMIT: u64 = 500_000;

/// Shared, cloneable handles to every collaborator a request needs. One
/// instance is built at startup and cloned into each spawned connection.
#[derive(Clone)]
pub struct AppContext {
    pub config: Arc<Config>,
    pub content_length_cache: ContentLengthCache,
    pub mirror_selector: Arc<MirrorSelector>,
    pub serializer: SerializerHandle,
    pub client: reqwest::Client,
}

enum Method {
    Get,
    Post,
    Other,
}

struct ParsedRequest {
    method: Method,
    target: String,
    headers: HashMap<String, String>,
}

struct ExtractedHeaders {
    content_length: Option<u64>,
    expect_continue: bool,
    range_start: Option<u64>,
    authorization: Option<String>,
    timestamp: Option<i64>,
}

enum Classification {
    Database,
    CompleteFile { path: PathBuf, total: u64 },
    PartialFile { path: PathBuf, total: u64 },
    NotFound,
}

/// Entry point: owns the socket for exactly one request/response cycle
/// (spec section 3, "Client Request Actor lives exactly one HTTP
/// request-response cycle"). A downloader this actor launched is aborted on
/// the way out only for genuine failures — if the client simply hung up
/// mid-transfer, the downloader keeps running so other waiters on the same
/// file still get served (section 4.F termination rules).
pub async fn handle_connection(socket: TcpStream, ctx: AppContext) {
    let mut reader = BufReader::new(socket);
    let mut sent_header = false;
    let mut downloader_task: Option<tokio::task::JoinHandle<()>> = None;

    let result = serve(&mut reader, &ctx, &mut sent_header, &mut downloader_task).await;

    let client_disconnected = matches!(&result, Err(e) if e.is_client_disconnect());

    if let Err(e) = result {
        if client_disconnected {
            log::debug!("client disconnected mid-request: {}", e);
        } else {
            log::warn!("request failed: {}", e);
        }
        if !sent_header && !client_disconnected {
            let header = http::internal_server_error_header();
            let _ = reader.get_mut().write_all(header.as_bytes()).await;
        }
    }

    if let Some(task) = downloader_task {
        if client_disconnected {
            drop(task);
        } else {
            task.abort();
        }
    }
}

async fn serve(
    reader: &mut BufReader<TcpStream>,
    ctx: &AppContext,
    sent_header: &mut bool,
    downloader_task: &mut Option<tokio::task::JoinHandle<()>>,
) -> Result<(), RequestError> {
    let request = parse_request(reader).await?;
    let extracted = extract_headers(&request.headers);

    match request.method {
        Method::Get => {
            handle_get(
                reader,
                ctx,
                &request.target,
                &extracted,
                sent_header,
                downloader_task,
            )
            .await
        }
        Method::Post => handle_post(reader, ctx, &request.target, &extracted, sent_header).await,
        Method::Other => Err(RequestError::Malformed),
    }
}

async fn parse_request(reader: &mut BufReader<TcpStream>) -> Result<ParsedRequest, RequestError> {
    let mut request_line = String::new();
    let n = reader
        .read_line(&mut request_line)
        .await
        .map_err(RequestError::Io)?;
    if n == 0 {
        return Err(RequestError::Malformed);
    }

    let request_line = request_line.trim_end();
    let mut parts = request_line.split_whitespace();
    let method = parts.next().ok_or(RequestError::Malformed)?;
    let target = parts.next().ok_or(RequestError::Malformed)?.to_string();
    let method = match method {
        "GET" => Method::Get,
        "POST" => Method::Post,
        _ => Method::Other,
    };

    let mut headers = HashMap::new();
    loop {
        let mut line = String::new();
        let n = reader.read_line(&mut line).await.map_err(RequestError::Io)?;
        if n == 0 {
            return Err(RequestError::Malformed);
        }
        let line = line.trim_end_matches(['\r', '\n']);
        if line.is_empty() {
            break;
        }
        let (name, value) = line.split_once(':').ok_or(RequestError::Malformed)?;
        headers.insert(name.trim().to_ascii_lowercase(), value.trim().to_string());
    }

    Ok(ParsedRequest {
        method,
        target,
        headers,
    })
}

fn extract_headers(headers: &HashMap<String, String>) -> ExtractedHeaders {
    ExtractedHeaders {
        content_length: headers.get("content-length").and_then(|v| v.parse().ok()),
        expect_continue: headers
            .get("expect")
            .map(|v| v.eq_ignore_ascii_case("100-continue"))
            .unwrap_or(false),
        range_start: headers.get("range").and_then(|v| parse_range_start(v)),
        authorization: headers.get("authorization").cloned(),
        timestamp: headers.get("timestamp").and_then(|v| v.parse().ok()),
    }
}

/// Only `bytes=N-` is supported — suffix ranges (`bytes=-N`) and closed
/// ranges are rejected by returning `None`, per spec section 6.
fn parse_range_start(value: &str) -> Option<u64> {
    let rest = value.strip_prefix("bytes=")?;
    if rest.starts_with('-') {
        return None;
    }
    let start = rest.split('-').next()?;
    start.parse::<u64>().ok()
}

async fn handle_get(
    reader: &mut BufReader<TcpStream>,
    ctx: &AppContext,
    target: &str,
    headers: &ExtractedHeaders,
    sent_header: &mut bool,
    downloader_task: &mut Option<tokio::task::JoinHandle<()>>,
) -> Result<(), RequestError> {
    if target == "/" {
        return write_text(reader, sent_header, "OK").await;
    }
    if target == "/robots.txt" {
        return write_text(reader, sent_header, "User-agent: *\nDisallow: /\n").await;
    }
    if target == "/favicon.ico" {
        return write_status_only(reader, sent_header, http::not_found_header()).await;
    }

    let key = match FileKey::parse(target) {
        Ok(k) => k,
        Err(_) => return write_status_only(reader, sent_header, http::not_found_header()).await,
    };

    match classify_uri(&key, ctx).await {
        Classification::Database => {
            let location = match first_mirror_location(ctx, &key) {
                Some(l) => l,
                None => {
                    return write_status_only(
                        reader,
                        sent_header,
                        http::internal_server_error_header(),
                    )
                    .await
                }
            };
            write_status_only(reader, sent_header, http::redirect_header(&location)).await
        }
        Classification::CompleteFile { path, total } => {
            serve_complete_file(reader, sent_header, &path, total, headers.range_start).await
        }
        Classification::PartialFile { path, total } => {
            match query_state_resolved(ctx, key.as_str()).await? {
                StateReply::Downloading => {
                    serve_growing_file(
                        reader,
                        ctx,
                        &key,
                        &path,
                        total,
                        headers.range_start,
                        None,
                        sent_header,
                    )
                    .await
                }
                StateReply::Unknown | StateReply::InvalidPath | StateReply::Pending => {
                    serve_cache_then_http(
                        reader,
                        ctx,
                        &key,
                        &path,
                        total,
                        headers.range_start,
                        sent_header,
                        downloader_task,
                    )
                    .await
                }
            }
        }
        Classification::NotFound => {
            if headers.range_start.is_some() {
                // Invariant C4: never start a cache-filling download from a
                // non-zero offset. Redirect instead of serving a file whose
                // prefix would not match the canonical stream.
                let location = match first_mirror_location(ctx, &key) {
                    Some(l) => l,
                    None => {
                        return write_status_only(reader, sent_header, http::not_found_header())
                            .await
                    }
                };
                return write_status_only(reader, sent_header, http::redirect_header(&location))
                    .await;
            }

            match query_state_resolved(ctx, key.as_str()).await? {
                StateReply::Downloading => {
                    let path = key.cache_path(&ctx.config.cache_directory);
                    let total = resolve_total(ctx, &key).await?;
                    serve_growing_file(reader, ctx, &key, &path, total, None, None, sent_header)
                        .await
                }
                StateReply::Unknown | StateReply::InvalidPath | StateReply::Pending => {
                    serve_fresh_download(
                        reader,
                        ctx,
                        &key,
                        headers.range_start,
                        sent_header,
                        downloader_task,
                    )
                    .await
                }
            }
        }
    }
}

fn first_mirror_location(ctx: &AppContext, key: &FileKey) -> Option<String> {
    let mirrors = ctx.mirror_selector.get_all();
    mirrors
        .first()
        .map(|base| format!("{}/{}", base.trim_end_matches('/'), key.as_str()))
}

async fn classify_uri(key: &FileKey, ctx: &AppContext) -> Classification {
    if key.ends_with_db() {
        return Classification::Database;
    }

    let total = match ctx.content_length_cache.get(key.basename()) {
        LookupResult::Found(cl) => cl,
        LookupResult::NotFound => return Classification::NotFound,
    };

    let path = key.cache_path(&ctx.config.cache_directory);
    match tokio::fs::metadata(&path).await {
        Ok(meta) if meta.len() == 0 => Classification::NotFound,
        Ok(meta) if meta.len() >= total => Classification::CompleteFile { path, total },
        Ok(meta) if meta.len() > 0 => Classification::PartialFile { path, total },
        _ => Classification::NotFound,
    }
}

/// Bounded wait on the Serializer (500ms, spec section 5) — a timeout here
/// is a hard error that crashes this actor (disposition table, section 7).
async fn query_state(ctx: &AppContext, filename: &str) -> Result<StateReply, RequestError> {
    match timeout(SERIALIZER_REPLY_TIMEOUT, ctx.serializer.state_query(filename)).await {
        Ok(reply) => Ok(reply),
        Err(_) => Err(RequestError::Io(std::io::Error::new(
            std::io::ErrorKind::TimedOut,
            "serializer state_query timed out",
        ))),
    }
}

/// Same as `query_state`, but a `Pending` reply (another client's follow-up
/// is outstanding and content-length isn't known yet) is polled away instead
/// of being handed to the caller — polling avoids racing `resolve_total`'s
/// HEAD fallback against the in-flight follow-up.
async fn query_state_resolved(ctx: &AppContext, filename: &str) -> Result<StateReply, RequestError> {
    let deadline = tokio::time::Instant::now() + PENDING_POLL_TIMEOUT;
    loop {
        let state = query_state(ctx, filename).await?;
        if !matches!(state, StateReply::Pending) {
            return Ok(state);
        }
        if tokio::time::Instant::now() >= deadline {
            return Err(RequestError::Io(std::io::Error::new(
                std::io::ErrorKind::TimedOut,
                "content-length follow-up never arrived",
            )));
        }
        tokio::time::sleep(PENDING_POLL_INTERVAL).await;
    }
}

/// Content-length for a file the Serializer says is downloading but whose
/// total we haven't cached yet (the `not_found` → `downloading` race).
async fn resolve_total(ctx: &AppContext, key: &FileKey) -> Result<u64, RequestError> {
    if let LookupResult::Found(cl) = ctx.content_length_cache.get(key.basename()) {
        return Ok(cl);
    }
    for base in ctx.mirror_selector.get_all() {
        let url = format!("{}/{}", base.trim_end_matches('/'), key.as_str());
        if let Ok(resp) = ctx.client.head(&url).send().await {
            if resp.status().is_success() {
                if let Some(len) = resp.content_length() {
                    let _ = ctx.content_length_cache.add(key.basename(), len);
                    return Ok(len);
                }
            }
        }
    }
    Err(RequestError::Io(std::io::Error::new(
        std::io::ErrorKind::NotFound,
        "content-length unknown",
    )))
}

async fn serve_complete_file(
    reader: &mut BufReader<TcpStream>,
    sent_header: &mut bool,
    path: &Path,
    total: u64,
    range_start: Option<u64>,
) -> Result<(), RequestError> {
    let start = range_start.unwrap_or(0);
    if start > total {
        return write_status_only(reader, sent_header, http::bad_request_header()).await;
    }

    let content_length = total - start;
    let header = http::ok_header(content_length, range_start, total);
    reader.get_mut().write_all(header.as_bytes()).await?;
    *sent_header = true;

    if start == total {
        return Ok(());
    }

    let file = std::fs::File::open(path)?;
    send_file_range(reader.get_ref(), &file, start, content_length).await?;
    Ok(())
}

/// Shared by plain growing-file readers (`owned_downloader: None`) and the
/// actor that itself launched the download (`Some(handle)`), which alone is
/// responsible for reporting `download_ended` once the transfer completes
/// (spec section 4.F.α).
async fn serve_growing_file(
    reader: &mut BufReader<TcpStream>,
    ctx: &AppContext,
    key: &FileKey,
    path: &Path,
    total: u64,
    range_start: Option<u64>,
    owned_downloader: Option<DownloaderHandle>,
    sent_header: &mut bool,
) -> Result<(), RequestError> {
    let start = range_start.unwrap_or(0);
    let content_length = total.saturating_sub(start);
    let header = http::ok_header(content_length, range_start, total);
    reader.get_mut().write_all(header.as_bytes()).await?;
    *sent_header = true;

    if start >= total {
        return Ok(());
    }

    let start_size = tokio::fs::metadata(path)
        .await
        .map(|m| m.len())
        .unwrap_or(0);
    let mut events = filewatcher::watch(path.to_path_buf(), total, start_size);
    let file = std::fs::File::open(path)?;
    let mut sent = start;

    if start_size > sent {
        send_file_range(reader.get_ref(), &file, sent, start_size - sent).await?;
        sent = start_size;
    }

    while sent < total {
        match events.recv().await {
            Some(FileEvent::SizeIncreased { new, .. }) => {
                if new > sent {
                    send_file_range(reader.get_ref(), &file, sent, new - sent).await?;
                    sent = new;
                }
            }
            Some(FileEvent::Complete { new, .. }) => {
                if new > sent {
                    send_file_range(reader.get_ref(), &file, sent, new - sent).await?;
                    sent = new;
                }
                break;
            }
            None => break,
        }
    }

    if let Some(handle) = owned_downloader {
        ctx.serializer.download_ended(key.clone(), handle).await;
    }

    Ok(())
}

/// Spawns a downloader, waits on its header-phase signal, and either streams
/// the response (headers already known to the client) or maps the downloader
/// failure to the status codes spec section 4.F.β/γ names.
async fn launch_downloader(
    ctx: &AppContext,
    key: &FileKey,
    path: &Path,
    start_offset: u64,
    downloader_task: &mut Option<tokio::task::JoinHandle<()>>,
) -> (
    DownloaderHandle,
    tokio::sync::oneshot::Receiver<Result<crate::downloader::DownloadStarted, DownloadError>>,
) {
    let handle = next_handle();
    let (started_tx, started_rx) = tokio::sync::oneshot::channel();
    let downloader = Downloader::new(ctx.client.clone());
    let mirrors = ctx.mirror_selector.get_all();
    let uri = key.as_str().to_string();
    let local_path = path.to_path_buf();
    let serializer = ctx.serializer.clone();
    let key_for_task = key.clone();

    let join = tokio::spawn(async move {
        let result = downloader
            .try_all(&mirrors, &uri, &local_path, start_offset, started_tx)
            .await;
        let status = match result {
            Ok(()) => TerminationStatus::Normal,
            Err(e) => TerminationStatus::Abnormal(e.to_string()),
        };
        serializer.downloader_terminated(key_for_task, handle, status);
    });
    *downloader_task = Some(join);

    (handle, started_rx)
}

/// 4.F.β — file partially cached locally, nobody else downloading it.
async fn serve_cache_then_http(
    reader: &mut BufReader<TcpStream>,
    ctx: &AppContext,
    key: &FileKey,
    path: &Path,
    total: u64,
    range_start: Option<u64>,
    sent_header: &mut bool,
    downloader_task: &mut Option<tokio::task::JoinHandle<()>>,
) -> Result<(), RequestError> {
    let filesize = tokio::fs::metadata(path)
        .await
        .map(|m| m.len())
        .unwrap_or(0);

    if filesize >= total {
        return serve_complete_file(reader, sent_header, path, total, range_start).await;
    }

    let start = range_start.unwrap_or(0);
    if start == total {
        let header = http::ok_header(0, range_start, total);
        reader.get_mut().write_all(header.as_bytes()).await?;
        *sent_header = true;
        return Ok(());
    }
    if start > filesize {
        // Unimplemented per spec section 4.F.β / 9 — fail closed rather
        // than silently violating prefix-correctness (C4).
        return write_status_only(reader, sent_header, http::bad_request_header()).await;
    }

    let (handle, started_rx) = launch_downloader(ctx, key, path, filesize, downloader_task).await;

    match started_rx.await {
        Ok(Ok(_started)) => {
            serve_growing_file(
                reader,
                ctx,
                key,
                path,
                total,
                range_start,
                Some(handle),
                sent_header,
            )
            .await
        }
        Ok(Err(DownloadError::NotFound)) => {
            write_status_only(reader, sent_header, http::not_found_header()).await
        }
        _ => write_status_only(reader, sent_header, http::internal_server_error_header()).await,
    }
}

/// 4.F.γ — nothing cached locally, Serializer confirmed nobody else is
/// downloading it either.
async fn serve_fresh_download(
    reader: &mut BufReader<TcpStream>,
    ctx: &AppContext,
    key: &FileKey,
    range_start: Option<u64>,
    sent_header: &mut bool,
    downloader_task: &mut Option<tokio::task::JoinHandle<()>>,
) -> Result<(), RequestError> {
    let path = key.cache_path(&ctx.config.cache_directory);
    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }
    tokio::fs::File::create(&path).await?;

    let (handle, started_rx) = launch_downloader(ctx, key, &path, 0, downloader_task).await;

    match started_rx.await {
        Ok(Ok(started)) => {
            let _ = ctx
                .content_length_cache
                .add(key.basename(), started.content_length);
            ctx.serializer
                .follow_up(
                    key.as_str(),
                    FollowUp::ContentLength(started.content_length, handle),
                )
                .await;

            serve_growing_file(
                reader,
                ctx,
                key,
                &path,
                started.content_length,
                range_start,
                Some(handle),
                sent_header,
            )
            .await
        }
        Ok(Err(DownloadError::NotFound)) => {
            let _ = tokio::fs::remove_file(&path).await;
            ctx.serializer.follow_up(key.as_str(), FollowUp::NotFound).await;
            write_status_only(reader, sent_header, http::not_found_header()).await
        }
        _ => {
            let _ = tokio::fs::remove_file(&path).await;
            ctx.serializer.follow_up(key.as_str(), FollowUp::NotFound).await;
            write_status_only(reader, sent_header, http::internal_server_error_header()).await
        }
    }
}

async fn handle_post(
    reader: &mut BufReader<TcpStream>,
    ctx: &AppContext,
    target: &str,
    headers: &ExtractedHeaders,
    sent_header: &mut bool,
) -> Result<(), RequestError> {
    let hostname = target.trim_start_matches('/');
    if hostname.is_empty() || hostname.contains('/') {
        return write_status_only(reader, sent_header, http::bad_request_header()).await;
    }

    if headers.expect_continue {
        reader
            .get_mut()
            .write_all(b"HTTP/1.1 100 Continue\r\n\r\n")
            .await?;
    }

    let content_length = headers.content_length.ok_or(RequestError::Malformed)?;
    if content_length > POST_BODY_LIMIT {
        return write_status_only(reader, sent_header, http::payload_too_large_header()).await;
    }

    let mut body = vec![0u8; content_length as usize];
    match timeout(POST_BODY_TIMEOUT, reader.read_exact(&mut body)).await {
        Ok(Ok(_)) => {}
        _ => return Err(RequestError::Malformed),
    }

    let now = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs() as i64;

    let verified = auth::verify(
        &ctx.config.recv_packages_key,
        &body,
        headers.authorization.as_deref(),
        headers.timestamp,
        now,
    );

    if verified.is_err() {
        return write_status_only(reader, sent_header, http::forbidden_header()).await;
    }

    tokio::fs::create_dir_all(&ctx.config.wanted_packages_directory).await?;
    let dest = ctx.config.wanted_packages_directory.join(hostname);
    tokio::fs::write(&dest, &body).await?;

    write_text(reader, sent_header, "OK").await
}

async fn write_text(
    reader: &mut BufReader<TcpStream>,
    sent_header: &mut bool,
    body: &str,
) -> Result<(), RequestError> {
    let header = http::ok_header(body.len() as u64, None, body.len() as u64);
    reader.get_mut().write_all(header.as_bytes()).await?;
    reader.get_mut().write_all(body.as_bytes()).await?;
    *sent_header = true;
    Ok(())
}

async fn write_status_only(
    reader: &mut BufReader<TcpStream>,
    sent_header: &mut bool,
    header: String,
) -> Result<(), RequestError> {
    reader.get_mut().write_all(header.as_bytes()).await?;
    *sent_header = true;
    Ok(())
}
