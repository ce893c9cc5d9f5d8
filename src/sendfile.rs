//! Zero-copy file-to-socket streaming.
//!
//! Grounded directly on flexo's `send_payload` (raw `libc::sendfile` in a
//! loop until `offset` reaches `filesize`), ported to `nix::sys::sendfile`
//! and driven by `TcpStream::writable()` instead of a blocking OS thread, so
//! the calling task yields back to the Tokio runtime whenever the socket
//! buffer is full instead of parking a thread.

use std::fs::File;
use std::os::fd::AsFd;

use nix::errno::Errno;
use tokio::net::TcpStream;

// Matches flexo's MAX_SENDFILE_COUNT: the largest count Linux's sendfile(2)
// accepts in one call (it silently caps at 0x7ffff000 bytes).
const MAX_SENDFILE_COUNT: usize = 0x7fff_f000;

/// Sends `len` bytes of `file` starting at `start` to `socket`, using
/// `sendfile(2)` so the bytes never cross into userspace.
pub async fn send_file_range(
    socket: &TcpStream,
    file: &File,
    start: u64,
    len: u64,
) -> std::io::Result<()> {
    let end = start + len;
    let mut offset: i64 = start as i64;

    while (offset as u64) < end {
        socket.writable().await?;

        let remaining = (end - offset as u64) as usize;
        let count = remaining.min(MAX_SENDFILE_COUNT);

        match nix::sys::sendfile::sendfile(socket.as_fd(), file.as_fd(), Some(&mut offset), count)
        {
            Ok(0) => break,
            Ok(_) => continue,
            Err(Errno::EAGAIN) => continue,
            Err(e) => return Err(std::io::Error::from(e)),
        }
    }

    Ok(())
}
