//! The local RPC surface: one newline-terminated JSON request per connection,
//! one newline-terminated JSON response back, over a Unix domain socket.
//!
//! On Linux the socket lives in the abstract namespace (no filesystem entry,
//! cleaned up automatically when the last reference closes); elsewhere it
//! falls back to a path inside a process-private temporary directory that is
//! removed on shutdown.

use std::io::{BufRead, BufReader, Write};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use serde::Deserialize;

use super::Inner;

#[derive(Debug, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
enum Request {
    Prefetch { archive: String },
    GetPreview { archive: String, wait_ms: u64 },
}

/// Binds a fresh preview socket and returns its externally-visible name
/// (what goes in `MICROVM_BACKUP_PREVIEW_SOCKET`) alongside the listener.
pub fn bind(token: &str) -> std::io::Result<(String, platform::Listener)> {
    platform::bind(token)
}

/// Connects to a running cache's socket as a client. Returns the raw
/// bidirectional stream (not the server-side [`platform::Stream`] wrapper,
/// which only every handles one half at a time).
pub fn connect(name: &str) -> std::io::Result<std::os::unix::net::UnixStream> {
    platform::connect(name)
}

/// Removes any filesystem trace of the socket. A no-op on Linux, where the
/// abstract namespace has none.
pub fn cleanup(name: &str) {
    platform::cleanup(name);
}

/// Polls `listener` for incoming connections, spawning one handler thread per
/// connection, until `stop` is set. Polling (rather than a blocking accept)
/// is how this loop observes shutdown without a second wakeup mechanism.
pub fn run_acceptor(inner: Arc<Inner>, listener: platform::Listener, stop: Arc<AtomicBool>) {
    listener.set_nonblocking(true).ok();
    loop {
        if stop.load(Ordering::SeqCst) {
            return;
        }
        match listener.accept_stream() {
            Ok(stream) => {
                let inner = Arc::clone(&inner);
                std::thread::spawn(move || handle_connection(inner, stream));
            }
            Err(ref e) if e.kind() == std::io::ErrorKind::WouldBlock => {
                std::thread::sleep(Duration::from_millis(200));
            }
            Err(_) => {
                std::thread::sleep(Duration::from_millis(200));
            }
        }
    }
}

fn handle_connection(inner: Arc<Inner>, stream: platform::Stream) {
    let mut reader = BufReader::new(stream.try_clone_stream());
    let mut line = String::new();
    if reader.read_line(&mut line).unwrap_or(0) == 0 {
        return;
    }
    let response = match serde_json::from_str::<Request>(line.trim_end()) {
        Ok(Request::Prefetch { archive }) => {
            inner.prefetch(&archive);
            serde_json::json!({"status": "ok"})
        }
        Ok(Request::GetPreview { archive, wait_ms }) => {
            let record = inner.get_preview(&archive, wait_ms);
            serde_json::json!({"status": record.status(), "text": record.text()})
        }
        Err(e) => serde_json::json!({"status": "error", "text": format!("malformed request: {e}")}),
    };
    let mut out = stream.into_write_half();
    if let Ok(mut body) = serde_json::to_vec(&response) {
        body.push(b'\n');
        let _ = out.write_all(&body);
    }
}

#[cfg(target_os = "linux")]
pub mod platform {
    use std::io;
    use std::os::linux::net::SocketAddrExt;
    use std::os::unix::net::{SocketAddr, UnixListener, UnixStream};

    pub struct Listener(UnixListener);
    pub struct Stream(UnixStream);

    impl Listener {
        pub fn set_nonblocking(&self, v: bool) -> io::Result<()> {
            self.0.set_nonblocking(v)
        }

        pub fn accept_stream(&self) -> io::Result<Stream> {
            let (stream, _addr) = self.0.accept()?;
            Ok(Stream(stream))
        }
    }

    impl Stream {
        pub fn try_clone_stream(&self) -> UnixStream {
            self.0.try_clone().expect("unix stream clone failed")
        }

        pub fn into_write_half(self) -> UnixStream {
            self.0
        }
    }

    pub fn bind(token: &str) -> io::Result<(String, Listener)> {
        let abstract_name = format!("microvm-backup-preview-{token}");
        let addr = SocketAddr::from_abstract_name(abstract_name.as_bytes())?;
        let listener = UnixListener::bind_addr(&addr)?;
        Ok((format!("@{abstract_name}"), Listener(listener)))
    }

    pub fn connect(name: &str) -> io::Result<UnixStream> {
        let abstract_name = name.trim_start_matches('@');
        let addr = SocketAddr::from_abstract_name(abstract_name.as_bytes())?;
        UnixStream::connect_addr(&addr)
    }

    pub fn cleanup(_name: &str) {
        // Abstract-namespace sockets have no filesystem entry to remove.
    }
}

#[cfg(not(target_os = "linux"))]
pub mod platform {
    use std::io;
    use std::os::unix::net::{UnixListener, UnixStream};
    use std::path::PathBuf;

    pub struct Listener(UnixListener);
    pub struct Stream(UnixStream);

    impl Listener {
        pub fn set_nonblocking(&self, v: bool) -> io::Result<()> {
            self.0.set_nonblocking(v)
        }

        pub fn accept_stream(&self) -> io::Result<Stream> {
            let (stream, _addr) = self.0.accept()?;
            Ok(Stream(stream))
        }
    }

    impl Stream {
        pub fn try_clone_stream(&self) -> UnixStream {
            self.0.try_clone().expect("unix stream clone failed")
        }

        pub fn into_write_half(self) -> UnixStream {
            self.0
        }
    }

    /// Non-Linux fallback: a path socket inside a private temp directory.
    /// The externally-visible name is the raw filesystem path (no `@`
    /// prefix), which is how callers distinguish the two transports.
    pub fn bind(token: &str) -> io::Result<(String, Listener)> {
        let dir = std::env::temp_dir().join(format!("microvm-backup-preview-{token}"));
        std::fs::create_dir_all(&dir)?;
        let path: PathBuf = dir.join("preview.sock");
        let listener = UnixListener::bind(&path)?;
        Ok((path.to_string_lossy().into_owned(), Listener(listener)))
    }

    pub fn connect(name: &str) -> io::Result<UnixStream> {
        UnixStream::connect(name)
    }

    pub fn cleanup(name: &str) {
        let path = std::path::Path::new(name);
        let _ = std::fs::remove_file(path);
        if let Some(dir) = path.parent() {
            let _ = std::fs::remove_dir(dir);
        }
    }
}
