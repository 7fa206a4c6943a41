//! Duplex byte streams over the local channel.
//!
//! Unix uses `tokio::net::UnixListener` / `UnixStream`. Windows uses tokio's
//! named pipe server and client; a pipe server instance serves one client, so
//! the listener keeps one spare instance ready for the next `accept`.

use super::endpoint::Endpoint;
use std::io;

#[cfg(unix)]
pub type ClientStream = tokio::net::UnixStream;
#[cfg(unix)]
pub type ServerStream = tokio::net::UnixStream;

#[cfg(windows)]
pub type ClientStream = tokio::net::windows::named_pipe::NamedPipeClient;
#[cfg(windows)]
pub type ServerStream = tokio::net::windows::named_pipe::NamedPipeServer;

/// Connect to a leader listening on `endpoint`.
#[cfg(unix)]
pub async fn connect(endpoint: &Endpoint) -> io::Result<ClientStream> {
    tokio::net::UnixStream::connect(endpoint.as_path()).await
}

/// Connect to a leader listening on `endpoint`.
#[cfg(windows)]
pub async fn connect(endpoint: &Endpoint) -> io::Result<ClientStream> {
    use std::time::Duration;
    use tokio::net::windows::named_pipe::ClientOptions;

    const ERROR_PIPE_BUSY: i32 = 231;

    loop {
        match ClientOptions::new().open(endpoint.as_path()) {
            Ok(client) => return Ok(client),
            Err(e) if e.raw_os_error() == Some(ERROR_PIPE_BUSY) => {}
            Err(e) => return Err(e),
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
}

/// Remove a socket file left behind by a crashed leader.
///
/// A missing file is not an error. Named pipes leave nothing behind.
pub async fn remove_stale(endpoint: &Endpoint) -> io::Result<()> {
    if !endpoint.is_file_backed() {
        return Ok(());
    }
    match tokio::fs::remove_file(endpoint.as_path()).await {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e),
    }
}

/// Listening side of the local channel.
#[cfg(unix)]
pub struct Listener {
    inner: tokio::net::UnixListener,
}

#[cfg(windows)]
pub struct Listener {
    name: std::path::PathBuf,
    next: tokio::net::windows::named_pipe::NamedPipeServer,
}

/// Start listening on `endpoint`.
#[cfg(unix)]
pub fn bind(endpoint: &Endpoint) -> io::Result<Listener> {
    Ok(Listener {
        inner: tokio::net::UnixListener::bind(endpoint.as_path())?,
    })
}

/// Start listening on `endpoint`.
#[cfg(windows)]
pub fn bind(endpoint: &Endpoint) -> io::Result<Listener> {
    use tokio::net::windows::named_pipe::ServerOptions;

    let next = ServerOptions::new()
        .first_pipe_instance(true)
        .create(endpoint.as_path())?;
    Ok(Listener {
        name: endpoint.as_path().to_path_buf(),
        next,
    })
}

impl Listener {
    /// Wait for the next connection.
    #[cfg(unix)]
    pub async fn accept(&mut self) -> io::Result<ServerStream> {
        let (stream, _addr) = self.inner.accept().await?;
        Ok(stream)
    }

    /// Wait for the next connection.
    #[cfg(windows)]
    pub async fn accept(&mut self) -> io::Result<ServerStream> {
        use tokio::net::windows::named_pipe::ServerOptions;

        self.next.connect().await?;
        let spare = ServerOptions::new().create(&self.name)?;
        Ok(std::mem::replace(&mut self.next, spare))
    }
}
