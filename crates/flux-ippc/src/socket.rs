//! Local stream socket transport.
//!
//! `ServerSocket`/`Stream` bind a local stream socket to Unix domain stream
//! sockets keyed by a filesystem path -- the natural local stream socket on
//! this platform, non-blocking throughout.

use std::{
    io::{self, Read, Write},
    os::fd::{AsRawFd, RawFd},
    path::{Path, PathBuf},
};

use mio::{Interest, Registry, Token, net::UnixListener};

/// Listening endpoint. Binds, listens, and sets non-blocking at construction.
pub struct ServerSocket {
    inner: UnixListener,
    path: PathBuf,
    closed: bool,
}

impl ServerSocket {
    pub fn bind(path: impl AsRef<Path>) -> io::Result<Self> {
        let path = path.as_ref().to_path_buf();
        // Stale sockets from a crashed prior run would otherwise make bind fail.
        let _ = std::fs::remove_file(&path);
        let inner = UnixListener::bind(&path)?;
        Ok(Self { inner, path, closed: false })
    }

    pub fn register(&mut self, registry: &Registry, token: Token) -> io::Result<()> {
        registry.register(&mut self.inner, token, Interest::READABLE)
    }

    /// Accepts one pending connection, or `Ok(None)` on would-block.
    pub fn accept(&self) -> io::Result<Option<(Stream, PathBuf)>> {
        match self.inner.accept() {
            Ok((stream, addr)) => {
                let label = addr
                    .as_pathname()
                    .map(Path::to_path_buf)
                    .unwrap_or_else(|| self.path.clone());
                Ok(Some((Stream::new(stream), label)))
            }
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => Ok(None),
            Err(e) => Err(e),
        }
    }

    pub fn close(&mut self, registry: &Registry) {
        if !self.closed {
            let _ = registry.deregister(&mut self.inner);
            let _ = std::fs::remove_file(&self.path);
            self.closed = true;
        }
    }

    pub fn closed(&self) -> bool {
        self.closed
    }
}

/// One accepted or connected end. Used both server- and client-side;
/// `Connection` layers the read/write task machinery on top of this.
pub struct Stream {
    inner: mio::net::UnixStream,
    closed: bool,
}

impl Stream {
    fn new(inner: mio::net::UnixStream) -> Self {
        Self { inner, closed: false }
    }

    pub fn connect(path: impl AsRef<Path>) -> io::Result<Self> {
        Ok(Self::new(mio::net::UnixStream::connect(path)?))
    }

    /// Wraps an already-connected raw stream, e.g. one half of
    /// [`mio::net::UnixStream::pair`] in a test.
    #[cfg(test)]
    pub(crate) fn from_raw(inner: mio::net::UnixStream) -> Self {
        Self::new(inner)
    }

    pub fn register(&mut self, registry: &Registry, token: Token, interest: Interest) -> io::Result<()> {
        registry.register(&mut self.inner, token, interest)
    }

    pub fn reregister(&mut self, registry: &Registry, token: Token, interest: Interest) -> io::Result<()> {
        registry.reregister(&mut self.inner, token, interest)
    }

    pub fn deregister(&mut self, registry: &Registry) -> io::Result<()> {
        registry.deregister(&mut self.inner)
    }

    /// Drains everything currently available into `buf`. Returns `true` if
    /// the peer closed the connection (EOF), `false` otherwise (including
    /// would-block, which is folded into "no EOF observed yet").
    pub fn read_into(&mut self, buf: &mut Vec<u8>) -> io::Result<bool> {
        let mut chunk = [0u8; 8192];
        loop {
            match self.inner.read(&mut chunk) {
                Ok(0) => return Ok(true),
                Ok(n) => buf.extend_from_slice(&chunk[..n]),
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => return Ok(false),
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e),
            }
        }
    }

    /// Writes as much of `buf` as the socket accepts right now, returning the
    /// number of bytes consumed (the caller drains its own queue accordingly).
    pub fn write_some(&mut self, buf: &[u8]) -> io::Result<usize> {
        match self.inner.write(buf) {
            Ok(n) => Ok(n),
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => Ok(0),
            Err(e) if e.kind() == io::ErrorKind::Interrupted => Ok(0),
            Err(e) => Err(e),
        }
    }

    pub fn close(&mut self, registry: &Registry) {
        if !self.closed {
            let _ = registry.deregister(&mut self.inner);
            let _ = self.inner.shutdown(std::net::Shutdown::Both);
            self.closed = true;
        }
    }

    pub fn closed(&self) -> bool {
        self.closed
    }
}

impl AsRawFd for Stream {
    fn as_raw_fd(&self) -> RawFd {
        self.inner.as_raw_fd()
    }
}
