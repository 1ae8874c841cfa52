use std::io::{ErrorKind, Read, Write};
use std::net::{Ipv4Addr, Shutdown, SocketAddr, TcpStream};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use socket2::{Domain, Protocol, Socket, Type};
use tokio_util::sync::CancellationToken;

use crate::registry::ClientRegistry;

pub const TS_CONTENT_TYPE: &str = "video/mp2t";

const LISTEN_BACKLOG: i32 = 16;
const ACCEPT_RETRY_DELAY: Duration = Duration::from_millis(10);
const REQUEST_READ_TIMEOUT: Duration = Duration::from_secs(5);
const DISCONNECT_POLL_INTERVAL: Duration = Duration::from_millis(100);
const CLIENT_WRITE_TIMEOUT: Duration = Duration::from_secs(2);
const MAX_REQUEST_SIZE: usize = 4096;

const NOT_FOUND_RESPONSE: &[u8] = b"HTTP/1.1 404 Not Found\r\n\
Content-Type: text/plain\r\n\
Content-Length: 13\r\n\
Connection: close\r\n\
\r\n\
404 Not Found";

fn stream_response(content_type: &str) -> String {
    format!(
        "HTTP/1.1 200 OK\r\n\
Content-Type: {}\r\n\
Connection: keep-alive\r\n\
Cache-Control: no-cache\r\n\
Pragma: no-cache\r\n\
\r\n",
        content_type
    )
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequestLine<'a> {
    pub method: &'a str,
    pub path: &'a str,
}

impl<'a> RequestLine<'a> {
    /// Parses the first line of an HTTP request. The query string is not part
    /// of `path`.
    pub fn parse(request: &'a [u8]) -> Option<Self> {
        let end = request.iter().position(|b| *b == b'\n').unwrap_or(request.len());
        let line = std::str::from_utf8(&request[..end]).ok()?.trim_end_matches('\r');
        let mut parts = line.split_ascii_whitespace();
        let method = parts.next()?;
        let target = parts.next()?;
        let version = parts.next()?;
        if !version.starts_with("HTTP/") {
            return None;
        }
        let path = target.split('?').next().unwrap_or(target);
        Some(Self { method, path })
    }
}

struct HandlerContext {
    stream_path: String,
    content_type: &'static str,
    registry: Arc<ClientRegistry>,
    cancel: CancellationToken,
}

/// Bound listener, ready to start accepting.
pub struct ConnectionManager {
    listener: Arc<Socket>,
    local_addr: SocketAddr,
    context: Arc<HandlerContext>,
}

impl ConnectionManager {
    pub fn bind(
        port: u16,
        stream_path: &str,
        registry: Arc<ClientRegistry>,
        cancel: CancellationToken,
    ) -> anyhow::Result<Self> {
        let addr = SocketAddr::from((Ipv4Addr::UNSPECIFIED, port));
        Self::bind_addr(addr, stream_path, registry, cancel)
    }

    pub fn bind_addr(
        addr: SocketAddr,
        stream_path: &str,
        registry: Arc<ClientRegistry>,
        cancel: CancellationToken,
    ) -> anyhow::Result<Self> {
        let socket = Socket::new(Domain::for_address(addr), Type::STREAM, Some(Protocol::TCP))?;
        socket.set_reuse_address(true)?;
        socket
            .bind(&addr.into())
            .map_err(|e| anyhow::anyhow!("bind {}: {}", addr, e))?;
        socket.listen(LISTEN_BACKLOG)?;
        let local_addr = socket
            .local_addr()?
            .as_socket()
            .ok_or(anyhow::anyhow!("listener has no inet address"))?;
        log::info!("listening on {} for {}", local_addr, stream_path);

        Ok(Self {
            listener: Arc::new(socket),
            local_addr,
            context: Arc::new(HandlerContext {
                stream_path: stream_path.to_string(),
                content_type: TS_CONTENT_TYPE,
                registry,
                cancel,
            }),
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn spawn(self) -> anyhow::Result<ListenerHandle> {
        let listener = Arc::clone(&self.listener);
        let context = Arc::clone(&self.context);
        let thread = thread::Builder::new()
            .name("ts-accept".into())
            .spawn(move || accept_loop(listener, context))?;
        Ok(ListenerHandle {
            thread,
            listener: self.listener,
            local_addr: self.local_addr,
        })
    }
}

/// Running accept loop.
pub struct ListenerHandle {
    thread: JoinHandle<()>,
    listener: Arc<Socket>,
    local_addr: SocketAddr,
}

impl ListenerHandle {
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Unblocks a pending accept. The cancellation token must already be
    /// cancelled so the loop exits instead of retrying.
    pub fn shutdown(&self) {
        let _ = self.listener.shutdown(Shutdown::Both);
        // some platforms keep accept blocked after shutdown
        let wake = SocketAddr::from((Ipv4Addr::LOCALHOST, self.local_addr.port()));
        let _ = TcpStream::connect_timeout(&wake, Duration::from_millis(100));
    }

    pub fn join(self) {
        if self.thread.join().is_err() {
            log::error!("accept thread panicked");
        }
    }
}

fn accept_loop(listener: Arc<Socket>, context: Arc<HandlerContext>) {
    log::info!("accept loop started");
    while !context.cancel.is_cancelled() {
        match listener.accept() {
            Ok((socket, addr)) => {
                if context.cancel.is_cancelled() {
                    break;
                }
                let stream: TcpStream = socket.into();
                let peer = addr.as_socket();
                let context = Arc::clone(&context);
                if let Err(e) = thread::Builder::new()
                    .name("ts-client".into())
                    .spawn(move || handle_client(stream, peer, context))
                {
                    log::error!("spawn client handler: {}", e);
                }
            }
            Err(_) if context.cancel.is_cancelled() => break,
            Err(e) => {
                log::warn!("accept failed: {}", e);
                thread::sleep(ACCEPT_RETRY_DELAY);
            }
        }
    }
    log::info!("accept loop finished");
}

fn handle_client(mut stream: TcpStream, peer: Option<SocketAddr>, context: Arc<HandlerContext>) {
    if let Err(e) = stream.set_read_timeout(Some(REQUEST_READ_TIMEOUT)) {
        log::debug!("set read timeout for {:?}: {}", peer, e);
        return;
    }
    let mut buf = [0u8; MAX_REQUEST_SIZE];
    let n = match stream.read(&mut buf) {
        Ok(0) => return,
        Ok(n) => n,
        Err(e) => {
            log::debug!("read request from {:?}: {}", peer, e);
            return;
        }
    };

    let accepted = matches!(
        RequestLine::parse(&buf[..n]),
        Some(line) if line.method == "GET" && line.path == context.stream_path
    );
    if !accepted {
        log::debug!("rejecting request from {:?}", peer);
        let _ = stream.write_all(NOT_FOUND_RESPONSE);
        let _ = stream.shutdown(Shutdown::Both);
        return;
    }

    if let Err(e) = serve_stream(stream, peer, &context) {
        log::debug!("client {:?} ended: {:#}", peer, e);
    }
}

fn serve_stream(
    mut stream: TcpStream,
    peer: Option<SocketAddr>,
    context: &HandlerContext,
) -> anyhow::Result<()> {
    stream.set_nodelay(true)?;
    stream.write_all(stream_response(context.content_type).as_bytes())?;
    stream.set_write_timeout(Some(CLIENT_WRITE_TIMEOUT))?;
    stream.set_read_timeout(Some(DISCONNECT_POLL_INTERVAL))?;
    let probe = stream.try_clone()?;

    let id = context.registry.register(stream);
    let mut byte = [0u8; 1];
    loop {
        if context.cancel.is_cancelled() || !context.registry.contains(id) {
            break;
        }
        match probe.peek(&mut byte) {
            Ok(0) => break,
            // the client sent something; we only care about disconnects
            Ok(_) => thread::sleep(DISCONNECT_POLL_INTERVAL),
            Err(e)
                if matches!(
                    e.kind(),
                    ErrorKind::WouldBlock | ErrorKind::TimedOut | ErrorKind::Interrupted
                ) => {}
            Err(e) => {
                log::debug!("client {} ({:?}) poll failed: {}", id, peer, e);
                break;
            }
        }
    }
    context.registry.remove(id);
    Ok(())
}

#[cfg(test)]
#[path = "server_test.rs"]
mod server_test;
