use std::io::{Read, Write};
use std::net::{SocketAddr, TcpStream};
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio_util::sync::CancellationToken;

use super::{ConnectionManager, ListenerHandle, RequestLine};
use crate::registry::ClientRegistry;

fn start_server() -> anyhow::Result<(ListenerHandle, Arc<ClientRegistry>, CancellationToken)> {
    let registry = Arc::new(ClientRegistry::new());
    let cancel = CancellationToken::new();
    let addr: SocketAddr = "127.0.0.1:0".parse()?;
    let manager = ConnectionManager::bind_addr(addr, "/stream", registry.clone(), cancel.clone())?;
    Ok((manager.spawn()?, registry, cancel))
}

fn stop_server(handle: ListenerHandle, registry: &ClientRegistry, cancel: &CancellationToken) {
    cancel.cancel();
    handle.shutdown();
    registry.close_all();
    handle.join();
}

fn wait_for(mut condition: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + Duration::from_secs(3);
    while Instant::now() < deadline {
        if condition() {
            return true;
        }
        std::thread::sleep(Duration::from_millis(10));
    }
    condition()
}

fn read_headers(stream: &mut TcpStream) -> anyhow::Result<String> {
    let mut headers = Vec::new();
    let mut byte = [0u8; 1];
    while !headers.ends_with(b"\r\n\r\n") {
        if stream.read(&mut byte)? == 0 {
            break;
        }
        headers.push(byte[0]);
    }
    Ok(String::from_utf8(headers)?)
}

#[test]
fn parse_request_line() {
    let line = RequestLine::parse(b"GET /stream?token=1 HTTP/1.1\r\nHost: x\r\n\r\n").unwrap();
    assert_eq!(line.method, "GET");
    assert_eq!(line.path, "/stream");
    assert!(RequestLine::parse(b"GET\r\n\r\n").is_none());
    assert!(RequestLine::parse(b"GET /stream SPDY\r\n").is_none());
    assert!(RequestLine::parse(&[0xff, 0xfe, b' ', b'/']).is_none());
}

#[test]
fn unknown_path_gets_404_and_is_not_counted() -> anyhow::Result<()> {
    let (handle, registry, cancel) = start_server()?;
    let mut client = TcpStream::connect(handle.local_addr())?;
    client.set_read_timeout(Some(Duration::from_secs(3)))?;
    client.write_all(b"GET /other HTTP/1.1\r\nHost: localhost\r\n\r\n")?;

    let mut response = String::new();
    client.read_to_string(&mut response)?;
    assert!(response.starts_with("HTTP/1.1 404 Not Found\r\n"), "{}", response);
    assert!(response.contains("Content-Type: text/plain"));
    assert!(response.ends_with("404 Not Found"));
    assert_eq!(registry.count(), 0);

    stop_server(handle, &registry, &cancel);
    Ok(())
}

#[test]
fn post_to_stream_path_is_rejected() -> anyhow::Result<()> {
    let (handle, registry, cancel) = start_server()?;
    let mut client = TcpStream::connect(handle.local_addr())?;
    client.set_read_timeout(Some(Duration::from_secs(3)))?;
    client.write_all(b"POST /stream HTTP/1.1\r\n\r\n")?;
    let mut response = String::new();
    client.read_to_string(&mut response)?;
    assert!(response.starts_with("HTTP/1.1 404"));
    assert_eq!(registry.count(), 0);
    stop_server(handle, &registry, &cancel);
    Ok(())
}

#[test]
fn stream_request_is_registered_until_disconnect() -> anyhow::Result<()> {
    let (handle, registry, cancel) = start_server()?;
    let mut client = TcpStream::connect(handle.local_addr())?;
    client.set_read_timeout(Some(Duration::from_secs(3)))?;
    client.write_all(b"GET /stream HTTP/1.1\r\nHost: localhost\r\n\r\n")?;

    let headers = read_headers(&mut client)?;
    assert!(headers.starts_with("HTTP/1.1 200 OK\r\n"), "{}", headers);
    assert!(headers.contains("Content-Type: video/mp2t\r\n"));
    assert!(headers.contains("Connection: keep-alive\r\n"));
    assert!(headers.contains("Cache-Control: no-cache\r\n"));
    assert!(wait_for(|| registry.count() == 1));

    registry.broadcast(&[0x47; 188]);
    let mut packet = [0u8; 188];
    client.read_exact(&mut packet)?;
    assert_eq!(packet[0], 0x47);

    drop(client);
    assert!(wait_for(|| registry.count() == 0));

    stop_server(handle, &registry, &cancel);
    Ok(())
}

#[test]
fn stop_closes_connected_clients() -> anyhow::Result<()> {
    let (handle, registry, cancel) = start_server()?;
    let addr = handle.local_addr();
    let mut client = TcpStream::connect(addr)?;
    client.set_read_timeout(Some(Duration::from_secs(3)))?;
    client.write_all(b"GET /stream HTTP/1.1\r\n\r\n")?;
    read_headers(&mut client)?;
    assert!(wait_for(|| registry.count() == 1));

    stop_server(handle, &registry, &cancel);
    assert_eq!(registry.count(), 0);
    let mut rest = Vec::new();
    client.read_to_end(&mut rest)?;
    assert!(rest.is_empty());
    Ok(())
}
