//! Accepting side: HTTP/1.1 listener. One request per connection.
//!
//! GET  -> long-lived response; the body is whatever the session writes until close.
//! PUT  -> Content-Length body fed to the session, answered once consumed.
//! OPTIONS -> CORS preflight.

use std::net::SocketAddr;

use bytes::Bytes;
use lpt_core::{ChannelError, Direction};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, trace};

use crate::channels::{ChannelEvent, Command, Emitter, Event, HandleSource, Incoming, Role, MAX_WRITE};

/// Request heads larger than this are refused.
const MAX_HEAD: usize = 16 * 1024;

const CORS_RESPONSE: &[u8] = b"HTTP/1.1 200 OK\r\n\
Access-Control-Allow-Origin: *\r\n\
Access-Control-Allow-Methods: GET, PUT, OPTIONS\r\n\
Access-Control-Allow-Headers: Content-Type\r\n\
Access-Control-Max-Age: 86400\r\n\
Content-Length: 0\r\n\
Connection: close\r\n\r\n";

const STREAM_HEAD: &[u8] = b"HTTP/1.1 200 OK\r\n\
Content-Type: application/octet-stream\r\n\
Cache-Control: no-cache\r\n\
Access-Control-Allow-Origin: *\r\n\
Connection: close\r\n\r\n";

const PUT_OK: &[u8] = b"HTTP/1.1 200 OK\r\n\
Content-Type: text/plain\r\n\
Access-Control-Allow-Origin: *\r\n\
Content-Length: 2\r\n\
Connection: close\r\n\r\nok";

const PUT_CANCELLED: &[u8] = b"HTTP/1.1 204 No Content\r\nConnection: close\r\n\r\n";

const NOT_FOUND: &[u8] = b"HTTP/1.1 404 Not Found\r\nContent-Length: 0\r\nConnection: close\r\n\r\n";

const BAD_REQUEST: &[u8] = b"HTTP/1.1 400 Bad Request\r\nContent-Length: 0\r\nConnection: close\r\n\r\n";

const NOT_ALLOWED: &[u8] =
    b"HTTP/1.1 405 Method Not Allowed\r\nAllow: GET, PUT, OPTIONS\r\nContent-Length: 0\r\nConnection: close\r\n\r\n";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequestHead {
    pub method: String,
    pub path: String,
    pub content_length: usize,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HeadError {
    Malformed,
    BadContentLength,
}

/// Parse a request head. `Ok(None)` until the head is complete; on success also returns its length.
pub fn parse_head(buf: &[u8]) -> Result<Option<(RequestHead, usize)>, HeadError> {
    let mut headers = [httparse::EMPTY_HEADER; 32];
    let mut req = httparse::Request::new(&mut headers);
    let status = req.parse(buf).map_err(|_| HeadError::Malformed)?;
    let httparse::Status::Complete(len) = status else {
        return Ok(None);
    };
    let method = req.method.ok_or(HeadError::Malformed)?.to_string();
    let path = req.path.ok_or(HeadError::Malformed)?.to_string();
    let mut content_length = 0;
    for h in req.headers.iter() {
        if h.name.eq_ignore_ascii_case("Content-Length") {
            let v = std::str::from_utf8(h.value).map_err(|_| HeadError::BadContentLength)?;
            content_length = v.trim().parse().map_err(|_| HeadError::BadContentLength)?;
        }
    }
    Ok(Some((
        RequestHead {
            method,
            path,
            content_length,
        },
        len,
    )))
}

/// Accept connections until the dispatcher goes away.
pub async fn run_listener(
    listener: TcpListener,
    events: mpsc::UnboundedSender<Event>,
    handles: HandleSource,
) -> std::io::Result<()> {
    loop {
        let (stream, remote) = listener.accept().await?;
        if events.is_closed() {
            return Ok(());
        }
        let events = events.clone();
        let handles = handles.clone();
        tokio::spawn(async move {
            if let Err(e) = handle_connection(stream, remote, events, handles).await {
                trace!(%remote, error = %e, "connection ended");
            }
        });
    }
}

async fn handle_connection(
    mut stream: TcpStream,
    remote: SocketAddr,
    events: mpsc::UnboundedSender<Event>,
    handles: HandleSource,
) -> std::io::Result<()> {
    let mut buf = Vec::with_capacity(4096);
    let mut chunk = [0u8; 4096];
    let (head, head_len) = loop {
        let n = stream.read(&mut chunk).await?;
        if n == 0 {
            return Ok(());
        }
        buf.extend_from_slice(&chunk[..n]);
        match parse_head(&buf) {
            Ok(Some(parsed)) => break parsed,
            Ok(None) if buf.len() < MAX_HEAD => continue,
            _ => return stream.write_all(BAD_REQUEST).await,
        }
    };
    let direction = match head.method.as_str() {
        "OPTIONS" => return stream.write_all(CORS_RESPONSE).await,
        "GET" => Direction::Send,
        "PUT" => Direction::Recv,
        _ => return stream.write_all(NOT_ALLOWED).await,
    };

    let handle = handles.next();
    let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();
    let (verdict_tx, verdict_rx) = oneshot::channel();
    let incoming = Incoming {
        handle,
        direction,
        url: head.path.clone(),
        remote,
        commands: cmd_tx,
        verdict: verdict_tx,
    };
    if events.send(Event::Incoming(incoming)).is_err() {
        return stream.write_all(NOT_FOUND).await;
    }
    if !verdict_rx.await.unwrap_or(false) {
        debug!(%remote, path = %head.path, "request rejected");
        return stream.write_all(NOT_FOUND).await;
    }
    let emitter = Emitter::new(Role::Server, handle, events);
    match direction {
        Direction::Send => serve_stream(stream, emitter, cmd_rx).await,
        Direction::Recv => {
            let body = buf.split_off(head_len);
            serve_put(stream, emitter, cmd_rx, body, head.content_length).await
        }
    }
}

/// GET: write the head, then whatever the session hands over, until either side closes.
async fn serve_stream(
    mut stream: TcpStream,
    emitter: Emitter,
    mut commands: mpsc::UnboundedReceiver<Command>,
) -> std::io::Result<()> {
    stream.write_all(STREAM_HEAD).await?;
    emitter.emit(ChannelEvent::Overhead(STREAM_HEAD.len()));
    let (mut reader, mut writer) = stream.into_split();
    let mut scratch = [0u8; 512];
    loop {
        tokio::select! {
            cmd = commands.recv() => match cmd {
                Some(Command::Wanted) => {
                    emitter.emit(ChannelEvent::Writable(MAX_WRITE));
                }
                Some(Command::Write(bytes)) => {
                    if let Err(e) = write_chunk(&mut writer, &bytes).await {
                        emitter.emit(ChannelEvent::Error(ChannelError::Io(e.to_string())));
                        return Err(e);
                    }
                }
                Some(Command::Close) | None => {
                    let _ = writer.shutdown().await;
                    emitter.emit(ChannelEvent::Closed);
                    return Ok(());
                }
                Some(Command::Pause) | Some(Command::Resume) => {}
            },
            read = reader.read(&mut scratch) => match read {
                Ok(0) => {
                    emitter.emit(ChannelEvent::Closed);
                    return Ok(());
                }
                // Nothing is expected after the request head.
                Ok(_) => {}
                Err(e) => {
                    emitter.emit(ChannelEvent::Error(ChannelError::Io(e.to_string())));
                    return Err(e);
                }
            },
        }
    }
}

async fn write_chunk(writer: &mut tokio::net::tcp::OwnedWriteHalf, bytes: &Bytes) -> std::io::Result<()> {
    writer.write_all(bytes).await?;
    writer.flush().await
}

/// PUT: feed the body, report the half closed, then answer.
async fn serve_put(
    mut stream: TcpStream,
    emitter: Emitter,
    mut commands: mpsc::UnboundedReceiver<Command>,
    mut body: Vec<u8>,
    content_length: usize,
) -> std::io::Result<()> {
    body.truncate(content_length);
    let mut remaining = content_length - body.len();
    if !body.is_empty() {
        emitter.emit(ChannelEvent::Data(Bytes::from(body)));
    }
    let mut paused = false;
    let mut chunk = vec![0u8; 16 * 1024];
    while remaining > 0 {
        let want = remaining.min(chunk.len());
        tokio::select! {
            cmd = commands.recv() => match cmd {
                Some(Command::Pause) => paused = true,
                Some(Command::Resume) => paused = false,
                Some(Command::Close) | None => {
                    emitter.emit(ChannelEvent::Closed);
                    return stream.write_all(PUT_CANCELLED).await;
                }
                Some(Command::Wanted) | Some(Command::Write(_)) => {}
            },
            read = stream.read(&mut chunk[..want]), if !paused => match read {
                Ok(0) => {
                    emitter.emit(ChannelEvent::Error(ChannelError::Io("request body truncated".into())));
                    return Ok(());
                }
                Ok(n) => {
                    remaining -= n;
                    emitter.emit(ChannelEvent::Data(Bytes::copy_from_slice(&chunk[..n])));
                }
                Err(e) => {
                    emitter.emit(ChannelEvent::Error(ChannelError::Io(e.to_string())));
                    return Err(e);
                }
            },
        }
    }
    emitter.emit(ChannelEvent::Closed);
    stream.write_all(PUT_OK).await
}
