//! The TCP front of the command handler.
use std::io::{self, BufRead, BufReader, Read, Write};
use std::net::{SocketAddr, TcpListener, TcpStream};
use std::sync::Arc;
use std::thread;

use parking_lot::Mutex;
use tracing::{debug, info, warn};

use tad::{Answer, Reply, Tad};

/// Accepts connections and feeds their requests to one shared `Tad`.
pub struct Server {
    tad: Tad,
    listener: TcpListener,
}

/// Writes answers back to one connection.
struct StreamReply {
    peer: SocketAddr,
    stream: Mutex<TcpStream>,
}

impl Server {
    pub fn bind(tad: Tad, addr: SocketAddr) -> io::Result<Self> {
        let listener = TcpListener::bind(addr)?;
        Ok(Server { tad, listener })
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    /// Serve connections until accepting fails.
    ///
    /// Each connection gets its own thread. The handler serializes the requests of all of them.
    pub fn run(self) -> io::Result<()> {
        info!(addr = %self.listener.local_addr()?, "accepting commands");
        for stream in self.listener.incoming() {
            let stream = stream?;
            let tad = self.tad.clone();
            thread::Builder::new()
                .name("tad-conn".into())
                .spawn(move || {
                    if let Err(err) = serve(tad, stream) {
                        warn!(error = %err, "connection closed");
                    }
                })?;
        }
        Ok(())
    }
}

fn serve(tad: Tad, stream: TcpStream) -> io::Result<()> {
    let peer = stream.peer_addr()?;
    info!(%peer, "connected");

    let reply = Arc::new(StreamReply {
        peer,
        stream: Mutex::new(stream.try_clone()?),
    });
    let mut reader = BufReader::new(stream);
    let mut line = String::new();

    loop {
        line.clear();
        if reader.read_line(&mut line)? == 0 {
            break;
        }

        let (request, length) = split_attachment(line.trim_end());
        let attachment = match length {
            Some(length) => {
                let mut bytes = vec![0; length];
                reader.read_exact(&mut bytes)?;
                let text = String::from_utf8(bytes)
                    .map_err(|err| io::Error::new(io::ErrorKind::InvalidData, err))?;
                Some(text)
            },
            None => None,
        };

        if request.is_empty() {
            continue;
        }

        debug!(%peer, request, "request");
        tad.handle_line(request, attachment, reply.clone());
    }

    info!(%peer, "disconnected");
    Ok(())
}

/// Split a trailing `attach <len>` off a request line.
fn split_attachment(line: &str) -> (&str, Option<usize>) {
    let mut words = line.rsplitn(3, ' ');
    let length = words.next().and_then(|word| word.parse().ok());
    let keyword = words.next();
    match (keyword, length, words.next()) {
        (Some("attach"), Some(length), Some(rest)) => (rest.trim_end(), Some(length)),
        _ => (line, None),
    }
}

/// The bytes of one answer on the wire.
fn encode(answer: &Answer) -> Vec<u8> {
    let mut out = answer.to_string();
    match &answer.attachment {
        Some(attachment) => {
            out.push_str(&format!(" attach {}\n", attachment.len()));
            out.push_str(attachment);
        },
        None => out.push('\n'),
    }
    out.into_bytes()
}

impl Reply for StreamReply {
    fn send(&self, answer: Answer) {
        let bytes = encode(&answer);
        let mut stream = self.stream.lock();
        if let Err(err) = stream.write_all(&bytes).and_then(|_| stream.flush()) {
            warn!(peer = %self.peer, error = %err, "answer lost");
        }
    }
}
