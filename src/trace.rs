//! Path discovery by TTL escalation.

use crate::icmp::{self, Reply};
use crate::internet::resolve_ipv4;
use crate::socket::{self, RawSocket};
use crate::Error;
use std::net::Ipv4Addr;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tokio::time::sleep;

pub const MAX_HOPS: u16 = 64;
const HOP_TIMEOUT: Duration = Duration::from_secs(5);
const HOP_INTERVAL: Duration = Duration::from_secs(1);

/// Walks the route to a host, one probe per TTL, reporting each responding
/// hop as `hop address rtt` and unanswered hops as `hop *`.
pub struct Tracer {
    pub host: String,
    pub addr: Ipv4Addr,
    sink: Mutex<Option<mpsc::UnboundedSender<String>>>,
}

impl Tracer {
    pub fn new(host: &str, sink: Option<mpsc::UnboundedSender<String>>) -> Result<Self, Error> {
        let addr = resolve_ipv4(host)?;
        Ok(Self {
            host: host.to_string(),
            addr,
            sink: Mutex::new(sink),
        })
    }

    /// Escalates TTL from 1 until the destination answers or the hop
    /// ceiling passes. An intermediate Time Exceeded and a terminal Echo
    /// Reply both satisfy a hop's wait. Running off the ceiling without
    /// reaching the destination just ends the report.
    pub async fn trace(&self) {
        let socket = match RawSocket::open(self.addr, HOP_TIMEOUT) {
            Ok(socket) => Arc::new(socket),
            Err(err) => {
                self.emit(err.to_string());
                self.close_sink();
                return;
            }
        };
        self.emit(format!(
            "traceroute to {} ({}), {} hops max",
            self.host, self.addr, MAX_HOPS
        ));

        let identifier: u16 = rand::random();
        let (token_tx, token_rx) = mpsc::channel(1);
        let (reply_tx, mut reply_rx) = mpsc::channel(1);
        {
            let socket = Arc::clone(&socket);
            let sink = self.sink.lock().unwrap().clone();
            std::thread::spawn(move || {
                hop_receive_loop(socket, identifier, token_rx, reply_tx, sink)
            });
        }

        for hop in 1..=MAX_HOPS {
            if let Err(err) = socket.set_ttl(u32::from(hop)) {
                self.emit(err.to_string());
                continue;
            }
            // The sequence field carries the hop number, which is what the
            // worker correlates against.
            let datagram = icmp::build_echo_request(identifier, hop);
            let start = Instant::now();
            if let Err(err) = socket.send(&datagram) {
                self.emit(err.to_string());
                continue;
            }
            if token_tx.send(hop).await.is_err() {
                break;
            }
            let reply = match reply_rx.recv().await {
                Some(Some(reply)) => reply,
                // Unanswered hop, reported by the worker as "hop *".
                Some(None) => continue,
                None => break,
            };
            let elapsed = start.elapsed().as_secs_f64() * 1_000.0;
            self.emit(format!("{} {}  {:.3}ms", hop, reply.responder, elapsed));
            if reply.responder == self.addr {
                break;
            }
            sleep(HOP_INTERVAL).await;
        }

        drop(token_tx);
        self.close_sink();
    }

    fn emit(&self, line: String) {
        if let Some(sink) = &*self.sink.lock().unwrap() {
            let _ = sink.send(line);
        }
    }

    fn close_sink(&self) {
        self.sink.lock().unwrap().take();
    }
}

/// Same rendezvous as the ping worker, but an unanswered hop reports as
/// `hop *` and the token is the hop number echoed in the probe's sequence.
fn hop_receive_loop(
    socket: Arc<RawSocket>,
    identifier: u16,
    mut token_rx: mpsc::Receiver<u16>,
    reply_tx: mpsc::Sender<Option<Reply>>,
    sink: Option<mpsc::UnboundedSender<String>>,
) {
    let mut buf = [0u8; socket::RECV_BUFFER_LEN];
    let mut hop = match token_rx.blocking_recv() {
        Some(hop) => hop,
        None => return,
    };
    loop {
        match socket.recv_from(&mut buf) {
            Err(err) => {
                if let Some(sink) = &sink {
                    if socket::is_timeout(&err) {
                        let _ = sink.send(format!("{} *", hop));
                    } else {
                        let _ = sink.send(err.to_string());
                    }
                }
                if reply_tx.blocking_send(None).is_err() {
                    return;
                }
            }
            Ok((size, from)) => {
                let reply = match icmp::parse_reply(&buf[..size], identifier, from) {
                    Ok(reply) => reply,
                    Err(_) => continue,
                };
                if reply.sequence != hop {
                    continue;
                }
                if reply_tx.blocking_send(Some(reply)).is_err() {
                    return;
                }
            }
        }
        hop = match token_rx.blocking_recv() {
            Some(hop) => hop,
            None => return,
        };
    }
}
