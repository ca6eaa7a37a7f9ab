//! Echo probe loop with live statistics and a pause/resume/cancel surface.
//!
//! The loop and its receive worker rendezvous once per probe: the loop hands
//! the worker the outstanding sequence number, the worker answers with the
//! matching [`Reply`] or a synthesized timeout. Both channels hold a single
//! slot, so there is never more than one probe in flight.

use crate::icmp::{self, Reply};
use crate::internet::resolve_ipv4;
use crate::socket::{self, RawSocket};
use crate::Error;
use std::net::Ipv4Addr;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tokio::time::sleep;

const PROBE_INTERVAL: Duration = Duration::from_secs(1);
const PAUSE_POLL_INTERVAL: Duration = Duration::from_millis(200);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Control {
    Running,
    Paused,
    Cancelled,
}

/// Running counters for one ping session, in milliseconds.
#[derive(Debug, Clone)]
pub struct PingStats {
    pub transmitted: u32,
    pub received: u32,
    pub min: f64,
    pub max: f64,
    pub avg: f64,
    pub stddev: f64,
    samples: Vec<f64>,
}

impl PingStats {
    fn new() -> Self {
        Self {
            transmitted: 0,
            received: 0,
            min: f64::MAX,
            max: 0.0,
            avg: 0.0,
            stddev: 0.0,
            samples: Vec::new(),
        }
    }

    fn record(&mut self, rtt_ms: f64) {
        self.received += 1;
        if rtt_ms > self.max {
            self.max = rtt_ms;
        }
        if rtt_ms < self.min {
            self.min = rtt_ms;
        }
        self.samples.push(rtt_ms);
    }

    pub fn loss_pct(&self) -> f64 {
        if self.transmitted == 0 {
            return 0.0;
        }
        f64::from(self.transmitted - self.received) / f64::from(self.transmitted) * 100.0
    }

    fn finish(&mut self) {
        let (avg, stddev) = mean_and_stddev(&self.samples);
        self.avg = avg;
        self.stddev = stddev;
    }
}

fn mean_and_stddev(samples: &[f64]) -> (f64, f64) {
    let mean = samples.iter().sum::<f64>() / samples.len() as f64;
    let variance = samples.iter().map(|s| (s - mean).powi(2)).sum::<f64>() / samples.len() as f64;
    (mean, variance.sqrt())
}

/// Sends `repeat` Echo Requests to one host, one per second, reporting
/// progress and a closing summary through the optional line sink.
pub struct Pinger {
    pub host: String,
    pub addr: Ipv4Addr,
    repeat: u16,
    timeout: Duration,
    sink: Mutex<Option<mpsc::UnboundedSender<String>>>,
    control: Mutex<Control>,
    stats: Mutex<PingStats>,
}

impl Pinger {
    pub fn new(
        host: &str,
        repeat: u16,
        timeout_secs: u64,
        sink: Option<mpsc::UnboundedSender<String>>,
    ) -> Result<Self, Error> {
        let addr = resolve_ipv4(host)?;
        Ok(Self {
            host: host.to_string(),
            addr,
            repeat,
            timeout: Duration::from_secs(timeout_secs),
            sink: Mutex::new(sink),
            control: Mutex::new(Control::Running),
            stats: Mutex::new(PingStats::new()),
        })
    }

    /// Runs the probe loop to completion or cancellation. Returns whether at
    /// least one reply came back, and closes the sink either way.
    pub async fn ping(&self) -> bool {
        let socket = match RawSocket::open(self.addr, self.timeout) {
            Ok(socket) => Arc::new(socket),
            Err(err) => {
                self.emit(err.to_string());
                self.close_sink();
                return false;
            }
        };
        self.emit(format!(
            "PING {} ({}): {} data bytes",
            self.host,
            self.addr,
            icmp::PAYLOAD_LEN
        ));

        let identifier: u16 = rand::random();
        let (token_tx, token_rx) = mpsc::channel(1);
        let (reply_tx, mut reply_rx) = mpsc::channel(1);
        {
            let socket = Arc::clone(&socket);
            let sink = self.sink.lock().unwrap().clone();
            std::thread::spawn(move || receive_loop(socket, identifier, token_rx, reply_tx, sink));
        }

        for sequence in 0..self.repeat {
            if self.wait_while_paused().await == Control::Cancelled {
                break;
            }
            let datagram = icmp::build_echo_request(identifier, sequence);
            let start = Instant::now();
            if let Err(err) = socket.send(&datagram) {
                self.emit(err.to_string());
                continue;
            }
            self.stats.lock().unwrap().transmitted += 1;
            if token_tx.send(sequence).await.is_err() {
                break;
            }
            match reply_rx.recv().await {
                Some(Some(reply)) => {
                    let elapsed = start.elapsed().as_secs_f64() * 1_000.0;
                    self.stats.lock().unwrap().record(elapsed);
                    self.emit(format!(
                        "{} bytes from {}: icmp_seq={} ttl={} time={:.3} ms",
                        reply.size, reply.responder, reply.sequence, reply.ttl, elapsed
                    ));
                }
                // Timeout, already reported by the worker.
                Some(None) => {}
                None => break,
            }
            sleep(PROBE_INTERVAL).await;
        }

        // Closing the token channel stops the worker; the socket follows it.
        drop(token_tx);
        let received = self.summary();
        self.close_sink();
        received > 0
    }

    /// Idempotent. Safe to call from any thread while `ping` runs.
    pub fn pause(&self) {
        let mut control = self.control.lock().unwrap();
        if *control != Control::Running {
            return;
        }
        *control = Control::Paused;
        drop(control);
        self.emit("ping paused".to_string());
    }

    pub fn resume(&self) {
        let mut control = self.control.lock().unwrap();
        if *control != Control::Paused {
            return;
        }
        *control = Control::Running;
        drop(control);
        self.emit("ping resumed".to_string());
    }

    /// Overrides a pause so a suspended loop still terminates promptly.
    pub fn cancel(&self) {
        let mut control = self.control.lock().unwrap();
        if *control == Control::Cancelled {
            return;
        }
        *control = Control::Cancelled;
        drop(control);
        self.emit("ping cancelled".to_string());
    }

    /// Snapshot of the session counters.
    pub fn stats(&self) -> PingStats {
        self.stats.lock().unwrap().clone()
    }

    async fn wait_while_paused(&self) -> Control {
        loop {
            let control = *self.control.lock().unwrap();
            match control {
                Control::Paused => sleep(PAUSE_POLL_INTERVAL).await,
                state => return state,
            }
        }
    }

    fn summary(&self) -> u32 {
        let mut stats = self.stats.lock().unwrap();
        self.emit(format!("--- {} ping statistics ---", self.host));
        self.emit(format!(
            "{} packets transmitted, {} packets received, {:.1}% packet loss",
            stats.transmitted,
            stats.received,
            stats.loss_pct()
        ));
        if !stats.samples.is_empty() {
            stats.finish();
            self.emit(format!(
                "round-trip min/avg/max/stddev = {:.3}/{:.3}/{:.3}/{:.3} ms",
                stats.min, stats.avg, stats.max, stats.stddev
            ));
        }
        stats.received
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

/// Receive worker: one correlated result per sequence token.
///
/// Datagrams that fail to decode or carry a stale sequence belong to someone
/// else (or to an expired probe) and never consume the token; the read loop
/// simply continues. Exits when the token channel closes.
fn receive_loop(
    socket: Arc<RawSocket>,
    identifier: u16,
    mut token_rx: mpsc::Receiver<u16>,
    reply_tx: mpsc::Sender<Option<Reply>>,
    sink: Option<mpsc::UnboundedSender<String>>,
) {
    let mut buf = [0u8; socket::RECV_BUFFER_LEN];
    let mut sequence = match token_rx.blocking_recv() {
        Some(sequence) => sequence,
        None => return,
    };
    loop {
        match socket.recv_from(&mut buf) {
            Err(err) => {
                if let Some(sink) = &sink {
                    if socket::is_timeout(&err) {
                        let _ = sink.send(format!("Request timeout for icmp_seq {}", sequence));
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
                if reply.sequence != sequence {
                    continue;
                }
                if reply_tx.blocking_send(Some(reply)).is_err() {
                    return;
                }
            }
        }
        sequence = match token_rx.blocking_recv() {
            Some(sequence) => sequence,
            None => return,
        };
    }
}
