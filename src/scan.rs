//! Subnet reachability sweep: one short-lived silent pinger per address.

use crate::ping::Pinger;
use crate::Error;
use futures::future::join_all;
use pnet::ipnetwork::Ipv4Network;
use std::net::Ipv4Addr;
use std::sync::{Arc, Mutex};
use tokio::sync::{mpsc, Semaphore};

const PROBES_PER_HOST: u16 = 2;
const PROBE_TIMEOUT_SECS: u64 = 2;
/// Cap on in-flight probes; a large block would otherwise exhaust the raw
/// socket supply.
const MAX_IN_FLIGHT: usize = 64;

/// Probes every address of a CIDR block, network and broadcast addresses
/// included, and collects the reachable ones.
pub struct Scanner {
    pub network: Ipv4Network,
    sink: Mutex<Option<mpsc::UnboundedSender<String>>>,
}

impl Scanner {
    pub fn new(cidr: &str, sink: Option<mpsc::UnboundedSender<String>>) -> Result<Self, Error> {
        let network = cidr
            .parse::<Ipv4Network>()
            .map_err(|source| Error::InvalidCidr {
                cidr: cidr.to_string(),
                source,
            })?;
        Ok(Self {
            network,
            sink: Mutex::new(sink),
        })
    }

    /// Blocks until every per-address probe finished, then returns the
    /// reachable addresses. Each probe runs an independent pinger with its
    /// own socket and identifier; only the result list is shared.
    pub async fn scan(&self) -> Vec<Ipv4Addr> {
        self.emit("start scanning".to_string());
        let reachable = Arc::new(Mutex::new(Vec::new()));
        let permits = Arc::new(Semaphore::new(MAX_IN_FLIGHT));

        let mut probes = Vec::new();
        for addr in self.network.iter() {
            let reachable = Arc::clone(&reachable);
            let permits = Arc::clone(&permits);
            let sink = self.sink.lock().unwrap().clone();
            probes.push(tokio::spawn(async move {
                let Ok(_permit) = permits.acquire_owned().await else {
                    return;
                };
                let pinger =
                    match Pinger::new(&addr.to_string(), PROBES_PER_HOST, PROBE_TIMEOUT_SECS, None)
                    {
                        Ok(pinger) => pinger,
                        Err(err) => {
                            if let Some(sink) = &sink {
                                let _ = sink.send(err.to_string());
                            }
                            return;
                        }
                    };
                if pinger.ping().await {
                    if let Some(sink) = &sink {
                        let _ = sink.send(format!("ip {} is reachable", addr));
                    }
                    reachable.lock().unwrap().push(addr);
                }
            }));
        }
        join_all(probes).await;

        self.emit("finish scanning".to_string());
        self.close_sink();
        let result = reachable.lock().unwrap().clone();
        result
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
