//! TCP port sweep. Async connect probes across a host list with
//! semaphore-limited concurrency, feeding the description fetch that turns
//! open HTTP ports into device records.

use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;

use tokio::net::TcpStream;
use tokio::sync::Semaphore;
use tokio::time::timeout;
use tracing::debug;

use crate::cancel::CancelToken;
use crate::config::SWEEP_CONCURRENCY;

/// TCP connect prober
pub struct PortSweeper {
    timeout: Duration,
    max_concurrent: usize,
}

impl PortSweeper {
    pub fn new() -> Self {
        Self {
            timeout: Duration::from_millis(1000),
            max_concurrent: SWEEP_CONCURRENCY,
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_concurrency(mut self, max_concurrent: usize) -> Self {
        self.max_concurrent = max_concurrent.max(1);
        self
    }

    /// Probe every (ip, port) pair; returns the open endpoints. Cancellation
    /// stops queued probes and aborts in-flight connects at their next await.
    pub async fn sweep(
        &self,
        ips: &[Ipv4Addr],
        ports: &[u16],
        cancel: &CancelToken,
    ) -> Vec<(Ipv4Addr, u16)> {
        let semaphore = Arc::new(Semaphore::new(self.max_concurrent));
        let mut handles = Vec::with_capacity(ips.len() * ports.len());

        for &ip in ips {
            for &port in ports {
                let sem = semaphore.clone();
                let cancel = cancel.clone();
                let connect_timeout = self.timeout;
                handles.push(tokio::spawn(async move {
                    let Ok(Ok(_permit)) = cancel.guard(sem.acquire_owned()).await else {
                        return None;
                    };
                    let addr = SocketAddr::new(IpAddr::V4(ip), port);
                    let connected = cancel
                        .guard(timeout(connect_timeout, TcpStream::connect(addr)))
                        .await;
                    match connected {
                        Ok(Ok(Ok(_stream))) => Some((ip, port)),
                        _ => None,
                    }
                }));
            }
        }

        let mut open = Vec::new();
        for handle in handles {
            if cancel.is_canceled() {
                handle.abort();
                continue;
            }
            if let Ok(Some(endpoint)) = handle.await {
                open.push(endpoint);
            }
        }

        debug!(open = open.len(), "port sweep complete");
        open
    }
}

impl Default for PortSweeper {
    fn default() -> Self {
        Self::new()
    }
}
