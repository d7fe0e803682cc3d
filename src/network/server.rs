//! TCP listener and accept loop
//!
//! Accept failures are counted per streak. Each failure backs off
//! exponentially up to a cap and the loop keeps serving; when a streak
//! reaches the configured threshold a `FatalEvent` is reported once, and the
//! caller decides what to do with it.

use crate::network::config::NodeConfig;
use crate::network::connection::wait_closed;
use std::future::Future;
use std::io;
use std::net::SocketAddr;
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, watch};

/// Unrecoverable conditions surfaced to whoever runs the node
#[derive(Debug, Clone, PartialEq)]
pub enum FatalEvent {
    /// The accept loop on `address` failed `consecutive` times in a row
    AcceptFailures {
        address: String,
        consecutive: u32,
        last_error: String,
    },
}

impl std::fmt::Display for FatalEvent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            FatalEvent::AcceptFailures {
                address,
                consecutive,
                last_error,
            } => write!(
                f,
                "accept loop on {} failed {} times in a row (last error: {})",
                address, consecutive, last_error
            ),
        }
    }
}

/// How the accept loop reacts to failures
#[derive(Debug, Clone, Copy)]
pub struct AcceptPolicy {
    /// Consecutive failures reported as fatal
    pub failure_threshold: u32,
    /// Delay after the first failure; doubles per further failure
    pub backoff: Duration,
    pub max_backoff: Duration,
}

impl AcceptPolicy {
    pub fn from_config(config: &NodeConfig) -> Self {
        Self {
            failure_threshold: config.accept_failure_threshold.max(1),
            backoff: Duration::from_millis(config.accept_backoff_ms),
            max_backoff: Duration::from_millis(config.accept_backoff_max_ms),
        }
    }
}

/// Decision after one failed accept
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct FailureAction {
    pub backoff: Duration,
    /// True exactly once per streak, when it reaches the threshold
    pub fatal: bool,
}

/// Counts consecutive accept failures
#[derive(Debug)]
pub struct FailureTracker {
    policy: AcceptPolicy,
    consecutive: u32,
}

impl FailureTracker {
    pub fn new(policy: AcceptPolicy) -> Self {
        Self {
            policy,
            consecutive: 0,
        }
    }

    pub fn consecutive(&self) -> u32 {
        self.consecutive
    }

    pub fn record_success(&mut self) {
        self.consecutive = 0;
    }

    pub fn record_failure(&mut self) -> FailureAction {
        self.consecutive = self.consecutive.saturating_add(1);

        let exponent = (self.consecutive - 1).min(16);
        let backoff = self
            .policy
            .backoff
            .saturating_mul(1u32 << exponent)
            .min(self.policy.max_backoff);

        FailureAction {
            backoff,
            fatal: self.consecutive == self.policy.failure_threshold,
        }
    }
}

/// TCP server for accepting cluster connections
pub struct Server {
    listener: TcpListener,
    local_addr: SocketAddr,
}

impl Server {
    /// Bind to an address and create the server
    pub async fn bind(addr: &str) -> io::Result<Self> {
        let listener = TcpListener::bind(addr).await?;
        let local_addr = listener.local_addr()?;
        log::info!("Server listening on {}", local_addr);

        Ok(Self {
            listener,
            local_addr,
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Accept one incoming connection
    pub async fn accept(&self) -> io::Result<(TcpStream, SocketAddr)> {
        self.listener.accept().await
    }

    /// Accept until `shutdown` is set, handing every socket to `on_accept`.
    ///
    /// The listener is closed when this returns.
    pub async fn run<F>(
        self,
        policy: AcceptPolicy,
        on_accept: F,
        fatal_tx: mpsc::UnboundedSender<FatalEvent>,
        shutdown: watch::Receiver<bool>,
    ) where
        F: FnMut(TcpStream, SocketAddr),
    {
        let server = &self;
        accept_loop(
            self.local_addr,
            move || server.accept(),
            policy,
            on_accept,
            fatal_tx,
            shutdown,
        )
        .await;
    }
}

/// Drive `accept` until shutdown, backing off on failures
async fn accept_loop<A, Fut, F>(
    local_addr: SocketAddr,
    mut accept: A,
    policy: AcceptPolicy,
    mut on_accept: F,
    fatal_tx: mpsc::UnboundedSender<FatalEvent>,
    mut shutdown: watch::Receiver<bool>,
) where
    A: FnMut() -> Fut,
    Fut: Future<Output = io::Result<(TcpStream, SocketAddr)>>,
    F: FnMut(TcpStream, SocketAddr),
{
    let mut tracker = FailureTracker::new(policy);

    loop {
        let accepted = tokio::select! {
            _ = wait_closed(&mut shutdown) => break,
            res = accept() => res,
        };

        match accepted {
            Ok((stream, addr)) => {
                tracker.record_success();
                on_accept(stream, addr);
            }
            Err(e) => {
                log::error!("Accept error on {}: {}", local_addr, e);

                let action = tracker.record_failure();
                if action.fatal {
                    let event = FatalEvent::AcceptFailures {
                        address: local_addr.to_string(),
                        consecutive: tracker.consecutive(),
                        last_error: e.to_string(),
                    };
                    log::error!("CRITICAL: {}", event);
                    let _ = fatal_tx.send(event);
                }

                tokio::select! {
                    _ = wait_closed(&mut shutdown) => break,
                    _ = tokio::time::sleep(action.backoff) => {}
                }
            }
        }
    }

    log::info!("Stopped accepting connections on {}", local_addr);
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    fn policy() -> AcceptPolicy {
        AcceptPolicy {
            failure_threshold: 5,
            backoff: Duration::from_millis(100),
            max_backoff: Duration::from_millis(1_000),
        }
    }

    #[test]
    fn test_backoff_doubles_and_caps() {
        let mut tracker = FailureTracker::new(policy());

        let delays: Vec<_> = (0..6).map(|_| tracker.record_failure().backoff).collect();
        assert_eq!(
            delays,
            vec![100, 200, 400, 800, 1_000, 1_000]
                .into_iter()
                .map(Duration::from_millis)
                .collect::<Vec<_>>()
        );
    }

    #[test]
    fn test_fatal_once_per_streak() {
        let mut tracker = FailureTracker::new(policy());

        let fatal: Vec<_> = (0..8).map(|_| tracker.record_failure().fatal).collect();
        assert_eq!(fatal.iter().filter(|f| **f).count(), 1);
        assert!(fatal[4]);

        tracker.record_success();
        assert_eq!(tracker.consecutive(), 0);
        let fatal: Vec<_> = (0..5).map(|_| tracker.record_failure().fatal).collect();
        assert_eq!(fatal, vec![false, false, false, false, true]);
    }

    #[test]
    fn test_success_resets_streak() {
        let mut tracker = FailureTracker::new(policy());
        for _ in 0..4 {
            assert!(!tracker.record_failure().fatal);
        }
        tracker.record_success();
        assert!(!tracker.record_failure().fatal);
        assert_eq!(tracker.record_failure().backoff, Duration::from_millis(200));
    }

    #[tokio::test]
    async fn test_failure_streak_reports_fatal_once_and_keeps_serving() {
        let listener = Arc::new(TcpListener::bind("127.0.0.1:0").await.unwrap());
        let addr = listener.local_addr().unwrap();
        let (fatal_tx, mut fatal_rx) = mpsc::unbounded_channel();
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let (seen_tx, mut seen_rx) = mpsc::unbounded_channel();

        // Four failures against a threshold of three, then real accepts.
        let mut failures = 4;
        let accept = move || {
            let listener = listener.clone();
            let fail = failures > 0;
            failures -= fail as u32;
            async move {
                if fail {
                    Err(io::Error::new(io::ErrorKind::Other, "too many open files"))
                } else {
                    listener.accept().await
                }
            }
        };
        let policy = AcceptPolicy {
            failure_threshold: 3,
            backoff: Duration::from_millis(1),
            max_backoff: Duration::from_millis(5),
        };

        let task = tokio::spawn(accept_loop(
            addr,
            accept,
            policy,
            move |_stream, peer| {
                let _ = seen_tx.send(peer);
            },
            fatal_tx,
            shutdown_rx,
        ));

        let client = TcpStream::connect(addr).await.unwrap();
        assert_eq!(seen_rx.recv().await.unwrap(), client.local_addr().unwrap());

        match fatal_rx.try_recv() {
            Ok(FatalEvent::AcceptFailures {
                address,
                consecutive,
                last_error,
            }) => {
                assert_eq!(address, addr.to_string());
                assert_eq!(consecutive, 3);
                assert_eq!(last_error, "too many open files");
            }
            other => panic!("expected one fatal event, got {:?}", other),
        }
        assert!(fatal_rx.try_recv().is_err());

        shutdown_tx.send_replace(true);
        task.await.unwrap();
    }

    #[tokio::test]
    async fn test_run_accepts_until_shutdown() {
        let server = Server::bind("127.0.0.1:0").await.unwrap();
        let addr = server.local_addr();
        let (fatal_tx, _fatal_rx) = mpsc::unbounded_channel();
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let (seen_tx, mut seen_rx) = mpsc::unbounded_channel();

        let task = tokio::spawn(server.run(
            policy(),
            move |_stream, peer| {
                let _ = seen_tx.send(peer);
            },
            fatal_tx,
            shutdown_rx,
        ));

        let client = TcpStream::connect(addr).await.unwrap();
        let seen = seen_rx.recv().await.unwrap();
        assert_eq!(seen, client.local_addr().unwrap());

        shutdown_tx.send_replace(true);
        task.await.unwrap();

        // The listener is gone.
        assert!(TcpStream::connect(addr).await.is_err());
    }
}
