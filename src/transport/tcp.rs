//! Reference TCP transport.
//!
//! # Responsibilities
//! - Dial the address with a connect timeout
//! - Report Ready while the socket stays open
//! - Reconnect with exponential backoff after failures
//! - Report Shutdown exactly once, after `shutdown()`
//!
//! # Design Decisions
//! - One background task per sub-connection, started by `connect()`
//! - The socket is only held open; RPC framing is out of scope here

use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::io::AsyncReadExt;
use tokio::net::TcpStream;
use tokio::sync::watch;
use tokio::time;

use crate::config::TransportConfig;
use crate::resilience::backoff::Backoff;
use crate::resolver::Address;
use crate::transport::{
    ConnectivityState, Connector, StateListener, SubConn, SubConnRef, TransportError,
};

/// Creates [`TcpSubConn`]s.
#[derive(Debug, Clone)]
pub struct TcpConnector {
    connect_timeout: Duration,
    backoff: Backoff,
}

impl TcpConnector {
    pub fn new(connect_timeout: Duration, backoff: Backoff) -> Self {
        Self {
            connect_timeout,
            backoff,
        }
    }

    pub fn from_config(config: &TransportConfig) -> Self {
        Self::new(
            Duration::from_millis(config.connect_timeout_ms),
            Backoff::new(
                Duration::from_millis(config.backoff_base_ms),
                Duration::from_millis(config.backoff_max_ms),
            ),
        )
    }
}

impl Default for TcpConnector {
    fn default() -> Self {
        Self::from_config(&TransportConfig::default())
    }
}

impl Connector for TcpConnector {
    fn new_sub_conn(
        &self,
        addr: &Address,
        listener: StateListener,
    ) -> Result<SubConnRef, TransportError> {
        let valid = addr
            .addr
            .rsplit_once(':')
            .map(|(host, port)| !host.is_empty() && port.parse::<u16>().is_ok())
            .unwrap_or(false);
        if !valid {
            return Err(TransportError::InvalidAddress {
                addr: addr.addr.clone(),
                reason: "expected host:port".to_string(),
            });
        }

        Ok(Arc::new(TcpSubConn::new(
            addr.clone(),
            listener,
            self.connect_timeout,
            self.backoff,
        )))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    Idle,
    Running,
    Stopped,
}

/// A TCP connection to one address, redialed until shut down.
#[derive(Debug)]
pub struct TcpSubConn {
    address: Address,
    listener: StateListener,
    connect_timeout: Duration,
    backoff: Backoff,
    phase: Mutex<Phase>,
    stop_tx: watch::Sender<bool>,
}

impl TcpSubConn {
    fn new(
        address: Address,
        listener: StateListener,
        connect_timeout: Duration,
        backoff: Backoff,
    ) -> Self {
        let (stop_tx, _) = watch::channel(false);
        Self {
            address,
            listener,
            connect_timeout,
            backoff,
            phase: Mutex::new(Phase::Idle),
            stop_tx,
        }
    }
}

impl SubConn for TcpSubConn {
    fn address(&self) -> &Address {
        &self.address
    }

    fn connect(&self) {
        let mut phase = self.phase.lock();
        if *phase != Phase::Idle {
            return;
        }

        let handle = match tokio::runtime::Handle::try_current() {
            Ok(handle) => handle,
            Err(e) => {
                tracing::warn!(addr = %self.address, error = %e, "No runtime to dial on");
                self.listener.report(ConnectivityState::TransientFailure);
                return;
            }
        };

        *phase = Phase::Running;
        let dialer = Dialer {
            addr: self.address.addr.clone(),
            listener: self.listener.clone(),
            connect_timeout: self.connect_timeout,
            backoff: self.backoff,
            stop: self.stop_tx.subscribe(),
        };
        handle.spawn(dialer.run());
    }

    fn shutdown(&self) {
        let previous = std::mem::replace(&mut *self.phase.lock(), Phase::Stopped);
        match previous {
            Phase::Stopped => {}
            // The dial task reports Shutdown on its way out.
            Phase::Running => {
                self.stop_tx.send_replace(true);
            }
            Phase::Idle => {
                self.stop_tx.send_replace(true);
                self.listener.report(ConnectivityState::Shutdown);
            }
        }
    }
}

struct Dialer {
    addr: String,
    listener: StateListener,
    connect_timeout: Duration,
    backoff: Backoff,
    stop: watch::Receiver<bool>,
}

impl Dialer {
    async fn run(mut self) {
        let mut attempt: u32 = 0;

        loop {
            if *self.stop.borrow() {
                break;
            }

            self.listener.report(ConnectivityState::Connecting);
            let dial = time::timeout(self.connect_timeout, TcpStream::connect(self.addr.as_str()));
            let outcome = tokio::select! {
                outcome = dial => outcome,
                _ = self.stop.changed() => break,
            };

            match outcome {
                Ok(Ok(stream)) => {
                    attempt = 0;
                    tracing::debug!(addr = %self.addr, "TCP connection established");
                    self.listener.report(ConnectivityState::Ready);
                    if self.hold(stream).await {
                        break;
                    }
                    tracing::info!(addr = %self.addr, "TCP connection closed by peer");
                }
                Ok(Err(e)) => {
                    tracing::warn!(addr = %self.addr, error = %e, "TCP dial failed");
                }
                Err(_) => {
                    tracing::warn!(
                        addr = %self.addr,
                        timeout_ms = self.connect_timeout.as_millis() as u64,
                        "TCP dial timed out"
                    );
                }
            }

            self.listener.report(ConnectivityState::TransientFailure);
            attempt = attempt.saturating_add(1);
            let delay = self.backoff.delay(attempt);
            tracing::debug!(
                addr = %self.addr,
                attempt,
                delay_ms = delay.as_millis() as u64,
                "Scheduling reconnect"
            );

            tokio::select! {
                _ = time::sleep(delay) => {}
                _ = self.stop.changed() => break,
            }
        }

        self.listener.report(ConnectivityState::Shutdown);
    }

    /// Keep `stream` open until the peer closes it (false) or a stop is
    /// requested (true).
    async fn hold(&mut self, mut stream: TcpStream) -> bool {
        let mut buf = [0u8; 512];
        loop {
            tokio::select! {
                read = stream.read(&mut buf) => match read {
                    Ok(0) | Err(_) => return false,
                    Ok(_) => continue,
                },
                _ = self.stop.changed() => return true,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::balancer::BalancerEvent;
    use crate::transport::SubConnId;
    use tokio::net::TcpListener;
    use tokio::sync::mpsc;

    fn fast_connector() -> TcpConnector {
        TcpConnector::new(
            Duration::from_millis(500),
            Backoff::new(Duration::from_millis(20), Duration::from_millis(50)),
        )
    }

    async fn next_state(rx: &mut mpsc::UnboundedReceiver<BalancerEvent>) -> ConnectivityState {
        match time::timeout(Duration::from_secs(5), rx.recv()).await {
            Ok(Some(BalancerEvent::SubConnState { state, .. })) => state,
            other => panic!("expected state event, got {:?}", other),
        }
    }

    #[test]
    fn test_rejects_address_without_port() {
        let (tx, _rx) = mpsc::unbounded_channel();
        let err = fast_connector()
            .new_sub_conn(&Address::new("localhost"), StateListener::new(SubConnId(0), tx))
            .unwrap_err();
        assert!(matches!(err, TransportError::InvalidAddress { .. }));
    }

    #[tokio::test]
    async fn test_connects_and_shuts_down() {
        let server = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = server.local_addr().unwrap();
        tokio::spawn(async move {
            let mut held = Vec::new();
            while let Ok((socket, _)) = server.accept().await {
                held.push(socket);
            }
        });

        let (tx, mut rx) = mpsc::unbounded_channel();
        let sc = fast_connector()
            .new_sub_conn(&Address::new(addr.to_string()), StateListener::new(SubConnId(1), tx))
            .unwrap();

        sc.connect();
        assert_eq!(next_state(&mut rx).await, ConnectivityState::Connecting);
        assert_eq!(next_state(&mut rx).await, ConnectivityState::Ready);

        sc.shutdown();
        assert_eq!(next_state(&mut rx).await, ConnectivityState::Shutdown);

        // Neither a second shutdown nor a late connect produce events.
        sc.shutdown();
        sc.connect();
        assert!(time::timeout(Duration::from_millis(100), rx.recv()).await.is_err());
    }

    #[tokio::test]
    async fn test_unreachable_address_reports_transient_failure() {
        // Bind then drop to get a port nobody listens on.
        let port = {
            let l = TcpListener::bind("127.0.0.1:0").await.unwrap();
            l.local_addr().unwrap().port()
        };

        let (tx, mut rx) = mpsc::unbounded_channel();
        let sc = fast_connector()
            .new_sub_conn(
                &Address::new(format!("127.0.0.1:{}", port)),
                StateListener::new(SubConnId(2), tx),
            )
            .unwrap();

        sc.connect();
        assert_eq!(next_state(&mut rx).await, ConnectivityState::Connecting);
        assert_eq!(next_state(&mut rx).await, ConnectivityState::TransientFailure);
        sc.shutdown();
    }

    #[tokio::test]
    async fn test_shutdown_before_connect_reports_once() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let sc = fast_connector()
            .new_sub_conn(&Address::new("127.0.0.1:1"), StateListener::new(SubConnId(3), tx))
            .unwrap();

        sc.shutdown();
        sc.connect();
        assert_eq!(next_state(&mut rx).await, ConnectivityState::Shutdown);
        assert!(time::timeout(Duration::from_millis(100), rx.recv()).await.is_err());
    }
}
