//! Inbound connection sources
//!
//! A [`Listener`] hands raw inbound connections to the switch through a
//! channel. The channel closes when the listener stops, which ends the
//! switch's accept loop for it.

use std::io;
use std::sync::{Mutex, PoisonError};
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::network::connection::BoxedStream;
use crate::network::netaddress::NetAddress;

/// Inbound connections buffered before the accept loop picks them up
pub const LISTENER_BACKLOG: usize = 64;

/// A raw inbound connection
pub struct InboundConn {
    pub stream: BoxedStream,
    pub remote_addr: NetAddress,
}

/// Source of inbound connections
pub trait Listener: Send + Sync {
    /// Take the connection receiver. Only the first call returns it.
    fn take_connections(&self) -> Option<mpsc::Receiver<InboundConn>>;

    /// Address the listener is bound to
    fn internal_address(&self) -> NetAddress;

    /// Stop accepting; the connection channel closes once drained
    fn stop(&self);
}

/// TCP listener
pub struct DefaultListener {
    local_addr: NetAddress,
    connections: Mutex<Option<mpsc::Receiver<InboundConn>>>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl DefaultListener {
    /// Bind `addr` and start accepting
    pub async fn bind(addr: &str) -> io::Result<Self> {
        let listener = TcpListener::bind(addr).await?;
        let local_addr = NetAddress::from(listener.local_addr()?);
        log::info!("Listening on {}", local_addr);

        let (tx, rx) = mpsc::channel(LISTENER_BACKLOG);
        let task = tokio::spawn(accept_routine(listener, tx));

        Ok(Self {
            local_addr,
            connections: Mutex::new(Some(rx)),
            task: Mutex::new(Some(task)),
        })
    }
}

impl Listener for DefaultListener {
    fn take_connections(&self) -> Option<mpsc::Receiver<InboundConn>> {
        self.connections
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
    }

    fn internal_address(&self) -> NetAddress {
        self.local_addr
    }

    fn stop(&self) {
        if let Some(task) = self.task.lock().unwrap_or_else(PoisonError::into_inner).take() {
            task.abort();
            log::info!("Stopped listening on {}", self.local_addr);
        }
    }
}

impl Drop for DefaultListener {
    fn drop(&mut self) {
        self.stop();
    }
}

async fn accept_routine(listener: TcpListener, tx: mpsc::Sender<InboundConn>) {
    loop {
        match listener.accept().await {
            Ok((stream, addr)) => {
                if let Err(e) = stream.set_nodelay(true) {
                    log::debug!("Failed to set nodelay for {}: {}", addr, e);
                }
                let conn = InboundConn {
                    stream: Box::new(stream),
                    remote_addr: NetAddress::from(addr),
                };
                if tx.send(conn).await.is_err() {
                    break;
                }
            }
            Err(e) => {
                log::warn!("Accept error: {}", e);
                tokio::time::sleep(Duration::from_millis(100)).await;
            }
        }
    }
}
