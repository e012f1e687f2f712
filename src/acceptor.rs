//! Shared-port acceptor for the front-tier pool.
//!
//! All N front-tier instances sit behind one externally visible port. One
//! accept loop owns the listener and hands each accepted connection to the
//! instance mailboxes in strict cyclic order; no instance owns the port and
//! there is no separate load-balancer component. Mailboxes are bounded, so a
//! saturated instance pauses accepting rather than being skipped over.

use std::net::SocketAddr;

use anyhow::{Context, Result, ensure};
use tokio::{
    net::{TcpListener, TcpStream},
    sync::{mpsc, watch},
    task::JoinHandle,
};
use tracing::{debug, info, warn};

/// Handle to the running accept loop.
#[derive(Debug)]
pub struct AcceptorGroup {
    addr: SocketAddr,
    shutdown_tx: watch::Sender<bool>,
    handle: JoinHandle<()>,
}

impl AcceptorGroup {
    /// Bind the shared listener and start distributing connections across
    /// `mailboxes`, one sender per front-tier instance.
    pub async fn bind(
        bind_addr: SocketAddr,
        mailboxes: Vec<mpsc::Sender<TcpStream>>,
    ) -> Result<Self> {
        ensure!(!mailboxes.is_empty(), "acceptor needs at least one instance");

        let listener = TcpListener::bind(bind_addr)
            .await
            .with_context(|| format!("failed to bind listener on {bind_addr}"))?;
        let addr = listener.local_addr()?;

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let instances = mailboxes.len();
        let handle = tokio::spawn(accept_loop(listener, mailboxes, shutdown_rx));

        info!(%addr, instances, "acceptor listening");
        Ok(Self {
            addr,
            shutdown_tx,
            handle,
        })
    }

    /// The bound address; useful when binding port 0.
    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    pub async fn shutdown(self) {
        let _ = self.shutdown_tx.send(true);
        let _ = self.handle.await;
    }
}

async fn accept_loop(
    listener: TcpListener,
    mailboxes: Vec<mpsc::Sender<TcpStream>>,
    mut shutdown_rx: watch::Receiver<bool>,
) {
    let mut cursor: usize = 0;
    loop {
        tokio::select! {
            accepted = listener.accept() => match accepted {
                Ok((stream, peer)) => {
                    let target = cursor % mailboxes.len();
                    cursor = cursor.wrapping_add(1);
                    debug!(%peer, instance = target, "connection assigned");
                    if mailboxes[target].send(stream).await.is_err() {
                        warn!(instance = target, "instance mailbox closed, dropping connection");
                    }
                }
                Err(err) => {
                    warn!(%err, "accept failed");
                }
            },
            changed = shutdown_rx.changed() => {
                if changed.is_ok() && *shutdown_rx.borrow() {
                    info!("acceptor shutting down");
                    break;
                }
            }
        }
    }
}
