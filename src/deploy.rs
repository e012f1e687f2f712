//! Deployment layer: wires the workers together in the required order.
//!
//! Exactly one persistence worker, then N front-tier instances behind one
//! shared listener. The sequencing is a strict two-step composition: the
//! persistence consumer must be live before the acceptor can hand the first
//! connection to a front-tier instance.

use std::net::SocketAddr;

use anyhow::{Context, Result};
use sqlx::sqlite::SqlitePoolOptions;
use tokio::{sync::mpsc, task::JoinHandle};
use tracing::{info, warn};

use crate::{
    acceptor::AcceptorGroup, bus::Bus, config::Config, db_worker::DatabaseWorker,
    http_worker::HttpWorker,
};

/// Per-instance backlog of accepted-but-unclaimed connections.
const CONNECTION_BACKLOG: usize = 32;

/// A fully deployed wikibus application.
pub struct Deployment {
    acceptor: AcceptorGroup,
    http_handles: Vec<JoinHandle<()>>,
    db_worker: DatabaseWorker,
}

impl Deployment {
    /// Deploy the persistence worker, then the front-tier pool.
    ///
    /// Returns once the whole stack can serve requests; any startup failure
    /// (pool, catalog, schema, bind) aborts deployment.
    pub async fn start(config: &Config, bus: &Bus) -> Result<Self> {
        let pool = SqlitePoolOptions::new()
            .max_connections(config.db_max_connections)
            .connect(&config.database_url)
            .await
            .with_context(|| format!("failed to open database `{}`", config.database_url))?;

        // Step one: the singleton persistence worker, awaited until its
        // consumer is registered.
        let db_worker = DatabaseWorker::start(config, bus, pool).await?;

        // Step two: the front-tier pool and the shared acceptor.
        let mut mailboxes = Vec::with_capacity(config.http_instances);
        let mut http_handles = Vec::with_capacity(config.http_instances);
        for instance_id in 0..config.http_instances {
            let (tx, rx) = mpsc::channel(CONNECTION_BACKLOG);
            mailboxes.push(tx);
            let worker = HttpWorker::new(instance_id, bus.clone(), config.reply_timeout, rx);
            http_handles.push(worker.spawn());
        }
        let acceptor = AcceptorGroup::bind(config.bind_addr(), mailboxes).await?;

        info!(
            addr = %acceptor.addr(),
            instances = config.http_instances,
            "wikibus deployed"
        );
        Ok(Self {
            acceptor,
            http_handles,
            db_worker,
        })
    }

    /// The externally visible address of the shared port.
    pub fn addr(&self) -> SocketAddr {
        self.acceptor.addr()
    }

    /// Tear down in reverse deployment order: stop accepting, drain the
    /// front tier, then stop the persistence worker.
    pub async fn shutdown(self) {
        self.acceptor.shutdown().await;
        // The acceptor held the only senders; each worker loop ends once its
        // mailbox is drained.
        for handle in self.http_handles {
            if let Err(err) = handle.await {
                warn!(?err, "http worker task panicked during shutdown");
            }
        }
        self.db_worker.shutdown().await;
        info!("wikibus stopped");
    }
}
