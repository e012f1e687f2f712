//! Persistence worker: the sole consumer at [`WIKIDB_ADDRESS`].
//!
//! Each inbound bus message is classified (action header → closed Action set),
//! bound against its catalog template, executed, and answered with a JSON body
//! or a coded failure. All database access in the system is confined to this
//! module. Every statement is one-shot — a connection is checked out, used for
//! a single request, and released — with the one exception of create-page,
//! whose probe-then-insert sequence rides a single checkout so the pair can't
//! interleave with itself across connections.

use std::sync::Arc;

use anyhow::{Context, Result, anyhow};
use serde_json::{Value, json};
use sqlx::{Row, SqlitePool};
use tokio::{sync::watch, task::JoinHandle};
use tracing::{debug, error, info, warn};

use crate::{
    bus::{Bus, Consumer},
    config::Config,
    protocol::{ACTION_HEADER, Action, ErrorCode, Reply, WIKIDB_ADDRESS},
    queries::QueryCatalog,
};

/// Handle to the running worker. Dropping without [`shutdown`] leaves the
/// dispatch task running until the bus goes away.
///
/// [`shutdown`]: DatabaseWorker::shutdown
#[derive(Debug)]
pub struct DatabaseWorker {
    shutdown_tx: watch::Sender<bool>,
    handle: JoinHandle<()>,
}

struct WorkerState {
    pool: SqlitePool,
    catalog: QueryCatalog,
}

impl DatabaseWorker {
    /// Load the catalog, bootstrap the schema, and register the consumer.
    ///
    /// Returns only once the worker can serve requests, so a caller that
    /// awaits this before deploying the front tier gets the startup ordering
    /// guarantee for free. Catalog or schema failures are startup-fatal.
    pub async fn start(config: &Config, bus: &Bus, pool: SqlitePool) -> Result<Self> {
        let catalog = QueryCatalog::load(config.queries_file.as_deref())
            .context("failed to load query catalog")?;

        sqlx::query(catalog.schema())
            .execute(&pool)
            .await
            .context("failed to bootstrap pages schema")?;

        let consumer = bus
            .register(WIKIDB_ADDRESS)
            .map_err(|err| anyhow!("failed to register persistence consumer: {err}"))?;

        let state = Arc::new(WorkerState { pool, catalog });
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let handle = tokio::spawn(dispatch_loop(consumer, state, shutdown_rx));

        info!(address = WIKIDB_ADDRESS, "database worker ready");
        Ok(Self {
            shutdown_tx,
            handle,
        })
    }

    pub async fn shutdown(self) {
        let _ = self.shutdown_tx.send(true);
        if let Err(err) = self.handle.await {
            warn!(?err, "database worker task panicked during shutdown");
        }
    }
}

async fn dispatch_loop(
    mut consumer: Consumer,
    state: Arc<WorkerState>,
    mut shutdown_rx: watch::Receiver<bool>,
) {
    loop {
        tokio::select! {
            delivery = consumer.recv() => match delivery {
                Some(delivery) => {
                    // Handle on its own task so a slow statement doesn't
                    // stall dispatch for other in-flight requests; the pool
                    // arbitrates connection checkouts.
                    let state = Arc::clone(&state);
                    tokio::spawn(async move {
                        let reply = handle_message(&state, &delivery.message).await;
                        delivery.reply(reply);
                    });
                }
                None => break,
            },
            changed = shutdown_rx.changed() => {
                if changed.is_ok() && *shutdown_rx.borrow() {
                    info!("database worker shutting down");
                    break;
                }
            }
        }
    }
}

async fn handle_message(state: &WorkerState, message: &crate::bus::Message) -> Reply {
    let Some(raw_action) = message.header(ACTION_HEADER) else {
        warn!("request without action header");
        return Reply::failure(ErrorCode::NoActionSpecified, "no action header specified");
    };
    let Ok(action) = raw_action.parse::<Action>() else {
        warn!(action = raw_action, "unknown action requested");
        return Reply::failure(ErrorCode::BadAction, format!("bad action: {raw_action}"));
    };

    debug!(%action, "handling persistence request");
    match execute_action(state, action, &message.body).await {
        Ok(body) => Reply::Success(body),
        Err(err) => {
            if let ActionError::Db(ref db_err) = err {
                error!(%action, error = %db_err, "database operation failed");
            }
            err.into_reply()
        }
    }
}

/// Failure paths inside one action's execution, each mapping to exactly one
/// wire error code.
enum ActionError {
    BadRequest(String),
    Conflict(String),
    Db(sqlx::Error),
}

impl ActionError {
    fn into_reply(self) -> Reply {
        match self {
            ActionError::BadRequest(message) => Reply::failure(ErrorCode::BadRequest, message),
            ActionError::Conflict(name) => {
                Reply::failure(ErrorCode::DbError, format!("page already exists: {name}"))
            }
            // The driver error crosses the bus as message text only.
            ActionError::Db(err) => Reply::failure(ErrorCode::DbError, err.to_string()),
        }
    }
}

impl From<sqlx::Error> for ActionError {
    fn from(err: sqlx::Error) -> Self {
        ActionError::Db(err)
    }
}

fn str_field<'a>(body: &'a Value, key: &str) -> Result<&'a str, ActionError> {
    body.get(key)
        .and_then(Value::as_str)
        .ok_or_else(|| ActionError::BadRequest(format!("missing string field `{key}`")))
}

fn int_field(body: &Value, key: &str) -> Result<i64, ActionError> {
    body.get(key)
        .and_then(Value::as_i64)
        .ok_or_else(|| ActionError::BadRequest(format!("missing integer field `{key}`")))
}

async fn execute_action(
    state: &WorkerState,
    action: Action,
    body: &Value,
) -> Result<Value, ActionError> {
    let template = state.catalog.lookup(action);
    match action {
        Action::AllPages => {
            let rows = sqlx::query(template).fetch_all(&state.pool).await?;
            let pages = rows
                .iter()
                .map(|row| row.try_get::<String, _>("name"))
                .collect::<Result<Vec<_>, _>>()?;
            Ok(json!({ "pages": pages }))
        }
        Action::GetPage => {
            let name = str_field(body, "name")?;
            let row = sqlx::query(template)
                .bind(name)
                .fetch_optional(&state.pool)
                .await?;
            match row {
                Some(row) => {
                    let id: i64 = row.try_get("id")?;
                    let markdown: String = row.try_get("content")?;
                    Ok(json!({ "found": true, "id": id, "name": name, "markdown": markdown }))
                }
                None => Ok(json!({ "found": false, "name": name })),
            }
        }
        Action::CreatePage => {
            let name = str_field(body, "name")?;
            let markdown = str_field(body, "markdown")?;
            // Dependent statements: probe then insert on one checkout. The
            // UNIQUE constraint on name closes the probe/insert window when
            // two creates race across connections.
            let mut conn = state.pool.acquire().await?;
            let existing = sqlx::query(state.catalog.lookup(Action::GetPage))
                .bind(name)
                .fetch_optional(&mut *conn)
                .await?;
            if existing.is_some() {
                return Err(ActionError::Conflict(name.to_string()));
            }
            sqlx::query(template)
                .bind(name)
                .bind(markdown)
                .execute(&mut *conn)
                .await
                .map_err(|err| {
                    if is_unique_violation(&err) {
                        ActionError::Conflict(name.to_string())
                    } else {
                        ActionError::Db(err)
                    }
                })?;
            Ok(json!({ "created": true, "name": name }))
        }
        Action::SavePage => {
            let name = str_field(body, "name")?;
            let markdown = str_field(body, "markdown")?;
            let result = sqlx::query(template)
                .bind(name)
                .bind(markdown)
                .execute(&state.pool)
                .await?;
            Ok(json!({ "updated": result.rows_affected() }))
        }
        Action::DeletePage => {
            let id = int_field(body, "id")?;
            let result = sqlx::query(template).bind(id).execute(&state.pool).await?;
            Ok(json!({ "deleted": result.rows_affected() }))
        }
    }
}

fn is_unique_violation(err: &sqlx::Error) -> bool {
    err.as_database_error()
        .is_some_and(|db| db.is_unique_violation())
}
