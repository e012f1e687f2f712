//! Front-tier worker: one replica of the JSON surface.
//!
//! Each instance is stateless between requests and holds only the bus handle
//! and the fixed persistence address. Inbound connections arrive on the
//! instance mailbox from the shared acceptor; every client request becomes
//! exactly one bus request, and the reply (or coded failure) is translated
//! back into an HTTP response. This tier never touches the database.

use std::{collections::HashMap, time::Duration};

use axum::{
    Json, Router,
    extract::{Path, Request, State},
    http::{HeaderValue, StatusCode},
    middleware::{self, Next},
    response::{IntoResponse, Response},
    routing::get,
};
use hyper_util::{
    rt::{TokioExecutor, TokioIo},
    server::conn::auto::Builder as ConnectionBuilder,
    service::TowerToHyperService,
};
use serde::Deserialize;
use serde_json::{Value, json};
use tokio::{net::TcpStream, sync::mpsc, task::JoinHandle};
use tracing::{debug, error, warn};

use crate::{
    bus::{Bus, BusError},
    protocol::{ACTION_HEADER, Action, ErrorCode, Reply, WIKIDB_ADDRESS},
};

/// Response header naming the instance that served the request.
pub const SERVED_BY_HEADER: &str = "x-served-by";

#[derive(Clone)]
struct AppState {
    bus: Bus,
    reply_timeout: Duration,
    instance_id: usize,
}

impl AppState {
    /// The single suspension point of a request's flow: send one bus request
    /// to the persistence worker and await its reply.
    async fn persist(&self, action: Action, body: Value) -> Result<Value, ApiError> {
        let headers = HashMap::from([(
            ACTION_HEADER.to_string(),
            action.as_str().to_string(),
        )]);
        match self
            .bus
            .request(WIKIDB_ADDRESS, headers, body, self.reply_timeout)
            .await
        {
            Ok(Reply::Success(body)) => Ok(body),
            Ok(Reply::Failure { code, message }) => {
                warn!(%action, %code, detail = %message, "persistence request failed");
                Err(ApiError::from_code(code, message))
            }
            Err(err @ (BusError::Timeout(_) | BusError::NoHandlers(_))) => {
                error!(%action, %err, "persistence service unavailable");
                Err(ApiError {
                    status: StatusCode::SERVICE_UNAVAILABLE,
                    message: "persistence service unavailable".to_string(),
                })
            }
            Err(err) => {
                error!(%action, %err, "unexpected bus error");
                Err(ApiError {
                    status: StatusCode::SERVICE_UNAVAILABLE,
                    message: err.to_string(),
                })
            }
        }
    }
}

/// One front-tier replica. Created with its connection mailbox, then spawned.
pub struct HttpWorker {
    instance_id: usize,
    router: Router,
    connections: mpsc::Receiver<TcpStream>,
}

impl HttpWorker {
    pub fn new(
        instance_id: usize,
        bus: Bus,
        reply_timeout: Duration,
        connections: mpsc::Receiver<TcpStream>,
    ) -> Self {
        let router = build_router(AppState {
            bus,
            reply_timeout,
            instance_id,
        });
        Self {
            instance_id,
            router,
            connections,
        }
    }

    pub fn spawn(self) -> JoinHandle<()> {
        tokio::spawn(self.run())
    }

    /// Serve connections handed off by the acceptor until the mailbox closes.
    async fn run(mut self) {
        while let Some(stream) = self.connections.recv().await {
            let service = TowerToHyperService::new(self.router.clone());
            let instance_id = self.instance_id;
            tokio::spawn(async move {
                if let Err(err) = ConnectionBuilder::new(TokioExecutor::new())
                    .serve_connection(TokioIo::new(stream), service)
                    .await
                {
                    debug!(instance_id, error = %err, "connection closed with error");
                }
            });
        }
        debug!(instance_id = self.instance_id, "http worker stopped");
    }
}

fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/healthz", get(healthz))
        .route("/api/pages", get(list_pages).post(create_page))
        // Same segment serves name-keyed reads/writes and id-keyed deletes;
        // the delete handler extracts the segment as an integer.
        .route(
            "/api/pages/{name}",
            get(get_page).put(save_page).delete(delete_page),
        )
        .layer(middleware::from_fn_with_state(state.clone(), tag_instance))
        .with_state(state)
}

async fn tag_instance(State(state): State<AppState>, request: Request, next: Next) -> Response {
    let mut response = next.run(request).await;
    response
        .headers_mut()
        .insert(SERVED_BY_HEADER, HeaderValue::from(state.instance_id));
    response
}

async fn healthz() -> Json<Value> {
    Json(json!({ "status": "ok", "service": "wikibus" }))
}

async fn list_pages(State(state): State<AppState>) -> Result<Json<Value>, ApiError> {
    let body = state.persist(Action::AllPages, json!({})).await?;
    Ok(Json(body))
}

async fn get_page(
    State(state): State<AppState>,
    Path(name): Path<String>,
) -> Result<Json<Value>, ApiError> {
    let body = state
        .persist(Action::GetPage, json!({ "name": name }))
        .await?;
    if body["found"] == json!(false) {
        return Err(ApiError {
            status: StatusCode::NOT_FOUND,
            message: format!("page not found: {name}"),
        });
    }
    Ok(Json(body))
}

#[derive(Debug, Deserialize)]
struct CreatePageRequest {
    name: String,
    markdown: String,
}

async fn create_page(
    State(state): State<AppState>,
    Json(request): Json<CreatePageRequest>,
) -> Result<(StatusCode, Json<Value>), ApiError> {
    let body = state
        .persist(
            Action::CreatePage,
            json!({ "name": request.name, "markdown": request.markdown }),
        )
        .await?;
    Ok((StatusCode::CREATED, Json(body)))
}

#[derive(Debug, Deserialize)]
struct SavePageRequest {
    markdown: String,
}

async fn save_page(
    State(state): State<AppState>,
    Path(name): Path<String>,
    Json(request): Json<SavePageRequest>,
) -> Result<Json<Value>, ApiError> {
    let body = state
        .persist(
            Action::SavePage,
            json!({ "name": name, "markdown": request.markdown }),
        )
        .await?;
    Ok(Json(body))
}

async fn delete_page(
    State(state): State<AppState>,
    Path(id): Path<i64>,
) -> Result<Json<Value>, ApiError> {
    let body = state.persist(Action::DeletePage, json!({ "id": id })).await?;
    Ok(Json(body))
}

#[derive(Debug)]
struct ApiError {
    status: StatusCode,
    message: String,
}

impl ApiError {
    /// Map the closed persistence error set onto caller-visible status
    /// classes: client-tier mistakes become 400s, database failures 500s.
    fn from_code(code: ErrorCode, message: String) -> Self {
        let status = if code.is_client_error() {
            StatusCode::BAD_REQUEST
        } else {
            StatusCode::INTERNAL_SERVER_ERROR
        };
        Self { status, message }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let body = Json(json!({ "error": self.message }));
        (self.status, body).into_response()
    }
}
