//! wikibus - a small wiki service built from bus-connected workers.
//!
//! Workers never hold references to one another; they cooperate only through
//! typed, addressed messages on the in-process [`bus`]. The persistence
//! worker is the sole database client, the front-tier pool shares one
//! listening port, and [`deploy`] sequences the two tiers.

pub mod acceptor;
pub mod bus;
pub mod config;
pub mod db_worker;
pub mod deploy;
pub mod http_worker;
pub mod protocol;
pub mod queries;

pub use acceptor::AcceptorGroup;
pub use bus::{Bus, BusError, Consumer, Delivery, Message};
pub use config::Config;
pub use db_worker::DatabaseWorker;
pub use deploy::Deployment;
pub use http_worker::{HttpWorker, SERVED_BY_HEADER};
pub use protocol::{ACTION_HEADER, Action, ErrorCode, Reply, UnknownAction, WIKIDB_ADDRESS};
pub use queries::{CatalogError, QueryCatalog};
