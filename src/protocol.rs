//! Wire-level vocabulary of the persistence protocol.
//!
//! Every request the front tier sends across the bus carries an `action`
//! header naming one of the closed [`Action`] set; every failure that comes
//! back carries one of the closed [`ErrorCode`] set. Nothing outside these two
//! enums crosses the bus boundary.

use std::fmt;
use std::str::FromStr;

use serde_json::Value;
use thiserror::Error;

/// Bus address the persistence worker listens on. Front-tier instances use
/// this constant directly; the address is never discovered at runtime.
pub const WIKIDB_ADDRESS: &str = "wikidb.queue";

/// Header key carrying the action name on every persistence request.
pub const ACTION_HEADER: &str = "action";

/// The closed set of persistence operations.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Action {
    AllPages,
    GetPage,
    CreatePage,
    SavePage,
    DeletePage,
}

impl Action {
    /// All actions, in catalog order.
    pub const ALL: [Action; 5] = [
        Action::AllPages,
        Action::GetPage,
        Action::CreatePage,
        Action::SavePage,
        Action::DeletePage,
    ];

    /// Wire name used in the `action` header and as the catalog key.
    pub fn as_str(self) -> &'static str {
        match self {
            Action::AllPages => "all-pages",
            Action::GetPage => "get-page",
            Action::CreatePage => "create-page",
            Action::SavePage => "save-page",
            Action::DeletePage => "delete-page",
        }
    }
}

impl fmt::Display for Action {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// An action name outside the closed set, kept for the failure message.
#[derive(Debug, Error, PartialEq, Eq)]
#[error("unknown action `{0}`")]
pub struct UnknownAction(String);

/// Unknown action names are rejected here, before any dispatch happens.
impl FromStr for Action {
    type Err = UnknownAction;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "all-pages" => Ok(Action::AllPages),
            "get-page" => Ok(Action::GetPage),
            "create-page" => Ok(Action::CreatePage),
            "save-page" => Ok(Action::SavePage),
            "delete-page" => Ok(Action::DeletePage),
            _ => Err(UnknownAction(s.to_string())),
        }
    }
}

/// The closed set of failure codes a persistence reply may carry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCode {
    /// The request had no `action` header at all.
    NoActionSpecified,
    /// The `action` header named something outside the [`Action`] set.
    BadAction,
    /// The body was missing or mistyped a field the action requires.
    BadRequest,
    /// The database driver reported a failure; detail lives in the message.
    DbError,
}

impl ErrorCode {
    pub fn as_str(self) -> &'static str {
        match self {
            ErrorCode::NoActionSpecified => "NO_ACTION_SPECIFIED",
            ErrorCode::BadAction => "BAD_ACTION",
            ErrorCode::BadRequest => "BAD_REQUEST",
            ErrorCode::DbError => "DB_ERROR",
        }
    }

    /// Whether the mistake sits with the caller (client error class) rather
    /// than the service (server error class).
    pub fn is_client_error(self) -> bool {
        !matches!(self, ErrorCode::DbError)
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Outcome of one persistence request: delivered at most once per request.
#[derive(Debug, Clone, PartialEq)]
pub enum Reply {
    Success(Value),
    Failure { code: ErrorCode, message: String },
}

impl Reply {
    pub fn failure(code: ErrorCode, message: impl Into<String>) -> Self {
        Reply::Failure {
            code,
            message: message.into(),
        }
    }
}
