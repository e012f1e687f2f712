//! Query catalog for the persistence worker.
//!
//! SQL text lives here, not in the worker: the catalog maps each [`Action`] to
//! one parameterized statement, plus the schema bootstrap statement run once at
//! worker start. The source is either a flat `key = value` text file or the
//! compiled-in defaults. Loading happens exactly once per worker; any defect in
//! the file (missing, malformed, incomplete, duplicated or unknown keys) is
//! fatal to startup — no partial catalog is ever accepted. SQL syntax is not
//! validated here; a bad statement surfaces at execution time as a DB_ERROR.

use std::collections::HashMap;
use std::path::Path;

use thiserror::Error;
use tracing::info;

use crate::protocol::Action;

/// Catalog key for the schema bootstrap statement. Not an action: it runs once
/// at worker start instead of being dispatchable over the bus.
const SCHEMA_KEY: &str = "create-pages-table";

const DEFAULT_QUERIES: &str = "\
# Built-in query set (SQLite dialect).
create-pages-table = CREATE TABLE IF NOT EXISTS pages (id INTEGER PRIMARY KEY AUTOINCREMENT, name TEXT NOT NULL UNIQUE, content TEXT NOT NULL DEFAULT '')
all-pages = SELECT name FROM pages ORDER BY name
get-page = SELECT id, content FROM pages WHERE name = ?
create-page = INSERT INTO pages (name, content) VALUES (?, ?)
save-page = INSERT INTO pages (name, content) VALUES (?, ?) ON CONFLICT(name) DO UPDATE SET content = excluded.content
delete-page = DELETE FROM pages WHERE id = ?
";

#[derive(Debug, Error)]
pub enum CatalogError {
    #[error("failed to read query file `{path}`: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("malformed query entry at line {line}: `{text}`")]
    Malformed { line: usize, text: String },
    #[error("duplicate query key `{0}`")]
    DuplicateKey(String),
    #[error("unknown query key `{0}`")]
    UnknownKey(String),
    #[error("missing query entry for `{0}`")]
    MissingEntry(&'static str),
}

/// Immutable action → SQL template mapping, complete by construction.
#[derive(Debug)]
pub struct QueryCatalog {
    schema: String,
    templates: HashMap<Action, String>,
}

impl QueryCatalog {
    /// Load from `path` when given, otherwise fall back to the built-in set.
    pub fn load(path: Option<&Path>) -> Result<Self, CatalogError> {
        match path {
            Some(path) => {
                let text = std::fs::read_to_string(path).map_err(|source| CatalogError::Io {
                    path: path.display().to_string(),
                    source,
                })?;
                let catalog = Self::parse(&text)?;
                info!(path = %path.display(), "loaded query catalog");
                Ok(catalog)
            }
            None => {
                let catalog =
                    Self::parse(DEFAULT_QUERIES).expect("built-in query set must parse");
                info!("using built-in query catalog");
                Ok(catalog)
            }
        }
    }

    fn parse(text: &str) -> Result<Self, CatalogError> {
        let mut schema = None;
        let mut templates = HashMap::new();

        for (idx, raw) in text.lines().enumerate() {
            let line = raw.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            let (key, template) = line.split_once('=').ok_or_else(|| CatalogError::Malformed {
                line: idx + 1,
                text: raw.to_string(),
            })?;
            let (key, template) = (key.trim(), template.trim());
            if template.is_empty() {
                return Err(CatalogError::Malformed {
                    line: idx + 1,
                    text: raw.to_string(),
                });
            }
            if key == SCHEMA_KEY {
                if schema.replace(template.to_string()).is_some() {
                    return Err(CatalogError::DuplicateKey(key.to_string()));
                }
                continue;
            }
            let action: Action = key
                .parse()
                .map_err(|_| CatalogError::UnknownKey(key.to_string()))?;
            if templates.insert(action, template.to_string()).is_some() {
                return Err(CatalogError::DuplicateKey(key.to_string()));
            }
        }

        let schema = schema.ok_or(CatalogError::MissingEntry(SCHEMA_KEY))?;
        for action in Action::ALL {
            if !templates.contains_key(&action) {
                return Err(CatalogError::MissingEntry(action.as_str()));
            }
        }

        Ok(Self { schema, templates })
    }

    /// Schema bootstrap statement, run once before the worker goes live.
    pub fn schema(&self) -> &str {
        &self.schema
    }

    /// Template for `action`. Infallible: the load already proved every
    /// action has an entry.
    pub fn lookup(&self, action: Action) -> &str {
        self.templates
            .get(&action)
            .map(String::as_str)
            .unwrap_or_else(|| unreachable!("catalog completeness checked at load"))
    }
}
