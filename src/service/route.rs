// src/service/route.rs

use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;

use percent_encoding::percent_decode_str;
use thiserror::Error;

/// Commands accepted on `POST /vm/<id>`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[allow(missing_docs)]
pub enum Command {
    Setup,
    Delete,
    PrepareMigration,
    FinishMigration,
}

impl FromStr for Command {
    type Err = RouteError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "setup" => Ok(Command::Setup),
            "delete" => Ok(Command::Delete),
            "preparemigration" => Ok(Command::PrepareMigration),
            "finishmigration" => Ok(Command::FinishMigration),
            other => Err(RouteError::UnknownCommand(other.to_string())),
        }
    }
}

impl fmt::Display for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Command::Setup => "setup",
            Command::Delete => "delete",
            Command::PrepareMigration => "preparemigration",
            Command::FinishMigration => "finishmigration",
        };
        f.write_str(name)
    }
}

/// A request path decoded into its name/value pairs
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Route {
    /// Guest UUID
    pub vm: String,

    /// Record key, if addressed
    pub key: Option<String>,

    /// Command, if given
    pub cmd: Option<Command>,
}

impl Route {
    /// Parses `/<name>/<value>/...` below `prefix`.
    ///
    /// Query parameters fill in names the path does not set, so
    /// `/vm/<id>/cmd/setup` and `/vm/<id>?cmd=setup` are equivalent. Path
    /// segments are percent-decoded like query values.
    pub fn parse(path: &str, query: Option<&str>, prefix: &str) -> Result<Self, RouteError> {
        let path = path.strip_prefix(prefix).unwrap_or(path);
        let segments: Vec<&str> = path.trim_matches('/').split('/').filter(|s| !s.is_empty()).collect();

        if segments.len() % 2 != 0 {
            return Err(RouteError::OddSegments(path.to_string()));
        }

        let mut params: HashMap<String, String> = HashMap::new();
        for pair in segments.chunks(2) {
            let name = decode_segment(pair[0])?;
            let value = decode_segment(pair[1])?;
            params.entry(name).or_insert(value);
        }
        if let Some(query) = query {
            for (name, value) in url::form_urlencoded::parse(query.as_bytes()) {
                params.entry(name.into_owned()).or_insert_with(|| value.into_owned());
            }
        }

        let vm = params
            .remove("vm")
            .filter(|vm| !vm.is_empty())
            .ok_or(RouteError::MissingGuest)?;
        let cmd = params.remove("cmd").map(|c| c.parse()).transpose()?;

        Ok(Self {
            vm,
            key: params.remove("key"),
            cmd,
        })
    }
}

fn decode_segment(segment: &str) -> Result<String, RouteError> {
    percent_decode_str(segment)
        .decode_utf8()
        .map(|decoded| decoded.into_owned())
        .map_err(|_| RouteError::InvalidEncoding(segment.to_string()))
}

/// Error decoding a request path
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RouteError {
    /// A name without a value
    #[error("Path {0} does not consist of name/value pairs")]
    OddSegments(String),

    /// No `vm` name, or an empty one
    #[error("No guest id in request")]
    MissingGuest,

    /// `cmd` outside the known set
    #[error("Unknown command {0}")]
    UnknownCommand(String),

    /// Escape sequence that does not decode to UTF-8
    #[error("Path segment {0} is not valid percent-encoded UTF-8")]
    InvalidEncoding(String),
}
