//! Spooler definitions select and configure an uploader backend
//!
//! A definition is a comma separated string: the backend scheme, the scratch
//! directory for temporary files and the upstream location, for example
//! `local,/var/spool/tmp,/srv/repo` or `gw,/var/spool/tmp,http://gw:4929/api/v1`.
//! The in-memory backend takes no arguments: `mem`.

use crate::error::{IngestError, Result};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;

/// The closed set of uploader backends
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackendKind {
    Local,
    Gateway,
    Memory,
}

impl BackendKind {
    pub fn scheme(&self) -> &'static str {
        match self {
            BackendKind::Local => "local",
            BackendKind::Gateway => "gw",
            BackendKind::Memory => "mem",
        }
    }
}

impl fmt::Display for BackendKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.scheme())
    }
}

impl FromStr for BackendKind {
    type Err = IngestError;

    fn from_str(scheme: &str) -> Result<Self> {
        match scheme {
            "local" => Ok(BackendKind::Local),
            "gw" => Ok(BackendKind::Gateway),
            "mem" => Ok(BackendKind::Memory),
            other => Err(IngestError::invalid_spooler(
                scheme,
                format!("unknown backend scheme '{}'", other),
            )),
        }
    }
}

/// A parsed spooler definition
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SpoolerDefinition {
    pub kind: BackendKind,
    pub temp_dir: PathBuf,
    pub upstream: String,
}

impl SpoolerDefinition {
    pub fn memory() -> Self {
        Self {
            kind: BackendKind::Memory,
            temp_dir: std::env::temp_dir(),
            upstream: String::new(),
        }
    }

    pub fn local(temp_dir: impl Into<PathBuf>, upstream: impl Into<PathBuf>) -> Self {
        Self {
            kind: BackendKind::Local,
            temp_dir: temp_dir.into(),
            upstream: upstream.into().to_string_lossy().into_owned(),
        }
    }

    pub fn gateway(temp_dir: impl Into<PathBuf>, api_url: impl Into<String>) -> Self {
        Self {
            kind: BackendKind::Gateway,
            temp_dir: temp_dir.into(),
            upstream: api_url.into(),
        }
    }
}

impl FromStr for SpoolerDefinition {
    type Err = IngestError;

    fn from_str(definition: &str) -> Result<Self> {
        let parts: Vec<&str> = definition.split(',').map(str::trim).collect();
        let kind: BackendKind = parts[0]
            .parse()
            .map_err(|_| IngestError::invalid_spooler(definition, "unknown backend scheme"))?;

        if kind == BackendKind::Memory {
            if parts.len() > 1 {
                return Err(IngestError::invalid_spooler(
                    definition,
                    "the mem backend takes no arguments",
                ));
            }
            return Ok(SpoolerDefinition::memory());
        }

        if parts.len() != 3 {
            return Err(IngestError::invalid_spooler(
                definition,
                format!("expected '{},<temp dir>,<upstream>'", kind.scheme()),
            ));
        }
        if parts[1].is_empty() || parts[2].is_empty() {
            return Err(IngestError::invalid_spooler(
                definition,
                "temp dir and upstream must not be empty",
            ));
        }
        if kind == BackendKind::Gateway
            && !(parts[2].starts_with("http://") || parts[2].starts_with("https://"))
        {
            return Err(IngestError::invalid_spooler(
                definition,
                "gateway upstream must be an http(s) URL",
            ));
        }

        Ok(Self {
            kind,
            temp_dir: PathBuf::from(parts[1]),
            upstream: parts[2].to_string(),
        })
    }
}

impl fmt::Display for SpoolerDefinition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.kind {
            BackendKind::Memory => f.write_str("mem"),
            kind => write!(
                f,
                "{},{},{}",
                kind.scheme(),
                self.temp_dir.display(),
                self.upstream
            ),
        }
    }
}
