//! Stage discriminators for work records.

use crate::{Error, Result};
use derive_more::Display;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::sync::LazyLock;

static STAGE_NAME: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[a-z][a-z0-9_-]*$").expect("valid stage regex"));

/// The `kind` column of a work record.
///
/// A unit can have one record per stage, e.g. an `initial` import followed by
/// repeated `incremental` imports.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize, Display)]
#[serde(try_from = "String", into = "String")]
#[display("{_0}")]
pub struct StageKind(String);

impl StageKind {
    /// Create a stage kind, validating the name.
    pub fn new(name: impl Into<String>) -> Result<Self> {
        let name = name.into();
        if !STAGE_NAME.is_match(&name) {
            return Err(Error::InvalidStage(name));
        }
        Ok(Self(name))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl TryFrom<String> for StageKind {
    type Error = Error;

    fn try_from(name: String) -> Result<Self> {
        Self::new(name)
    }
}

impl From<StageKind> for String {
    fn from(kind: StageKind) -> Self {
        kind.0
    }
}

impl std::str::FromStr for StageKind {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        Self::new(s)
    }
}
