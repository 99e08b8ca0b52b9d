//! Client wire protocol.
//!
//! The view-syncer produces a per-client stream of tagged tuples:
//! `["pokeStart", …]`, `["pokePart", …]`, `["pokeEnd", …]` and terminal
//! `["error", …]` frames. Transport framing lives outside this crate; the
//! types here define the payloads and their JSON shape.

use crate::models::query::Ast;
use crate::models::row::{RowKey, RowValue};
use crate::models::schema::SchemaVersions;
use crate::models::{ClientId, QueryHash, TableName};
use serde::de::Error as DeError;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::collections::BTreeMap;
use strum_macros::Display;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize, Display)]
pub enum ErrorKind {
    AuthInvalidated,
    ClientNotFound,
    Internal,
    InvalidConnectionRequest,
    InvalidMessage,
    MutationFailed,
    SchemaVersionNotSupported,
    Unauthorized,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ErrorBody {
    pub kind: ErrorKind,
    pub message: String,
}

impl ErrorBody {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self { kind, message: message.into() }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PokeStartBody {
    #[serde(rename = "pokeID")]
    pub poke_id: String,
    /// Cookie the client is being advanced from; `None` for a cold start.
    pub base_cookie: Option<String>,
    pub schema_versions: SchemaVersions,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PokePartBody {
    #[serde(rename = "pokeID")]
    pub poke_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_mutation_id_changes: Option<BTreeMap<ClientId, i64>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub desired_queries_patches: Option<BTreeMap<ClientId, Vec<QueriesPatch>>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub got_queries_patch: Option<Vec<QueriesPatch>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rows_patch: Option<Vec<RowsPatch>>,
}

impl PokePartBody {
    pub fn new(poke_id: impl Into<String>) -> Self {
        Self { poke_id: poke_id.into(), ..Default::default() }
    }

    pub fn is_empty(&self) -> bool {
        self.last_mutation_id_changes.is_none()
            && self.desired_queries_patches.is_none()
            && self.got_queries_patch.is_none()
            && self.rows_patch.is_none()
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PokeEndBody {
    #[serde(rename = "pokeID")]
    pub poke_id: String,
    pub cookie: String,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "camelCase")]
pub enum QueriesPatch {
    Put {
        hash: QueryHash,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        ast: Option<Ast>,
    },
    Del {
        hash: QueryHash,
    },
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "camelCase")]
pub enum RowsPatch {
    Put {
        #[serde(rename = "tableName")]
        table_name: TableName,
        value: RowValue,
    },
    /// Deletes carry only the row key.
    Del {
        #[serde(rename = "tableName")]
        table_name: TableName,
        id: RowKey,
    },
}

/// A downstream frame: `[tag, body]`.
#[derive(Clone, Debug, PartialEq)]
pub enum Downstream {
    PokeStart(PokeStartBody),
    PokePart(PokePartBody),
    PokeEnd(PokeEndBody),
    Error(ErrorBody),
}

impl Downstream {
    pub fn tag(&self) -> &'static str {
        match self {
            Downstream::PokeStart(_) => "pokeStart",
            Downstream::PokePart(_) => "pokePart",
            Downstream::PokeEnd(_) => "pokeEnd",
            Downstream::Error(_) => "error",
        }
    }
}

impl Serialize for Downstream {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match self {
            Downstream::PokeStart(body) => (self.tag(), body).serialize(serializer),
            Downstream::PokePart(body) => (self.tag(), body).serialize(serializer),
            Downstream::PokeEnd(body) => (self.tag(), body).serialize(serializer),
            Downstream::Error(body) => (self.tag(), body).serialize(serializer),
        }
    }
}

impl<'de> Deserialize<'de> for Downstream {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let (tag, body): (String, serde_json::Value) = Deserialize::deserialize(deserializer)?;
        let frame = match tag.as_str() {
            "pokeStart" => Downstream::PokeStart(
                serde_json::from_value(body).map_err(D::Error::custom)?,
            ),
            "pokePart" => {
                Downstream::PokePart(serde_json::from_value(body).map_err(D::Error::custom)?)
            }
            "pokeEnd" => {
                Downstream::PokeEnd(serde_json::from_value(body).map_err(D::Error::custom)?)
            }
            "error" => Downstream::Error(serde_json::from_value(body).map_err(D::Error::custom)?),
            other => return Err(D::Error::custom(format!("unknown frame tag `{other}`"))),
        };
        Ok(frame)
    }
}
