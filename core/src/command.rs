//! Command model and wire codec.
//!
//! A [`Command`] is the unit of work carried on the log: an operation tag
//! plus the catalog item fields it applies to. Commands are immutable once
//! published; the log is the append-only system of record for *intent*,
//! not for current state.
//!
//! # Wire Format
//!
//! Commands travel as UTF-8 JSON objects with field-name-tagged (not
//! positional) encoding:
//!
//! ```json
//! {
//!   "operation": "CREATE",
//!   "product_id": "p1",
//!   "name": "Widget",
//!   "description": "d",
//!   "price": 9.99,
//!   "category": "tools"
//! }
//! ```
//!
//! The `operation` tag is case-insensitive on decode and normalized to
//! uppercase on encode. Unknown fields are ignored. Missing fields decode
//! as absent; whether an absent field is acceptable depends on the
//! operation and is checked by [`Command::missing_fields`] at apply time,
//! not at decode time.

use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

/// Errors from encoding or decoding a command payload.
#[derive(Error, Debug)]
pub enum CodecError {
    /// The payload was not a valid JSON command object.
    #[error("failed to decode command payload: {0}")]
    Decode(String),

    /// The command could not be serialized to JSON.
    #[error("failed to encode command: {0}")]
    Encode(String),
}

/// The mutation a command intends against the catalog store.
///
/// Operation tags are matched case-insensitively on the wire. Anything
/// outside the three known tags parses to [`Operation::Unrecognized`],
/// preserving the raw tag so the consumer can dead-letter the record with
/// enough context to diagnose. An unrecognized operation must never
/// mutate state.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Operation {
    /// Insert a catalog item (idempotent: applied as an upsert keyed on
    /// the business identity).
    Create,
    /// Overwrite every attribute field of an existing item.
    Update,
    /// Remove an item by its internal key.
    Delete,
    /// Any tag outside the known set, after case normalization.
    Unrecognized(String),
}

impl Operation {
    /// Parse an operation tag, normalizing case.
    #[must_use]
    pub fn parse(tag: &str) -> Self {
        match tag.to_ascii_uppercase().as_str() {
            "CREATE" => Self::Create,
            "UPDATE" => Self::Update,
            "DELETE" => Self::Delete,
            _ => Self::Unrecognized(tag.to_string()),
        }
    }

    /// The normalized wire tag for this operation.
    ///
    /// Unrecognized operations round-trip their raw tag.
    #[must_use]
    pub fn as_tag(&self) -> &str {
        match self {
            Self::Create => "CREATE",
            Self::Update => "UPDATE",
            Self::Delete => "DELETE",
            Self::Unrecognized(tag) => tag,
        }
    }

    /// Whether this is one of the three operations the materializer
    /// knows how to apply.
    #[must_use]
    pub const fn is_recognized(&self) -> bool {
        !matches!(self, Self::Unrecognized(_))
    }
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_tag())
    }
}

/// A single intended catalog mutation, as carried on the log.
///
/// `product_id` is the business identity (externally meaningful key);
/// `id` is the store's internal numeric key, assigned on CREATE and used
/// by UPDATE/DELETE to address the row. Attribute fields are present in
/// full for CREATE and UPDATE (full overwrite, not merge) and ignored for
/// DELETE.
#[derive(Debug, Clone, PartialEq)]
pub struct Command {
    /// The mutation this command intends.
    pub operation: Operation,
    /// Business identity of the catalog item.
    pub product_id: Option<String>,
    /// Internal numeric key; required for UPDATE and DELETE.
    pub id: Option<i64>,
    /// Item name.
    pub name: Option<String>,
    /// Item description.
    pub description: Option<String>,
    /// Item price (non-negative).
    pub price: Option<f64>,
    /// Item category.
    pub category: Option<String>,
}

/// Serde-facing shape of the wire object.
///
/// All fields are optional here so that a structurally valid JSON object
/// always decodes; per-operation requirements are enforced later, at
/// apply time (a missing required field is a warned no-op, not a decode
/// error).
#[derive(Serialize, Deserialize)]
struct WireCommand {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    operation: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    product_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    id: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    description: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    price: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    category: Option<String>,
}

impl Command {
    /// Create a fully-formed CREATE command.
    #[must_use]
    pub fn create(
        product_id: impl Into<String>,
        name: impl Into<String>,
        description: impl Into<String>,
        price: f64,
        category: impl Into<String>,
    ) -> Self {
        Self {
            operation: Operation::Create,
            product_id: Some(product_id.into()),
            id: None,
            name: Some(name.into()),
            description: Some(description.into()),
            price: Some(price),
            category: Some(category.into()),
        }
    }

    /// Create an UPDATE command addressing the row with internal key `id`.
    #[must_use]
    pub fn update(
        id: i64,
        product_id: impl Into<String>,
        name: impl Into<String>,
        description: impl Into<String>,
        price: f64,
        category: impl Into<String>,
    ) -> Self {
        Self {
            operation: Operation::Update,
            product_id: Some(product_id.into()),
            id: Some(id),
            name: Some(name.into()),
            description: Some(description.into()),
            price: Some(price),
            category: Some(category.into()),
        }
    }

    /// Create a DELETE command addressing the row with internal key `id`.
    ///
    /// Carries no business identity, so it publishes unkeyed; prefer
    /// [`delete_keyed`](Self::delete_keyed) when the identity is known,
    /// which keeps the delete ordered with the item's other commands.
    #[must_use]
    pub const fn delete(id: i64) -> Self {
        Self {
            operation: Operation::Delete,
            product_id: None,
            id: Some(id),
            name: None,
            description: None,
            price: None,
            category: None,
        }
    }

    /// Create a DELETE command that also carries the business identity,
    /// so it lands on the same partition as the item's CREATE and UPDATE
    /// commands and cannot overtake them.
    #[must_use]
    pub fn delete_keyed(id: i64, product_id: impl Into<String>) -> Self {
        Self {
            product_id: Some(product_id.into()),
            ..Self::delete(id)
        }
    }

    /// The partition key for this command: the business identity when
    /// present, so the broker routes same-identity commands to one
    /// partition and per-identity ordering holds by construction.
    #[must_use]
    pub fn partition_key(&self) -> Option<&str> {
        self.product_id.as_deref()
    }

    /// Field names required by this command's operation that are absent.
    ///
    /// - CREATE requires the business identity and all four attributes.
    /// - UPDATE requires the internal key, the business identity and all
    ///   four attributes (full overwrite, not merge).
    /// - DELETE requires the internal key only.
    /// - Unrecognized operations report nothing; they are rejected at
    ///   dispatch, before field checks matter.
    #[must_use]
    pub fn missing_fields(&self) -> Vec<&'static str> {
        let mut missing = Vec::new();
        let mut need = |present: bool, field: &'static str| {
            if !present {
                missing.push(field);
            }
        };

        match self.operation {
            Operation::Create | Operation::Update => {
                if self.operation == Operation::Update {
                    need(self.id.is_some(), "id");
                }
                need(self.product_id.is_some(), "product_id");
                need(self.name.is_some(), "name");
                need(self.description.is_some(), "description");
                need(self.price.is_some(), "price");
                need(self.category.is_some(), "category");
            }
            Operation::Delete => need(self.id.is_some(), "id"),
            Operation::Unrecognized(_) => {}
        }

        missing
    }

    /// Encode this command to its UTF-8 JSON wire form.
    ///
    /// The operation tag is emitted normalized (uppercase).
    ///
    /// # Errors
    ///
    /// Returns [`CodecError::Encode`] if serialization fails.
    pub fn encode(&self) -> Result<Vec<u8>, CodecError> {
        let wire = WireCommand {
            operation: Some(self.operation.as_tag().to_string()),
            product_id: self.product_id.clone(),
            id: self.id,
            name: self.name.clone(),
            description: self.description.clone(),
            price: self.price,
            category: self.category.clone(),
        };
        serde_json::to_vec(&wire).map_err(|e| CodecError::Encode(e.to_string()))
    }

    /// Decode a command from its JSON wire form.
    ///
    /// Unknown fields are ignored; a missing or unknown operation tag
    /// decodes to [`Operation::Unrecognized`] so the consumer can route
    /// the record to the dead-letter store at dispatch.
    ///
    /// # Errors
    ///
    /// Returns [`CodecError::Decode`] if the payload is not a JSON
    /// object of the expected shape.
    pub fn decode(payload: &[u8]) -> Result<Self, CodecError> {
        let wire: WireCommand =
            serde_json::from_slice(payload).map_err(|e| CodecError::Decode(e.to_string()))?;

        let operation = wire
            .operation
            .as_deref()
            .map_or_else(|| Operation::Unrecognized(String::new()), Operation::parse);

        Ok(Self {
            operation,
            product_id: wire.product_id,
            id: wire.id,
            name: wire.name,
            description: wire.description,
            price: wire.price,
            category: wire.category,
        })
    }
}
