// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Shape log messages.
//!
//! A shape source answers each request with a batch of messages: row changes
//! (insert, update, delete) and control messages (`up-to-date`,
//! `must-refetch`). This module defines those types and parses the JSON wire
//! form used by the HTTP shape log.
//!
//! # Wire Format
//!
//! ```json
//! [
//!   {"key": "\"public\".\"todos\"/\"1\"",
//!    "value": {"id": "1", "title": "milk", "completed": false},
//!    "headers": {"operation": "insert", "txids": [734], "lsn": "1200", "op_position": 0}},
//!   {"headers": {"control": "up-to-date"}}
//! ]
//! ```
//!
//! A message offset comes from its `offset` field if present, else from
//! its `lsn`/`op_position` headers, else it inherits the batch offset.
//! Unknown operations and control kinds are logged and skipped so newer
//! servers don't break older clients.

use crate::cursor::Offset;
use crate::error::{Result, SyncError};
use crate::store::{Key, Row};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use std::str::FromStr;
use tracing::{trace, warn};

/// Transaction id issued by the durable store for a committed write.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Txid(pub u64);

impl fmt::Display for Txid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for Txid {
    type Err = std::num::ParseIntError;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        s.trim().parse().map(Txid)
    }
}

impl From<u64> for Txid {
    fn from(v: u64) -> Self {
        Txid(v)
    }
}

/// Row change operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChangeOp {
    Insert,
    Update,
    Delete,
}

impl ChangeOp {
    fn from_str(s: &str) -> Option<Self> {
        match s.to_lowercase().as_str() {
            "insert" => Some(ChangeOp::Insert),
            "update" => Some(ChangeOp::Update),
            "delete" => Some(ChangeOp::Delete),
            _ => None,
        }
    }

    /// Label used in logs and metrics.
    pub fn as_str(&self) -> &'static str {
        match self {
            ChangeOp::Insert => "insert",
            ChangeOp::Update => "update",
            ChangeOp::Delete => "delete",
        }
    }
}

impl fmt::Display for ChangeOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A row change delivered by the shape source.
#[derive(Debug, Clone, PartialEq)]
pub struct ChangeEvent {
    /// Log position of this change.
    pub offset: Offset,
    /// Operation type.
    pub op: ChangeOp,
    /// Row key as sent by the source.
    pub key: Key,
    /// Full row for inserts, changed columns for updates, primary key columns
    /// (if any) for deletes.
    pub value: Option<Row>,
    /// Transactions this change belongs to.
    pub txids: Vec<Txid>,
}

impl ChangeEvent {
    /// Create an insert event.
    pub fn insert(offset: Offset, key: impl Into<Key>, value: Row) -> Self {
        Self {
            offset,
            op: ChangeOp::Insert,
            key: key.into(),
            value: Some(value),
            txids: Vec::new(),
        }
    }

    /// Create an update event carrying the changed columns.
    pub fn update(offset: Offset, key: impl Into<Key>, value: Row) -> Self {
        Self {
            offset,
            op: ChangeOp::Update,
            key: key.into(),
            value: Some(value),
            txids: Vec::new(),
        }
    }

    /// Create a delete event.
    pub fn delete(offset: Offset, key: impl Into<Key>) -> Self {
        Self {
            offset,
            op: ChangeOp::Delete,
            key: key.into(),
            value: None,
            txids: Vec::new(),
        }
    }

    /// Attach a transaction id.
    pub fn with_txid(mut self, txid: impl Into<Txid>) -> Self {
        self.txids.push(txid.into());
        self
    }
}

/// Control message kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Control {
    /// The client has everything up to the current head of the log.
    UpToDate,
    /// The cursor can't be resumed; discard and resnapshot.
    MustRefetch,
}

/// One message from a shape batch.
#[derive(Debug, Clone, PartialEq)]
pub enum ShapeMessage {
    Change(ChangeEvent),
    Control(Control),
}

impl ShapeMessage {
    /// Get the change if this is a change message.
    pub fn as_change(&self) -> Option<&ChangeEvent> {
        match self {
            ShapeMessage::Change(c) => Some(c),
            ShapeMessage::Control(_) => None,
        }
    }
}

/// One response from a shape source.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct ShapeBatch {
    /// Messages in log order.
    pub messages: Vec<ShapeMessage>,
    /// Shape handle the source associates with this log.
    pub handle: Option<String>,
    /// Offset to resume from after applying this batch.
    pub offset: Offset,
}

impl ShapeBatch {
    /// Create a batch ending at `offset`.
    pub fn new(handle: Option<String>, offset: Offset) -> Self {
        Self {
            messages: Vec::new(),
            handle,
            offset,
        }
    }

    /// Append a change.
    pub fn push_change(&mut self, change: ChangeEvent) {
        self.messages.push(ShapeMessage::Change(change));
    }

    /// Append an up-to-date marker.
    pub fn push_up_to_date(&mut self) {
        self.messages.push(ShapeMessage::Control(Control::UpToDate));
    }

    /// Iterate over the row changes.
    pub fn changes(&self) -> impl Iterator<Item = &ChangeEvent> {
        self.messages.iter().filter_map(ShapeMessage::as_change)
    }

    /// Check if the batch carries an up-to-date marker.
    pub fn is_up_to_date(&self) -> bool {
        self.messages
            .iter()
            .any(|m| matches!(m, ShapeMessage::Control(Control::UpToDate)))
    }

    /// Check if the batch tells us to resnapshot.
    pub fn must_refetch(&self) -> bool {
        self.messages
            .iter()
            .any(|m| matches!(m, ShapeMessage::Control(Control::MustRefetch)))
    }

    /// Check if there are no messages at all.
    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }
}

#[derive(Debug, Deserialize)]
struct WireMessage {
    #[serde(default)]
    key: Option<String>,
    #[serde(default)]
    value: Option<Value>,
    #[serde(default)]
    offset: Option<String>,
    #[serde(default)]
    headers: WireHeaders,
}

#[derive(Debug, Default, Deserialize)]
struct WireHeaders {
    #[serde(default)]
    operation: Option<String>,
    #[serde(default)]
    control: Option<String>,
    #[serde(default)]
    txids: Vec<Value>,
    #[serde(default)]
    lsn: Option<Value>,
    #[serde(default)]
    op_position: Option<u64>,
}

/// Parse a JSON shape log body.
///
/// `batch_offset` is used for messages that carry no position of their own.
pub fn parse_messages(body: &str, batch_offset: Offset) -> Result<Vec<ShapeMessage>> {
    let body = body.trim();
    if body.is_empty() {
        return Ok(Vec::new());
    }

    let wire: Vec<WireMessage> = serde_json::from_str(body)
        .map_err(|e| SyncError::transport_msg("parse", format!("malformed shape log body: {}", e)))?;

    let mut messages = Vec::with_capacity(wire.len());
    for msg in wire {
        if let Some(control) = msg.headers.control.as_deref() {
            match control {
                "up-to-date" => messages.push(ShapeMessage::Control(Control::UpToDate)),
                "must-refetch" => messages.push(ShapeMessage::Control(Control::MustRefetch)),
                other => trace!(control = %other, "Skipping unknown control message"),
            }
            continue;
        }

        let Some(op_str) = msg.headers.operation.as_deref() else {
            warn!("Skipping shape message with neither operation nor control header");
            continue;
        };
        let Some(op) = ChangeOp::from_str(op_str) else {
            warn!(operation = %op_str, "Skipping unknown operation");
            continue;
        };
        let key = msg
            .key
            .ok_or_else(|| SyncError::transport_msg("parse", "change message without key"))?;

        let value = match msg.value {
            Some(Value::Object(map)) => Some(map),
            Some(Value::Null) | None => None,
            Some(other) => {
                return Err(SyncError::transport_msg(
                    "parse",
                    format!("value for key {} is not an object: {}", key, other),
                ))
            }
        };
        if op != ChangeOp::Delete && value.is_none() {
            return Err(SyncError::transport_msg(
                "parse",
                format!("{} for key {} has no value", op, key),
            ));
        }

        let offset = message_offset(msg.offset.as_deref(), &msg.headers).unwrap_or(batch_offset);
        let txids = msg.headers.txids.iter().filter_map(parse_txid).collect();

        messages.push(ShapeMessage::Change(ChangeEvent {
            offset,
            op,
            key: Key::from(key),
            value,
            txids,
        }));
    }
    Ok(messages)
}

fn message_offset(offset: Option<&str>, headers: &WireHeaders) -> Option<Offset> {
    if let Some(o) = offset.and_then(|o| o.parse().ok()) {
        return Some(o);
    }
    let lsn = match headers.lsn.as_ref()? {
        Value::String(s) => s.parse().ok()?,
        Value::Number(n) => n.as_u64()?,
        _ => return None,
    };
    Some(Offset::new(lsn, headers.op_position.unwrap_or(0)))
}

fn parse_txid(v: &Value) -> Option<Txid> {
    match v {
        Value::Number(n) => n.as_u64().map(Txid),
        Value::String(s) => s.parse().ok(),
        _ => None,
    }
}
