//! Cluster message models
//!
//! Every message exchanged between nodes is a `Message`: a unique id plus a
//! `Payload` variant. Payloads are encoded as JSON objects tagged with
//! `"type"`, so the receiving side dispatches with a single `match`.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use cumulus_common::Result;

use crate::{model::Node, path::StorePath};

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub id: Uuid,
    #[serde(flatten)]
    pub payload: Payload,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum Payload {
    /// Handshake offer or reply carrying the sender's descriptor
    Identification { node: Node },
    /// Confirms the message with id `reference`
    Ack { reference: Uuid },
    /// Rejects a handshake because one is already in progress
    BusyNode { node: Node },
    /// Announces a directory node
    PublishPath { path: StorePath },
    /// Retracts a directory node and its subtree
    HidePath { path: StorePath },
    /// Replicates a leaf; `value` is present only for holders
    PublishObject {
        path: StorePath,
        timestamp: i64,
        holders: Vec<Uuid>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        value: Option<Value>,
    },
    /// Synchronous read request
    Invoke { path: StorePath },
    /// Reply to `Invoke` or `Lock`; an absent value means not found
    Response {
        reference: Uuid,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        value: Option<Value>,
    },
    /// Distributed-lock vote request
    Lock { path: StorePath, timestamp: i64 },
    /// Distributed-lock release notification
    Unlock { path: StorePath },
    /// The circulating token
    CloudWagon { wagon: Wagon },
    /// Application message routed by topic
    Deliver {
        origin: Uuid,
        topic: String,
        body: Value,
    },
}

impl Payload {
    pub fn kind(&self) -> &'static str {
        match self {
            Payload::Identification { .. } => "identification",
            Payload::Ack { .. } => "ack",
            Payload::BusyNode { .. } => "busyNode",
            Payload::PublishPath { .. } => "publishPath",
            Payload::HidePath { .. } => "hidePath",
            Payload::PublishObject { .. } => "publishObject",
            Payload::Invoke { .. } => "invoke",
            Payload::Response { .. } => "response",
            Payload::Lock { .. } => "lock",
            Payload::Unlock { .. } => "unlock",
            Payload::CloudWagon { .. } => "cloudWagon",
            Payload::Deliver { .. } => "deliver",
        }
    }
}

impl Message {
    pub fn new(payload: Payload) -> Self {
        Self {
            id: Uuid::new_v4(),
            payload,
        }
    }

    pub fn kind(&self) -> &'static str {
        self.payload.kind()
    }

    pub fn ack(reference: Uuid) -> Self {
        Self::new(Payload::Ack { reference })
    }

    pub fn response(reference: Uuid, value: Option<Value>) -> Self {
        Self::new(Payload::Response { reference, value })
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec(self)?)
    }

    pub fn from_slice(bytes: &[u8]) -> Result<Self> {
        Ok(serde_json::from_slice(bytes)?)
    }
}

/// The circulating store-and-forward token
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Wagon {
    /// Incarnation id
    pub id: Uuid,
    /// Pending messages per destination node
    #[serde(default)]
    pub load: BTreeMap<Uuid, Vec<Message>>,
}

impl Wagon {
    pub fn new() -> Self {
        Self {
            id: Uuid::new_v4(),
            load: BTreeMap::new(),
        }
    }

    /// Total number of queued messages
    pub fn pending(&self) -> usize {
        self.load.values().map(Vec::len).sum()
    }

    /// Remove and return everything addressed to `node`
    pub fn unload(&mut self, node: &Uuid) -> Vec<Message> {
        self.load.remove(node).unwrap_or_default()
    }

    /// Append queued messages, keeping per-destination order
    pub fn merge(&mut self, load: BTreeMap<Uuid, Vec<Message>>) {
        for (node, messages) in load {
            if !messages.is_empty() {
                self.load.entry(node).or_default().extend(messages);
            }
        }
    }

    /// Re-address everything queued for `from` to `to`, ahead of what `to` already has
    pub fn rekey(&mut self, from: &Uuid, to: Uuid) {
        if *from == to {
            return;
        }
        if let Some(mut moved) = self.load.remove(from) {
            if let Some(existing) = self.load.remove(&to) {
                moved.extend(existing);
            }
            self.load.insert(to, moved);
        }
    }
}

impl Default for Wagon {
    fn default() -> Self {
        Self::new()
    }
}
