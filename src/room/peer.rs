#![forbid(unsafe_code)]

// Peer - one participant's connection and the media resources it owns

use crate::attendance::{AttendanceRecord, LeaveReason};
use crate::media::types::{
    ConnectionId, ConsumerId, LectureId, MediaKind, ProducerId, TrackSource, TransportId, UserId,
};
use crate::media::{MediaConsumer, MediaProducer, MediaTransport};
use crate::signaling::protocol::{Identity, ProducerSummary};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, warn};

/// Lecture role. Only a teacher may open a room.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    Teacher,
    Student,
}

impl FromStr for Role {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "teacher" => Ok(Role::Teacher),
            "student" => Ok(Role::Student),
            other => Err(format!("unknown role: {other}")),
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Role::Teacher => f.write_str("teacher"),
            Role::Student => f.write_str("student"),
        }
    }
}

pub struct ProducerEntry {
    pub handle: Arc<dyn MediaProducer>,
    pub transport_id: TransportId,
    pub kind: MediaKind,
    pub source: Option<TrackSource>,
    pub metadata: Value,
    /// Last pause state observed from the engine
    pub paused: bool,
}

pub struct ConsumerEntry {
    pub handle: Arc<dyn MediaConsumer>,
    pub transport_id: TransportId,
    /// Source producer, referenced by id only
    pub producer_id: ProducerId,
}

/// Participant in a live lecture
pub struct Peer {
    pub connection_id: ConnectionId,
    pub lecture_id: LectureId,
    pub user_id: UserId,
    pub display_name: String,
    pub role: Role,
    pub joined_at: DateTime<Utc>,
    sender: mpsc::Sender<Arc<String>>,
    transports: HashMap<TransportId, Arc<dyn MediaTransport>>,
    producers: HashMap<ProducerId, ProducerEntry>,
    consumers: HashMap<ConsumerId, ConsumerEntry>,
}

impl Peer {
    pub fn new(
        connection_id: ConnectionId,
        lecture_id: LectureId,
        identity: &Identity,
        sender: mpsc::Sender<Arc<String>>,
    ) -> Self {
        Self {
            connection_id,
            lecture_id,
            user_id: identity.user_id.clone(),
            display_name: identity.display_name.clone(),
            role: identity.role,
            joined_at: Utc::now(),
            sender,
            transports: HashMap::new(),
            producers: HashMap::new(),
            consumers: HashMap::new(),
        }
    }

    /// Queues a pre-serialized frame for this peer's socket
    pub fn send_json(&self, json: Arc<String>) {
        match self.sender.try_send(json) {
            Ok(()) => {}
            Err(mpsc::error::TrySendError::Full(_)) => {
                warn!(
                    "Channel full for peer {} in lecture {}, dropping message",
                    self.connection_id, self.lecture_id
                );
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                debug!(
                    "Channel closed for peer {} in lecture {} (disconnected)",
                    self.connection_id, self.lecture_id
                );
            }
        }
    }

    pub fn add_transport(&mut self, transport: Arc<dyn MediaTransport>) {
        self.transports.insert(transport.id(), transport);
    }

    pub fn transport(&self, transport_id: &TransportId) -> Option<&Arc<dyn MediaTransport>> {
        self.transports.get(transport_id)
    }

    pub fn remove_transport(&mut self, transport_id: &TransportId) -> Option<Arc<dyn MediaTransport>> {
        self.transports.remove(transport_id)
    }

    pub fn transport_ids(&self) -> Vec<TransportId> {
        self.transports.keys().cloned().collect()
    }

    pub fn add_producer(&mut self, entry: ProducerEntry) {
        self.producers.insert(entry.handle.id(), entry);
    }

    pub fn producer(&self, producer_id: &ProducerId) -> Option<&ProducerEntry> {
        self.producers.get(producer_id)
    }

    pub fn producer_mut(&mut self, producer_id: &ProducerId) -> Option<&mut ProducerEntry> {
        self.producers.get_mut(producer_id)
    }

    pub fn remove_producer(&mut self, producer_id: &ProducerId) -> Option<ProducerEntry> {
        self.producers.remove(producer_id)
    }

    pub fn producer_ids(&self) -> Vec<ProducerId> {
        self.producers.keys().cloned().collect()
    }

    pub fn add_consumer(&mut self, entry: ConsumerEntry) {
        self.consumers.insert(entry.handle.id(), entry);
    }

    pub fn consumer(&self, consumer_id: &ConsumerId) -> Option<&ConsumerEntry> {
        self.consumers.get(consumer_id)
    }

    pub fn remove_consumer(&mut self, consumer_id: &ConsumerId) -> Option<ConsumerEntry> {
        self.consumers.remove(consumer_id)
    }

    pub fn consumer_ids(&self) -> Vec<ConsumerId> {
        self.consumers.keys().cloned().collect()
    }

    /// Consumers of this peer fed by `producer_id`
    pub fn consumers_of(&self, producer_id: &ProducerId) -> Vec<ConsumerId> {
        self.consumers
            .iter()
            .filter(|(_, entry)| &entry.producer_id == producer_id)
            .map(|(id, _)| id.clone())
            .collect()
    }

    pub fn transport_count(&self) -> usize {
        self.transports.len()
    }

    pub fn producer_count(&self) -> usize {
        self.producers.len()
    }

    pub fn consumer_count(&self) -> usize {
        self.consumers.len()
    }

    /// This peer's tracks as advertised to others
    pub fn producer_summaries(&self) -> Vec<ProducerSummary> {
        self.producers
            .iter()
            .map(|(id, entry)| ProducerSummary {
                producer_id: id.clone(),
                peer_id: self.connection_id.clone(),
                user_id: self.user_id.clone(),
                kind: entry.kind,
                source: entry.source,
                metadata: entry.metadata.clone(),
                paused: entry.paused,
            })
            .collect()
    }

    /// Closes every engine resource and empties the maps.
    /// Consumers go first, then producers, then the transports carrying them.
    pub fn close_all(&mut self) {
        for (_, entry) in self.consumers.drain() {
            entry.handle.close();
        }
        for (_, entry) in self.producers.drain() {
            entry.handle.close();
        }
        for (_, transport) in self.transports.drain() {
            transport.close();
        }
    }

    pub fn attendance(&self, reason: LeaveReason) -> AttendanceRecord {
        AttendanceRecord {
            lecture_id: self.lecture_id.clone(),
            user_id: self.user_id.clone(),
            display_name: self.display_name.clone(),
            role: self.role,
            joined_at: self.joined_at,
            left_at: Utc::now(),
            reason,
        }
    }
}
