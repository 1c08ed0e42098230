#![forbid(unsafe_code)]

// Attendance output - join/leave timestamps handed to the external ledger

use crate::media::types::{LectureId, UserId};
use crate::room::peer::Role;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tracing::{debug, info};

/// Why a peer stopped attending
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum LeaveReason {
    /// Connection dropped
    Disconnected,
    /// Explicit leave-room
    Left,
    /// Evicted by a newer connection of the same user
    Replaced,
    /// The host ended the lecture (or disconnected)
    LectureEnded,
}

/// One completed attendance interval
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AttendanceRecord {
    pub lecture_id: LectureId,
    pub user_id: UserId,
    pub display_name: String,
    pub role: Role,
    pub joined_at: DateTime<Utc>,
    pub left_at: DateTime<Utc>,
    pub reason: LeaveReason,
}

impl AttendanceRecord {
    pub fn duration(&self) -> chrono::Duration {
        self.left_at - self.joined_at
    }
}

/// Consumer of attendance records. Called while the room is locked, so
/// implementations must not block.
pub trait AttendanceLedger: Send + Sync + 'static {
    fn record(&self, record: AttendanceRecord);
}

/// Writes each record to the log
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingLedger;

impl AttendanceLedger for TracingLedger {
    fn record(&self, record: AttendanceRecord) {
        info!(
            "attendance: user {} ({}) in lecture {} for {}s, reason {:?}",
            record.user_id,
            record.display_name,
            record.lecture_id,
            record.duration().num_seconds(),
            record.reason
        );
    }
}

/// Forwards records over a channel to an exporter task
#[derive(Debug, Clone)]
pub struct ChannelLedger {
    sender: mpsc::UnboundedSender<AttendanceRecord>,
}

impl ChannelLedger {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<AttendanceRecord>) {
        let (sender, receiver) = mpsc::unbounded_channel();
        (Self { sender }, receiver)
    }
}

impl AttendanceLedger for ChannelLedger {
    fn record(&self, record: AttendanceRecord) {
        if self.sender.send(record).is_err() {
            debug!("Attendance receiver dropped, record discarded");
        }
    }
}
