//! Domain model structs persisted in the local database.
//!
//! Every struct derives `Serialize` and `Deserialize` so it can be handed
//! directly to the UI layer.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use nexfi_shared::UserId;

// ---------------------------------------------------------------------------
// Delivery status
// ---------------------------------------------------------------------------

/// Delivery status of a message. Ordered: a message only ever moves forward.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageStatus {
    /// Authored on this device, not confirmed anywhere else yet.
    Local,
    /// Received over (or acknowledged by) the direct transport.
    Delivered,
    /// Acknowledged by the backend; `remote_id` is known.
    Synced,
}

impl MessageStatus {
    /// Integer stored in the `status` column.
    pub fn rank(self) -> i64 {
        match self {
            Self::Local => 0,
            Self::Delivered => 1,
            Self::Synced => 2,
        }
    }

    pub fn from_rank(rank: i64) -> Option<Self> {
        match rank {
            0 => Some(Self::Local),
            1 => Some(Self::Delivered),
            2 => Some(Self::Synced),
            _ => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Local => "local",
            Self::Delivered => "delivered",
            Self::Synced => "synced",
        }
    }
}

impl std::fmt::Display for MessageStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Outcome of a status transition request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transition {
    /// The record moved to the requested status.
    Applied,
    /// The record was already at or beyond the requested status.
    Unchanged,
    /// No record with that id exists.
    NotFound,
}

// ---------------------------------------------------------------------------
// Message
// ---------------------------------------------------------------------------

/// A single direct message.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Message {
    /// Locally generated identifier, unique within the store.
    pub id: String,
    pub from_user_id: UserId,
    pub to_user_id: UserId,
    pub text: String,
    /// Reference to an attached image, if any.
    pub image: Option<String>,
    /// Reference to an attached voice note, if any.
    pub voice: Option<String>,
    pub mood: Option<String>,
    /// When the message was authored (as reported by the author).
    pub timestamp: DateTime<Utc>,
    pub status: MessageStatus,
    pub sent_by_me: bool,
    pub read: bool,
    /// Backend-assigned id; present exactly when `status` is `Synced`.
    pub remote_id: Option<String>,
}

impl Message {
    /// A message authored on this device, not yet delivered anywhere.
    pub fn local(from: UserId, to: UserId, text: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            from_user_id: from,
            to_user_id: to,
            text: text.into(),
            image: None,
            voice: None,
            mood: None,
            timestamp: Utc::now(),
            status: MessageStatus::Local,
            sent_by_me: true,
            read: true,
            remote_id: None,
        }
    }

    /// Whether `remote_id` agrees with `status`.
    pub fn is_consistent(&self) -> bool {
        self.remote_id.is_some() == (self.status == MessageStatus::Synced)
    }

    pub fn is_synced(&self) -> bool {
        self.status == MessageStatus::Synced
    }
}
