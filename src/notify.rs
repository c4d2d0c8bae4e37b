use chrono::NaiveDate;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tracing::info;
use ulid::Ulid;

use crate::model::{BookingRequest, BookingStatus, ResourceId};

const CHANNEL_CAPACITY: usize = 256;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum NotificationKind {
    Confirmed,
    /// Retries exhausted.
    Failed,
    Cancelled,
    Expired,
}

impl NotificationKind {
    pub fn for_status(status: BookingStatus) -> Option<Self> {
        match status {
            BookingStatus::Confirmed => Some(Self::Confirmed),
            BookingStatus::Failed => Some(Self::Failed),
            BookingStatus::Cancelled => Some(Self::Cancelled),
            BookingStatus::Expired => Some(Self::Expired),
            _ => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Confirmed => "confirmed",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
            Self::Expired => "expired",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NotificationContext {
    pub user_id: String,
    pub resource_id: ResourceId,
    pub booking_date: NaiveDate,
    pub time_slot: String,
    pub status: BookingStatus,
    pub retry_count: u32,
    pub confirmation_code: Option<String>,
    pub error_message: Option<String>,
}

impl From<&BookingRequest> for NotificationContext {
    fn from(r: &BookingRequest) -> Self {
        Self {
            user_id: r.user_id.clone(),
            resource_id: r.resource_id,
            booking_date: r.booking_date,
            time_slot: r.time_slot.to_string(),
            status: r.status,
            retry_count: r.retry_count,
            confirmation_code: r.confirmation_code.clone(),
            error_message: r.error_message.clone(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Notification {
    pub request_id: Ulid,
    pub kind: NotificationKind,
    pub context: NotificationContext,
}

/// Receives lifecycle notifications. Must not block.
pub trait Notifier: Send + Sync {
    fn notify(&self, request_id: Ulid, kind: NotificationKind, context: NotificationContext);
}

/// Broadcast hub keyed by user id, plus a firehose channel for every notification.
pub struct NotifyHub {
    channels: DashMap<String, broadcast::Sender<Notification>>,
    all: broadcast::Sender<Notification>,
}

impl NotifyHub {
    pub fn new() -> Self {
        Self {
            channels: DashMap::new(),
            all: broadcast::channel(CHANNEL_CAPACITY).0,
        }
    }

    /// Subscribe to one user's notifications. Creates the channel if needed.
    pub fn subscribe(&self, user_id: &str) -> broadcast::Receiver<Notification> {
        let sender = self
            .channels
            .entry(user_id.to_string())
            .or_insert_with(|| broadcast::channel(CHANNEL_CAPACITY).0);
        sender.subscribe()
    }

    pub fn subscribe_all(&self) -> broadcast::Receiver<Notification> {
        self.all.subscribe()
    }

    /// Send a notification. No-op if nobody is listening.
    pub fn send(&self, notification: &Notification) {
        if let Some(sender) = self.channels.get(&notification.context.user_id) {
            let _ = sender.send(notification.clone());
        }
        let _ = self.all.send(notification.clone());
    }

    pub fn remove(&self, user_id: &str) {
        self.channels.remove(user_id);
    }
}

impl Default for NotifyHub {
    fn default() -> Self {
        Self::new()
    }
}

impl Notifier for NotifyHub {
    fn notify(&self, request_id: Ulid, kind: NotificationKind, context: NotificationContext) {
        info!(
            request_id = %request_id,
            kind = kind.as_str(),
            user_id = %context.user_id,
            court = context.resource_id,
            date = %context.booking_date,
            "booking notification"
        );
        self.send(&Notification { request_id, kind, context });
    }
}
