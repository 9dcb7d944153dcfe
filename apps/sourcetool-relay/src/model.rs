//! Durable entities the relay reads and writes.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HostInstanceStatus {
    Unknown,
    Online,
    Unreachable,
}

impl HostInstanceStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            HostInstanceStatus::Unknown => "unknown",
            HostInstanceStatus::Online => "online",
            HostInstanceStatus::Unreachable => "unreachable",
        }
    }

    pub fn parse(value: &str) -> Self {
        match value {
            "online" => HostInstanceStatus::Online,
            "unreachable" => HostInstanceStatus::Unreachable,
            _ => HostInstanceStatus::Unknown,
        }
    }
}

/// One running SDK process.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HostInstance {
    pub id: Uuid,
    pub organization_id: Uuid,
    pub api_key_id: Uuid,
    pub sdk_name: String,
    pub sdk_version: String,
    pub status: HostInstanceStatus,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, sqlx::FromRow)]
pub struct ApiKey {
    pub id: Uuid,
    pub organization_id: Uuid,
    pub environment_id: Uuid,
    pub name: String,
    pub key: String,
}

/// One browser conversation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, sqlx::FromRow)]
pub struct Session {
    pub id: Uuid,
    pub organization_id: Uuid,
    pub user_id: Uuid,
    pub environment_id: Uuid,
    pub created_at: DateTime<Utc>,
}

/// Binds a session to a host that served it. The newest row is the current host.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, sqlx::FromRow)]
pub struct SessionHostInstance {
    pub session_id: Uuid,
    pub host_instance_id: Uuid,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, sqlx::FromRow)]
pub struct Page {
    pub id: Uuid,
    pub organization_id: Uuid,
    pub environment_id: Uuid,
    pub api_key_id: Uuid,
    pub name: String,
    pub route: String,
    pub path: Vec<i32>,
}

impl Page {
    /// True when the host-declared fields differ.
    pub fn differs_from(&self, other: &Page) -> bool {
        self.name != other.name || self.route != other.route || self.path != other.path
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, sqlx::FromRow)]
pub struct GroupPage {
    pub id: Uuid,
    pub group_id: Uuid,
    pub page_id: Uuid,
}
