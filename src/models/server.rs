use serde::{Deserialize, Serialize};
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ServerStatus {
    Active,
    Inactive,
}

impl fmt::Display for ServerStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Active => write!(f, "active"),
            Self::Inactive => write!(f, "inactive"),
        }
    }
}

impl std::str::FromStr for ServerStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "active" => Ok(Self::Active),
            "inactive" => Ok(Self::Inactive),
            _ => Err(format!("Invalid server status: {s}")),
        }
    }
}

/// A fleet member that hosts provisioned accounts
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Server {
    pub id: i64,
    pub name: String,
    pub hostname: String,
    pub control_panel_kind: String,
    pub max_accounts: i32,
    pub current_accounts: i32,
    pub status: ServerStatus,
}

impl Server {
    pub fn has_capacity(&self) -> bool {
        self.status == ServerStatus::Active && self.current_accounts < self.max_accounts
    }

    /// Fraction of account slots in use; servers without slots count as full
    pub fn load_ratio(&self) -> f64 {
        if self.max_accounts <= 0 {
            return 1.0;
        }
        f64::from(self.current_accounts) / f64::from(self.max_accounts)
    }
}

/// Registration data for a new fleet member
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewServer {
    pub name: String,
    pub hostname: String,
    pub control_panel_kind: String,
    pub max_accounts: i32,
    #[serde(default)]
    pub current_accounts: i32,
    #[serde(default = "default_server_status")]
    pub status: ServerStatus,
}

fn default_server_status() -> ServerStatus {
    ServerStatus::Active
}
