//! # System Constants
//!
//! Step names, transition event names and operational defaults shared by the
//! scheduler, the executors and the admin surface.

/// Step names understood by the scheduler and the built-in executors
pub mod steps {
    pub const ALLOCATE_SERVER: &str = "allocate_server";
    pub const CREATE_VHOST: &str = "create_vhost";
    pub const CREATE_DATABASE: &str = "create_database";
    pub const CREATE_MAILBOX: &str = "create_mailbox";
    pub const ISSUE_CERTIFICATE: &str = "issue_certificate";
    pub const SCHEDULE_BACKUP: &str = "schedule_backup";

    /// Steps that act on the task's assigned server
    pub const SERVER_BOUND: &[&str] = &[
        CREATE_VHOST,
        CREATE_DATABASE,
        ISSUE_CERTIFICATE,
        SCHEDULE_BACKUP,
    ];

    /// Whether the step needs `server_id` to be set before it runs
    pub fn requires_server(step: &str) -> bool {
        SERVER_BOUND.contains(&step)
    }
}

/// Transition event names written to the audit log
pub mod events {
    pub const TASK_CREATED: &str = "task.created";
    pub const TASK_CLAIMED: &str = "task.claimed";
    pub const STEP_COMPLETED: &str = "task.step_completed";
    pub const TASK_COMPLETED: &str = "task.completed";
    pub const TASK_RETRY_SCHEDULED: &str = "task.retry_scheduled";
    pub const TASK_FAILED: &str = "task.failed";
    pub const TASK_CANCELLED: &str = "task.cancelled";
    pub const TASK_RETRY_REQUESTED: &str = "task.retry_requested";
    pub const TASK_RECOVERED: &str = "task.recovered";
    pub const TASK_CLEARED: &str = "task.cleared";
}

/// Who triggered a transition
pub mod actors {
    pub const SCHEDULER: &str = "scheduler";
    pub const ADMIN: &str = "admin";
    pub const RECOVERY: &str = "recovery";
    pub const BILLING: &str = "billing";
}

/// Error messages with fixed meaning
pub mod messages {
    pub const CANCELLED: &str = "cancelled";
    pub const ABANDONED: &str = "abandoned";
}

/// System-wide defaults
pub mod system {
    pub const DEFAULT_MAX_RETRIES: i32 = 3;
    pub const DEFAULT_WORKER_COUNT: usize = 4;
    pub const DEFAULT_BACKUP_CRON: &str = "0 3 * * *";
    pub const DEFAULT_BACKUP_RETENTION_DAYS: u32 = 14;
    /// Attempts the allocator makes when a reservation races another worker
    pub const ALLOCATION_RACE_RETRIES: usize = 5;
}

#[cfg(test)]
mod tests {
    use super::steps;

    #[test]
    fn test_server_bound_steps() {
        assert!(steps::requires_server(steps::CREATE_VHOST));
        assert!(steps::requires_server(steps::ISSUE_CERTIFICATE));
        assert!(!steps::requires_server(steps::CREATE_MAILBOX));
        assert!(!steps::requires_server(steps::ALLOCATE_SERVER));
    }
}
