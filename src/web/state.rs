//! # Web Application State
//!
//! Shared state handed to every admin API handler.

use std::sync::Arc;

use crate::orchestration::ProvisionerCore;

#[derive(Clone)]
pub struct AppState {
    pub core: Arc<ProvisionerCore>,
}

impl AppState {
    pub fn new(core: Arc<ProvisionerCore>) -> Self {
        Self { core }
    }
}
