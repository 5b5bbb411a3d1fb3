//! Application state shared across handlers.

use std::sync::Arc;

use crate::auth::AuthState;
use crate::messages::MessageStore;
use crate::users::UserRepository;
use crate::ws::{HubConfig, HubHandle};

/// Application state shared across handlers.
#[derive(Clone)]
pub struct AppState {
    pub hub: HubHandle,
    /// Per-connection limits applied by the upgrade gate.
    pub hub_config: Arc<HubConfig>,
    pub users: UserRepository,
    pub messages: Arc<dyn MessageStore>,
    pub auth: AuthState,
    /// Origins allowed to make cross-origin requests. Empty means same-origin only.
    pub allowed_origins: Arc<Vec<String>>,
}
