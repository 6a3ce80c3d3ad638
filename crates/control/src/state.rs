// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

use std::sync::Arc;

use tokio_util::sync::CancellationToken;

use crate::admission::Admission;
use crate::broker::ReadinessBroker;
use crate::config::Config;
use crate::coordinator::Coordinator;
use crate::platform::ContainerPlatform;
use crate::store::SessionStore;
use crate::token::TokenService;

/// Shared control-plane state. Every component is constructor-injected; the
/// process holds exactly one instance of each in production.
pub struct AppState {
    pub config: Config,
    pub store: Arc<dyn SessionStore>,
    pub broker: Arc<ReadinessBroker>,
    pub platform: Arc<dyn ContainerPlatform>,
    pub tokens: Arc<TokenService>,
    pub admission: Arc<Admission>,
    pub coordinator: Coordinator,
    pub shutdown: CancellationToken,
}
