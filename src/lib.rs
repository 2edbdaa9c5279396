pub mod auth;
pub mod config;
pub mod error;
pub mod handlers;
pub mod hub;
pub mod metrics;
pub mod models;
pub mod schema;
pub mod storage;

use std::sync::Arc;

use auth::Authenticator;
use hub::Hub;
use metrics::HubMetrics;

pub type UserId = i64;
pub type GroupId = i64;

#[derive(Clone)]
pub struct AppState {
    pub hub: Hub,
    pub auth: Arc<dyn Authenticator>,
    pub metrics: HubMetrics,
}
