//! Shared state handed to every handler.

use crate::{
    config::AppConfig,
    context::PipelineContext,
    services::{optimizer_client::OptimizerClient, storage_service::ObjectStore},
};
use std::sync::Arc;

#[derive(Clone)]
pub struct AppState {
    pub store: ObjectStore,
    pub optimizer: OptimizerClient,
    pub ctx: PipelineContext,
    pub config: Arc<AppConfig>,
}
