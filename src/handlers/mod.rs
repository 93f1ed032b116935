pub mod gateway_handlers;
pub mod health_handlers;
pub mod ingest_handlers;
