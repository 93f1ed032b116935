pub mod optimizer;
pub mod optimizer_client;
pub mod storage_service;
