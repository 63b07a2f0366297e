pub mod export_service;
pub mod transfer_service;
