pub mod anchor;
pub mod config;
pub mod crypto;
pub mod error;
pub mod ledger;
pub mod metadata;
pub mod server;
pub mod storage;
