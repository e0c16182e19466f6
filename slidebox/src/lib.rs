pub mod cache;
pub mod clock;
pub mod config;
pub mod extraction;
pub mod gateway;
pub mod metadata;
pub mod model;
pub mod session;
pub mod shell;
pub mod state;
pub mod storage;
pub mod sync;
pub mod token_provider;
