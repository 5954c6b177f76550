pub mod app;
pub mod archive;
pub mod config;
pub mod domain;
pub mod download;
pub mod envelope;
pub mod error;
pub mod output;
pub mod poll;
pub mod rda;
pub mod retry;
pub mod store;
