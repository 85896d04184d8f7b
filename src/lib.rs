pub mod batch;
pub mod config;
pub mod converter;
pub mod domain;
pub mod error;
pub mod events;
pub mod fs_util;
pub mod library;
pub mod manifest;
pub mod output;
pub mod publish;
pub mod sanitize;
pub mod scheduler;
pub mod transfer;
pub mod unpack;
