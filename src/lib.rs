pub mod accounts;
pub mod api_keys;
pub mod auth;
pub mod chat;
pub mod command_block;
pub mod constants;
pub mod db;
pub mod hardening;
pub mod health;
pub mod history;
pub mod json_log_layer;
pub mod json_repair;
pub mod logging;
pub mod main_helper;
pub mod providers;
pub mod redaction;
pub mod redaction_layer;
pub mod sessions;
pub mod specs;
pub mod storage;
pub mod str_utils;
pub mod streaming;
pub mod types;

pub use types::*;

pub use main_helper::{build_router, AppState, Args};
