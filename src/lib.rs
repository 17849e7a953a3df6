//! formulary — 声明式包安装与 launchd 定时任务注册

pub mod config;
pub mod descriptor;
pub mod error;
pub mod fetcher;
pub mod installer;
pub mod pipeline;
pub mod registry;
pub mod service;
pub mod verifier;

pub use error::{Error, Result};
