//! 共享库
//!
//! 包含内容过滤引擎共用的配置加载与日志初始化代码。

pub mod config;
pub mod observability;
