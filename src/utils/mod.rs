//! # 工具函数模块
//!
//! 提供美化输出、进度条与日志初始化。
//!
//! ## 依赖关系
//! - 被 `commands/` 与 `fit/` 使用
//! - 子模块: logging, output, progress

pub mod logging;
pub mod output;
pub mod progress;
