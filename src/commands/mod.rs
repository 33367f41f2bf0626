//! # 命令执行模块
//!
//! 实现各子命令的业务逻辑。
//!
//! ## 依赖关系
//! - 被 `main.rs` 调用
//! - 使用 `cli/`, `fit/`, `utils/`
//! - 子模块: fit, scales

pub mod fit;
pub mod scales;

use crate::cli::Commands;
use ezfit::error::Result;

/// 执行命令
pub fn run(cmd: Commands) -> Result<()> {
    match cmd {
        Commands::Fit(args) => fit::execute(args),
        Commands::Scales(args) => scales::execute(args),
    }
}
