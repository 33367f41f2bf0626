//! # CLI 模块
//!
//! 使用 `clap` 定义命令行参数和子命令。
//!
//! ## 命令结构
//! - `fit`: 分阶段精修并写出结果
//! - `scales`: 由 `.res` 文件重新换算相分数
//!
//! ## 依赖关系
//! - 被 `main.rs` 使用
//! - 子模块: fit, scales

pub mod fit;
pub mod scales;

use clap::{ArgAction, Parser, Subcommand};

/// ezfit - 多相 PDF 分阶段精修
#[derive(Parser)]
#[command(name = "ezfit")]
#[command(author = "Changjiang Wu")]
#[command(version)]
#[command(about = "Staged multi-phase refinement of crystal structures against PDF data", long_about = None)]
#[command(propagate_version = true)]
pub struct Cli {
    /// Increase log verbosity (-v info, -vv debug); RUST_LOG takes precedence
    #[arg(short, long, action = ArgAction::Count, global = true)]
    pub verbose: u8,

    #[command(subcommand)]
    pub command: Commands,
}

/// 可用的子命令
#[derive(Subcommand)]
pub enum Commands {
    /// Refine phases against a measured G(r) and report phase fractions
    Fit(fit::FitArgs),

    /// Recompute molar and weight fractions from a .res summary
    Scales(scales::ScalesArgs),
}
