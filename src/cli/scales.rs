//! # scales 子命令 CLI 定义
//!
//! 读取已有 `.res` 文件中的比例因子，重新换算相分数。
//!
//! ## 依赖关系
//! - 被 `cli/mod.rs` 使用
//! - 参数传递给 `commands/scales.rs`

use crate::cli::fit::parse_phase_spec;
use ezfit::fit::PhaseSpec;
use clap::Args;
use std::path::PathBuf;

/// scales 子命令参数
#[derive(Args, Debug)]
pub struct ScalesArgs {
    /// Results summary (.res) holding the fitted <phase>_scale values
    pub res: PathBuf,

    /// Phases in fit order as ID:shape[:formula]
    #[arg(short, long = "phase", value_parser = parse_phase_spec, required = true)]
    pub phases: Vec<PhaseSpec>,

    /// Configuration file (defaults to FitPDF_config.toml in the current directory)
    #[arg(short, long)]
    pub config: Option<PathBuf>,

    /// X-ray energy in keV, overriding [measurement].kev
    #[arg(long)]
    pub kev: Option<f64>,
}
