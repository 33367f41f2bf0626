//! # fit 子命令 CLI 定义
//!
//! 相以 `ID:shape[:formula]` 形式给出，可重复；同名相按出现顺序编号。
//!
//! ## 依赖关系
//! - 被 `cli/mod.rs` 使用
//! - 参数传递给 `commands/fit.rs`

use ezfit::fit::PhaseSpec;
use clap::Args;
use std::path::PathBuf;

/// 解析 `ID:shape[:formula]`；省略化学式时留空，由 CIF 提供
pub fn parse_phase_spec(input: &str) -> Result<PhaseSpec, String> {
    let parts: Vec<&str> = input.split(':').map(str::trim).collect();
    match parts.as_slice() {
        [id, shape] if !id.is_empty() && !shape.is_empty() => Ok(PhaseSpec::new(*id, *shape, "")),
        [id, shape, formula] if !id.is_empty() && !shape.is_empty() => {
            Ok(PhaseSpec::new(*id, *shape, *formula))
        }
        _ => Err(format!(
            "Invalid phase '{}'. Use ID:shape or ID:shape:formula (e.g., NiO:sphericalCF:NiO)",
            input
        )),
    }
}

/// fit 子命令参数
#[derive(Args, Debug)]
pub struct FitArgs {
    /// Phase to refine as ID:shape[:formula], repeatable (e.g., -p NiO:bulkCF)
    #[arg(short, long = "phase", value_parser = parse_phase_spec, required = true)]
    pub phases: Vec<PhaseSpec>,

    /// Configuration file (defaults to FitPDF_config.toml in the current directory)
    #[arg(short, long)]
    pub config: Option<PathBuf>,

    /// Measured G(r) file, overriding [files].data
    #[arg(short, long)]
    pub data: Option<PathBuf>,

    /// Output file stem for .res/.fgr results
    #[arg(short, long, default_value = "fit")]
    pub output: PathBuf,

    /// Free text appended to the .res summary
    #[arg(long, default_value = "")]
    pub footer: String,

    /// Also write one refined CIF per phase
    #[arg(long, default_value_t = false)]
    pub cifs: bool,

    /// Plot file (.png or .svg)
    #[arg(long)]
    pub plot: Option<PathBuf>,

    /// Plot width in pixels
    #[arg(long, default_value_t = 1200)]
    pub plot_width: u32,

    /// Plot height in pixels
    #[arg(long, default_value_t = 800)]
    pub plot_height: u32,
}
