//! # scales 命令实现
//!
//! 读取 `.res` 中的 `<相>_scale`，按配置的 CIF 目录与 f1 表重新换算摩尔分数与质量分数。
//!
//! ## 依赖关系
//! - 使用 `cli/scales.rs` 定义的参数
//! - 使用 `fit/scale.rs`、`fit/results.rs`

use crate::cli::scales::ScalesArgs;
use ezfit::config::FitConfig;
use ezfit::error::{EzfitError, Result};
use ezfit::fit::results::{print_phase_fractions, read_res_scales};
use ezfit::fit::{assemble, resolve_scales};
use ezfit::utils::output;

/// 执行 scales 命令
pub fn execute(args: ScalesArgs) -> Result<()> {
    output::print_header("Phase Fractions from Fitted Scales");

    let config = FitConfig::load(args.config.as_deref())?;
    let kev = args
        .kev
        .or(config.measurement.kev)
        .ok_or_else(|| EzfitError::config("measurement.kev", "X-ray energy is required"))?;

    let model = assemble(&args.phases)?;
    let fitted = read_res_scales(&args.res)?;
    output::print_info(&format!(
        "Read {} scale factors from {}",
        fitted.len(),
        args.res.display()
    ));

    let scales = resolve_scales(&config, &model.phases, &fitted, kev)?;
    print_phase_fractions(&scales);
    Ok(())
}
