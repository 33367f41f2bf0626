//! # fit 命令实现
//!
//! 执行完整流水线并写出结果文件：
//! 组装 → 注册参数 → 约束 → 分阶段精修 → 换算相分数 → `.res`/`.fgr`（可选 CIF 与图）
//!
//! ## 依赖关系
//! - 使用 `cli/fit.rs` 定义的参数
//! - 使用 `fit/` 流水线
//! - 使用 `utils/output.rs`

use crate::cli::fit::FitArgs;
use ezfit::error::Result;
use ezfit::fit::FitPdf;
use ezfit::utils::{output, progress};

/// 执行 fit 命令
pub fn execute(args: FitArgs) -> Result<()> {
    output::print_header("Staged PDF Refinement");

    let session = FitPdf::new(args.data.as_deref(), &args.phases, args.config.as_deref())?;
    output::print_info(&format!("Model: {}", session.equation()));

    let spinner = progress::create_spinner("Building model");
    let model = session.build_model();
    spinner.finish_and_clear();
    let model = model?;
    for name in model.instrument_parameters() {
        output::print_info(&format!("Refining instrument parameter {}", name));
    }

    let outcome = model.apply_restraints()?.run_fit()?;
    for stage in outcome.result.stages.iter().filter(|s| !s.converged) {
        output::print_warning(&format!(
            "Step {} stopped after {} evaluations without meeting ftol",
            stage.index, stage.nfev
        ));
    }
    output::print_success(&format!("Refinement finished, Rw = {:.4}", outcome.result.goodness.rw));

    for path in outcome.save_results(&args.output, &args.footer, args.cifs)? {
        output::print_written("result", &path.display().to_string());
    }

    if let Some(plot) = &args.plot {
        outcome.plot(plot, args.plot_width, args.plot_height)?;
        output::print_written("plot", &plot.display().to_string());
    }

    for (phase, weight) in outcome.weight_fractions() {
        output::print_info(&format!("{}: {:.2} wt%", phase, weight * 100.0));
    }
    Ok(())
}
