//! # ezfit - 多相 PDF 分阶段精修
//!
//! 以晶体结构（CIF）与纳米颗粒形状函数构建多相模型，
//! 对实测 G(r) 分阶段精修，并将比例因子换算为摩尔分数与质量分数。
//!
//! ## 子命令
//! - `fit` - 分阶段精修并写出结果
//! - `scales` - 由 `.res` 文件重新换算相分数
//!
//! ## 依赖关系
//! ```text
//! main.rs
//!   ├── cli/        (命令行参数定义)
//!   ├── commands/   (命令执行逻辑)
//!   │     └── ezfit::fit (精修流水线)
//!   └── ezfit::utils (输出与日志)
//! ```

mod cli;
mod commands;

use clap::Parser;
use cli::Cli;
use ezfit::utils;

fn main() {
    // Initialize colored output for Windows compatibility
    #[cfg(windows)]
    colored::control::set_virtual_terminal(true).ok();

    let cli = Cli::parse();
    utils::logging::init_logging(cli.verbose);

    if let Err(e) = commands::run(cli.command) {
        utils::output::print_error(&format!("{}", e));
        std::process::exit(1);
    }
}
