//! # 美化输出工具
//!
//! 提供统一的终端输出样式。
//!
//! ## 依赖关系
//! - 被 `commands/` 与 `fit/optimizer.rs` 使用
//! - 使用 `colored` crate

use colored::Colorize;

/// 打印成功消息
pub fn print_success(msg: &str) {
    println!("{} {}", "[OK]".green().bold(), msg);
}

/// 打印错误消息
pub fn print_error(msg: &str) {
    eprintln!("{} {}", "[ERR]".red().bold(), msg);
}

/// 打印警告消息
pub fn print_warning(msg: &str) {
    println!("{} {}", "[WARN]".yellow().bold(), msg);
}

/// 打印信息消息
pub fn print_info(msg: &str) {
    println!("{} {}", "[*]".blue().bold(), msg);
}

/// 打印精修阶段及其自由参数
pub fn print_stage(index: usize, total: usize, params: &[String]) {
    println!(
        "{} {} {}",
        format!("Step {} / {}:", index, total).cyan().bold(),
        "params".dimmed(),
        params.join(", ")
    );
}

/// 打印写出的文件
pub fn print_written(kind: &str, path: &str) {
    println!("{} {} {} {}", "[OK]".green().bold(), kind.dimmed(), "->".cyan(), path);
}

/// 打印标题栏
pub fn print_header(title: &str) {
    let line = "─".repeat(60);
    println!("\n{}", line.dimmed());
    println!("  {}", title.bold());
    println!("{}\n", line.dimmed());
}
