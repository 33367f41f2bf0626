//! # G(r) 数据解析器
//!
//! 解析实测 PDF 文本文件（如 PDFgetX3 输出的 .gr）。
//!
//! ## 格式说明
//! - 头部注释与元数据行（非数值行）会被跳过
//! - 2 列: r G(r)，不确定度取 1.0
//! - 3 列: r G(r) dG
//! - 4 列: r G(r) dr dG
//!
//! ## 依赖关系
//! - 被 `fit/mod.rs` 使用
//! - 使用 `models/profile.rs`

use crate::error::{EzfitError, Result};
use crate::models::Profile;
use std::fs;
use std::path::Path;

/// 解析 G(r) 文件
pub fn parse_gr_file(path: &Path) -> Result<Profile> {
    let content = fs::read_to_string(path).map_err(|e| EzfitError::FileReadError {
        path: path.display().to_string(),
        source: e,
    })?;

    parse_gr_content(&content, &path.display().to_string())
}

/// 从字符串内容解析 G(r)
pub fn parse_gr_content(content: &str, source_name: &str) -> Result<Profile> {
    let mut r = Vec::new();
    let mut g = Vec::new();
    let mut dg = Vec::new();

    for line in content.lines() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        let values: Option<Vec<f64>> = line
            .split(|c: char| c.is_whitespace() || c == ',' || c == ';')
            .filter(|s| !s.is_empty())
            .map(|s| s.parse::<f64>().ok())
            .collect();
        let values = match values {
            Some(v) if v.len() >= 2 => v,
            _ => continue,
        };

        r.push(values[0]);
        g.push(values[1]);
        let sigma = match values.len() {
            2 => 1.0,
            3 => values[2],
            _ => values[3],
        };
        // 零不确定度会使加权残差发散
        dg.push(if sigma > 0.0 { sigma } else { 1.0 });
    }

    if r.len() < 2 {
        return Err(EzfitError::ParseError {
            format: "gr".to_string(),
            path: source_name.to_string(),
            reason: "No numeric data rows found".to_string(),
        });
    }

    Profile::new(r, g, dg)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_gr_with_header() {
        let content = r#"[DEFAULT]
version = pdfgetx3-2.1.1
#### start data
#S 1
#L r($\AA$)  G($\AA^{-2}$)
1.00 0.50 0.01
1.01 0.55 0.01
1.02 0.60 0.02
"#;
        let profile = parse_gr_content(content, "test.gr").unwrap();
        assert_eq!(profile.r_obs.len(), 3);
        assert!((profile.g_obs[2] - 0.60).abs() < 1e-12);
        assert!((profile.dg_obs[2] - 0.02).abs() < 1e-12);
    }

    #[test]
    fn test_parse_gr_two_columns() {
        let content = "0.0 0.0\n0.1 0.2\n0.2 0.3\n";
        let profile = parse_gr_content(content, "two.gr").unwrap();
        assert_eq!(profile.dg_obs, vec![1.0, 1.0, 1.0]);
    }

    #[test]
    fn test_parse_gr_four_columns() {
        let content = "1.0 2.0 0.001 0.3\n1.1 2.1 0.001 0.4\n";
        let profile = parse_gr_content(content, "four.gr").unwrap();
        assert_eq!(profile.dg_obs, vec![0.3, 0.4]);
    }

    #[test]
    fn test_parse_gr_empty() {
        assert!(parse_gr_content("# nothing\n", "empty.gr").is_err());
    }
}
