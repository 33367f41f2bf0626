//! # CIF 格式解析器
//!
//! 解析晶体学信息文件 (CIF)，提取晶胞、对称操作与原子位点表。
//!
//! ## CIF 格式说明
//! ```text
//! data_NiO
//! _cell_length_a    4.1771(2)
//! _cell_angle_alpha 90
//! _cell_volume      72.88
//! _chemical_formula_sum 'Ni4 O4'
//! loop_
//! _symmetry_equiv_pos_as_xyz
//!   'x, y, z'
//!   'x, y+1/2, z+1/2'
//! loop_
//! _atom_site_label
//! _atom_site_type_symbol
//! _atom_site_fract_x
//! ...
//! ```
//!
//! 数值中的括号不确定度（如 `4.1771(2)`）会被去除。
//!
//! ## 依赖关系
//! - 被 `parsers/mod.rs` 使用
//! - 使用 `models/structure.rs`、`models/symmetry.rs`

use crate::error::{EzfitError, Result};
use crate::models::{Crystal, Lattice, Site, SymOp};
use regex::Regex;
use std::f64::consts::PI;
use std::fs;
use std::path::Path;
use std::sync::OnceLock;

const CELL_TAGS: [&str; 6] = [
    "_cell_length_a",
    "_cell_length_b",
    "_cell_length_c",
    "_cell_angle_alpha",
    "_cell_angle_beta",
    "_cell_angle_gamma",
];

const SYMOP_TAGS: [&str; 2] = [
    "_symmetry_equiv_pos_as_xyz",
    "_space_group_symop_operation_xyz",
];

const SPACE_GROUP_TAGS: [&str; 2] = [
    "_symmetry_space_group_name_h-m",
    "_space_group_name_h-m_alt",
];

/// 解析 CIF 文件
pub fn parse_cif_file(path: &Path) -> Result<Crystal> {
    let content = fs::read_to_string(path).map_err(|e| EzfitError::FileReadError {
        path: path.display().to_string(),
        source: e,
    })?;

    parse_cif_content(
        &content,
        path.file_stem()
            .and_then(|s| s.to_str())
            .unwrap_or("unknown"),
    )
}

/// 从字符串内容解析 CIF 格式
pub fn parse_cif_content(content: &str, default_name: &str) -> Result<Crystal> {
    let parse_err = |reason: String| EzfitError::ParseError {
        format: "cif".to_string(),
        path: default_name.to_string(),
        reason,
    };

    let mut name = default_name.to_string();
    let mut cell: [Option<f64>; 6] = [None; 6];
    let mut cell_volume = None;
    let mut formula = None;
    let mut space_group = None;
    let mut symops = Vec::new();
    let mut sites = Vec::new();

    let lines: Vec<&str> = content.lines().collect();
    let mut i = 0;
    while i < lines.len() {
        let line = lines[i].trim();
        if line.is_empty() || line.starts_with('#') {
            i += 1;
            continue;
        }

        if let Some(block) = line.strip_prefix("data_") {
            if !block.is_empty() {
                name = block.to_string();
            }
            i += 1;
            continue;
        }

        if line.eq_ignore_ascii_case("loop_") {
            let (headers, rows, next) = read_loop(&lines, i + 1);
            i = next;
            if headers.iter().any(|h| SYMOP_TAGS.contains(&h.as_str())) {
                symops = parse_symop_loop(&headers, &rows).map_err(|e| parse_err(e.to_string()))?;
            } else if headers.iter().any(|h| h == "_atom_site_fract_x") {
                sites = parse_atom_site_loop(&headers, &rows).map_err(parse_err)?;
            }
            continue;
        }

        if line.starts_with('_') {
            let tokens = tokenize(line);
            let tag = tokens[0].to_lowercase();
            let value = match tokens.get(1) {
                Some(v) => v.clone(),
                // 值位于下一行
                None => {
                    i += 1;
                    lines
                        .get(i)
                        .map(|l| l.trim().trim_matches(&['\'', '"'][..]).to_string())
                        .unwrap_or_default()
                }
            };

            if let Some(k) = CELL_TAGS.iter().position(|t| *t == tag) {
                cell[k] = Some(parse_number(&value).ok_or_else(|| {
                    parse_err(format!("Invalid value for {}: '{}'", tag, value))
                })?);
            } else if tag == "_cell_volume" {
                cell_volume = parse_number(&value);
            } else if tag == "_chemical_formula_sum" {
                formula = Some(value);
            } else if SPACE_GROUP_TAGS.contains(&tag.as_str()) {
                space_group = Some(value);
            }
        }
        i += 1;
    }

    let mut params = [0.0; 6];
    for (k, v) in cell.iter().enumerate() {
        params[k] = v.ok_or_else(|| parse_err(format!("Missing {}", CELL_TAGS[k])))?;
    }

    let mut crystal = Crystal::new(name, Lattice::from_array(params), sites).with_symops(symops);
    crystal.cell_volume = cell_volume;
    crystal.formula = formula;
    crystal.space_group = space_group;
    Ok(crystal)
}

/// 读取一个 loop_ 块，返回 (列名, 数据行, 下一行号)
fn read_loop(lines: &[&str], start: usize) -> (Vec<String>, Vec<Vec<String>>, usize) {
    let mut headers = Vec::new();
    let mut i = start;
    while i < lines.len() {
        let line = lines[i].trim();
        if line.starts_with('_') {
            headers.push(line.split_whitespace().next().unwrap_or("").to_lowercase());
            i += 1;
        } else {
            break;
        }
    }

    let mut values: Vec<String> = Vec::new();
    while i < lines.len() {
        let line = lines[i].trim();
        if line.is_empty() || line.starts_with('#') {
            i += 1;
            if !values.is_empty() && line.is_empty() {
                break;
            }
            continue;
        }
        if line.starts_with('_') || line.eq_ignore_ascii_case("loop_") || line.starts_with("data_") {
            break;
        }
        values.extend(tokenize(line));
        i += 1;
    }

    let width = headers.len().max(1);
    let rows = values.chunks(width).map(|c| c.to_vec()).collect();
    (headers, rows, i)
}

fn parse_symop_loop(headers: &[String], rows: &[Vec<String>]) -> Result<Vec<SymOp>> {
    let col = headers
        .iter()
        .position(|h| SYMOP_TAGS.contains(&h.as_str()))
        .unwrap_or(0);
    rows.iter()
        .filter_map(|row| row.get(col))
        .map(|expr| SymOp::parse(expr))
        .collect()
}

fn parse_atom_site_loop(
    headers: &[String],
    rows: &[Vec<String>],
) -> std::result::Result<Vec<Site>, String> {
    let col = |tag: &str| headers.iter().position(|h| h == tag);
    let label_col = col("_atom_site_label").ok_or("atom_site loop without _atom_site_label")?;
    let xyz_cols = [
        col("_atom_site_fract_x"),
        col("_atom_site_fract_y"),
        col("_atom_site_fract_z"),
    ];
    let type_col = col("_atom_site_type_symbol");
    let occ_col = col("_atom_site_occupancy");
    let uiso_col = col("_atom_site_u_iso_or_equiv");
    let biso_col = col("_atom_site_b_iso_or_equiv");

    let mut sites = Vec::new();
    for row in rows {
        if row.len() < headers.len() {
            continue;
        }
        let label = row[label_col].clone();
        let mut position = [0.0; 3];
        for (k, c) in xyz_cols.iter().enumerate() {
            let c = c.ok_or("atom_site loop missing a fractional coordinate column")?;
            position[k] = parse_number(&row[c])
                .ok_or_else(|| format!("Invalid coordinate '{}' for site {}", row[c], label))?;
        }

        let element = type_col
            .map(|c| element_from_symbol(&row[c]))
            .filter(|e| !e.is_empty())
            .unwrap_or_else(|| element_from_symbol(&label));

        let occupancy = occ_col.and_then(|c| parse_number(&row[c])).unwrap_or(1.0);
        let uiso = uiso_col.and_then(|c| parse_number(&row[c]));
        let biso = match (uiso, biso_col.and_then(|c| parse_number(&row[c]))) {
            (Some(u), _) => u * 8.0 * PI * PI,
            (None, Some(b)) => b,
            (None, None) => 1.0,
        };

        sites.push(
            Site::new(label, element, position)
                .with_occupancy(occupancy)
                .with_biso(biso),
        );
    }
    Ok(sites)
}

/// 从类型符号或标签中提取元素符号（去除价态与编号）
pub fn element_from_symbol(symbol: &str) -> String {
    let mut chars = symbol.chars().skip_while(|c| !c.is_ascii_alphabetic());
    let mut element = String::new();
    if let Some(first) = chars.next() {
        element.push(first.to_ascii_uppercase());
        if let Some(second) = chars.next() {
            if second.is_ascii_lowercase() {
                element.push(second);
            }
        }
    }
    element
}

/// 解析 CIF 数值，去除括号中的不确定度
pub fn parse_number(text: &str) -> Option<f64> {
    static UNCERTAINTY: OnceLock<Option<Regex>> = OnceLock::new();
    let cleaned = match UNCERTAINTY.get_or_init(|| Regex::new(r"\(\d+\)").ok()) {
        Some(re) => re.replace_all(text.trim(), "").into_owned(),
        None => text.trim().to_string(),
    };
    if cleaned == "." || cleaned == "?" {
        return None;
    }
    cleaned.parse().ok()
}

/// 按空白分词，保留引号内的空格
fn tokenize(line: &str) -> Vec<String> {
    let mut tokens = Vec::new();
    let mut current = String::new();
    let mut quote: Option<char> = None;

    for c in line.chars() {
        match quote {
            Some(q) if c == q => {
                tokens.push(std::mem::take(&mut current));
                quote = None;
            }
            Some(_) => current.push(c),
            None if (c == '\'' || c == '"') && current.is_empty() => quote = Some(c),
            None if c.is_whitespace() => {
                if !current.is_empty() {
                    tokens.push(std::mem::take(&mut current));
                }
            }
            None => current.push(c),
        }
    }
    if !current.is_empty() {
        tokens.push(current);
    }
    tokens
}

/// 将 Crystal 转换为 CIF 格式字符串
pub fn to_cif_string(crystal: &Crystal) -> String {
    let p = crystal.lattice.parameters();
    let mut result = String::new();

    result.push_str(&format!("data_{}\n\n", crystal.name));
    if let Some(sg) = &crystal.space_group {
        result.push_str(&format!("_symmetry_space_group_name_H-M '{}'\n", sg));
    }
    for (tag, value) in CELL_TAGS.iter().zip(p.iter()) {
        result.push_str(&format!("{:<22} {:.6}\n", tag, value));
    }
    result.push_str(&format!("{:<22} {:.6}\n", "_cell_volume", crystal.lattice.volume()));
    result.push_str(&format!("_chemical_formula_sum '{}'\n\n", crystal.formula()));

    result.push_str("loop_\n_symmetry_equiv_pos_as_xyz\n");
    for op in crystal.effective_symops() {
        result.push_str(&format!("  '{}'\n", op.to_xyz_string()));
    }
    result.push('\n');

    result.push_str("loop_\n");
    result.push_str("_atom_site_label\n_atom_site_type_symbol\n");
    result.push_str("_atom_site_fract_x\n_atom_site_fract_y\n_atom_site_fract_z\n");
    result.push_str("_atom_site_occupancy\n_atom_site_B_iso_or_equiv\n");
    for site in &crystal.sites {
        result.push_str(&format!(
            "{:<6} {:<3} {:12.8} {:12.8} {:12.8} {:8.5} {:10.6}\n",
            site.label,
            site.element,
            site.position[0],
            site.position[1],
            site.position[2],
            site.occupancy,
            site.biso
        ));
    }

    result
}

#[cfg(test)]
mod tests {
    use super::*;

    const NIO_CIF: &str = r#"
data_NiO
_symmetry_space_group_name_H-M 'F m -3 m'
_cell_length_a    4.1771(2)
_cell_length_b    4.1771(2)
_cell_length_c    4.1771(2)
_cell_angle_alpha 90
_cell_angle_beta  90
_cell_angle_gamma 90
_cell_volume      72.884
_chemical_formula_sum 'Ni4 O4'

loop_
_symmetry_equiv_pos_as_xyz
  'x, y, z'
  'x, y+1/2, z+1/2'
  'x+1/2, y, z+1/2'
  'x+1/2, y+1/2, z'

loop_
_atom_site_label
_atom_site_type_symbol
_atom_site_fract_x
_atom_site_fract_y
_atom_site_fract_z
_atom_site_occupancy
_atom_site_U_iso_or_equiv
Ni1 Ni2+ 0.0 0.0 0.0 1.0 0.0063
O1  O2-  0.5 0.5 0.5 1.0 0.0076
"#;

    #[test]
    fn test_parse_nio() {
        let crystal = parse_cif_content(NIO_CIF, "fallback").unwrap();
        assert_eq!(crystal.name, "NiO");
        assert_eq!(crystal.sites.len(), 2);
        assert_eq!(crystal.symops.len(), 4);
        assert_eq!(crystal.sites[0].element, "Ni");
        assert_eq!(crystal.sites[1].element, "O");
        assert_eq!(crystal.formula.as_deref(), Some("Ni4 O4"));
        assert_eq!(crystal.space_group.as_deref(), Some("F m -3 m"));
        assert!((crystal.cell_volume.unwrap() - 72.884).abs() < 1e-9);

        let p = crystal.lattice.parameters();
        assert!((p[0] - 4.1771).abs() < 1e-9);
        assert!((crystal.sites[0].biso - 0.0063 * 8.0 * PI * PI).abs() < 1e-9);
    }

    #[test]
    fn test_parse_number_strips_uncertainty() {
        assert_eq!(parse_number("4.1771(2)"), Some(4.1771));
        assert_eq!(parse_number("0.5"), Some(0.5));
        assert_eq!(parse_number("?"), None);
        assert_eq!(parse_number("."), None);
    }

    #[test]
    fn test_element_from_symbol() {
        assert_eq!(element_from_symbol("Ni2+"), "Ni");
        assert_eq!(element_from_symbol("O1"), "O");
        assert_eq!(element_from_symbol("Al"), "Al");
        assert_eq!(element_from_symbol("OW3"), "O");
    }

    #[test]
    fn test_missing_cell_is_error() {
        let content = "data_x\n_cell_length_a 4.0\n";
        assert!(parse_cif_content(content, "x").is_err());
    }

    #[test]
    fn test_cif_write_then_read() {
        let crystal = parse_cif_content(NIO_CIF, "NiO").unwrap();
        let text = to_cif_string(&crystal);
        let again = parse_cif_content(&text, "NiO").unwrap();

        assert_eq!(again.sites.len(), 2);
        assert_eq!(again.symops.len(), 4);
        assert!((again.sites[1].position[0] - 0.5).abs() < 1e-8);
        assert!((again.sites[0].biso - crystal.sites[0].biso).abs() < 1e-5);
    }

    #[test]
    fn test_tokenize_quotes() {
        assert_eq!(tokenize("_tag 'a b c'"), vec!["_tag", "a b c"]);
        assert_eq!(tokenize("  'x, y, z'  "), vec!["x, y, z"]);
    }
}
