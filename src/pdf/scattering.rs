//! # 元素数据与 X 射线散射长度
//!
//! 提供元素的原子序数与摩尔质量、按能量插值的 f1（原子散射因子实部）表，
//! 以及经典散射长度换算。
//!
//! ## 公式
//! b = r_e · f1(E)，其中 r_e = e² / (4πε₀ mₑ c²) 为经典电子半径
//!
//! ## f1 表格式
//! 每个元素一个 CSV 文件 `f1_<El>.csv`，首行为表头，三列: index, keV, f1
//!
//! ## 依赖关系
//! - 被 `pdf/generator.rs` 使用（原子序数作为 X 射线权重）
//! - 被 `fit/scale.rs` 使用（散射长度、摩尔质量）

use crate::error::{EzfitError, Result};
use crate::models::profile::interp;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::LazyLock;

/// 经典电子半径 (m)
pub const CLASSICAL_ELECTRON_RADIUS: f64 = 2.8179403262e-15;

/// 元素基本数据
#[derive(Debug, Clone, Copy)]
pub struct Element {
    pub symbol: &'static str,
    pub z: u32,
    /// 标准原子量 (g/mol)
    pub mass: f64,
}

#[rustfmt::skip]
const ELEMENT_DATA: &[(&str, f64)] = &[
    ("H", 1.008), ("He", 4.0026), ("Li", 6.94), ("Be", 9.0122), ("B", 10.81),
    ("C", 12.011), ("N", 14.007), ("O", 15.999), ("F", 18.998), ("Ne", 20.180),
    ("Na", 22.990), ("Mg", 24.305), ("Al", 26.982), ("Si", 28.085), ("P", 30.974),
    ("S", 32.06), ("Cl", 35.45), ("Ar", 39.948), ("K", 39.098), ("Ca", 40.078),
    ("Sc", 44.956), ("Ti", 47.867), ("V", 50.942), ("Cr", 51.996), ("Mn", 54.938),
    ("Fe", 55.845), ("Co", 58.933), ("Ni", 58.693), ("Cu", 63.546), ("Zn", 65.38),
    ("Ga", 69.723), ("Ge", 72.630), ("As", 74.922), ("Se", 78.971), ("Br", 79.904),
    ("Kr", 83.798), ("Rb", 85.468), ("Sr", 87.62), ("Y", 88.906), ("Zr", 91.224),
    ("Nb", 92.906), ("Mo", 95.95), ("Tc", 98.0), ("Ru", 101.07), ("Rh", 102.91),
    ("Pd", 106.42), ("Ag", 107.87), ("Cd", 112.41), ("In", 114.82), ("Sn", 118.71),
    ("Sb", 121.76), ("Te", 127.60), ("I", 126.90), ("Xe", 131.29), ("Cs", 132.91),
    ("Ba", 137.33), ("La", 138.91), ("Ce", 140.12), ("Pr", 140.91), ("Nd", 144.24),
    ("Pm", 145.0), ("Sm", 150.36), ("Eu", 151.96), ("Gd", 157.25), ("Tb", 158.93),
    ("Dy", 162.50), ("Ho", 164.93), ("Er", 167.26), ("Tm", 168.93), ("Yb", 173.05),
    ("Lu", 174.97), ("Hf", 178.49), ("Ta", 180.95), ("W", 183.84), ("Re", 186.21),
    ("Os", 190.23), ("Ir", 192.22), ("Pt", 195.08), ("Au", 196.97), ("Hg", 200.59),
    ("Tl", 204.38), ("Pb", 207.2), ("Bi", 208.98), ("Po", 209.0), ("At", 210.0),
    ("Rn", 222.0), ("Fr", 223.0), ("Ra", 226.0), ("Ac", 227.0), ("Th", 232.04),
    ("Pa", 231.04), ("U", 238.03), ("Np", 237.0), ("Pu", 244.0),
];

/// 元素表（按符号索引，原子序数即表中序号）
pub static ELEMENTS: LazyLock<HashMap<&'static str, Element>> = LazyLock::new(|| {
    ELEMENT_DATA
        .iter()
        .enumerate()
        .map(|(i, &(symbol, mass))| {
            (
                symbol,
                Element {
                    symbol,
                    z: i as u32 + 1,
                    mass,
                },
            )
        })
        .collect()
});

/// 查询元素数据
pub fn element(symbol: &str) -> Option<&'static Element> {
    ELEMENTS.get(symbol)
}

/// 原子序数，未知元素返回 None
pub fn atomic_number(symbol: &str) -> Option<u32> {
    element(symbol).map(|e| e.z)
}

/// 由 f1 计算经典散射长度 (m)
pub fn scattering_length(f1: f64) -> f64 {
    CLASSICAL_ELECTRON_RADIUS * f1
}

/// 计算化学式的摩尔质量 (g/mol)，支持括号与小数计量数，如 "Ca(OH)2"、"Ni0.5 O"
pub fn formula_mass(formula: &str) -> Result<f64> {
    let chars: Vec<char> = formula.chars().filter(|c| !c.is_whitespace()).collect();
    let mut pos = 0;
    let mass = parse_group(&chars, &mut pos, formula)?;
    if pos != chars.len() {
        return Err(bad_formula(formula, "unbalanced parentheses"));
    }
    if mass <= 0.0 {
        return Err(bad_formula(formula, "empty formula"));
    }
    Ok(mass)
}

fn bad_formula(formula: &str, reason: &str) -> EzfitError {
    EzfitError::ParseError {
        format: "formula".to_string(),
        path: formula.to_string(),
        reason: reason.to_string(),
    }
}

fn parse_group(chars: &[char], pos: &mut usize, formula: &str) -> Result<f64> {
    let mut total = 0.0;
    while *pos < chars.len() {
        let c = chars[*pos];
        let unit = if c == '(' || c == '[' {
            *pos += 1;
            let inner = parse_group(chars, pos, formula)?;
            match chars.get(*pos) {
                Some(')') | Some(']') => *pos += 1,
                _ => return Err(bad_formula(formula, "unbalanced parentheses")),
            }
            inner
        } else if c == ')' || c == ']' {
            return Ok(total);
        } else if c.is_ascii_uppercase() {
            let mut symbol = c.to_string();
            *pos += 1;
            while let Some(&l) = chars.get(*pos) {
                if l.is_ascii_lowercase() {
                    symbol.push(l);
                    *pos += 1;
                } else {
                    break;
                }
            }
            element(&symbol)
                .map(|e| e.mass)
                .ok_or_else(|| bad_formula(formula, &format!("unknown element '{}'", symbol)))?
        } else {
            return Err(bad_formula(formula, &format!("unexpected character '{}'", c)));
        };

        let start = *pos;
        while let Some(&d) = chars.get(*pos) {
            if d.is_ascii_digit() || d == '.' {
                *pos += 1;
            } else {
                break;
            }
        }
        let count: f64 = if start == *pos {
            1.0
        } else {
            let digits: String = chars[start..*pos].iter().collect();
            digits
                .parse()
                .map_err(|_| bad_formula(formula, &format!("invalid count '{}'", digits)))?
        };
        total += unit * count;
    }
    Ok(total)
}

/// 单个元素的 f1 能量表
#[derive(Debug, Clone)]
pub struct F1Table {
    pub element: String,
    pub kev: Vec<f64>,
    pub f1: Vec<f64>,
}

impl F1Table {
    /// 从 CSV 文件读取 (index, keV, f1)
    pub fn load(path: &Path, element: &str) -> Result<Self> {
        let mut reader = csv::ReaderBuilder::new()
            .has_headers(true)
            .trim(csv::Trim::All)
            .from_path(path)?;

        let mut rows: Vec<(f64, f64)> = Vec::new();
        for record in reader.records() {
            let record = record?;
            let field = |k: usize| record.get(k).and_then(|s| s.parse::<f64>().ok());
            match (field(1), field(2)) {
                (Some(e), Some(f)) => rows.push((e, f)),
                _ => {
                    return Err(EzfitError::ParseError {
                        format: "f1".to_string(),
                        path: path.display().to_string(),
                        reason: format!("expected numeric keV and f1 columns, got {:?}", record),
                    })
                }
            }
        }
        if rows.is_empty() {
            return Err(EzfitError::ParseError {
                format: "f1".to_string(),
                path: path.display().to_string(),
                reason: "table has no rows".to_string(),
            });
        }
        rows.sort_by(|a, b| a.0.total_cmp(&b.0));

        Ok(F1Table {
            element: element.to_string(),
            kev: rows.iter().map(|r| r.0).collect(),
            f1: rows.iter().map(|r| r.1).collect(),
        })
    }

    /// 在给定能量处线性插值 f1
    pub fn at(&self, kev: f64) -> f64 {
        interp(kev, &self.kev, &self.f1)
    }
}

/// 在目录中查找元素的 f1 表
pub fn find_f1_file(dir: &Path, element: &str) -> Option<PathBuf> {
    let pattern = dir.join(format!("f1_{}.*", element));
    let pattern = pattern.to_string_lossy();
    glob::glob(&pattern)
        .ok()?
        .filter_map(|entry| entry.ok())
        .find(|p| p.is_file())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    #[test]
    fn test_element_table() {
        assert_eq!(atomic_number("H"), Some(1));
        assert_eq!(atomic_number("O"), Some(8));
        assert_eq!(atomic_number("Ni"), Some(28));
        assert_eq!(atomic_number("Al"), Some(13));
        assert_eq!(atomic_number("U"), Some(92));
        assert_eq!(atomic_number("Xx"), None);
    }

    #[test]
    fn test_formula_mass() {
        let nio = formula_mass("NiO").unwrap();
        assert!((nio - 74.692).abs() < 1e-3);

        let al2o3 = formula_mass("Al2O3").unwrap();
        assert!((al2o3 - 101.961).abs() < 1e-2);

        let spaced = formula_mass("Ni4 O4").unwrap();
        assert!((spaced - 4.0 * nio).abs() < 1e-9);

        let hydroxide = formula_mass("Ca(OH)2").unwrap();
        assert!((hydroxide - 74.092).abs() < 1e-2);

        let partial = formula_mass("Ni0.5O").unwrap();
        assert!((partial - (0.5 * 58.693 + 15.999)).abs() < 1e-9);
    }

    #[test]
    fn test_formula_mass_errors() {
        assert!(formula_mass("Xy2").is_err());
        assert!(formula_mass("Ca(OH2").is_err());
        assert!(formula_mass("").is_err());
    }

    #[test]
    fn test_f1_table_interpolation() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("f1_Ni.csv");
        fs::write(&path, "index,keV,f1\n0,50.0,28.0\n1,70.0,28.4\n").unwrap();

        let found = find_f1_file(dir.path(), "Ni").unwrap();
        assert_eq!(found, path);
        assert!(find_f1_file(dir.path(), "O").is_none());

        let table = F1Table::load(&found, "Ni").unwrap();
        assert!((table.at(60.0) - 28.2).abs() < 1e-12);
        assert!((scattering_length(table.at(60.0)) - 28.2 * CLASSICAL_ELECTRON_RADIUS).abs() < 1e-25);
    }
}
