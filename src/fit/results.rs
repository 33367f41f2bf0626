//! # 精修结果
//!
//! 汇总拟合优度、参数值与相分数，并写出：
//! - `<stem>.res`: 结果摘要（末尾附自由文本）
//! - `<stem>.fgr`: `;` 分隔的数据 `r;g(r);g(r)_calc;g(r)_diff;<相>...`
//! - `<stem>_<相>.cif`: 各相精修后的结构
//!
//! 拟合优度：
//! - `Rw = sqrt(Σ((Gobs−Gcalc)/dG)² / Σ(Gobs/dG)²)`
//! - `chi2 = Σ((Gobs−Gcalc)/dG)²`，约化 chi2 除以 (点数 − 自由参数数)
//!
//! ## 依赖关系
//! - 被 `fit/mod.rs`、`fit/plot.rs`、`commands/` 使用
//! - 使用 `csv` 写入与读取数据文件，`tabled` 打印结果表

use crate::error::{EzfitError, Result};
use crate::fit::optimizer::StageReport;
use crate::fit::recipe::Recipe;
use crate::fit::scale::PhaseScale;
use crate::parsers::cif::to_cif_string;
use crate::utils::output;
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use tabled::{Table, Tabled};

/// `.fgr` 固定列
pub const FGR_COLUMNS: [&str; 4] = ["r", "g(r)", "g(r)_calc", "g(r)_diff"];

const RULE: &str =
    "------------------------------------------------------------------------------";

/// 精修后的参数
#[derive(Debug, Clone, PartialEq)]
pub struct RefinedParameter {
    pub name: String,
    pub value: f64,
    /// 仅最后一个阶段中自由的参数有误差估计
    pub std_error: Option<f64>,
    pub constrained: bool,
}

/// 拟合优度
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct GoodnessOfFit {
    pub rw: f64,
    pub chi2: f64,
    pub reduced_chi2: f64,
    pub points: usize,
    pub free: usize,
}

impl GoodnessOfFit {
    pub fn compute(obs: &[f64], calc: &[f64], dobs: &[f64], free: usize) -> Self {
        let mut num = 0.0;
        let mut den = 0.0;
        for ((o, c), d) in obs.iter().zip(calc).zip(dobs) {
            num += ((o - c) / d).powi(2);
            den += (o / d).powi(2);
        }
        let points = obs.len();
        let dof = points.saturating_sub(free).max(1) as f64;
        GoodnessOfFit {
            rw: if den > 0.0 { (num / den).sqrt() } else { f64::NAN },
            chi2: num,
            reduced_chi2: num / dof,
            points,
            free,
        }
    }
}

/// 完整的精修结果
#[derive(Debug, Clone)]
pub struct FitResult {
    pub equation: String,
    pub goodness: GoodnessOfFit,
    pub parameters: Vec<RefinedParameter>,
    pub stages: Vec<StageReport>,
    pub scales: Vec<PhaseScale>,
    pub r: Vec<f64>,
    pub g_obs: Vec<f64>,
    pub g_calc: Vec<f64>,
    /// (相, 该相贡献)
    pub components: Vec<(String, Vec<f64>)>,
}

impl FitResult {
    /// 从配方当前状态汇总结果
    pub fn from_recipe(recipe: &Recipe, stages: Vec<StageReport>, scales: Vec<PhaseScale>) -> Result<Self> {
        let profile = &recipe.contribution.profile;
        let components = recipe.evaluate_components()?;
        let mut g_calc = vec![0.0; profile.len()];
        for (_, c) in &components {
            for (t, v) in g_calc.iter_mut().zip(c) {
                *t += v;
            }
        }

        let last = stages.last();
        let free = last.map(|s| s.free.len()).unwrap_or(0);
        let goodness = GoodnessOfFit::compute(&profile.y, &g_calc, &profile.dy, free);

        let mut parameters = Vec::with_capacity(recipe.registry.len());
        for p in recipe.registry.iter() {
            let std_error = last.and_then(|s| {
                s.free
                    .iter()
                    .position(|n| n == &p.name)
                    .and_then(|k| s.std_errors.get(k).copied())
            });
            parameters.push(RefinedParameter {
                name: p.name.clone(),
                value: recipe.registry.value(&p.name)?,
                std_error,
                constrained: recipe.registry.is_constrained(&p.name),
            });
        }

        Ok(FitResult {
            equation: recipe.contribution.equation().to_string(),
            goodness,
            parameters,
            stages,
            scales,
            r: profile.x.clone(),
            g_obs: profile.y.clone(),
            g_calc,
            components,
        })
    }

    /// Gobs − Gcalc
    pub fn difference(&self) -> Vec<f64> {
        self.g_obs.iter().zip(&self.g_calc).map(|(o, c)| o - c).collect()
    }

    pub fn parameter(&self, name: &str) -> Option<&RefinedParameter> {
        self.parameters.iter().find(|p| p.name == name)
    }

    /// `.res` 文件内容
    pub fn to_res_string(&self, footer: &str) -> String {
        ResSummary {
            result: self,
            footer,
        }
        .to_string()
    }

    pub fn write_res(&self, path: &Path, footer: &str) -> Result<()> {
        ensure_parent(path)?;
        fs::write(path, self.to_res_string(footer)).map_err(|e| EzfitError::FileWriteError {
            path: path.display().to_string(),
            source: e,
        })
    }

    /// 写出 `.fgr` 数据；数值以可精确回读的形式保存
    pub fn write_fgr(&self, path: &Path) -> Result<()> {
        ensure_parent(path)?;
        let mut wtr = csv::WriterBuilder::new().delimiter(b';').from_path(path)?;

        let mut header: Vec<String> = FGR_COLUMNS.iter().map(|s| s.to_string()).collect();
        header.extend(self.components.iter().map(|(p, _)| p.clone()));
        wtr.write_record(&header)?;

        let diff = self.difference();
        for i in 0..self.r.len() {
            let mut row = vec![
                self.r[i].to_string(),
                self.g_obs[i].to_string(),
                self.g_calc[i].to_string(),
                diff[i].to_string(),
            ];
            row.extend(self.components.iter().map(|(_, c)| c[i].to_string()));
            wtr.write_record(&row)?;
        }

        wtr.flush().map_err(|e| EzfitError::FileWriteError {
            path: path.display().to_string(),
            source: e,
        })
    }

    /// 打印参数表与相分数表
    pub fn print_tables(&self) {
        #[derive(Tabled)]
        struct ParamRow {
            #[tabled(rename = "Parameter")]
            name: String,
            #[tabled(rename = "Value")]
            value: String,
            #[tabled(rename = "σ")]
            error: String,
        }

        let rows: Vec<ParamRow> = self
            .parameters
            .iter()
            .map(|p| ParamRow {
                name: p.name.clone(),
                value: format!("{:.6}", p.value),
                error: p.std_error.map(|e| format!("{:.2e}", e)).unwrap_or_default(),
            })
            .collect();
        output::print_header(&format!(
            "Refined Parameters (Rw = {:.4}, reduced χ² = {:.4})",
            self.goodness.rw, self.goodness.reduced_chi2
        ));
        println!("{}", Table::new(&rows));

        if !self.scales.is_empty() {
            print_phase_fractions(&self.scales);
        }
    }
}

/// 打印相分数表
pub fn print_phase_fractions(scales: &[PhaseScale]) {
    #[derive(Tabled)]
    struct PhaseRow {
        #[tabled(rename = "Phase")]
        phase: String,
        #[tabled(rename = "Scale")]
        scale: String,
        #[tabled(rename = "Molar")]
        molar: String,
        #[tabled(rename = "Weight")]
        weight: String,
    }

    let rows: Vec<PhaseRow> = scales
        .iter()
        .map(|p| PhaseRow {
            phase: p.phase.clone(),
            scale: format!("{:.6}", p.fitted_scale),
            molar: format!("{:.4}", p.molar_fraction),
            weight: format!("{:.4}", p.weight_fraction),
        })
        .collect();
    output::print_header("Phase Fractions");
    println!("{}", Table::new(&rows));
}

/// `.res` 摘要的文本形式
struct ResSummary<'a> {
    result: &'a FitResult,
    footer: &'a str,
}

impl fmt::Display for ResSummary<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let r = self.result;
        let g = &r.goodness;
        writeln!(f, "Results written by ezfit")?;
        writeln!(f, "Equation: {}", r.equation)?;
        writeln!(f)?;
        writeln!(f, "Overall")?;
        writeln!(f, "{}", RULE)?;
        writeln!(f, "{:<16}{:.8}", "Chi2", g.chi2)?;
        writeln!(f, "{:<16}{:.8}", "Reduced Chi2", g.reduced_chi2)?;
        writeln!(f, "{:<16}{:.8}", "Rw", g.rw)?;
        writeln!(f, "{:<16}{}", "Points", g.points)?;
        writeln!(f, "{:<16}{}", "Free", g.free)?;
        writeln!(f)?;

        writeln!(f, "Variables")?;
        writeln!(f, "{}", RULE)?;
        for p in r.parameters.iter().filter(|p| !p.constrained) {
            match p.std_error {
                Some(e) => writeln!(f, "{:<32}{:>18.8e} +/- {:.4e}", p.name, p.value, e)?,
                None => writeln!(f, "{:<32}{:>18.8e}", p.name, p.value)?,
            }
        }
        writeln!(f)?;

        let constrained: Vec<&RefinedParameter> =
            r.parameters.iter().filter(|p| p.constrained).collect();
        if !constrained.is_empty() {
            writeln!(f, "Constrained Variables")?;
            writeln!(f, "{}", RULE)?;
            for p in constrained {
                writeln!(f, "{:<32}{:>18.8e}", p.name, p.value)?;
            }
            writeln!(f)?;
        }

        if !r.stages.is_empty() {
            writeln!(f, "Stages")?;
            writeln!(f, "{}", RULE)?;
            for st in &r.stages {
                writeln!(
                    f,
                    "{:<4}cost {:.6e}  nfev {:<6}{}",
                    st.index,
                    st.cost,
                    st.nfev,
                    st.free.join(" ")
                )?;
            }
            writeln!(f)?;
        }

        if !r.scales.is_empty() {
            writeln!(f, "Phase fractions")?;
            writeln!(f, "{}", RULE)?;
            writeln!(f, "{:<16}{:>14}{:>14}{:>14}", "phase", "scale", "molar", "weight")?;
            for p in &r.scales {
                writeln!(
                    f,
                    "{:<16}{:>14.6}{:>14.6}{:>14.6}",
                    p.phase, p.fitted_scale, p.molar_fraction, p.weight_fraction
                )?;
            }
            writeln!(f)?;
        }

        if !self.footer.is_empty() {
            writeln!(f, "{}", RULE)?;
            writeln!(f, "{}", self.footer)?;
        }
        Ok(())
    }
}

/// 写出各相精修后的结构，返回写出的文件
pub fn write_structures(recipe: &Recipe, stem: &Path) -> Result<Vec<PathBuf>> {
    ensure_parent(stem)?;
    let mut written = Vec::new();
    for (phase, crystal) in recipe.refined_crystals()? {
        let path = with_suffix(stem, &format!("_{}.cif", phase));
        fs::write(&path, to_cif_string(&crystal)).map_err(|e| EzfitError::FileWriteError {
            path: path.display().to_string(),
            source: e,
        })?;
        written.push(path);
    }
    Ok(written)
}

/// 创建输出文件所在的目录
fn ensure_parent(path: &Path) -> Result<()> {
    match path.parent() {
        Some(dir) if !dir.as_os_str().is_empty() => {
            fs::create_dir_all(dir).map_err(|e| EzfitError::FileWriteError {
                path: dir.display().to_string(),
                source: e,
            })
        }
        _ => Ok(()),
    }
}

/// 在文件名主干后追加后缀，如 `out/fit` + `.res`
pub fn with_suffix(stem: &Path, suffix: &str) -> PathBuf {
    let mut s = stem.as_os_str().to_owned();
    s.push(suffix);
    PathBuf::from(s)
}

/// 回读的 `.fgr` 数据
#[derive(Debug, Clone)]
pub struct FgrTable {
    pub headers: Vec<String>,
    pub columns: Vec<Vec<f64>>,
}

impl FgrTable {
    pub fn column(&self, name: &str) -> Option<&[f64]> {
        self.headers
            .iter()
            .position(|h| h == name)
            .map(|k| self.columns[k].as_slice())
    }
}

/// 读取 `.fgr` 文件
pub fn read_fgr(path: &Path) -> Result<FgrTable> {
    let mut rdr = csv::ReaderBuilder::new()
        .delimiter(b';')
        .has_headers(true)
        .trim(csv::Trim::All)
        .from_path(path)?;
    let headers: Vec<String> = rdr.headers()?.iter().map(String::from).collect();
    let mut columns = vec![Vec::new(); headers.len()];
    for (line, record) in rdr.records().enumerate() {
        let record = record?;
        for (k, field) in record.iter().enumerate().take(headers.len()) {
            let v = field.parse::<f64>().map_err(|_| EzfitError::ParseError {
                format: "fgr".to_string(),
                path: path.display().to_string(),
                reason: format!("row {}: invalid number '{}'", line + 2, field),
            })?;
            columns[k].push(v);
        }
    }
    Ok(FgrTable { headers, columns })
}

/// 从 `.res` 文件读取各相比例因子 (`<相>_scale`)，按出现顺序
pub fn read_res_scales(path: &Path) -> Result<Vec<(String, f64)>> {
    let content = fs::read_to_string(path).map_err(|e| EzfitError::FileReadError {
        path: path.display().to_string(),
        source: e,
    })?;
    let mut scales = Vec::new();
    for line in content.lines() {
        let mut tokens = line.split_whitespace();
        let (Some(name), Some(value)) = (tokens.next(), tokens.next()) else {
            continue;
        };
        let Some(phase) = name.strip_suffix("_scale") else {
            continue;
        };
        if let Ok(v) = value.parse::<f64>() {
            if !scales.iter().any(|(p, _): &(String, f64)| p == phase) {
                scales.push((phase.to_string(), v));
            }
        }
    }
    if scales.is_empty() {
        return Err(EzfitError::ParseError {
            format: "res".to_string(),
            path: path.display().to_string(),
            reason: "no <phase>_scale entries found".to_string(),
        });
    }
    Ok(scales)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> FitResult {
        let r: Vec<f64> = (0..50).map(|i| 1.0 + i as f64 * 0.1).collect();
        let a: Vec<f64> = r.iter().map(|x| (3.0 * x).sin() / x).collect();
        let b: Vec<f64> = r.iter().map(|x| 0.1 * (1.7 * x).cos()).collect();
        let g_calc: Vec<f64> = a.iter().zip(&b).map(|(x, y)| x + y).collect();
        let g_obs: Vec<f64> = g_calc.iter().enumerate().map(|(i, v)| v + 0.01 * (i as f64).sin()).collect();
        FitResult {
            equation: "A * AbulkCF + B * BbulkCF".to_string(),
            goodness: GoodnessOfFit::compute(&g_obs, &g_calc, &vec![1.0; r.len()], 2),
            parameters: vec![
                RefinedParameter {
                    name: "A_scale".to_string(),
                    value: 0.75,
                    std_error: Some(0.01),
                    constrained: false,
                },
                RefinedParameter {
                    name: "B_scale".to_string(),
                    value: 0.25,
                    std_error: None,
                    constrained: false,
                },
                RefinedParameter {
                    name: "B_O2_Biso".to_string(),
                    value: 0.5,
                    std_error: None,
                    constrained: true,
                },
            ],
            stages: Vec::new(),
            scales: Vec::new(),
            r,
            g_obs,
            g_calc,
            components: vec![("A".to_string(), a), ("B".to_string(), b)],
        }
    }

    #[test]
    fn test_goodness_of_fit() {
        let g = GoodnessOfFit::compute(&[1.0, 2.0], &[1.0, 1.0], &[1.0, 1.0], 1);
        assert!((g.chi2 - 1.0).abs() < 1e-12);
        assert!((g.rw - (1.0f64 / 5.0).sqrt()).abs() < 1e-12);
        assert!((g.reduced_chi2 - 1.0).abs() < 1e-12);
        let perfect = GoodnessOfFit::compute(&[1.0, 2.0], &[1.0, 2.0], &[1.0, 1.0], 0);
        assert_eq!(perfect.rw, 0.0);
    }

    #[test]
    fn test_fgr_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("fit.fgr");
        let result = sample();
        result.write_fgr(&path).unwrap();

        let table = read_fgr(&path).unwrap();
        assert_eq!(table.headers, vec!["r", "g(r)", "g(r)_calc", "g(r)_diff", "A", "B"]);
        assert_eq!(table.column("r").unwrap(), result.r.as_slice());
        assert_eq!(table.column("g(r)").unwrap(), result.g_obs.as_slice());
        assert_eq!(table.column("g(r)_calc").unwrap(), result.g_calc.as_slice());

        let obs = table.column("g(r)").unwrap();
        let calc = table.column("g(r)_calc").unwrap();
        let diff = table.column("g(r)_diff").unwrap();
        for i in 0..obs.len() {
            assert_eq!(obs[i] - calc[i], diff[i]);
        }
    }

    #[test]
    fn test_res_summary_and_scales() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("fit.res");
        let result = sample();
        result.write_res(&path, "sample 42, 60 keV").unwrap();

        let content = fs::read_to_string(&path).unwrap();
        assert!(content.contains("Rw"));
        assert!(content.contains("Constrained Variables"));
        assert!(content.trim_end().ends_with("sample 42, 60 keV"));

        let scales = read_res_scales(&path).unwrap();
        assert_eq!(scales, vec![("A".to_string(), 0.75), ("B".to_string(), 0.25)]);
    }

    #[test]
    fn test_writers_create_output_directory() {
        let dir = tempfile::tempdir().unwrap();
        let stem = dir.path().join("out").join("run1");
        let result = sample();
        result.write_res(&with_suffix(&stem, ".res"), "").unwrap();
        result.write_fgr(&with_suffix(&stem, ".fgr")).unwrap();

        assert!(dir.path().join("out/run1.res").is_file());
        assert_eq!(read_fgr(&dir.path().join("out/run1.fgr")).unwrap().columns[0], result.r);
    }

    #[test]
    fn test_read_res_without_scales() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("empty.res");
        fs::write(&path, "Overall\nRw 0.1\n").unwrap();
        assert!(read_res_scales(&path).is_err());
    }

    #[test]
    fn test_with_suffix() {
        assert_eq!(
            with_suffix(Path::new("out/fit"), "_NiO.cif"),
            PathBuf::from("out/fit_NiO.cif")
        );
    }
}
