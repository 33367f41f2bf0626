//! # 比例因子换算
//!
//! 将各相拟合得到的比例因子换算为摩尔分数与质量分数：
//!
//! ```text
//! ρ      = Σ mult / V                      (V 以 m³ 计)
//! ⟨b⟩    = Σ mult · r_e · f1(E) / Σ mult
//! s'     = scale / (ρ · ⟨b⟩²)
//! molar  = s' / Σ s'
//! weight = molar · M / Σ (molar · M)
//! ```
//!
//! 结构文件会被重新读取。缺少晶胞体积、位点、对称操作或某元素的 f1 表都会立即失败。
//!
//! ## 依赖关系
//! - 被 `fit/mod.rs` 与 `commands/scales.rs` 使用
//! - 使用 `parsers/cif.rs`、`pdf/scattering.rs`

use crate::error::{EzfitError, Result};
use crate::models::Crystal;
use crate::parsers::cif::parse_cif_file;
use crate::pdf::scattering::{find_f1_file, formula_mass, scattering_length, F1Table};
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::path::{Path, PathBuf};

/// Å³ → m³
const CUBIC_ANGSTROM: f64 = 1e-30;

/// 单相输入
#[derive(Debug, Clone)]
pub struct ScaleInput {
    pub phase: String,
    /// 拟合得到的比例因子
    pub scale: f64,
    /// 结构文件
    pub structure: PathBuf,
    /// 化学式；为空时取自结构文件
    pub formula: String,
}

/// 单相换算结果
#[derive(Debug, Clone, PartialEq)]
pub struct PhaseScale {
    pub phase: String,
    pub fitted_scale: f64,
    /// m³
    pub cell_volume: f64,
    /// 标签 → 等效位置数 × 占有率
    pub multiplicities: BTreeMap<String, f64>,
    /// m⁻³
    pub number_density: f64,
    /// m
    pub mean_scattering_length: f64,
    pub molar_fraction: f64,
    pub weight_fraction: f64,
}

/// 比例因子换算器
#[derive(Debug)]
pub struct ScaleResolver {
    f1_dir: PathBuf,
    kev: f64,
    tables: HashMap<String, F1Table>,
}

impl ScaleResolver {
    pub fn new(f1_dir: impl Into<PathBuf>, kev: f64) -> Self {
        ScaleResolver {
            f1_dir: f1_dir.into(),
            kev,
            tables: HashMap::new(),
        }
    }

    pub fn kev(&self) -> f64 {
        self.kev
    }

    /// 元素在当前能量下的散射长度
    fn element_length(&mut self, phase: &str, element: &str) -> Result<f64> {
        if !self.tables.contains_key(element) {
            let path = find_f1_file(&self.f1_dir, element).ok_or_else(|| {
                EzfitError::scale(
                    phase,
                    format!(
                        "no f1 table for {} in {}",
                        element,
                        self.f1_dir.display()
                    ),
                )
            })?;
            let table = F1Table::load(&path, element)
                .map_err(|e| EzfitError::scale(phase, e.to_string()))?;
            tracing::debug!(element, path = %path.display(), "loaded f1 table");
            self.tables.insert(element.to_string(), table);
        }
        let f1 = self
            .tables
            .get(element)
            .map(|t| t.at(self.kev))
            .ok_or_else(|| EzfitError::scale(phase, format!("no f1 table for {}", element)))?;
        Ok(scattering_length(f1))
    }

    /// 单相的体积、数密度与平均散射长度（分数在 `resolve` 中归一化）
    pub fn phase_metrics(&mut self, phase: &str, scale: f64, crystal: &Crystal) -> Result<PhaseScale> {
        let volume = crystal
            .cell_volume
            .ok_or_else(|| EzfitError::scale(phase, "structure has no _cell_volume"))?;
        if !(volume > 0.0) {
            return Err(EzfitError::scale(phase, format!("invalid cell volume {}", volume)));
        }
        if crystal.sites.is_empty() {
            return Err(EzfitError::scale(phase, "structure has no atom sites"));
        }
        if crystal.symops.is_empty() {
            return Err(EzfitError::scale(phase, "structure has no symmetry operations"));
        }
        // 多重度按标签统计，重名位点会被合并
        let mut labels = BTreeSet::new();
        if let Some(site) = crystal.sites.iter().find(|s| !labels.insert(s.label.as_str())) {
            return Err(EzfitError::scale(
                phase,
                format!("duplicate site label {}", site.label),
            ));
        }

        let volume = volume * CUBIC_ANGSTROM;
        let multiplicities = crystal.multiplicities();
        let total: f64 = multiplicities.values().sum();
        if !(total > 0.0) {
            return Err(EzfitError::scale(phase, "unit cell contains no atoms"));
        }

        let mut weighted = 0.0;
        for site in &crystal.sites {
            let mult = multiplicities.get(&site.label).copied().unwrap_or(0.0);
            weighted += mult * self.element_length(phase, &site.element)?;
        }

        Ok(PhaseScale {
            phase: phase.to_string(),
            fitted_scale: scale,
            cell_volume: volume,
            multiplicities,
            number_density: total / volume,
            mean_scattering_length: weighted / total,
            molar_fraction: 0.0,
            weight_fraction: 0.0,
        })
    }

    /// 换算全部相，返回顺序与输入一致
    pub fn resolve(&mut self, inputs: &[ScaleInput]) -> Result<Vec<PhaseScale>> {
        let mut results = Vec::with_capacity(inputs.len());
        let mut masses = Vec::with_capacity(inputs.len());
        for input in inputs {
            let crystal = load_structure(&input.phase, &input.structure)?;
            results.push(self.phase_metrics(&input.phase, input.scale, &crystal)?);

            let formula = if input.formula.trim().is_empty() {
                crystal.formula()
            } else {
                input.formula.clone()
            };
            let mass = formula_mass(&formula).map_err(|e| EzfitError::scale(&input.phase, e.to_string()))?;
            masses.push(mass);
        }

        let provisional: Vec<f64> = results
            .iter()
            .map(|p| p.fitted_scale / (p.number_density * p.mean_scattering_length.powi(2)))
            .collect();
        let molar = normalize(&provisional)
            .ok_or_else(|| EzfitError::scale("*", "fitted scales sum to zero"))?;

        let weighted: Vec<f64> = molar.iter().zip(&masses).map(|(x, m)| x * m).collect();
        let weight = normalize(&weighted)
            .ok_or_else(|| EzfitError::scale("*", "molar masses sum to zero"))?;

        for ((p, x), w) in results.iter_mut().zip(molar).zip(weight) {
            p.molar_fraction = x;
            p.weight_fraction = w;
            tracing::info!(phase = %p.phase, molar = x, weight = w, "resolved scale");
        }
        Ok(results)
    }
}

fn load_structure(phase: &str, path: &Path) -> Result<Crystal> {
    if !path.is_file() {
        return Err(EzfitError::scale(
            phase,
            format!("structure file not found: {}", path.display()),
        ));
    }
    parse_cif_file(path)
}

/// 归一化使和为 1；和不为正时返回 None
fn normalize(values: &[f64]) -> Option<Vec<f64>> {
    let sum: f64 = values.iter().sum();
    if !(sum > 0.0) || !sum.is_finite() {
        return None;
    }
    Some(values.iter().map(|v| v / sum).collect())
}
