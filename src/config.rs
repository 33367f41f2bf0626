//! # 配置模块
//!
//! 读取 TOML 格式的精修配置文件（默认 `FitPDF_config.toml`）。
//!
//! ## 配置段
//! - `[files]`: 数据文件、CIF 目录、f1 表目录（必需）
//! - `[metadata]`（别名 `[PDF]`）: 仪器参数 qdamp/qbroad，留空则作为精修参数
//! - `[measurement]`（别名 `[Measurement]`）: X 射线能量 keV
//! - `[restraints]`: 参数类别 → 约束区间
//! - `[verbose]`、`[range]`、`[solver]`、`[[param_order]]`
//!
//! 相对路径以配置文件所在目录为基准。
//!
//! ## 依赖关系
//! - 被 `fit/` 与 `commands/` 使用
//! - 使用 `serde` + `toml`

use crate::error::{EzfitError, Result};
use serde::Deserialize;
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

/// 未指定配置文件时在当前目录查找的文件名
pub const DEFAULT_CONFIG_NAME: &str = "FitPDF_config.toml";

/// 约束（软边界）规格
#[derive(Debug, Clone, Copy, PartialEq, Deserialize)]
#[serde(try_from = "toml::Value")]
pub enum RestraintSpec {
    /// 以当前值为中心 ± 半径
    SymmetricRadius(f64),
    /// 固定区间
    Bounds { lower: f64, upper: f64 },
    /// 固定区间并重设初值
    BoundsWithInitial { lower: f64, upper: f64, initial: f64 },
}

impl RestraintSpec {
    /// 由当前值解析出 (下界, 上界)
    pub fn resolve(&self, current: f64) -> (f64, f64) {
        match *self {
            RestraintSpec::SymmetricRadius(r) => (current - r, current + r),
            RestraintSpec::Bounds { lower, upper }
            | RestraintSpec::BoundsWithInitial { lower, upper, .. } => (lower, upper),
        }
    }

    pub fn initial(&self) -> Option<f64> {
        match *self {
            RestraintSpec::BoundsWithInitial { initial, .. } => Some(initial),
            _ => None,
        }
    }

    /// 从 TOML 值构造：数值为半径，2 元数组为区间，3 元数组为区间加初值
    pub fn from_value(key: &str, value: &toml::Value) -> Result<Self> {
        let number = |v: &toml::Value| match v {
            toml::Value::Float(f) => Some(*f),
            toml::Value::Integer(i) => Some(*i as f64),
            _ => None,
        };
        let invalid = |reason: String| EzfitError::config(format!("restraints.{}", key), reason);

        let spec = match value {
            toml::Value::Array(items) => {
                let nums: Option<Vec<f64>> = items.iter().map(number).collect();
                let nums = nums.ok_or_else(|| invalid("array items must be numbers".to_string()))?;
                match nums.as_slice() {
                    [lower, upper] => RestraintSpec::Bounds {
                        lower: *lower,
                        upper: *upper,
                    },
                    [lower, upper, initial] => RestraintSpec::BoundsWithInitial {
                        lower: *lower,
                        upper: *upper,
                        initial: *initial,
                    },
                    _ => {
                        return Err(invalid(format!(
                            "expected [lower, upper] or [lower, upper, initial], got {} values",
                            nums.len()
                        )))
                    }
                }
            }
            other => match number(other) {
                Some(radius) => RestraintSpec::SymmetricRadius(radius),
                None => {
                    return Err(invalid(format!(
                        "expected a number or an array, got {}",
                        other.type_str()
                    )))
                }
            },
        };

        match spec {
            RestraintSpec::SymmetricRadius(r) if !(r >= 0.0) => {
                Err(invalid(format!("radius must be non-negative, got {}", r)))
            }
            RestraintSpec::Bounds { lower, upper }
            | RestraintSpec::BoundsWithInitial { lower, upper, .. }
                if !(lower <= upper) =>
            {
                Err(invalid(format!("lower bound {} exceeds upper bound {}", lower, upper)))
            }
            _ => Ok(spec),
        }
    }
}

impl TryFrom<toml::Value> for RestraintSpec {
    type Error = EzfitError;

    fn try_from(value: toml::Value) -> Result<Self> {
        RestraintSpec::from_value("?", &value)
    }
}

/// 文件路径
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct FilesConfig {
    /// 实测 G(r) 文件
    pub data: Option<PathBuf>,
    /// CIF 目录，相 `X` 对应 `<cif_dir>/X.cif`
    pub cif_dir: PathBuf,
    /// f1 表目录
    pub f1_dir: PathBuf,
}

impl Default for FilesConfig {
    fn default() -> Self {
        FilesConfig {
            data: None,
            cif_dir: PathBuf::from("CIFS"),
            f1_dir: PathBuf::from("rsc"),
        }
    }
}

/// 仪器参数
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct Metadata {
    pub qdamp: Option<f64>,
    pub qbroad: Option<f64>,
}

impl Metadata {
    pub fn is_empty(&self) -> bool {
        self.qdamp.is_none() && self.qbroad.is_none()
    }
}

/// 测量条件
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct Measurement {
    /// X 射线能量 (keV)
    #[serde(alias = "keV")]
    pub kev: Option<f64>,
}

/// 输出控制
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct VerboseConfig {
    /// 每个精修阶段打印进度
    pub step: bool,
    /// 结束时打印结果表
    pub results: bool,
}

impl Default for VerboseConfig {
    fn default() -> Self {
        VerboseConfig {
            step: true,
            results: true,
        }
    }
}

/// 计算区间
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RangeConfig {
    pub rmin: f64,
    pub rmax: f64,
    pub rstep: f64,
}

impl Default for RangeConfig {
    fn default() -> Self {
        RangeConfig {
            rmin: 1.0,
            rmax: 8.0,
            rstep: 0.01,
        }
    }
}

/// 最小二乘求解器选项
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SolverConfig {
    /// 相对代价下降阈值
    pub ftol: f64,
    /// 每个阶段的最大残差计算次数
    pub max_nfev: usize,
    /// 生成器线程数，0 表示全部 CPU
    pub workers: usize,
}

impl Default for SolverConfig {
    fn default() -> Self {
        SolverConfig {
            ftol: 1e-5,
            max_nfev: 200,
            workers: 0,
        }
    }
}

/// 精修阶段：先固定 `fix`，再释放 `free`
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(default)]
pub struct Stage {
    pub free: Vec<String>,
    pub fix: Vec<String>,
}

impl Stage {
    pub fn freeing(tokens: &[&str]) -> Self {
        Stage {
            free: tokens.iter().map(|s| s.to_string()).collect(),
            fix: Vec::new(),
        }
    }
}

/// 完整配置
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct FitConfig {
    pub files: FilesConfig,
    #[serde(alias = "PDF")]
    pub metadata: Metadata,
    #[serde(alias = "Measurement")]
    pub measurement: Measurement,
    pub restraints: BTreeMap<String, RestraintSpec>,
    pub verbose: VerboseConfig,
    pub range: RangeConfig,
    pub solver: SolverConfig,
    pub param_order: Vec<Stage>,

    /// 相对路径的基准目录
    #[serde(skip)]
    pub base_dir: PathBuf,
}

impl Default for FitConfig {
    fn default() -> Self {
        FitConfig {
            files: FilesConfig::default(),
            metadata: Metadata::default(),
            measurement: Measurement::default(),
            restraints: default_restraints(),
            verbose: VerboseConfig::default(),
            range: RangeConfig::default(),
            solver: SolverConfig::default(),
            param_order: default_param_order(),
            base_dir: PathBuf::from("."),
        }
    }
}

/// 默认约束表
pub fn default_restraints() -> BTreeMap<String, RestraintSpec> {
    let mut m = BTreeMap::new();
    m.insert(
        "delta2".to_string(),
        RestraintSpec::BoundsWithInitial {
            lower: 1.0,
            upper: 5.0,
            initial: 3.0,
        },
    );
    m.insert(
        "scale".to_string(),
        RestraintSpec::BoundsWithInitial {
            lower: 0.01,
            upper: 2.0,
            initial: 0.5,
        },
    );
    m.insert("lat".to_string(), RestraintSpec::SymmetricRadius(0.2));
    m.insert(
        "cfs".to_string(),
        RestraintSpec::BoundsWithInitial {
            lower: 0.1,
            upper: 100.0,
            initial: 50.0,
        },
    );
    m
}

/// 默认精修顺序: 晶格+比例 → 形状参数 → 位移参数+δ₂ → 全部
pub fn default_param_order() -> Vec<Stage> {
    vec![
        Stage::freeing(&["lat", "scale"]),
        Stage::freeing(&["cfs"]),
        Stage::freeing(&["adp", "delta2"]),
        Stage::freeing(&["all"]),
    ]
}

impl FitConfig {
    /// 读取配置文件；`None` 时查找当前目录下的默认文件
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let path = match path {
            Some(p) => p.to_path_buf(),
            None => {
                tracing::info!(
                    "No config file location provided, looking for {}",
                    DEFAULT_CONFIG_NAME
                );
                PathBuf::from(DEFAULT_CONFIG_NAME)
            }
        };
        if !path.exists() {
            return Err(EzfitError::InputNotFound {
                path: path.display().to_string(),
            });
        }
        let content = fs::read_to_string(&path).map_err(|e| EzfitError::FileReadError {
            path: path.display().to_string(),
            source: e,
        })?;

        let mut config = Self::from_toml_str(&content)?;
        config.base_dir = path
            .parent()
            .filter(|p| !p.as_os_str().is_empty())
            .map(Path::to_path_buf)
            .unwrap_or_else(|| PathBuf::from("."));
        tracing::debug!(path = %path.display(), "loaded configuration");
        Ok(config)
    }

    /// 从 TOML 字符串解析，`[files]` 段必须存在
    pub fn from_toml_str(content: &str) -> Result<Self> {
        let table: toml::Table = content
            .parse()
            .map_err(|e: toml::de::Error| EzfitError::config("toml", e.message().to_string()))?;
        if !table.contains_key("files") {
            return Err(EzfitError::config("files", "missing required section [files]"));
        }

        // 逐项解析约束，以便错误信息指出具体键
        if let Some(restraints) = table.get("restraints").and_then(|v| v.as_table()) {
            for (key, value) in restraints {
                RestraintSpec::from_value(key, value)?;
            }
        }

        let config: FitConfig = toml::Value::Table(table)
            .try_into()
            .map_err(|e: toml::de::Error| EzfitError::config("toml", e.message().to_string()))?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<()> {
        if !(self.range.rstep > 0.0) {
            return Err(EzfitError::config("range.rstep", "step must be positive"));
        }
        if !(self.range.rmin < self.range.rmax) {
            return Err(EzfitError::config(
                "range",
                format!("rmin {} must be below rmax {}", self.range.rmin, self.range.rmax),
            ));
        }
        if !(self.solver.ftol > 0.0) {
            return Err(EzfitError::config("solver.ftol", "tolerance must be positive"));
        }
        if self.solver.max_nfev == 0 {
            return Err(EzfitError::config("solver.max_nfev", "must be at least 1"));
        }
        Ok(())
    }

    /// 以配置文件目录为基准解析路径
    pub fn resolve(&self, path: &Path) -> PathBuf {
        if path.is_absolute() {
            path.to_path_buf()
        } else {
            self.base_dir.join(path)
        }
    }

    pub fn cif_dir(&self) -> PathBuf {
        self.resolve(&self.files.cif_dir)
    }

    pub fn f1_dir(&self) -> PathBuf {
        self.resolve(&self.files.f1_dir)
    }

    pub fn data_file(&self) -> Option<PathBuf> {
        self.files.data.as_deref().map(|p| self.resolve(p))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const FULL: &str = r#"
[files]
data = "gr/sample.gr"
cif_dir = "cifs"
f1_dir = "rsc/f1"

[PDF]
qdamp = 0.0107
qbroad = 0.0159

[Measurement]
keV = 60

[restraints]
delta2 = [1.0, 5.0, 3.0]
lat = 0.2
occ = [0, 1]

[range]
rmin = 1.5
rmax = 20.0
rstep = 0.02

[[param_order]]
free = ["lat", "scale"]

[[param_order]]
free = ["all"]
fix = ["xyz"]
"#;

    #[test]
    fn test_full_config() {
        let config = FitConfig::from_toml_str(FULL).unwrap();
        assert_eq!(config.files.data.as_deref(), Some(Path::new("gr/sample.gr")));
        assert_eq!(config.metadata.qdamp, Some(0.0107));
        assert!(!config.metadata.is_empty());
        assert_eq!(config.measurement.kev, Some(60.0));
        assert_eq!(config.range.rmax, 20.0);
        assert_eq!(config.solver.max_nfev, 200);
        assert_eq!(config.param_order.len(), 2);
        assert_eq!(config.param_order[1].fix, vec!["xyz".to_string()]);

        assert_eq!(config.restraints["lat"], RestraintSpec::SymmetricRadius(0.2));
        assert_eq!(
            config.restraints["occ"],
            RestraintSpec::Bounds {
                lower: 0.0,
                upper: 1.0
            }
        );
        assert_eq!(config.restraints["delta2"].initial(), Some(3.0));
        assert!(!config.restraints.contains_key("scale"));
    }

    #[test]
    fn test_defaults() {
        let config = FitConfig::from_toml_str("[files]\n").unwrap();
        assert!(config.metadata.is_empty());
        assert_eq!(config.param_order, default_param_order());
        assert_eq!(config.restraints.len(), 4);
        assert_eq!(config.range.rstep, 0.01);
    }

    #[test]
    fn test_missing_files_section() {
        let err = FitConfig::from_toml_str("[range]\nrmin = 1.0\n").unwrap_err();
        assert!(matches!(err, EzfitError::Configuration { ref key, .. } if key == "files"));
    }

    #[test]
    fn test_malformed_restraint() {
        let content = "[files]\n[restraints]\nscale = [1.0, 2.0, 3.0, 4.0]\n";
        let err = FitConfig::from_toml_str(content).unwrap_err();
        assert!(matches!(err, EzfitError::Configuration { ref key, .. } if key == "restraints.scale"));

        let content = "[files]\n[restraints]\nscale = \"wide\"\n";
        assert!(FitConfig::from_toml_str(content).is_err());

        let content = "[files]\n[restraints]\nscale = [2.0, 1.0]\n";
        assert!(FitConfig::from_toml_str(content).is_err());
    }

    #[test]
    fn test_restraint_resolution() {
        assert_eq!(RestraintSpec::SymmetricRadius(0.2).resolve(4.0), (3.8, 4.2));
        let b = RestraintSpec::Bounds {
            lower: 0.1,
            upper: 100.0,
        };
        assert_eq!(b.resolve(7.0), (0.1, 100.0));
        assert_eq!(b.initial(), None);
    }

    #[test]
    fn test_load_resolves_relative_paths() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("ezfit.toml");
        fs::write(&path, "[files]\ncif_dir = \"cifs\"\n").unwrap();

        let config = FitConfig::load(Some(path.as_path())).unwrap();
        assert_eq!(config.cif_dir(), dir.path().join("cifs"));
        assert!(FitConfig::load(Some(dir.path().join("missing.toml").as_path())).is_err());
    }
}
