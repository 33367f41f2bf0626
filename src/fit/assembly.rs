//! # 相命名与模型组装
//!
//! - 去重相标识：重复出现的标识从第二次起依次追加 1, 2, ...
//! - 构造模型方程：`P1 * P1shapeId + P2 * P2shapeId + ...`
//! - 构造函数注册表：`<phase><shapeId>` → 参数名列表（首项为 `r`）
//!
//! ## 依赖关系
//! - 被 `fit/recipe.rs` 和 `fit/mod.rs` 使用
//! - 使用 `pdf/shape.rs`

use crate::error::{EzfitError, Result};
use crate::pdf::ShapeFunction;
use std::collections::{BTreeMap, BTreeSet, HashMap};

/// 用户给出的单相描述
#[derive(Debug, Clone, PartialEq)]
pub struct PhaseSpec {
    /// 相标识，同时是 CIF 文件名（不含扩展名）
    pub id: String,
    /// 形状函数标识，如 `sphericalCF`
    pub shape: String,
    /// 化学式，用于换算质量分数；为空时取自 CIF
    pub formula: String,
}

impl PhaseSpec {
    pub fn new(id: impl Into<String>, shape: impl Into<String>, formula: impl Into<String>) -> Self {
        PhaseSpec {
            id: id.into(),
            shape: shape.into(),
            formula: formula.into(),
        }
    }
}

/// 组装后的相
#[derive(Debug, Clone, PartialEq)]
pub struct Phase {
    /// 去重后的唯一标识
    pub id: String,
    /// 原始标识（结构文件名）
    pub source: String,
    pub shape: ShapeFunction,
    pub formula: String,
}

impl Phase {
    /// 函数注册表中的键
    pub fn function_key(&self) -> String {
        format!("{}{}", self.id, self.shape.id())
    }

    /// 形状函数的精修参数名
    pub fn shape_parameter_names(&self) -> Vec<String> {
        self.shape
            .parameter_suffixes()
            .iter()
            .map(|s| format!("{}_{}", self.id, s))
            .collect()
    }
}

/// 函数注册表中的一项
#[derive(Debug, Clone, PartialEq)]
pub struct FunctionEntry {
    pub shape: ShapeFunction,
    /// 参数名，首项为自变量 `r`
    pub argnames: Vec<String>,
    /// 所属相
    pub phase: String,
}

/// 方程中的一项：相比例 × 形状函数
#[derive(Debug, Clone, PartialEq)]
pub struct Term {
    pub phase: String,
    pub function: String,
}

/// 组装结果
#[derive(Debug, Clone)]
pub struct ModelAssembly {
    pub phases: Vec<Phase>,
    pub equation: String,
    pub functions: BTreeMap<String, FunctionEntry>,
}

/// 去重相标识
pub fn dedupe_phase_ids(ids: &[String]) -> Vec<String> {
    let mut counts: HashMap<&str, usize> = HashMap::new();
    for id in ids {
        *counts.entry(id.as_str()).or_insert(0) += 1;
    }

    let mut taken: BTreeSet<String> = BTreeSet::new();
    let mut counters: HashMap<&str, usize> = HashMap::new();
    let mut out = Vec::with_capacity(ids.len());
    for id in ids {
        let first = !counters.contains_key(id.as_str());
        let counter = counters.entry(id.as_str()).or_insert(0);
        let unique = if first && !taken.contains(id) {
            id.clone()
        } else {
            loop {
                *counter += 1;
                let candidate = format!("{}{}", id, counter);
                // 避免与输入中本身存在的标识冲突
                if !taken.contains(&candidate) && !counts.contains_key(candidate.as_str()) {
                    break candidate;
                }
            }
        };
        taken.insert(unique.clone());
        out.push(unique);
    }
    out
}

/// 构造模型方程
pub fn create_equation(phases: &[Phase]) -> String {
    phases
        .iter()
        .map(|p| format!("{} * {}", p.id, p.function_key()))
        .collect::<Vec<_>>()
        .join(" + ")
}

/// 构造函数注册表
pub fn create_functions(phases: &[Phase]) -> BTreeMap<String, FunctionEntry> {
    phases
        .iter()
        .map(|p| {
            let mut argnames = vec!["r".to_string()];
            argnames.extend(p.shape_parameter_names());
            (
                p.function_key(),
                FunctionEntry {
                    shape: p.shape,
                    argnames,
                    phase: p.id.clone(),
                },
            )
        })
        .collect()
}

/// 组装模型：去重、解析形状函数、生成方程与函数表
pub fn assemble(specs: &[PhaseSpec]) -> Result<ModelAssembly> {
    if specs.is_empty() {
        return Err(EzfitError::config("phases", "at least one phase is required"));
    }
    let ids: Vec<String> = specs.iter().map(|s| s.id.clone()).collect();
    let unique = dedupe_phase_ids(&ids);

    let mut phases = Vec::with_capacity(specs.len());
    for (spec, id) in specs.iter().zip(unique) {
        let shape: ShapeFunction = spec.shape.parse().map_err(|_| {
            EzfitError::config(
                format!("phase {}", id),
                format!("unknown shape function '{}'", spec.shape),
            )
        })?;
        phases.push(Phase {
            id,
            source: spec.id.clone(),
            shape,
            formula: spec.formula.clone(),
        });
    }

    let equation = create_equation(&phases);
    let functions = create_functions(&phases);
    tracing::debug!(%equation, "assembled model");
    Ok(ModelAssembly {
        phases,
        equation,
        functions,
    })
}

/// 解析模型方程为 (相比例, 函数) 项
pub fn parse_equation(equation: &str) -> Result<Vec<Term>> {
    let mut terms = Vec::new();
    for part in equation.split('+') {
        let factors: Vec<&str> = part.split('*').map(str::trim).collect();
        match factors.as_slice() {
            [phase, function] if !phase.is_empty() && !function.is_empty() => terms.push(Term {
                phase: phase.to_string(),
                function: function.to_string(),
            }),
            _ => {
                return Err(EzfitError::config(
                    "equation",
                    format!("cannot parse term '{}' in '{}'", part.trim(), equation),
                ))
            }
        }
    }
    Ok(terms)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ids(v: &[&str]) -> Vec<String> {
        v.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_dedupe_appends_counter() {
        assert_eq!(dedupe_phase_ids(&ids(&["A", "A", "B"])), ids(&["A", "A1", "B"]));
        assert_eq!(
            dedupe_phase_ids(&ids(&["A", "B", "A", "A"])),
            ids(&["A", "B", "A1", "A2"])
        );
    }

    #[test]
    fn test_dedupe_is_idempotent() {
        let unique = ids(&["NiO", "Al2O3", "CeO2"]);
        assert_eq!(dedupe_phase_ids(&unique), unique);
        let once = dedupe_phase_ids(&ids(&["A", "A", "B"]));
        assert_eq!(dedupe_phase_ids(&once), once);
    }

    #[test]
    fn test_dedupe_avoids_existing_names() {
        assert_eq!(
            dedupe_phase_ids(&ids(&["A", "A1", "A"])),
            ids(&["A", "A1", "A2"])
        );
    }

    #[test]
    fn test_assemble_equation_and_functions() {
        let specs = vec![
            PhaseSpec::new("NiO", "sphericalCF", "NiO"),
            PhaseSpec::new("NiO", "bulkCF", "NiO"),
        ];
        let model = assemble(&specs).unwrap();
        assert_eq!(model.equation, "NiO * NiOsphericalCF + NiO1 * NiO1bulkCF");
        assert_eq!(model.phases[1].source, "NiO");

        let f = &model.functions["NiOsphericalCF"];
        assert_eq!(f.argnames, vec!["r", "NiO_psize"]);
        assert_eq!(model.functions["NiO1bulkCF"].argnames, vec!["r"]);
    }

    #[test]
    fn test_unknown_shape_names_phase() {
        let specs = vec![PhaseSpec::new("CeO2", "cubeCF", "CeO2")];
        let err = assemble(&specs).unwrap_err();
        match err {
            EzfitError::Configuration { key, reason } => {
                assert!(key.contains("CeO2"));
                assert!(reason.contains("cubeCF"));
            }
            other => panic!("unexpected error: {}", other),
        }
    }

    #[test]
    fn test_parse_equation() {
        let terms = parse_equation("A * AsphericalCF + B * BbulkCF").unwrap();
        assert_eq!(terms.len(), 2);
        assert_eq!(terms[1].phase, "B");
        assert_eq!(terms[1].function, "BbulkCF");
        assert!(parse_equation("A + B").is_err());
    }
}
