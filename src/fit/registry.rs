//! # 参数注册表
//!
//! 精修会话中所有参数的唯一归属者：名称 → 参数状态（值、上下界、自由标志、标签、约束区间），
//! 标签倒排索引，以及参数之间的线性约束。
//!
//! ## 约束语义
//! - 约束 `target = offset + Σ cᵢ · sourceᵢ` 在读取时求值
//! - 依赖图必须无环
//! - 被约束或派生的参数不能被释放
//!
//! ## 依赖关系
//! - 被 `fit/registrar.rs`、`fit/constraints.rs`、`fit/optimizer.rs` 使用

use crate::error::{EzfitError, Result};
use std::collections::{BTreeMap, BTreeSet, HashMap};

/// 选择全部参数的特殊标记
pub const ALL_TOKEN: &str = "all";

/// 参数类别标签；即使没有成员也是合法的选择标记
pub const CLASS_TAGS: [&str; 10] = [
    "scale", "delta2", "lat", "adp", "xyz", "occ", "cfs", "qdamp", "qbroad", "occsum",
];

/// 软约束：值超出 [lower, upper] 时产生 (超出量 / sig) 的残差
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Restraint {
    pub lower: f64,
    pub upper: f64,
    pub sig: f64,
}

impl Restraint {
    pub fn penalty(&self, value: f64) -> f64 {
        let excess = (self.lower - value).max(value - self.upper).max(0.0);
        excess / self.sig
    }
}

/// 线性约束 target = offset + Σ coef · source
#[derive(Debug, Clone, PartialEq)]
pub struct Constraint {
    pub target: String,
    pub terms: Vec<(String, f64)>,
    pub offset: f64,
}

/// 精修参数
#[derive(Debug, Clone)]
pub struct FitParameter {
    pub name: String,
    pub value: f64,
    pub free: bool,
    pub tags: BTreeSet<String>,
    pub lower: f64,
    pub upper: f64,
    pub restraint: Option<Restraint>,
    /// 派生参数仅由约束求值（如占有率之和）
    pub derived: bool,
}

/// 参数注册表
#[derive(Debug, Clone, Default)]
pub struct ParameterRegistry {
    params: Vec<FitParameter>,
    index: HashMap<String, usize>,
    tag_index: BTreeMap<String, Vec<usize>>,
    constraints: BTreeMap<String, Constraint>,
}

impl ParameterRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// 注册新参数，初始为固定状态
    pub fn add<I, S>(&mut self, name: &str, value: f64, tags: I) -> Result<&mut FitParameter>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.insert(name, value, tags, false)
    }

    /// 注册派生参数，其值为 Σ coef · source
    pub fn add_derived<I, S>(&mut self, name: &str, terms: Vec<(String, f64)>, tags: I) -> Result<()>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        for (source, _) in &terms {
            self.position(source)?;
        }
        self.insert(name, 0.0, tags, true)?;
        self.constraints.insert(
            name.to_string(),
            Constraint {
                target: name.to_string(),
                terms,
                offset: 0.0,
            },
        );
        let value = self.value(name)?;
        if let Some(p) = self.get_mut(name) {
            p.value = value;
        }
        Ok(())
    }

    fn insert<I, S>(&mut self, name: &str, value: f64, tags: I, derived: bool) -> Result<&mut FitParameter>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        if self.index.contains_key(name) {
            return Err(EzfitError::DuplicateParameter(name.to_string()));
        }
        let idx = self.params.len();
        let tags: BTreeSet<String> = tags.into_iter().map(Into::into).collect();
        for tag in &tags {
            self.tag_index.entry(tag.clone()).or_default().push(idx);
        }
        self.params.push(FitParameter {
            name: name.to_string(),
            value,
            free: false,
            tags,
            lower: f64::NEG_INFINITY,
            upper: f64::INFINITY,
            restraint: None,
            derived,
        });
        self.index.insert(name.to_string(), idx);
        Ok(&mut self.params[idx])
    }

    fn position(&self, name: &str) -> Result<usize> {
        self.index
            .get(name)
            .copied()
            .ok_or_else(|| EzfitError::UnknownParameter(name.to_string()))
    }

    pub fn contains(&self, name: &str) -> bool {
        self.index.contains_key(name)
    }

    pub fn get(&self, name: &str) -> Option<&FitParameter> {
        self.index.get(name).map(|&i| &self.params[i])
    }

    fn get_mut(&mut self, name: &str) -> Option<&mut FitParameter> {
        self.index.get(name).map(|&i| &mut self.params[i])
    }

    /// 按注册顺序遍历参数
    pub fn iter(&self) -> impl Iterator<Item = &FitParameter> {
        self.params.iter()
    }

    pub fn len(&self) -> usize {
        self.params.len()
    }

    pub fn is_empty(&self) -> bool {
        self.params.is_empty()
    }

    /// 全部参数名（注册顺序）
    pub fn names(&self) -> Vec<String> {
        self.params.iter().map(|p| p.name.clone()).collect()
    }

    /// 带某标签的参数名（注册顺序）
    pub fn members(&self, tag: &str) -> Vec<String> {
        self.tag_index
            .get(tag)
            .map(|idx| idx.iter().map(|&i| self.params[i].name.clone()).collect())
            .unwrap_or_default()
    }

    /// 设置硬边界
    pub fn bound_range(&mut self, name: &str, lower: f64, upper: f64) -> Result<()> {
        let idx = self.position(name)?;
        self.params[idx].lower = lower;
        self.params[idx].upper = upper;
        Ok(())
    }

    /// 设置软约束区间
    pub fn restrain(&mut self, name: &str, lower: f64, upper: f64, sig: f64) -> Result<()> {
        let idx = self.position(name)?;
        self.params[idx].restraint = Some(Restraint { lower, upper, sig });
        Ok(())
    }

    /// 当前值，约束参数按其约束表达式求值
    pub fn value(&self, name: &str) -> Result<f64> {
        let idx = self.position(name)?;
        match self.constraints.get(name) {
            Some(c) => {
                let mut v = c.offset;
                for (source, coef) in &c.terms {
                    v += coef * self.value(source)?;
                }
                Ok(v)
            }
            None => Ok(self.params[idx].value),
        }
    }

    /// 直接设置参数值
    pub fn set_value(&mut self, name: &str, value: f64) -> Result<()> {
        let idx = self.position(name)?;
        if self.constraints.contains_key(name) {
            return Err(EzfitError::ConstraintConflict {
                name: name.to_string(),
                reason: "value is determined by a constraint".to_string(),
            });
        }
        self.params[idx].value = value;
        Ok(())
    }

    pub fn is_constrained(&self, name: &str) -> bool {
        self.constraints.contains_key(name)
    }

    pub fn constraint(&self, name: &str) -> Option<&Constraint> {
        self.constraints.get(name)
    }

    pub fn constraints(&self) -> impl Iterator<Item = &Constraint> {
        self.constraints.values()
    }

    /// 添加约束 target = Σ coef · source；替换 target 上已有的约束
    pub fn constrain(&mut self, target: &str, terms: Vec<(String, f64)>) -> Result<()> {
        let idx = self.position(target)?;
        for (source, _) in &terms {
            self.position(source)?;
            if source == target || self.depends_on(source, target) {
                return Err(EzfitError::ConstraintConflict {
                    name: target.to_string(),
                    reason: format!("constraint on '{}' would form a cycle", source),
                });
            }
        }
        self.params[idx].free = false;
        self.constraints.insert(
            target.to_string(),
            Constraint {
                target: target.to_string(),
                terms,
                offset: 0.0,
            },
        );
        self.params[idx].value = self.value(target)?;
        Ok(())
    }

    /// `name` 是否（传递地）依赖 `other`
    fn depends_on(&self, name: &str, other: &str) -> bool {
        let mut stack = vec![name.to_string()];
        let mut seen = BTreeSet::new();
        while let Some(current) = stack.pop() {
            if !seen.insert(current.clone()) {
                continue;
            }
            if let Some(c) = self.constraints.get(&current) {
                for (source, _) in &c.terms {
                    if source == other {
                        return true;
                    }
                    stack.push(source.clone());
                }
            }
        }
        false
    }

    /// 展开选择标记：`all`、标签或参数名
    pub fn expand(&self, token: &str) -> Result<Vec<String>> {
        if token == ALL_TOKEN {
            return Ok(self
                .params
                .iter()
                .filter(|p| !p.derived)
                .map(|p| p.name.clone())
                .collect());
        }
        if let Some(idx) = self.tag_index.get(token) {
            return Ok(idx.iter().map(|&i| self.params[i].name.clone()).collect());
        }
        if self.index.contains_key(token) {
            return Ok(vec![token.to_string()]);
        }
        if CLASS_TAGS.contains(&token) {
            tracing::debug!(token, "selection token matches no parameters");
            return Ok(Vec::new());
        }
        Err(EzfitError::UnknownParameter(token.to_string()))
    }

    fn expand_all<S: AsRef<str>>(&self, tokens: &[S]) -> Result<Vec<usize>> {
        let mut out = Vec::new();
        let mut seen = BTreeSet::new();
        for token in tokens {
            for name in self.expand(token.as_ref())? {
                let idx = self.position(&name)?;
                if seen.insert(idx) {
                    out.push(idx);
                }
            }
        }
        Ok(out)
    }

    /// 固定所选参数
    pub fn fix<S: AsRef<str>>(&mut self, tokens: &[S]) -> Result<()> {
        for idx in self.expand_all(tokens)? {
            self.params[idx].free = false;
        }
        Ok(())
    }

    /// 释放所选参数；被约束或派生的参数跳过
    pub fn free<S: AsRef<str>>(&mut self, tokens: &[S]) -> Result<()> {
        for idx in self.expand_all(tokens)? {
            let name = &self.params[idx].name;
            if self.params[idx].derived || self.constraints.contains_key(name) {
                tracing::debug!(param = %name, "constrained parameter stays fixed");
                continue;
            }
            self.params[idx].free = true;
        }
        Ok(())
    }

    pub fn fix_all(&mut self) {
        for p in &mut self.params {
            p.free = false;
        }
    }

    /// 自由参数名（注册顺序）
    pub fn free_names(&self) -> Vec<String> {
        self.params
            .iter()
            .filter(|p| p.free)
            .map(|p| p.name.clone())
            .collect()
    }

    /// 参数的搜索区间：硬边界与软约束区间的交集
    pub fn box_bounds(&self, name: &str) -> Result<(f64, f64)> {
        let p = &self.params[self.position(name)?];
        let (mut lo, mut hi) = (p.lower, p.upper);
        if let Some(r) = p.restraint {
            lo = lo.max(r.lower);
            hi = hi.min(r.upper);
        }
        if lo > hi {
            // 区间不相交时以硬边界为准
            return Ok((p.lower, p.upper));
        }
        Ok((lo, hi))
    }

    /// 全部软约束的残差项
    pub fn penalties(&self) -> Result<Vec<f64>> {
        let mut out = Vec::new();
        for p in &self.params {
            if let Some(r) = p.restraint {
                out.push(r.penalty(self.value(&p.name)?));
            }
        }
        Ok(out)
    }

    /// 刷新派生参数与被约束参数的缓存值
    pub fn refresh(&mut self) -> Result<()> {
        let targets: Vec<String> = self.constraints.keys().cloned().collect();
        for target in targets {
            let v = self.value(&target)?;
            if let Some(p) = self.get_mut(&target) {
                p.value = v;
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> ParameterRegistry {
        let mut reg = ParameterRegistry::new();
        reg.add("NiO_scale", 1.0, ["scale", "NiO", "NiO_scale"]).unwrap();
        reg.add("NiO_a", 4.17, ["lat", "NiO", "NiO_lat"]).unwrap();
        reg.add("NiO_Ni1_occ", 0.6, ["occ", "NiO", "occ_Ni"]).unwrap();
        reg.add("NiO_Ni2_occ", 0.3, ["occ", "NiO", "occ_Ni"]).unwrap();
        reg
    }

    #[test]
    fn test_duplicate_name_rejected() {
        let mut reg = sample();
        let err = reg.add("NiO_a", 1.0, ["lat"]).unwrap_err();
        assert!(matches!(err, EzfitError::DuplicateParameter(_)));
    }

    #[test]
    fn test_expand_tokens() {
        let reg = sample();
        assert_eq!(reg.expand("all").unwrap().len(), 4);
        assert_eq!(reg.expand("occ_Ni").unwrap(), vec!["NiO_Ni1_occ", "NiO_Ni2_occ"]);
        assert_eq!(reg.expand("NiO_a").unwrap(), vec!["NiO_a"]);
        assert!(reg.expand("cfs").unwrap().is_empty());
        assert!(matches!(reg.expand("bogus"), Err(EzfitError::UnknownParameter(_))));
    }

    #[test]
    fn test_fix_and_free() {
        let mut reg = sample();
        assert!(reg.free_names().is_empty());
        reg.free(&["lat", "scale"]).unwrap();
        assert_eq!(reg.free_names(), vec!["NiO_scale", "NiO_a"]);
        reg.fix(&["NiO_a"]).unwrap();
        assert_eq!(reg.free_names(), vec!["NiO_scale"]);
        reg.fix_all();
        assert!(reg.free_names().is_empty());
    }

    #[test]
    fn test_equality_constraint_reads_live_value() {
        let mut reg = sample();
        reg.constrain("NiO_Ni2_occ", vec![("NiO_Ni1_occ".to_string(), 1.0)]).unwrap();
        assert_eq!(reg.value("NiO_Ni2_occ").unwrap(), 0.6);

        reg.set_value("NiO_Ni1_occ", 0.8).unwrap();
        assert_eq!(reg.value("NiO_Ni2_occ").unwrap(), 0.8);
        assert!(reg.set_value("NiO_Ni2_occ", 0.1).is_err());

        // 被约束参数不能释放
        reg.free(&["occ"]).unwrap();
        assert_eq!(reg.free_names(), vec!["NiO_Ni1_occ"]);
    }

    #[test]
    fn test_cycle_rejected() {
        let mut reg = sample();
        reg.constrain("NiO_Ni2_occ", vec![("NiO_Ni1_occ".to_string(), 1.0)]).unwrap();
        let err = reg
            .constrain("NiO_Ni1_occ", vec![("NiO_Ni2_occ".to_string(), 1.0)])
            .unwrap_err();
        assert!(matches!(err, EzfitError::ConstraintConflict { .. }));
        assert!(reg.constrain("NiO_a", vec![("NiO_a".to_string(), 1.0)]).is_err());
    }

    #[test]
    fn test_derived_sum_and_penalty() {
        let mut reg = sample();
        reg.add_derived(
            "NiO_occsum_Ni1_Ni2",
            vec![("NiO_Ni1_occ".to_string(), 1.0), ("NiO_Ni2_occ".to_string(), 1.0)],
            ["occsum", "NiO"],
        )
        .unwrap();
        reg.restrain("NiO_occsum_Ni1_Ni2", 0.0, 1.0, 1e-3).unwrap();

        assert!((reg.value("NiO_occsum_Ni1_Ni2").unwrap() - 0.9).abs() < 1e-12);
        assert_eq!(reg.penalties().unwrap(), vec![0.0]);

        reg.set_value("NiO_Ni1_occ", 0.9).unwrap();
        let p = reg.penalties().unwrap();
        assert!((p[0] - 200.0).abs() < 1e-6);

        // 派生参数不参与 "all"
        assert!(!reg.expand("all").unwrap().contains(&"NiO_occsum_Ni1_Ni2".to_string()));
    }

    #[test]
    fn test_box_bounds_intersect_restraint() {
        let mut reg = sample();
        reg.bound_range("NiO_scale", 0.0, f64::INFINITY).unwrap();
        assert_eq!(reg.box_bounds("NiO_scale").unwrap(), (0.0, f64::INFINITY));
        reg.restrain("NiO_scale", 0.01, 2.0, 1e-3).unwrap();
        assert_eq!(reg.box_bounds("NiO_scale").unwrap(), (0.01, 2.0));
    }

    #[test]
    fn test_restraint_penalty() {
        let r = Restraint {
            lower: 1.0,
            upper: 5.0,
            sig: 0.5,
        };
        assert_eq!(r.penalty(3.0), 0.0);
        assert_eq!(r.penalty(0.0), 2.0);
        assert_eq!(r.penalty(6.0), 2.0);
    }
}
