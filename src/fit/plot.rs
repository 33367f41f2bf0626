//! # 拟合图
//!
//! 使用 `plotters` 绘制实测曲线、计算曲线与下移的差值曲线；扩展名为 `.svg` 时输出 SVG，否则 PNG。
//!
//! ## 依赖关系
//! - 被 `fit/mod.rs` 调用
//! - 使用 `fit/results.rs` 的 FitResult
//! - 使用 `plotters` 渲染图表

use crate::error::{EzfitError, Result};
use crate::fit::results::FitResult;

use plotters::prelude::*;
use std::path::Path;

/// 差值曲线的下移量：位于数据最低点以下并留出 10% 间距
pub fn difference_offset(obs: &[f64], calc: &[f64], diff: &[f64]) -> f64 {
    let lo = obs.iter().chain(calc).copied().fold(f64::INFINITY, f64::min);
    let hi = obs.iter().chain(calc).copied().fold(f64::NEG_INFINITY, f64::max);
    let diff_hi = diff.iter().copied().fold(f64::NEG_INFINITY, f64::max);
    if !lo.is_finite() || !diff_hi.is_finite() {
        return 0.0;
    }
    lo - diff_hi - 0.1 * (hi - lo)
}

/// 绘制拟合图
pub fn plot_fit(result: &FitResult, output_path: &Path, title: &str, width: u32, height: u32) -> Result<()> {
    let use_svg = output_path
        .extension()
        .and_then(|e| e.to_str())
        .is_some_and(|e| e.eq_ignore_ascii_case("svg"));

    if use_svg {
        let root = SVGBackend::new(output_path, (width, height)).into_drawing_area();
        draw_fit_chart(&root, result, title)?;
        root.present().map_err(|e| EzfitError::Other(e.to_string()))?;
    } else {
        let root = BitMapBackend::new(output_path, (width, height)).into_drawing_area();
        draw_fit_chart(&root, result, title)?;
        root.present().map_err(|e| EzfitError::Other(e.to_string()))?;
    }
    Ok(())
}

fn draw_fit_chart<DB: DrawingBackend>(
    root: &DrawingArea<DB, plotters::coord::Shift>,
    result: &FitResult,
    title: &str,
) -> Result<()>
where
    DB::ErrorType: 'static,
{
    let plot_err = |e: DrawingAreaErrorKind<DB::ErrorType>| EzfitError::Other(format!("{:?}", e));

    root.fill(&WHITE).map_err(plot_err)?;

    let diff = result.difference();
    let offset = difference_offset(&result.g_obs, &result.g_calc, &diff);
    let x_min = result.r.first().copied().unwrap_or(0.0);
    let x_max = result.r.last().copied().unwrap_or(1.0);
    let y_max = result
        .g_obs
        .iter()
        .chain(&result.g_calc)
        .copied()
        .fold(f64::NEG_INFINITY, f64::max);
    let y_min = diff
        .iter()
        .map(|d| d + offset)
        .fold(offset, f64::min);
    let pad = 0.05 * (y_max - y_min).abs().max(1e-6);

    let mut chart = ChartBuilder::on(root)
        .caption(title, ("sans-serif", 28).into_font())
        .margin(30)
        .x_label_area_size(50)
        .y_label_area_size(60)
        .build_cartesian_2d(x_min..x_max, (y_min - pad)..(y_max + pad))
        .map_err(plot_err)?;

    chart
        .configure_mesh()
        .x_desc("r (Å)")
        .y_desc("G (Å⁻²)")
        .x_label_style(("sans-serif", 16))
        .y_label_style(("sans-serif", 16))
        .axis_desc_style(("sans-serif", 18))
        .draw()
        .map_err(plot_err)?;

    let obs_color = RGBColor(0, 102, 204);
    chart
        .draw_series(
            result
                .r
                .iter()
                .zip(&result.g_obs)
                .map(|(x, y)| Circle::new((*x, *y), 2, obs_color.stroke_width(1))),
        )
        .map_err(plot_err)?
        .label("G(r) obs")
        .legend(move |(x, y)| Circle::new((x + 10, y), 3, obs_color.stroke_width(1)));

    let calc_color = RGBColor(204, 0, 0);
    chart
        .draw_series(LineSeries::new(
            result.r.iter().zip(&result.g_calc).map(|(x, y)| (*x, *y)),
            calc_color.stroke_width(2),
        ))
        .map_err(plot_err)?
        .label("G(r) calc")
        .legend(move |(x, y)| PathElement::new(vec![(x, y), (x + 20, y)], calc_color.stroke_width(2)));

    let diff_color = RGBColor(0, 153, 0);
    chart
        .draw_series(LineSeries::new(
            result.r.iter().zip(&diff).map(|(x, d)| (*x, d + offset)),
            diff_color.stroke_width(1),
        ))
        .map_err(plot_err)?
        .label("difference")
        .legend(move |(x, y)| PathElement::new(vec![(x, y), (x + 20, y)], diff_color.stroke_width(1)));

    chart
        .draw_series(LineSeries::new(
            [(x_min, offset), (x_max, offset)],
            RGBColor(128, 128, 128).stroke_width(1),
        ))
        .map_err(plot_err)?;

    chart
        .configure_series_labels()
        .background_style(WHITE.mix(0.8))
        .border_style(BLACK)
        .position(SeriesLabelPosition::UpperRight)
        .draw()
        .map_err(plot_err)?;

    let rw_text = format!("Rw = {:.4}", result.goodness.rw);
    chart
        .draw_series(std::iter::once(Text::new(
            rw_text,
            (x_min + 0.02 * (x_max - x_min), y_max),
            ("sans-serif", 14).into_font().color(&BLACK),
        )))
        .map_err(plot_err)?;

    Ok(())
}
