//! 窗宽窗位映射

use crate::config::ModalityPresets;
use crate::volume::{min_max, Volume};
use ndarray::{Array2, ArrayView2};
use serde::{Deserialize, Serialize};

/// 显示窗
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Window {
    pub width: f32,
    pub level: f32,
}

impl Window {
    pub fn new(width: f32, level: f32) -> Self {
        Self { width, level }
    }

    pub fn lower(&self) -> f32 {
        self.level - self.width / 2.0
    }

    pub fn upper(&self) -> f32 {
        self.level + self.width / 2.0
    }

    /// 单个强度值映射为 0..=255
    pub fn map(&self, value: f32, invert: bool) -> u8 {
        if !(self.width > 0.0) || !self.width.is_finite() {
            return 0;
        }
        let mapped = if value <= self.lower() {
            0
        } else if value >= self.upper() {
            255
        } else {
            (((value - self.lower()) / self.width) * 255.0).round().clamp(0.0, 255.0) as u8
        };
        if invert {
            255 - mapped
        } else {
            mapped
        }
    }

    /// 作为缓存键的位表示
    pub(crate) fn key_bits(&self) -> (u32, u32) {
        (self.width.to_bits(), self.level.to_bits())
    }
}

/// 将物理强度图像映射为8位灰度；窗宽不大于0时返回全零图像
pub fn apply_window(image: ArrayView2<'_, f32>, window: Window, invert: bool) -> Array2<u8> {
    if !(window.width > 0.0) || !window.width.is_finite() {
        return Array2::zeros(image.dim());
    }
    image.mapv(|v| window.map(v, invert))
}

/// 未指定窗口时的自动窗口：影像自带窗口、模态预设，最后取数据范围
pub fn auto_window(volume: &Volume, presets: &ModalityPresets) -> Window {
    if let Some((width, level)) = volume.default_window {
        return Window::new(width, level);
    }
    if volume.modality == "CT" {
        return Window::new(presets.ct.soft_tissue_window_width, presets.ct.soft_tissue_window_level);
    }
    data_range_window(volume.data.iter().copied())
}

/// 覆盖整个数据范围的窗口
pub fn data_range_window(values: impl Iterator<Item = f32>) -> Window {
    let (min, max) = min_max(values);
    let width = (max - min).max(1.0);
    Window::new(width, min + (max - min) / 2.0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::volume::Spacing;
    use ndarray::{array, Array3};

    #[test]
    fn test_values_outside_window_clip() {
        let window = Window::new(400.0, 40.0);
        let image = array![[-1000.0, -160.0, 40.0], [240.0, 3000.0, -160.5]];

        let out = apply_window(image.view(), window, false);
        assert_eq!(out[[0, 0]], 0);
        assert_eq!(out[[0, 1]], 0);
        assert_eq!(out[[0, 2]], 128);
        assert_eq!(out[[1, 0]], 255);
        assert_eq!(out[[1, 1]], 255);
        assert_eq!(out[[1, 2]], 0);

        let inverted = apply_window(image.view(), window, true);
        assert_eq!(inverted[[0, 0]], 255);
        assert_eq!(inverted[[1, 1]], 0);
    }

    #[test]
    fn test_window_bounds_sweep() {
        for (width, level) in [(1.0, 0.0), (80.0, 35.0), (2000.0, 500.0), (0.5, -3.25)] {
            let window = Window::new(width, level);
            for step in 0..=20 {
                let offset = step as f32 * width / 4.0;
                assert_eq!(window.map(window.lower() - offset, false), 0);
                assert_eq!(window.map(window.upper() + offset, false), 255);
                assert_eq!(window.map(window.lower() - offset, true), 255);
                assert_eq!(window.map(window.upper() + offset, true), 0);
            }
        }
    }

    #[test]
    fn test_degenerate_width_gives_flat_image() {
        let image = array![[1.0, 2.0], [3.0, 4.0]];
        for width in [0.0, -10.0, f32::NAN] {
            let out = apply_window(image.view(), Window::new(width, 2.0), true);
            assert!(out.iter().all(|&v| v == 0));
        }
    }

    #[test]
    fn test_auto_window_sources() {
        let data = Array3::from_shape_fn((2, 2, 2), |(z, y, x)| (z * 4 + y * 2 + x) as f32 * 10.0);
        let mut volume = Volume::from_array("s", "MR", data, Spacing::default());
        let presets = ModalityPresets::default();
        assert_eq!(auto_window(&volume, &presets), Window::new(70.0, 35.0));

        volume.modality = "CT".into();
        assert_eq!(auto_window(&volume, &presets), Window::new(400.0, 40.0));

        volume.default_window = Some((1500.0, -600.0));
        assert_eq!(auto_window(&volume, &presets), Window::new(1500.0, -600.0));
    }
}
