//! 三维二值形态学与连通域（6邻域）

use ndarray::{Array3, Zip};
use serde::Serialize;
use std::collections::VecDeque;

const NEIGHBOURS: [(isize, isize, isize); 6] = [(-1, 0, 0), (1, 0, 0), (0, -1, 0), (0, 1, 0), (0, 0, -1), (0, 0, 1)];

fn neighbours(
    (z, y, x): (usize, usize, usize),
    (depth, rows, columns): (usize, usize, usize),
) -> impl Iterator<Item = (usize, usize, usize)> {
    NEIGHBOURS.iter().filter_map(move |&(dz, dy, dx)| {
        let nz = z.checked_add_signed(dz)?;
        let ny = y.checked_add_signed(dy)?;
        let nx = x.checked_add_signed(dx)?;
        (nz < depth && ny < rows && nx < columns).then_some((nz, ny, nx))
    })
}

/// 阈值二值化：强度不低于 `threshold` 的体素为真
pub fn threshold_mask(data: &Array3<f32>, threshold: f32) -> Array3<bool> {
    data.mapv(|v| v >= threshold)
}

/// 膨胀（十字结构元）
pub fn dilate(mask: &Array3<bool>) -> Array3<bool> {
    let dim = mask.dim();
    Array3::from_shape_fn(dim, |idx| mask[idx] || neighbours(idx, dim).any(|n| mask[n]))
}

/// 腐蚀（十字结构元，边界外视为背景）
pub fn erode(mask: &Array3<bool>) -> Array3<bool> {
    let dim = mask.dim();
    Array3::from_shape_fn(dim, |idx| {
        mask[idx] && neighbours(idx, dim).count() == NEIGHBOURS.len() && neighbours(idx, dim).all(|n| mask[n])
    })
}

/// 闭运算：先膨胀后腐蚀，用于弥合小裂隙
pub fn closing(mask: &Array3<bool>) -> Array3<bool> {
    // 边界体素腐蚀时会被剥离，闭运算结果保留原前景
    let mut closed = erode(&dilate(mask));
    Zip::from(&mut closed).and(mask).for_each(|c, &m| *c |= m);
    closed
}

/// 填充与边界不连通的背景空洞
pub fn fill_holes(mask: &Array3<bool>) -> Array3<bool> {
    let dim = mask.dim();
    let (depth, rows, columns) = dim;
    let mut outside = Array3::from_elem(dim, false);
    let mut queue = VecDeque::new();

    for ((z, y, x), &value) in mask.indexed_iter() {
        let on_border = z == 0 || y == 0 || x == 0 || z + 1 == depth || y + 1 == rows || x + 1 == columns;
        if on_border && !value {
            outside[[z, y, x]] = true;
            queue.push_back((z, y, x));
        }
    }
    while let Some(idx) = queue.pop_front() {
        for n in neighbours(idx, dim) {
            if !mask[n] && !outside[n] {
                outside[n] = true;
                queue.push_back(n);
            }
        }
    }

    outside.mapv(|o| !o)
}

/// 连通域
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Component {
    /// 从1开始的标签
    pub label: u32,
    pub voxel_count: usize,
    /// 质心（体素坐标：深度, 行, 列）
    pub centroid: [f32; 3],
    /// 包围盒最小/最大角点
    pub bbox_min: [usize; 3],
    pub bbox_max: [usize; 3],
}

/// 6邻域连通域标记；背景标签为0，连通域按发现顺序编号
pub fn label_components(mask: &Array3<bool>) -> (Array3<u32>, Vec<Component>) {
    let dim = mask.dim();
    let mut labels = Array3::<u32>::zeros(dim);
    let mut components = Vec::new();
    let mut queue = VecDeque::new();

    for (start, &value) in mask.indexed_iter() {
        if !value || labels[start] != 0 {
            continue;
        }
        let label = components.len() as u32 + 1;
        labels[start] = label;
        queue.push_back(start);

        let mut count = 0usize;
        let mut sum = [0.0f64; 3];
        let mut bbox_min = [start.0, start.1, start.2];
        let mut bbox_max = bbox_min;
        while let Some(idx) = queue.pop_front() {
            count += 1;
            let coords = [idx.0, idx.1, idx.2];
            for axis in 0..3 {
                sum[axis] += coords[axis] as f64;
                bbox_min[axis] = bbox_min[axis].min(coords[axis]);
                bbox_max[axis] = bbox_max[axis].max(coords[axis]);
            }
            for n in neighbours(idx, dim) {
                if mask[n] && labels[n] == 0 {
                    labels[n] = label;
                    queue.push_back(n);
                }
            }
        }

        components.push(Component {
            label,
            voxel_count: count,
            centroid: [
                (sum[0] / count as f64) as f32,
                (sum[1] / count as f64) as f32,
                (sum[2] / count as f64) as f32,
            ],
            bbox_min,
            bbox_max,
        });
    }

    (labels, components)
}
