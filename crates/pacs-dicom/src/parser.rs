//! DICOM数据解析器
//!
//! 每个对象只解码一次，提取为字段固定、全部可选的 [`ParsedDicomObject`]；
//! 缺省值集中在访问器中，调用方不再直接读取DICOM元素。

use dicom::core::Tag;
use dicom::dictionary_std::tags;
use dicom::object::{open_file, DefaultDicomObject, InMemDicomObject};
use pacs_core::{utils, PacsError, Result};
use std::path::Path;
use tracing::{debug, error};

/// DICOM数据解析器
pub struct DicomParser;

impl DicomParser {
    /// 解析DICOM文件（包含文件元信息）
    pub fn parse_file<P: AsRef<Path>>(file_path: P) -> Result<(DefaultDicomObject, ParsedDicomObject)> {
        let file_path = file_path.as_ref();
        debug!("开始解析DICOM文件: {:?}", file_path);

        let obj = open_file(file_path).map_err(|e| {
            error!("DICOM文件解析失败: {:?}", e);
            PacsError::DicomParseError(format!("无法解析DICOM文件 {:?}: {}", file_path, e))
        })?;

        let mut parsed = Self::extract_metadata(&obj);
        parsed.transfer_syntax_uid = Some(utils::trim_dicom_value(obj.meta().transfer_syntax()).to_string());
        Ok((obj, parsed))
    }

    /// 从数据集中提取元数据
    pub fn extract_metadata(obj: &InMemDicomObject) -> ParsedDicomObject {
        let mut parsed = ParsedDicomObject::default();

        // 提取患者信息
        parsed.patient_id = Self::get_string_element(obj, tags::PATIENT_ID);
        parsed.patient_name = Self::get_string_element(obj, tags::PATIENT_NAME);
        parsed.patient_birth_date = Self::get_string_element(obj, tags::PATIENT_BIRTH_DATE);
        parsed.patient_sex = Self::get_string_element(obj, tags::PATIENT_SEX);
        parsed.patient_weight = Self::get_float_element(obj, tags::PATIENT_WEIGHT);

        // 提取检查信息
        parsed.study_instance_uid = Self::get_string_element(obj, tags::STUDY_INSTANCE_UID);
        parsed.study_date = Self::get_string_element(obj, tags::STUDY_DATE);
        parsed.study_time = Self::get_string_element(obj, tags::STUDY_TIME);
        parsed.study_description = Self::get_string_element(obj, tags::STUDY_DESCRIPTION);
        parsed.accession_number = Self::get_string_element(obj, tags::ACCESSION_NUMBER);
        parsed.referring_physician_name = Self::get_string_element(obj, tags::REFERRING_PHYSICIAN_NAME);

        // 提取序列信息
        parsed.series_instance_uid = Self::get_string_element(obj, tags::SERIES_INSTANCE_UID);
        parsed.series_number = Self::get_integer_element(obj, tags::SERIES_NUMBER);
        parsed.series_description = Self::get_string_element(obj, tags::SERIES_DESCRIPTION);
        parsed.modality = Self::get_string_element(obj, tags::MODALITY);

        // 提取实例信息
        parsed.sop_instance_uid = Self::get_string_element(obj, tags::SOP_INSTANCE_UID);
        parsed.sop_class_uid = Self::get_string_element(obj, tags::SOP_CLASS_UID);
        parsed.instance_number = Self::get_integer_element(obj, tags::INSTANCE_NUMBER);

        // 提取设备信息
        parsed.institution_name = Self::get_string_element(obj, tags::INSTITUTION_NAME);

        // 提取图像信息
        parsed.rows = Self::get_integer_element(obj, tags::ROWS);
        parsed.columns = Self::get_integer_element(obj, tags::COLUMNS);
        parsed.bits_allocated = Self::get_integer_element(obj, tags::BITS_ALLOCATED);
        parsed.bits_stored = Self::get_integer_element(obj, tags::BITS_STORED);
        parsed.high_bit = Self::get_integer_element(obj, tags::HIGH_BIT);

        // 提取空间几何信息
        parsed.pixel_spacing = Self::get_float_array::<2>(obj, tags::PIXEL_SPACING);
        parsed.slice_thickness = Self::get_float_element(obj, tags::SLICE_THICKNESS);
        parsed.image_position = Self::get_float_array::<3>(obj, tags::IMAGE_POSITION_PATIENT);
        parsed.image_orientation = Self::get_float_array::<6>(obj, tags::IMAGE_ORIENTATION_PATIENT);
        parsed.slice_location = Self::get_float_element(obj, tags::SLICE_LOCATION);

        // 提取像素值标定信息
        parsed.rescale_slope = Self::get_float_element(obj, tags::RESCALE_SLOPE);
        parsed.rescale_intercept = Self::get_float_element(obj, tags::RESCALE_INTERCEPT);
        parsed.window_center = Self::get_float_element(obj, tags::WINDOW_CENTER);
        parsed.window_width = Self::get_float_element(obj, tags::WINDOW_WIDTH);

        debug!("成功提取DICOM元数据: {}", parsed.get_summary());
        parsed
    }

    /// 获取字符串类型元素的值，空值视为缺失
    fn get_string_element(obj: &InMemDicomObject, tag: Tag) -> Option<String> {
        let element = obj.element(tag).ok()?;
        let value = element.to_str().ok()?;
        let value = utils::trim_dicom_value(&value);
        if value.is_empty() {
            None
        } else {
            Some(value.to_string())
        }
    }

    /// 获取整数类型元素的值（兼容IS字符串）
    fn get_integer_element<T>(obj: &InMemDicomObject, tag: Tag) -> Option<T>
    where
        T: TryFrom<i64>,
    {
        let element = obj.element(tag).ok()?;
        let value: i64 = element.to_int::<i64>().ok()?;
        T::try_from(value).ok()
    }

    /// 获取浮点类型元素的值（兼容DS字符串）
    fn get_float_element(obj: &InMemDicomObject, tag: Tag) -> Option<f64> {
        obj.element(tag).ok()?.to_float64().ok().filter(|v| v.is_finite())
    }

    /// 获取定长浮点数组
    fn get_float_array<const N: usize>(obj: &InMemDicomObject, tag: Tag) -> Option<[f64; N]> {
        let values = obj.element(tag).ok()?.to_multi_float64().ok()?;
        if values.len() < N || values.iter().take(N).any(|v| !v.is_finite()) {
            return None;
        }
        let mut out = [0.0; N];
        out.copy_from_slice(&values[..N]);
        Some(out)
    }
}

/// 解析后的DICOM对象
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ParsedDicomObject {
    // === 患者信息 ===
    /// 患者ID
    pub patient_id: Option<String>,
    /// 患者姓名 (Family^Given)
    pub patient_name: Option<String>,
    /// 患者出生日期
    pub patient_birth_date: Option<String>,
    /// 患者性别
    pub patient_sex: Option<String>,
    /// 患者体重 (kg)
    pub patient_weight: Option<f64>,

    // === 检查信息 ===
    /// 检查实例UID
    pub study_instance_uid: Option<String>,
    /// 检查日期
    pub study_date: Option<String>,
    /// 检查时间
    pub study_time: Option<String>,
    /// 检查描述
    pub study_description: Option<String>,
    /// 检查号
    pub accession_number: Option<String>,
    /// 申请医生
    pub referring_physician_name: Option<String>,

    // === 序列信息 ===
    /// 序列实例UID
    pub series_instance_uid: Option<String>,
    /// 序列号
    pub series_number: Option<i32>,
    /// 序列描述
    pub series_description: Option<String>,
    /// 模态
    pub modality: Option<String>,

    // === 实例信息 ===
    /// SOP实例UID
    pub sop_instance_uid: Option<String>,
    /// SOP类UID
    pub sop_class_uid: Option<String>,
    /// 实例号
    pub instance_number: Option<i32>,

    // === 设备信息 ===
    /// 机构名称
    pub institution_name: Option<String>,

    // === 图像信息 ===
    pub rows: Option<u16>,
    pub columns: Option<u16>,
    pub bits_allocated: Option<u16>,
    pub bits_stored: Option<u16>,
    pub high_bit: Option<u16>,

    // === 空间几何 ===
    /// 像素间距 (行, 列) mm
    pub pixel_spacing: Option<[f64; 2]>,
    pub slice_thickness: Option<f64>,
    /// 图像左上角患者坐标
    pub image_position: Option<[f64; 3]>,
    /// 行/列方向余弦
    pub image_orientation: Option<[f64; 6]>,
    pub slice_location: Option<f64>,

    // === 像素值标定 ===
    pub rescale_slope: Option<f64>,
    pub rescale_intercept: Option<f64>,
    pub window_center: Option<f64>,
    pub window_width: Option<f64>,

    // === 传输语法 ===
    /// 传输语法UID
    pub transfer_syntax_uid: Option<String>,
}

impl ParsedDicomObject {
    /// 模态，缺省为 OT
    pub fn modality_or_default(&self) -> &str {
        self.modality.as_deref().unwrap_or("OT")
    }

    /// 检查描述，缺省为 "DICOM Study"
    pub fn study_description_or_default(&self) -> &str {
        self.study_description.as_deref().unwrap_or("DICOM Study")
    }

    /// 序列号，缺省为 1
    pub fn series_number_or_default(&self) -> i32 {
        self.series_number.unwrap_or(1)
    }

    /// 标定参数 (slope, intercept)，缺省为 (1, 0)
    pub fn rescale(&self) -> (f64, f64) {
        let slope = match self.rescale_slope {
            Some(s) if s != 0.0 => s,
            _ => 1.0,
        };
        (slope, self.rescale_intercept.unwrap_or(0.0))
    }

    /// 图像尺寸 (行数, 列数)
    pub fn get_image_size(&self) -> Option<(u16, u16)> {
        match (self.rows, self.columns) {
            (Some(rows), Some(columns)) => Some((rows, columns)),
            _ => None,
        }
    }

    /// 获取DICOM对象的摘要信息
    pub fn get_summary(&self) -> String {
        format!(
            "DICOM对象: 患者ID={}, 检查UID={}, 序列UID={}, 模态={}",
            self.patient_id.as_deref().unwrap_or("未知"),
            self.study_instance_uid.as_deref().unwrap_or("未知"),
            self.series_instance_uid.as_deref().unwrap_or("未知"),
            self.modality.as_deref().unwrap_or("未知")
        )
    }
}

impl std::fmt::Display for ParsedDicomObject {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.get_summary())
    }
}
