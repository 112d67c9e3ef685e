//! DICOM数据验证模块
//!
//! 接收前的输入检查：必需UID、患者ID、UID形态与超长字段。
//! 错误会导致拒收；警告只记录日志。

use crate::parser::ParsedDicomObject;
use pacs_core::utils;
use serde::Deserialize;
use tracing::{debug, warn};

/// 验证策略
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ValidationPolicy {
    /// UID最小长度
    pub min_uid_length: usize,
    /// UID最大长度
    pub max_uid_length: usize,
    /// 患者姓名最大长度
    pub max_patient_name_length: usize,
    /// 其他字符串字段最大长度
    pub max_field_length: usize,
}

impl Default for ValidationPolicy {
    fn default() -> Self {
        Self {
            min_uid_length: 10,
            max_uid_length: 64,
            max_patient_name_length: 200,
            max_field_length: 1024,
        }
    }
}

/// DICOM数据验证器
#[derive(Debug, Clone, Default)]
pub struct DicomValidator {
    policy: ValidationPolicy,
}

impl DicomValidator {
    /// 创建新的DICOM验证器
    pub fn new(policy: ValidationPolicy) -> Self {
        Self { policy }
    }

    pub fn policy(&self) -> &ValidationPolicy {
        &self.policy
    }

    /// 验证待存储对象
    pub fn validate_for_store(&self, obj: &ParsedDicomObject) -> ValidationResult {
        let mut result = ValidationResult::new();

        // 1. 验证必需的UID
        self.validate_required_uids(obj, &mut result);

        // 2. 验证患者信息
        self.validate_patient_info(obj, &mut result);

        // 3. 验证字符串字段长度
        self.validate_field_lengths(obj, &mut result);

        // 4. 验证日期时间格式
        self.validate_datetime_format(obj, &mut result);

        // 5. 验证图像信息
        self.validate_image_info(obj, &mut result);

        if let Some(modality) = &obj.modality {
            if !is_known_modality(modality) {
                result.add_warning(format!("模态代码可能无效: {}", modality));
            }
        }

        if result.has_warnings() {
            warn!("{}: {}", result.get_summary(), result.warnings.join("; "));
        } else {
            debug!("{}", result.get_summary());
        }
        result
    }

    /// 验证必需的UID
    fn validate_required_uids(&self, obj: &ParsedDicomObject, result: &mut ValidationResult) {
        let required_uids = [
            ("Study Instance UID", obj.study_instance_uid.as_deref()),
            ("Series Instance UID", obj.series_instance_uid.as_deref()),
            ("SOP Instance UID", obj.sop_instance_uid.as_deref()),
        ];

        for (name, uid) in required_uids {
            match uid {
                Some(uid) => {
                    if !self.is_valid_uid(uid) {
                        result.add_error(format!("{} 格式无效: {}", name, uid));
                    }
                }
                None => result.add_error(format!("{} 缺失", name)),
            }
        }

        if let Some(sop_class) = &obj.sop_class_uid {
            if !utils::is_valid_dicom_uid(sop_class) {
                result.add_warning(format!("SOP类UID格式无效: {}", sop_class));
            }
        }
    }

    /// 验证患者信息
    fn validate_patient_info(&self, obj: &ParsedDicomObject, result: &mut ValidationResult) {
        match &obj.patient_id {
            Some(id) if id.len() > 64 => result.add_error("患者ID长度超过64字符".to_string()),
            Some(_) => {}
            None => result.add_error("患者ID缺失".to_string()),
        }

        if let Some(name) = &obj.patient_name {
            if name.chars().count() > self.policy.max_patient_name_length {
                result.add_error(format!(
                    "患者姓名过长: {} 字符 (上限 {})",
                    name.chars().count(),
                    self.policy.max_patient_name_length
                ));
            }
        }

        if let Some(sex) = &obj.patient_sex {
            if !["M", "F", "O"].contains(&sex.as_str()) {
                result.add_warning(format!("患者性别值无效: {}，应为M/F/O", sex));
            }
        }
    }

    /// 拒绝异常超长的字符串字段
    fn validate_field_lengths(&self, obj: &ParsedDicomObject, result: &mut ValidationResult) {
        let fields = [
            ("检查描述", &obj.study_description),
            ("序列描述", &obj.series_description),
            ("检查号", &obj.accession_number),
            ("申请医生", &obj.referring_physician_name),
            ("机构名称", &obj.institution_name),
            ("模态", &obj.modality),
        ];

        for (name, field) in fields {
            if let Some(value) = field {
                if value.len() > self.policy.max_field_length {
                    result.add_error(format!("{}过长: {} 字节", name, value.len()));
                }
            }
        }
    }

    /// 验证日期时间格式
    fn validate_datetime_format(&self, obj: &ParsedDicomObject, result: &mut ValidationResult) {
        let date_fields = [
            ("患者出生日期", &obj.patient_birth_date),
            ("检查日期", &obj.study_date),
        ];

        for (name, date_field) in date_fields {
            if let Some(date) = date_field {
                if utils::parse_dicom_date(date).is_none() {
                    result.add_warning(format!("{}格式无效: {}", name, date));
                }
            }
        }

        if let Some(time) = &obj.study_time {
            if utils::parse_dicom_time(time).is_none() {
                result.add_warning(format!("检查时间格式无效: {}", time));
            }
        }
    }

    /// 验证图像信息
    fn validate_image_info(&self, obj: &ParsedDicomObject, result: &mut ValidationResult) {
        match (obj.rows, obj.columns) {
            (Some(rows), Some(columns)) if rows == 0 || columns == 0 => {
                result.add_warning("图像尺寸为0".to_string());
            }
            (Some(_), None) | (None, Some(_)) => {
                result.add_warning("图像尺寸信息不完整，缺少行数或列数".to_string());
            }
            // 可能是没有像素数据的DICOM对象
            _ => {}
        }

        if let (Some(bits_allocated), Some(bits_stored)) = (obj.bits_allocated, obj.bits_stored) {
            if bits_stored > bits_allocated {
                result.add_warning("存储位数大于分配位数".to_string());
            }
        }
    }

    /// UID字符与长度检查
    fn is_valid_uid(&self, uid: &str) -> bool {
        utils::is_valid_dicom_uid(uid)
            && uid.len() >= self.policy.min_uid_length
            && uid.len() <= self.policy.max_uid_length
    }
}

/// 常见的DICOM模态代码
fn is_known_modality(modality: &str) -> bool {
    const MODALITIES: &[&str] = &[
        "CR", "CT", "DX", "ES", "MG", "MR", "NM", "OT", "PT", "RF", "SC", "US", "XA", "XC",
        "RTIMAGE", "RTDOSE", "RTSTRUCT", "RTPLAN", "HC", "SEG", "DOC", "REG", "OP", "OPT",
        "SR", "KO", "PR",
    ];
    MODALITIES.contains(&modality)
}

/// 验证结果
#[derive(Debug, Clone)]
pub struct ValidationResult {
    /// 验证错误列表
    pub errors: Vec<String>,
    /// 验证警告列表
    pub warnings: Vec<String>,
    /// 是否通过验证
    pub is_valid: bool,
}

impl Default for ValidationResult {
    fn default() -> Self {
        Self::new()
    }
}

impl ValidationResult {
    /// 创建新的验证结果
    pub fn new() -> Self {
        Self {
            errors: Vec::new(),
            warnings: Vec::new(),
            is_valid: true,
        }
    }

    /// 添加错误
    pub fn add_error(&mut self, error: String) {
        self.is_valid = false;
        self.errors.push(error);
    }

    /// 添加警告
    pub fn add_warning(&mut self, warning: String) {
        self.warnings.push(warning);
    }

    pub fn has_errors(&self) -> bool {
        !self.errors.is_empty()
    }

    pub fn has_warnings(&self) -> bool {
        !self.warnings.is_empty()
    }

    /// 获取验证报告摘要
    pub fn get_summary(&self) -> String {
        if self.is_valid {
            if self.has_warnings() {
                format!("验证通过，但有 {} 个警告", self.warnings.len())
            } else {
                "验证完全通过".to_string()
            }
        } else {
            format!(
                "验证失败：{} 个错误，{} 个警告",
                self.errors.len(),
                self.warnings.len()
            )
        }
    }

    /// 所有错误合并为一条消息
    pub fn error_message(&self) -> String {
        self.errors.join("; ")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn valid_object() -> ParsedDicomObject {
        ParsedDicomObject {
            patient_id: Some("P1".to_string()),
            patient_name: Some("DOE^JANE".to_string()),
            study_instance_uid: Some("1.2.826.0.1.1".to_string()),
            series_instance_uid: Some("1.2.826.0.1.1.1".to_string()),
            sop_instance_uid: Some("1.2.826.0.1.1.1.1".to_string()),
            modality: Some("CT".to_string()),
            ..Default::default()
        }
    }

    #[test]
    fn test_valid_object_passes() {
        let result = DicomValidator::default().validate_for_store(&valid_object());
        assert!(result.is_valid, "{:?}", result.errors);
    }

    #[test]
    fn test_missing_uid_and_patient_id() {
        let mut obj = valid_object();
        obj.series_instance_uid = None;
        obj.patient_id = None;

        let result = DicomValidator::default().validate_for_store(&obj);
        assert!(!result.is_valid);
        assert_eq!(result.errors.len(), 2);
    }

    #[test]
    fn test_uid_length_bounds() {
        let mut obj = valid_object();
        obj.study_instance_uid = Some("1.2.3".to_string());
        assert!(!DicomValidator::default().validate_for_store(&obj).is_valid);

        let relaxed = DicomValidator::new(ValidationPolicy {
            min_uid_length: 1,
            ..Default::default()
        });
        assert!(relaxed.validate_for_store(&obj).is_valid);

        obj.study_instance_uid = Some(format!("1.{}", "2".repeat(64)));
        assert!(!relaxed.validate_for_store(&obj).is_valid);

        obj.study_instance_uid = Some("1.2.abc.3.4.5".to_string());
        assert!(!relaxed.validate_for_store(&obj).is_valid);
    }

    #[test]
    fn test_oversized_patient_name_is_rejected() {
        let mut obj = valid_object();
        obj.patient_name = Some("A".repeat(201));
        let result = DicomValidator::default().validate_for_store(&obj);
        assert!(!result.is_valid);

        obj.patient_name = Some("A".repeat(200));
        assert!(DicomValidator::default().validate_for_store(&obj).is_valid);
    }

    #[test]
    fn test_bad_dates_are_warnings_only() {
        let mut obj = valid_object();
        obj.study_date = Some("20231301".to_string());
        obj.patient_sex = Some("X".to_string());

        let result = DicomValidator::default().validate_for_store(&obj);
        assert!(result.is_valid);
        assert_eq!(result.warnings.len(), 2);
    }

    #[test]
    fn test_validation_result() {
        let mut result = ValidationResult::new();

        result.add_warning("测试警告".to_string());
        assert!(result.has_warnings());
        assert!(result.is_valid);

        result.add_error("测试错误".to_string());
        assert!(result.has_errors());
        assert!(!result.is_valid);
        assert_eq!(result.error_message(), "测试错误");
    }
}
