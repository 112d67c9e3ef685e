//! DICOM传输语法与SOP类支持
//!
//! 关联协商时提供的抽象语法（验证 + 常见存储SOP类）与传输语法列表。

use dicom::dictionary_std::uids;
use dicom::encoding::transfer_syntax::TransferSyntaxIndex;
use dicom::transfer_syntax::TransferSyntaxRegistry;

/// 验证SOP类
pub const VERIFICATION_SOP_CLASS: &str = uids::VERIFICATION;

/// 存储SOP类UID前缀
const STORAGE_SOP_CLASS_PREFIX: &str = "1.2.840.10008.5.1.4.1.1.";

/// 接收的存储SOP类
pub const STORAGE_SOP_CLASSES: &[&str] = &[
    uids::COMPUTED_RADIOGRAPHY_IMAGE_STORAGE,
    uids::DIGITAL_X_RAY_IMAGE_STORAGE_FOR_PRESENTATION,
    uids::DIGITAL_X_RAY_IMAGE_STORAGE_FOR_PROCESSING,
    uids::DIGITAL_MAMMOGRAPHY_X_RAY_IMAGE_STORAGE_FOR_PRESENTATION,
    uids::DIGITAL_MAMMOGRAPHY_X_RAY_IMAGE_STORAGE_FOR_PROCESSING,
    uids::CT_IMAGE_STORAGE,
    uids::ENHANCED_CT_IMAGE_STORAGE,
    uids::MR_IMAGE_STORAGE,
    uids::ENHANCED_MR_IMAGE_STORAGE,
    uids::ULTRASOUND_IMAGE_STORAGE,
    uids::ULTRASOUND_MULTI_FRAME_IMAGE_STORAGE,
    uids::SECONDARY_CAPTURE_IMAGE_STORAGE,
    uids::MULTI_FRAME_GRAYSCALE_BYTE_SECONDARY_CAPTURE_IMAGE_STORAGE,
    uids::MULTI_FRAME_GRAYSCALE_WORD_SECONDARY_CAPTURE_IMAGE_STORAGE,
    uids::MULTI_FRAME_TRUE_COLOR_SECONDARY_CAPTURE_IMAGE_STORAGE,
    uids::X_RAY_ANGIOGRAPHIC_IMAGE_STORAGE,
    uids::X_RAY_RADIOFLUOROSCOPIC_IMAGE_STORAGE,
    uids::NUCLEAR_MEDICINE_IMAGE_STORAGE,
    uids::POSITRON_EMISSION_TOMOGRAPHY_IMAGE_STORAGE,
    uids::ENHANCED_PET_IMAGE_STORAGE,
    uids::RT_IMAGE_STORAGE,
    uids::RT_DOSE_STORAGE,
    uids::RT_STRUCTURE_SET_STORAGE,
    uids::RT_PLAN_STORAGE,
    uids::GRAYSCALE_SOFTCOPY_PRESENTATION_STATE_STORAGE,
    uids::BASIC_TEXT_SR_STORAGE,
    uids::ENHANCED_SR_STORAGE,
    uids::COMPREHENSIVE_SR_STORAGE,
    uids::ENCAPSULATED_PDF_STORAGE,
];

/// 未压缩传输语法
const UNCOMPRESSED_SYNTAXES: &[&str] = &[
    uids::IMPLICIT_VR_LITTLE_ENDIAN,
    uids::EXPLICIT_VR_LITTLE_ENDIAN,
    uids::EXPLICIT_VR_BIG_ENDIAN,
];

/// DICOM传输语法管理器
#[derive(Debug, Clone, Default)]
pub struct TransferSyntaxManager;

impl TransferSyntaxManager {
    pub fn new() -> Self {
        Self
    }

    /// 检查传输语法是否可以解码数据集
    pub fn is_supported(&self, uid: &str) -> bool {
        let uid = uid.trim_end_matches('\0');
        TransferSyntaxRegistry
            .get(uid)
            .map(|ts| !ts.is_unsupported())
            .unwrap_or(false)
    }

    /// 协商时提供的传输语法：未压缩语法在前，其后为注册表中其余可解码的语法
    pub fn get_supported_syntaxes(&self) -> Vec<String> {
        let mut syntaxes: Vec<String> = UNCOMPRESSED_SYNTAXES.iter().map(|s| s.to_string()).collect();
        for ts in TransferSyntaxRegistry.iter() {
            if !ts.is_unsupported() && !syntaxes.iter().any(|s| s == ts.uid()) {
                syntaxes.push(ts.uid().to_string());
            }
        }
        syntaxes
    }

    /// 协商时提供的抽象语法
    pub fn get_abstract_syntaxes(&self) -> Vec<&'static str> {
        std::iter::once(VERIFICATION_SOP_CLASS)
            .chain(STORAGE_SOP_CLASSES.iter().copied())
            .collect()
    }

    /// 检查传输语法是否为压缩语法
    pub fn is_compressed(&self, uid: &str) -> bool {
        !UNCOMPRESSED_SYNTAXES.contains(&uid.trim_end_matches('\0'))
            && uid != uids::DEFLATED_EXPLICIT_VR_LITTLE_ENDIAN
    }

    /// 获取传输语法名称
    pub fn get_transfer_syntax_name(&self, uid: &str) -> String {
        TransferSyntaxRegistry
            .get(uid.trim_end_matches('\0'))
            .map(|ts| ts.name().to_string())
            .unwrap_or_else(|| format!("Unknown ({})", uid))
    }
}

/// 是否属于存储SOP类族
pub fn is_storage_sop_class(uid: &str) -> bool {
    let uid = uid.trim_end_matches('\0');
    STORAGE_SOP_CLASSES.contains(&uid) || uid.starts_with(STORAGE_SOP_CLASS_PREFIX)
}
