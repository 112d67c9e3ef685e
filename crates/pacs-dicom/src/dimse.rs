//! DIMSE消息处理
//!
//! 命令集始终以隐式VR小端编码。

use dicom::core::{DataElement, PrimitiveValue, VR};
use dicom::dictionary_std::tags;
use dicom::object::InMemDicomObject;
use dicom::transfer_syntax::entries::IMPLICIT_VR_LITTLE_ENDIAN;
use pacs_core::{utils, PacsError, Result};

/// 命令字段取值
pub mod command_field {
    pub const C_STORE_RQ: u16 = 0x0001;
    pub const C_STORE_RSP: u16 = 0x8001;
    pub const C_GET_RQ: u16 = 0x0010;
    pub const C_FIND_RQ: u16 = 0x0020;
    pub const C_MOVE_RQ: u16 = 0x0021;
    pub const C_ECHO_RQ: u16 = 0x0030;
    pub const C_ECHO_RSP: u16 = 0x8030;
    pub const C_CANCEL_RQ: u16 = 0x0FFF;
}

/// 命令数据集类型：无数据集
const NO_DATA_SET: u16 = 0x0101;

/// DIMSE状态码
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DimseStatus {
    Success,
    /// 0x0124 拒绝：未授权
    RefusedNotAuthorized,
    /// 0x0122 拒绝：SOP类不支持
    SopClassNotSupported,
    /// 0x0211 无法识别的操作
    UnrecognizedOperation,
    /// 0xA700 资源不足
    OutOfResources,
    /// 0xC000 无法理解
    CannotUnderstand,
    /// 0x0110 处理失败
    ProcessingFailure,
}

impl DimseStatus {
    pub fn code(&self) -> u16 {
        match self {
            DimseStatus::Success => 0x0000,
            DimseStatus::RefusedNotAuthorized => 0x0124,
            DimseStatus::SopClassNotSupported => 0x0122,
            DimseStatus::UnrecognizedOperation => 0x0211,
            DimseStatus::OutOfResources => 0xA700,
            DimseStatus::CannotUnderstand => 0xC000,
            DimseStatus::ProcessingFailure => 0x0110,
        }
    }

    pub fn is_success(&self) -> bool {
        matches!(self, DimseStatus::Success)
    }
}

impl std::fmt::Display for DimseStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:?} (0x{:04X})", self, self.code())
    }
}

/// DIMSE消息解析器
pub struct DimseParser;

impl DimseParser {
    /// 解析命令集字节
    pub fn parse_command_set(data: &[u8]) -> Result<CommandSet> {
        let ts = IMPLICIT_VR_LITTLE_ENDIAN.erased();
        let obj = InMemDicomObject::read_dataset_with_ts(data, &ts)
            .map_err(|e| PacsError::Dicom(format!("无法读取DIMSE命令: {}", e)))?;
        CommandSet::from_object(&obj)
    }

    /// 编码命令集
    pub fn encode_command(obj: &InMemDicomObject) -> Result<Vec<u8>> {
        let ts = IMPLICIT_VR_LITTLE_ENDIAN.erased();
        let mut data = Vec::new();
        obj.write_dataset_with_ts(&mut data, &ts)
            .map_err(|e| PacsError::Dicom(format!("无法编码DIMSE命令: {}", e)))?;
        Ok(data)
    }
}

/// DICOM命令集
#[derive(Debug, Clone, PartialEq)]
pub struct CommandSet {
    pub command_field: u16,
    pub message_id: u16,
    pub affected_sop_class_uid: Option<String>,
    pub affected_sop_instance_uid: Option<String>,
    /// 命令后是否跟随数据集
    pub has_data_set: bool,
}

impl CommandSet {
    pub fn from_object(obj: &InMemDicomObject) -> Result<Self> {
        let command_field = obj
            .element(tags::COMMAND_FIELD)
            .map_err(|e| PacsError::Dicom(format!("缺少命令字段: {}", e)))?
            .uint16()
            .map_err(|e| PacsError::Dicom(format!("命令字段不是整数: {}", e)))?;
        let message_id = obj
            .element(tags::MESSAGE_ID)
            .ok()
            .and_then(|e| e.uint16().ok())
            .unwrap_or(0);
        let has_data_set = obj
            .element(tags::COMMAND_DATA_SET_TYPE)
            .ok()
            .and_then(|e| e.uint16().ok())
            .map(|v| v != NO_DATA_SET)
            .unwrap_or(false);

        Ok(Self {
            command_field,
            message_id,
            affected_sop_class_uid: Self::get_uid(obj, tags::AFFECTED_SOP_CLASS_UID),
            affected_sop_instance_uid: Self::get_uid(obj, tags::AFFECTED_SOP_INSTANCE_UID),
            has_data_set,
        })
    }

    fn get_uid(obj: &InMemDicomObject, tag: dicom::core::Tag) -> Option<String> {
        let value = obj.element(tag).ok()?.to_str().ok()?;
        let value = utils::trim_dicom_value(&value);
        (!value.is_empty()).then(|| value.to_string())
    }

    /// 获取命令类型
    pub fn get_command_type(&self) -> CommandType {
        match self.command_field {
            command_field::C_ECHO_RQ => CommandType::CEcho,
            command_field::C_STORE_RQ => CommandType::CStore,
            command_field::C_FIND_RQ => CommandType::CFind,
            command_field::C_MOVE_RQ => CommandType::CMove,
            command_field::C_GET_RQ => CommandType::CGet,
            command_field::C_CANCEL_RQ => CommandType::CCancel,
            other => CommandType::Unknown(other),
        }
    }
}

/// 命令类型
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommandType {
    CEcho,
    CStore,
    CFind,
    CMove,
    CGet,
    CCancel,
    Unknown(u16),
}

/// C-ECHO-RSP
pub fn c_echo_response(message_id: u16, status: DimseStatus) -> InMemDicomObject {
    InMemDicomObject::command_from_element_iter([
        DataElement::new(
            tags::AFFECTED_SOP_CLASS_UID,
            VR::UI,
            PrimitiveValue::from(crate::transfer_syntax::VERIFICATION_SOP_CLASS),
        ),
        DataElement::new(tags::COMMAND_FIELD, VR::US, PrimitiveValue::from(command_field::C_ECHO_RSP)),
        DataElement::new(tags::MESSAGE_ID_BEING_RESPONDED_TO, VR::US, PrimitiveValue::from(message_id)),
        DataElement::new(tags::COMMAND_DATA_SET_TYPE, VR::US, PrimitiveValue::from(NO_DATA_SET)),
        DataElement::new(tags::STATUS, VR::US, PrimitiveValue::from(status.code())),
    ])
}

/// C-STORE-RSP
pub fn c_store_response(
    message_id: u16,
    sop_class_uid: &str,
    sop_instance_uid: &str,
    status: DimseStatus,
) -> InMemDicomObject {
    InMemDicomObject::command_from_element_iter([
        DataElement::new(tags::AFFECTED_SOP_CLASS_UID, VR::UI, PrimitiveValue::from(sop_class_uid)),
        DataElement::new(tags::COMMAND_FIELD, VR::US, PrimitiveValue::from(command_field::C_STORE_RSP)),
        DataElement::new(tags::MESSAGE_ID_BEING_RESPONDED_TO, VR::US, PrimitiveValue::from(message_id)),
        DataElement::new(tags::COMMAND_DATA_SET_TYPE, VR::US, PrimitiveValue::from(NO_DATA_SET)),
        DataElement::new(tags::STATUS, VR::US, PrimitiveValue::from(status.code())),
        DataElement::new(tags::AFFECTED_SOP_INSTANCE_UID, VR::UI, PrimitiveValue::from(sop_instance_uid)),
    ])
}

/// 不支持的操作：以请求命令字段置高位作为响应
pub fn unsupported_response(command: &CommandSet) -> InMemDicomObject {
    InMemDicomObject::command_from_element_iter([
        DataElement::new(tags::COMMAND_FIELD, VR::US, PrimitiveValue::from(command.command_field | 0x8000)),
        DataElement::new(tags::MESSAGE_ID_BEING_RESPONDED_TO, VR::US, PrimitiveValue::from(command.message_id)),
        DataElement::new(tags::COMMAND_DATA_SET_TYPE, VR::US, PrimitiveValue::from(NO_DATA_SET)),
        DataElement::new(
            tags::STATUS,
            VR::US,
            PrimitiveValue::from(DimseStatus::UnrecognizedOperation.code()),
        ),
    ])
}

/// 读取响应中的状态码
pub fn response_status(obj: &InMemDicomObject) -> Option<u16> {
    obj.element(tags::STATUS).ok()?.uint16().ok()
}
