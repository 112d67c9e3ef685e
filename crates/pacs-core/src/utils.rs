//! 通用工具函数

use chrono::{DateTime, NaiveDate, NaiveTime, Utc};
use uuid::Uuid;

/// AE标题最大长度
pub const AE_TITLE_MAX_LEN: usize = 16;

/// 生成唯一的DICOM标识符
pub fn generate_dicom_uid() -> String {
    // 2.25 根下以UUID十进制表示，长度不超过64
    format!("2.25.{}", Uuid::new_v4().as_u128())
}

/// 验证DICOM UID格式
pub fn is_valid_dicom_uid(uid: &str) -> bool {
    !uid.is_empty()
        && uid.len() <= 64
        && uid.chars().all(|c| c.is_ascii_digit() || c == '.')
        && !uid.starts_with('.')
        && !uid.ends_with('.')
        && !uid.contains("..")
}

/// 规范化AE标题：去除空白与填充字符并转为大写
pub fn normalize_ae_title(ae_title: &str) -> String {
    ae_title
        .trim_matches(|c: char| c.is_whitespace() || c == '\0')
        .to_ascii_uppercase()
}

/// 验证AE标题：1-16个字符，不允许反斜杠与控制字符
pub fn is_valid_ae_title(ae_title: &str) -> bool {
    let trimmed = ae_title.trim();
    !trimmed.is_empty()
        && trimmed.len() <= AE_TITLE_MAX_LEN
        && trimmed
            .chars()
            .all(|c| c.is_ascii() && !c.is_ascii_control() && c != '\\')
}

/// 去除DICOM字符串值末尾的填充
pub fn trim_dicom_value(value: &str) -> &str {
    value.trim_matches(|c: char| c.is_whitespace() || c == '\0')
}

/// 解析DICOM日期 (YYYYMMDD)
pub fn parse_dicom_date(value: &str) -> Option<NaiveDate> {
    NaiveDate::parse_from_str(trim_dicom_value(value), "%Y%m%d").ok()
}

/// 解析DICOM时间 (HHMMSS.FFFFFF，允许省略分秒)
pub fn parse_dicom_time(value: &str) -> Option<NaiveTime> {
    let value = trim_dicom_value(value);
    let (whole, fraction) = match value.split_once('.') {
        Some((whole, fraction)) => (whole, Some(fraction)),
        None => (value, None),
    };
    if !whole.chars().all(|c| c.is_ascii_digit()) {
        return None;
    }
    let field = |range: std::ops::Range<usize>| -> Option<u32> {
        whole.get(range).map(|s| s.parse().ok()).unwrap_or(Some(0))
    };
    let (hour, minute, second) = match whole.len() {
        2 | 4 | 6 => (field(0..2)?, field(2..4)?, field(4..6)?),
        _ => return None,
    };
    let micros = match fraction {
        Some(f) if !f.is_empty() && f.len() <= 6 && f.chars().all(|c| c.is_ascii_digit()) => {
            format!("{:0<6}", f).parse().ok()?
        }
        Some(_) => return None,
        None => 0,
    };
    NaiveTime::from_hms_micro_opt(hour, minute, second.min(59), micros)
}

/// 拆分DICOM人名 (Family^Given^Middle^Prefix^Suffix)，返回 (名, 姓)
pub fn split_person_name(value: &str) -> (String, String) {
    let value = trim_dicom_value(value);
    let mut parts = value.split('^').map(str::trim);
    let family = parts.next().unwrap_or_default().to_string();
    let given = parts.next().unwrap_or_default().to_string();
    (given, family)
}

/// 默认检查号：ACC_<Unix秒>
pub fn default_accession_number(now: DateTime<Utc>) -> String {
    format!("ACC_{}", now.timestamp())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_generate_dicom_uid() {
        let uid = generate_dicom_uid();
        assert!(is_valid_dicom_uid(&uid));
    }

    #[test]
    fn test_is_valid_dicom_uid() {
        assert!(is_valid_dicom_uid("1.2.840.10008.5.1.4.1.1.4"));
        assert!(!is_valid_dicom_uid(""));
        assert!(!is_valid_dicom_uid("invalid.uid.with.letters"));
        assert!(!is_valid_dicom_uid("1..2"));
        assert!(!is_valid_dicom_uid(".1.2"));
    }

    #[test]
    fn test_ae_title_helpers() {
        assert_eq!(normalize_ae_title(" ct_main_01 \0"), "CT_MAIN_01");
        assert!(is_valid_ae_title("CT_MAIN_01"));
        assert!(!is_valid_ae_title(""));
        assert!(!is_valid_ae_title("A_VERY_LONG_AE_TITLE_X"));
        assert!(!is_valid_ae_title("BAD\\AE"));
    }

    #[test]
    fn test_parse_dicom_date_and_time() {
        assert_eq!(parse_dicom_date("20240229"), NaiveDate::from_ymd_opt(2024, 2, 29));
        assert_eq!(parse_dicom_date("20230229"), None);
        assert_eq!(parse_dicom_time("1230"), NaiveTime::from_hms_opt(12, 30, 0));
        assert_eq!(
            parse_dicom_time("123045.5"),
            NaiveTime::from_hms_micro_opt(12, 30, 45, 500_000)
        );
        assert_eq!(parse_dicom_time("12a0"), None);
    }

    #[test]
    fn test_split_person_name() {
        assert_eq!(
            split_person_name("DOE^JOHN^^"),
            ("JOHN".to_string(), "DOE".to_string())
        );
        assert_eq!(split_person_name("ANONYMOUS"), (String::new(), "ANONYMOUS".to_string()));
    }
}
