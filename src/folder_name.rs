use serde::Serialize;

/// Product reference recovered from a human-typed folder name such as
/// `sigma 24-70 #624`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ParsedFolderName {
    pub product_name: String,
    pub serial_suffix: Option<String>,
    pub raw: String,
}

/// Splits a trailing `#<digits>` serial off the folder name. Never fails:
/// without a serial the whole trimmed name is the product name.
pub fn parse_folder_name(raw: &str) -> ParsedFolderName {
    let trimmed = raw.trim();
    let split = trimmed.rfind('#').and_then(|pos| {
        let digits = &trimmed[pos + 1..];
        if !digits.is_empty() && digits.bytes().all(|b| b.is_ascii_digit()) {
            Some((trimmed[..pos].trim(), digits))
        } else {
            None
        }
    });

    match split {
        Some((name, serial)) => ParsedFolderName {
            product_name: name.to_string(),
            serial_suffix: Some(serial.to_string()),
            raw: raw.to_string(),
        },
        None => ParsedFolderName {
            product_name: trimmed.to_string(),
            serial_suffix: None,
            raw: raw.to_string(),
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn splits_trailing_serial() {
        let parsed = parse_folder_name("sigma 24-70 #624");
        assert_eq!(parsed.product_name, "sigma 24-70");
        assert_eq!(parsed.serial_suffix.as_deref(), Some("624"));
        assert_eq!(parsed.raw, "sigma 24-70 #624");
    }

    #[test]
    fn name_without_serial_is_kept_whole() {
        let parsed = parse_folder_name("hasselblad x2d");
        assert_eq!(parsed.product_name, "hasselblad x2d");
        assert_eq!(parsed.serial_suffix, None);
    }

    #[test]
    fn short_serial_after_model_range() {
        let parsed = parse_folder_name("nikon z 180-600 #12");
        assert_eq!(parsed.product_name, "nikon z 180-600");
        assert_eq!(parsed.serial_suffix.as_deref(), Some("12"));
    }

    #[test]
    fn uses_last_hash_and_trims_whitespace() {
        let parsed = parse_folder_name("  leica #2 body #77  ");
        assert_eq!(parsed.product_name, "leica #2 body");
        assert_eq!(parsed.serial_suffix.as_deref(), Some("77"));
    }

    #[test]
    fn non_numeric_suffix_is_not_a_serial() {
        let parsed = parse_folder_name("canon rf 50 #1a");
        assert_eq!(parsed.product_name, "canon rf 50 #1a");
        assert_eq!(parsed.serial_suffix, None);

        let spaced = parse_folder_name("canon rf 50 # 12");
        assert_eq!(spaced.serial_suffix, None);
    }
}
