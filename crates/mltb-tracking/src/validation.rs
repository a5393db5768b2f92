//! Limits and name handling shared by every store.

use mltb_types::{TrackingError, TrackingResult};

pub const MAX_ENTITY_KEY_LENGTH: usize = 250;
pub const MAX_PARAM_VAL_LENGTH: usize = 250;
pub const MAX_TAG_VAL_LENGTH: usize = 5000;
pub const MAX_PARAMS_TAGS_PER_BATCH: usize = 100;
pub const MAX_METRICS_PER_BATCH: usize = 1000;

const SHORTEN_MARKER: &str = " [...] ";

/// Map `name` onto the character set accepted for tracking keys.
///
/// German umlauts and `ß` become digraphs, other Latin letters with
/// diacritics lose them, and anything else outside
/// `[A-Za-z0-9_\-. /]` becomes `_`. The result is cut to
/// [`MAX_ENTITY_KEY_LENGTH`].
pub fn normalize_name(name: &str) -> String {
    let mut out = String::with_capacity(name.len());
    for c in name.chars() {
        if is_key_char(c) {
            out.push(c);
        } else if let Some(folded) = fold_char(c) {
            out.push_str(folded);
        } else {
            out.push('_');
        }
    }
    // Everything pushed is ASCII, so byte and char lengths agree.
    out.truncate(MAX_ENTITY_KEY_LENGTH);
    out
}

/// Shorten `text` to at most `width` characters, keeping a prefix and a
/// suffix around a ` [...] ` marker.
pub fn shorten(text: &str, width: usize) -> String {
    let len = text.chars().count();
    if len <= width {
        return text.to_string();
    }
    let marker_len = SHORTEN_MARKER.chars().count();
    if width <= marker_len {
        return text.chars().take(width).collect();
    }

    let keep = width - marker_len;
    let head = keep.div_ceil(2);
    let tail = keep - head;
    let prefix: String = text.chars().take(head).collect();
    let suffix: String = text.chars().skip(len - tail).collect();
    format!("{prefix}{SHORTEN_MARKER}{suffix}")
}

fn is_key_char(c: char) -> bool {
    c.is_ascii_alphanumeric() || matches!(c, '_' | '-' | '.' | ' ' | '/')
}

fn fold_char(c: char) -> Option<&'static str> {
    let folded = match c {
        'ä' => "ae",
        'ö' => "oe",
        'ü' => "ue",
        'Ä' => "Ae",
        'Ö' => "Oe",
        'Ü' => "Ue",
        'ß' => "ss",
        'à' | 'á' | 'â' | 'ã' | 'å' | 'ā' | 'ă' | 'ą' => "a",
        'À' | 'Á' | 'Â' | 'Ã' | 'Å' | 'Ā' | 'Ă' | 'Ą' => "A",
        'æ' => "ae",
        'Æ' => "AE",
        'ç' | 'ć' | 'č' => "c",
        'Ç' | 'Ć' | 'Č' => "C",
        'ď' | 'đ' => "d",
        'Ď' | 'Đ' => "D",
        'è' | 'é' | 'ê' | 'ë' | 'ē' | 'ę' | 'ě' => "e",
        'È' | 'É' | 'Ê' | 'Ë' | 'Ē' | 'Ę' | 'Ě' => "E",
        'ì' | 'í' | 'î' | 'ï' | 'ī' => "i",
        'Ì' | 'Í' | 'Î' | 'Ï' | 'Ī' => "I",
        'ł' => "l",
        'Ł' => "L",
        'ñ' | 'ń' | 'ň' => "n",
        'Ñ' | 'Ń' | 'Ň' => "N",
        'ò' | 'ó' | 'ô' | 'õ' | 'ø' | 'ō' | 'ő' => "o",
        'Ò' | 'Ó' | 'Ô' | 'Õ' | 'Ø' | 'Ō' | 'Ő' => "O",
        'œ' => "oe",
        'Œ' => "OE",
        'ř' => "r",
        'Ř' => "R",
        'ś' | 'š' | 'ş' => "s",
        'Ś' | 'Š' | 'Ş' => "S",
        'ť' | 'ţ' => "t",
        'Ť' | 'Ţ' => "T",
        'ù' | 'ú' | 'û' | 'ū' | 'ů' | 'ű' => "u",
        'Ù' | 'Ú' | 'Û' | 'Ū' | 'Ů' | 'Ű' => "U",
        'ý' | 'ÿ' => "y",
        'Ý' | 'Ÿ' => "Y",
        'ź' | 'ż' | 'ž' => "z",
        'Ź' | 'Ż' | 'Ž' => "Z",
        _ => return None,
    };
    Some(folded)
}

/// Check a param, metric or tag key.
pub fn validate_key(key: &str) -> TrackingResult<()> {
    let invalid = |reason: &str| TrackingError::InvalidKey {
        key: key.to_string(),
        reason: reason.to_string(),
    };

    if key.is_empty() {
        return Err(invalid("key must not be empty"));
    }
    if key.len() > MAX_ENTITY_KEY_LENGTH {
        return Err(invalid(&format!(
            "key is longer than {MAX_ENTITY_KEY_LENGTH} characters"
        )));
    }
    if !key.chars().all(is_key_char) {
        return Err(invalid(
            "only alphanumerics, underscores, dashes, periods, spaces and slashes are allowed",
        ));
    }
    if key.starts_with('/') || key.split('/').any(|part| part == ".." || part == ".") {
        return Err(invalid("key must be a relative path without '.' or '..' parts"));
    }
    Ok(())
}

pub fn validate_param(key: &str, value: &str) -> TrackingResult<()> {
    validate_key(key)?;
    validate_length(key, value, MAX_PARAM_VAL_LENGTH)
}

pub fn validate_tag(key: &str, value: &str) -> TrackingResult<()> {
    validate_key(key)?;
    validate_length(key, value, MAX_TAG_VAL_LENGTH)
}

fn validate_length(key: &str, value: &str, limit: usize) -> TrackingResult<()> {
    let length = value.chars().count();
    if length > limit {
        return Err(TrackingError::ValueTooLong {
            key: key.to_string(),
            length,
            limit,
        });
    }
    Ok(())
}
