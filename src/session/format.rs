//! Value display formats.
//!
//! A session has a global [`DisplayFormat`]; an expression may override it with a trailing
//! `,<letter>` suffix and ask for an array view with `[N]` (`ptr,x[16]`).

use crate::engine::{DebugValue, NumericValue, Scalar};
use serde::{Deserialize, Serialize};
use strum_macros::{Display, EnumString};

/// Session-wide display format.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, Deserialize, Serialize, EnumString, Display)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum DisplayFormat {
    #[default]
    Auto,
    Hex,
    Decimal,
    Binary,
}

/// When frames are presented as disassembly.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, Deserialize, Serialize, EnumString, Display)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum ShowDisassembly {
    /// Only frames without line information.
    #[default]
    Auto,
    Always,
    Never,
}

#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub enum Format {
    #[default]
    Default,
    Char,
    Hex,
    Octal,
    Decimal,
    Binary,
    Float,
    Pointer,
    Unsigned,
    CString,
    Bytes,
    BytesWithAscii,
}

impl Format {
    pub fn from_suffix(c: char) -> Option<Self> {
        Some(match c {
            'c' => Format::Char,
            'h' | 'x' => Format::Hex,
            'o' => Format::Octal,
            'd' => Format::Decimal,
            'b' => Format::Binary,
            'f' => Format::Float,
            'p' => Format::Pointer,
            'u' => Format::Unsigned,
            's' => Format::CString,
            'y' => Format::Bytes,
            'Y' => Format::BytesWithAscii,
            _ => return None,
        })
    }
}

impl From<DisplayFormat> for Format {
    fn from(value: DisplayFormat) -> Self {
        match value {
            DisplayFormat::Auto => Format::Default,
            DisplayFormat::Hex => Format::Hex,
            DisplayFormat::Decimal => Format::Decimal,
            DisplayFormat::Binary => Format::Binary,
        }
    }
}

#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct FormatSpec {
    pub format: Option<Format>,
    pub array: Option<u32>,
}

impl FormatSpec {
    pub const NONE: FormatSpec = FormatSpec {
        format: None,
        array: None,
    };
}

/// Split a trailing format suffix off an expression.
///
/// The suffix starts after the last comma and must be exactly one letter optionally followed by
/// `[N]`. Anything else (`foo, x`, `foo,x [42]`, `foo,bar`) leaves the expression untouched. An
/// unknown letter is an error.
pub fn parse_expression_format(expr: &str) -> Result<(&str, FormatSpec), String> {
    let Some(pos) = expr.rfind(',') else {
        return Ok((expr, FormatSpec::NONE));
    };
    let spec = &expr[pos + 1..];

    let (letter, rest) = match spec.chars().next() {
        Some(c) if c.is_alphabetic() => (Some(c), &spec[c.len_utf8()..]),
        _ => (None, spec),
    };

    let array = if rest.is_empty() {
        None
    } else {
        let count = rest
            .strip_prefix('[')
            .and_then(|r| r.strip_suffix(']'))
            .and_then(|n| n.parse::<u32>().ok());
        match count {
            Some(count) => Some(count),
            None => return Ok((expr, FormatSpec::NONE)),
        }
    };

    let format = match letter {
        Some(c) => Some(Format::from_suffix(c).ok_or_else(|| format!("Invalid format specifier: {c}"))?),
        None => None,
    };
    Ok((&expr[..pos], FormatSpec { format, array }))
}

/// Escape `c` for display inside `quote` delimiters.
fn escape_char(c: char, quote: char) -> String {
    match c {
        '\'' | '"' if c != quote => c.to_string(),
        c => c.escape_debug().to_string(),
    }
}

fn hex_bytes(data: &[u8]) -> String {
    data.iter()
        .map(|b| format!("{b:02x}"))
        .collect::<Vec<_>>()
        .join(" ")
}

/// Primitive rendering in an explicit format, `None` if the value does not support it.
pub fn format_scalar(value: &dyn DebugValue, format: Format) -> Option<String> {
    let size = value.byte_size().clamp(1, 8);
    match format {
        Format::Default => None,
        Format::CString => value.as_string().map(|s| {
            let escaped: String = s.chars().map(|c| escape_char(c, '"')).collect();
            format!("\"{escaped}\"")
        }),
        Format::Bytes => value.data().map(|d| hex_bytes(&d)),
        Format::BytesWithAscii => value.data().map(|d| {
            let ascii: String = d
                .iter()
                .map(|b| if b.is_ascii_graphic() || *b == b' ' { *b as char } else { '.' })
                .collect();
            format!("{}  {ascii}", hex_bytes(&d))
        }),
        _ => {
            let scalar = value.scalar()?;
            let bits = scalar.bits(size);
            Some(match format {
                Format::Hex => format!("0x{bits:0width$x}", width = size * 2),
                Format::Octal => format!("0{bits:o}"),
                Format::Binary => format!("0b{bits:0width$b}", width = size * 8),
                Format::Pointer => format!("0x{bits:016x}"),
                Format::Unsigned => bits.to_string(),
                Format::Decimal => match scalar {
                    Scalar::Float(v) => (v as i64).to_string(),
                    Scalar::Unsigned(v) => v.to_string(),
                    _ => sign_extend(bits, size).to_string(),
                },
                Format::Float => match scalar {
                    Scalar::Float(v) => v.to_string(),
                    _ if size == 4 => f32::from_bits(bits as u32).to_string(),
                    _ if size == 8 => f64::from_bits(bits).to_string(),
                    _ => return None,
                },
                Format::Char => {
                    let c = char::from_u32(bits as u32)?;
                    format!("'{}'", escape_char(c, '\''))
                }
                Format::Default | Format::CString | Format::Bytes | Format::BytesWithAscii => {
                    return None
                }
            })
        }
    }
}

fn sign_extend(bits: u64, size: usize) -> i64 {
    if size >= 8 {
        return bits as i64;
    }
    let shift = 64 - size * 8;
    ((bits << shift) as i64) >> shift
}

/// Display string of a value.
///
/// Order: read error, explicit format, value (with summary), summary, container type name,
/// `<not available>`.
pub fn render_value(value: &dyn DebugValue, format: Format) -> String {
    if let Some(err) = value.error() {
        return format!("<{err}>");
    }
    if let Some(text) = format_scalar(value, format) {
        return text;
    }
    match (value.value(), value.summary()) {
        (Some(v), Some(s)) => format!("{v} {s}"),
        (Some(v), None) => v,
        (None, Some(s)) => s,
        (None, None) if value.num_children() > 0 => value
            .type_name()
            .filter(|t| !t.is_empty())
            .unwrap_or_else(|| "{...}".to_string()),
        (None, None) => "<not available>".to_string(),
    }
}
