//! The metadata record and its on-disk encoding.
//!
//! `meta` files use the same line-oriented `key = value` format as Java's
//! `java.util.Properties`: one `key = value` pair per line, `\`, `\n`, `\r`,
//! `\t`, `=`, `:`, `#`, `!` and non-ASCII bytes backslash-escaped on write,
//! and `#`/`!`-prefixed lines treated as comments. No existing crate
//! reproduces those exact escaping rules, so the codec is hand-rolled here.

use std::collections::BTreeMap;
use std::fmt;

/// Current lifecycle state of a content entry. Ordered the way I3 requires
/// transitions to advance; `PartialOrd`/`Ord` are not derived because the
/// state machine validates transitions explicitly rather than by comparing
/// enum discriminants.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Status {
    Stored,
    Waiting,
    Transforming,
    Transformed,
    Failed,
}

impl Status {
    fn as_str(self) -> &'static str {
        match self {
            Status::Stored => "stored",
            Status::Waiting => "waiting",
            Status::Transforming => "transforming",
            Status::Transformed => "transformed",
            Status::Failed => "failed",
        }
    }

    fn parse(s: &str) -> Option<Self> {
        Some(match s {
            "stored" => Status::Stored,
            "waiting" => Status::Waiting,
            "transforming" => Status::Transforming,
            "transformed" => Status::Transformed,
            "failed" => Status::Failed,
            _ => return None,
        })
    }
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Source media type, per the `source.type` field.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SourceType {
    Jpg,
    Png,
}

impl SourceType {
    pub fn as_str(self) -> &'static str {
        match self {
            SourceType::Jpg => "JPG",
            SourceType::Png => "PNG",
        }
    }

    pub fn mime(self) -> &'static str {
        match self {
            SourceType::Jpg => "image/jpeg",
            SourceType::Png => "image/png",
        }
    }

    pub fn extension(self) -> &'static str {
        match self {
            SourceType::Jpg => "jpg",
            SourceType::Png => "png",
        }
    }

    fn parse(s: &str) -> Option<Self> {
        Some(match s {
            "JPG" => SourceType::Jpg,
            "PNG" => SourceType::Png,
            _ => return None,
        })
    }

    /// Maps an HTTP `Content-Type` to the corresponding source type. This is
    /// the "later, corrected" mapping described in spec section 9 — JPEG and
    /// PNG are distinguished, not both folded into `JPG`.
    pub fn from_mime(mime: &str) -> Option<Self> {
        match mime {
            "image/jpeg" => Some(SourceType::Jpg),
            "image/png" => Some(SourceType::Png),
            _ => None,
        }
    }
}

/// The full metadata record for a content entry, per the data model table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Metadata {
    pub content_id: String,
    pub status: Status,
    pub stored_datetime: chrono::NaiveDateTime,
    pub source_name: Option<String>,
    pub source_type: SourceType,
    pub source_quality: u32,
    pub source_size: u64,
    pub target_quality: Option<u32>,
    pub target_size: Option<u64>,
    /// Keys outside the enumerated schema, preserved verbatim so a
    /// parse-then-serialize round-trip does not lose information (P6).
    pub extra: BTreeMap<String, String>,
}

impl Metadata {
    /// Builds the initial record written at admission, in the `stored`
    /// state. `target.*` fields are unset until the job completes.
    pub fn new_stored(
        content_id: String,
        stored_datetime: chrono::NaiveDateTime,
        source_name: Option<String>,
        source_type: SourceType,
        source_quality: u32,
        source_size: u64,
    ) -> Self {
        Metadata {
            content_id,
            status: Status::Stored,
            stored_datetime,
            source_name,
            source_type,
            source_quality,
            source_size,
            target_quality: None,
            target_size: None,
            extra: BTreeMap::new(),
        }
    }
}

const DATETIME_FORMAT: &str = "%Y-%m-%dT%H:%M:%S%.9f";

/// Errors from parsing a `meta` file's contents.
#[derive(Debug, thiserror::Error)]
pub enum MetaError {
    #[error("metadata is missing required field '{0}'")]
    MissingField(&'static str),
    #[error("metadata field '{0}' has an invalid value: {1}")]
    InvalidField(&'static str, String),
}

/// Serializes a metadata record into the properties-file text format.
pub fn serialize(meta: &Metadata) -> String {
    let mut out = String::new();
    push_line(&mut out, "contentId", &meta.content_id);
    push_line(&mut out, "process.status", meta.status.as_str());
    push_line(
        &mut out,
        "stored.datetime",
        &meta.stored_datetime.format(DATETIME_FORMAT).to_string(),
    );
    if let Some(name) = &meta.source_name {
        push_line(&mut out, "source.name", name);
    }
    push_line(&mut out, "source.type", meta.source_type.as_str());
    push_line(&mut out, "source.quality", &meta.source_quality.to_string());
    push_line(&mut out, "source.size", &meta.source_size.to_string());
    if let Some(q) = meta.target_quality {
        push_line(&mut out, "target.quality", &q.to_string());
    }
    if let Some(s) = meta.target_size {
        push_line(&mut out, "target.size", &s.to_string());
    }
    for (k, v) in &meta.extra {
        push_line(&mut out, k, v);
    }
    out
}

fn push_line(out: &mut String, key: &str, value: &str) {
    out.push_str(&escape(key));
    out.push_str(" = ");
    out.push_str(&escape(value));
    out.push('\n');
}

/// Escapes a key or value per the properties-format rules: backslash,
/// newline, carriage return, tab, `=`, `:`, and a leading or trailing space
/// are backslash-escaped; everything else (including non-ASCII) is passed
/// through verbatim since the files are UTF-8, not the original ISO-8859-1.
/// Escaping the outermost spaces (rather than every space) keeps the common
/// case readable while still round-tripping a value like `" photo.jpg "`
/// intact through `parse_lines`'s `trim_start`/`trim_end` of the separator
/// whitespace (P6).
fn escape(s: &str) -> String {
    let last = s.chars().count().saturating_sub(1);
    let mut out = String::with_capacity(s.len());
    for (i, c) in s.chars().enumerate() {
        match c {
            '\\' => out.push_str("\\\\"),
            '\n' => out.push_str("\\n"),
            '\r' => out.push_str("\\r"),
            '\t' => out.push_str("\\t"),
            '=' => out.push_str("\\="),
            ':' => out.push_str("\\:"),
            '#' => out.push_str("\\#"),
            '!' => out.push_str("\\!"),
            ' ' if i == 0 || i == last => out.push_str("\\ "),
            other => out.push(other),
        }
    }
    out
}

fn unescape(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    let mut chars = s.chars();
    while let Some(c) = chars.next() {
        if c == '\\' {
            match chars.next() {
                Some('n') => out.push('\n'),
                Some('r') => out.push('\r'),
                Some('t') => out.push('\t'),
                Some(other) => out.push(other),
                None => {}
            }
        } else {
            out.push(c);
        }
    }
    out
}

/// Parses raw `meta` file text into a `BTreeMap`, splitting each `key =
/// value` line and unescaping both sides. Blank lines and lines starting
/// with `#` or `!` are comments and skipped.
fn parse_lines(raw: &str) -> BTreeMap<String, String> {
    let mut map = BTreeMap::new();
    for line in raw.lines() {
        let trimmed = line.trim();
        if trimmed.is_empty() || trimmed.starts_with('#') || trimmed.starts_with('!') {
            continue;
        }
        if let Some(idx) = find_unescaped_separator(trimmed) {
            let key = unescape(trimmed[..idx].trim_end());
            let value = unescape(trimmed[idx + 1..].trim_start());
            map.insert(key, value);
        }
    }
    map
}

/// Finds the byte index of the first unescaped `=` or `:` separating key
/// from value.
fn find_unescaped_separator(s: &str) -> Option<usize> {
    let bytes = s.as_bytes();
    let mut i = 0;
    let mut escaped = false;
    while i < bytes.len() {
        let b = bytes[i];
        if escaped {
            escaped = false;
        } else if b == b'\\' {
            escaped = true;
        } else if b == b'=' || b == b':' {
            return Some(i);
        }
        i += 1;
    }
    None
}

/// Parses a full `meta` file into a `Metadata` record.
pub fn parse(raw: &str) -> Result<Metadata, MetaError> {
    let mut fields = parse_lines(raw);

    let content_id = fields
        .remove("contentId")
        .ok_or(MetaError::MissingField("contentId"))?;

    let status_raw = fields
        .remove("process.status")
        .ok_or(MetaError::MissingField("process.status"))?;
    let status = Status::parse(&status_raw)
        .ok_or_else(|| MetaError::InvalidField("process.status", status_raw.clone()))?;

    let datetime_raw = fields
        .remove("stored.datetime")
        .ok_or(MetaError::MissingField("stored.datetime"))?;
    let stored_datetime = parse_datetime(&datetime_raw)
        .ok_or_else(|| MetaError::InvalidField("stored.datetime", datetime_raw.clone()))?;

    let source_name = fields.remove("source.name");

    let source_type_raw = fields
        .remove("source.type")
        .ok_or(MetaError::MissingField("source.type"))?;
    let source_type = SourceType::parse(&source_type_raw)
        .ok_or_else(|| MetaError::InvalidField("source.type", source_type_raw.clone()))?;

    let source_quality = fields
        .remove("source.quality")
        .ok_or(MetaError::MissingField("source.quality"))?
        .parse::<u32>()
        .map_err(|_| MetaError::InvalidField("source.quality", "not an integer".into()))?;

    let source_size = fields
        .remove("source.size")
        .ok_or(MetaError::MissingField("source.size"))?
        .parse::<u64>()
        .map_err(|_| MetaError::InvalidField("source.size", "not an integer".into()))?;

    let target_quality = match fields.remove("target.quality") {
        Some(v) => Some(
            v.parse::<u32>()
                .map_err(|_| MetaError::InvalidField("target.quality", "not an integer".into()))?,
        ),
        None => None,
    };

    let target_size = match fields.remove("target.size") {
        Some(v) => Some(
            v.parse::<u64>()
                .map_err(|_| MetaError::InvalidField("target.size", "not an integer".into()))?,
        ),
        None => None,
    };

    Ok(Metadata {
        content_id,
        status,
        stored_datetime,
        source_name,
        source_type,
        source_quality,
        source_size,
        target_quality,
        target_size,
        extra: fields,
    })
}

fn parse_datetime(s: &str) -> Option<chrono::NaiveDateTime> {
    // Accept both the fractional-second form we emit and a bare-seconds form,
    // so hand-edited or foreign-writer files still parse.
    chrono::NaiveDateTime::parse_from_str(s, DATETIME_FORMAT)
        .or_else(|_| chrono::NaiveDateTime::parse_from_str(s, "%Y-%m-%dT%H:%M:%S"))
        .ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> Metadata {
        Metadata::new_stored(
            "0123456789abcdef0123456789abcdef".into(),
            chrono::NaiveDate::from_ymd_opt(2026, 1, 2)
                .unwrap()
                .and_hms_opt(3, 4, 5)
                .unwrap(),
            Some("photo.jpg".into()),
            SourceType::Jpg,
            87,
            12345,
        )
    }

    #[test]
    fn round_trips_a_stored_record() {
        let meta = sample();
        let text = serialize(&meta);
        let parsed = parse(&text).expect("parses");
        assert_eq!(parsed, meta);
    }

    #[test]
    fn round_trips_a_transformed_record_with_unknown_keys() {
        let mut meta = sample();
        meta.status = Status::Transformed;
        meta.target_quality = Some(42);
        meta.target_size = Some(999);
        meta.extra.insert("legacy.flag".into(), "yes".into());

        let text = serialize(&meta);
        let parsed = parse(&text).expect("parses");
        assert_eq!(parsed, meta);
    }

    #[test]
    fn escapes_and_unescapes_special_characters_in_values() {
        let mut meta = sample();
        meta.source_name = Some("weird: name = with\ttabs\nand newlines".into());
        let text = serialize(&meta);
        let parsed = parse(&text).expect("parses");
        assert_eq!(parsed.source_name, meta.source_name);
    }

    #[test]
    fn round_trips_leading_and_trailing_whitespace_in_a_value() {
        let mut meta = sample();
        meta.source_name = Some(" photo.jpg ".into());
        let text = serialize(&meta);
        let parsed = parse(&text).expect("parses");
        assert_eq!(parsed.source_name, meta.source_name);
    }

    #[test]
    fn missing_field_is_reported() {
        let err = parse("contentId = abc\n").unwrap_err();
        assert!(matches!(err, MetaError::MissingField("process.status")));
    }

    #[test]
    fn png_always_reports_quality_100() {
        let mut meta = sample();
        meta.source_type = SourceType::Png;
        meta.source_quality = 100;
        let text = serialize(&meta);
        let parsed = parse(&text).unwrap();
        assert_eq!(parsed.source_type, SourceType::Png);
        assert_eq!(parsed.source_quality, 100);
    }
}
