use serde::de::Error as _;
use serde::{Deserialize, Deserializer, Serializer};

/// Deserializes a string and hands it to `parser`, reporting failures as
/// `invalid <kind> `<raw>`: <reason>`.
pub fn parse_via_string<'de, D, T, F>(deserializer: D, kind: &str, parser: F) -> Result<T, D::Error>
where
    D: Deserializer<'de>,
    F: FnOnce(&str) -> Result<T, String>,
{
    let raw = String::deserialize(deserializer)?;
    parser(raw.trim()).map_err(|err| D::Error::custom(format!("invalid {kind} `{raw}`: {err}")))
}

/// Counterpart of [`parse_via_string`] for keyword enums.
pub fn serialize_as_str<S>(serializer: S, keyword: &str) -> Result<S::Ok, S::Error>
where
    S: Serializer,
{
    serializer.serialize_str(keyword)
}
