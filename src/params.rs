//! Lenient deserializers for MCP tool arguments.
//!
//! Agents frequently send ids and limits as strings (`"42"`) and id lists as
//! comma-separated text. These helpers accept both shapes.

use serde::{Deserialize, Deserializer};
use std::fmt::Display;
use std::str::FromStr;

#[derive(Deserialize)]
#[serde(untagged)]
enum StringOrNum<T> {
    Num(T),
    Str(String),
}

fn parse_text<T, E>(text: &str) -> Result<T, E>
where
    T: FromStr,
    T::Err: Display,
    E: serde::de::Error,
{
    text.trim().parse().map_err(E::custom)
}

/// A number given either as a JSON number or as a numeric string.
pub fn number_or_string<'de, D, T>(deserializer: D) -> Result<T, D::Error>
where
    D: Deserializer<'de>,
    T: FromStr + Deserialize<'de>,
    T::Err: Display,
{
    match StringOrNum::<T>::deserialize(deserializer)? {
        StringOrNum::Num(n) => Ok(n),
        StringOrNum::Str(s) => parse_text(&s),
    }
}

/// Like [`number_or_string`], with `null`, a missing field or `""` meaning `None`.
pub fn option_number_or_string<'de, D, T>(deserializer: D) -> Result<Option<T>, D::Error>
where
    D: Deserializer<'de>,
    T: FromStr + Deserialize<'de>,
    T::Err: Display,
{
    match Option::<StringOrNum<T>>::deserialize(deserializer)? {
        Some(StringOrNum::Num(n)) => Ok(Some(n)),
        Some(StringOrNum::Str(s)) if s.trim().is_empty() => Ok(None),
        Some(StringOrNum::Str(s)) => parse_text(&s).map(Some),
        None => Ok(None),
    }
}

/// Entity ids as `[1, "2"]`, `"1, 2 3"` or a single number.
pub fn id_list<'de, D>(deserializer: D) -> Result<Vec<i64>, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum IdList {
        One(i64),
        Many(Vec<StringOrNum<i64>>),
        Text(String),
    }

    match IdList::deserialize(deserializer)? {
        IdList::One(id) => Ok(vec![id]),
        IdList::Many(items) => items
            .into_iter()
            .map(|item| match item {
                StringOrNum::Num(n) => Ok(n),
                StringOrNum::Str(s) => parse_text(&s),
            })
            .collect(),
        IdList::Text(text) => text
            .split(|c: char| c == ',' || c.is_whitespace())
            .filter(|part| !part.is_empty())
            .map(parse_text)
            .collect(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Deserialize, Debug, PartialEq)]
    struct Args {
        #[serde(deserialize_with = "number_or_string")]
        id: i64,
        #[serde(deserialize_with = "option_number_or_string", default)]
        limit: Option<usize>,
        #[serde(deserialize_with = "id_list", default)]
        ids: Vec<i64>,
    }

    fn parse(json: &str) -> Result<Args, serde_json::Error> {
        serde_json::from_str(json)
    }

    #[test]
    fn test_numbers_and_strings() {
        assert_eq!(parse(r#"{"id": 7}"#).unwrap().id, 7);
        assert_eq!(parse(r#"{"id": " 7 "}"#).unwrap().id, 7);
        assert!(parse(r#"{"id": "seven"}"#).is_err());
    }

    #[test]
    fn test_optional_limit() {
        assert_eq!(parse(r#"{"id": 1}"#).unwrap().limit, None);
        assert_eq!(parse(r#"{"id": 1, "limit": null}"#).unwrap().limit, None);
        assert_eq!(parse(r#"{"id": 1, "limit": ""}"#).unwrap().limit, None);
        assert_eq!(parse(r#"{"id": 1, "limit": "25"}"#).unwrap().limit, Some(25));
        assert_eq!(parse(r#"{"id": 1, "limit": 3}"#).unwrap().limit, Some(3));
    }

    #[test]
    fn test_id_list_shapes() {
        assert_eq!(parse(r#"{"id": 1, "ids": [3, "4"]}"#).unwrap().ids, vec![3, 4]);
        assert_eq!(parse(r#"{"id": 1, "ids": "5, 6 7"}"#).unwrap().ids, vec![5, 6, 7]);
        assert_eq!(parse(r#"{"id": 1, "ids": 9}"#).unwrap().ids, vec![9]);
        assert!(parse(r#"{"id": 1, "ids": "5,x"}"#).is_err());
    }
}
