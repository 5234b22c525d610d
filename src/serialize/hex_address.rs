//! Serialize addresses as `"0x..."` strings. JSON consumers lose precision on
//! integers above 2^53, and hex is what people grep logs for anyway.

use serde::Serializer;

pub fn serialize<S>(value: &u64, serializer: S) -> Result<S::Ok, S::Error>
where
    S: Serializer,
{
    serializer.collect_str(&format_args!("{value:#x}"))
}

/// Same as [`serialize`], for optional fields
pub mod option {
    use serde::Serializer;

    pub fn serialize<S>(value: &Option<u64>, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        match value {
            Some(value) => super::serialize(value, serializer),
            None => serializer.serialize_none(),
        }
    }
}
