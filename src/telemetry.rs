use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

/// Field name to raw reply value, exactly as the modem printed it.
pub type FieldMap = BTreeMap<String, String>;

/// Per-technology readings of one sample.
pub type Readings = BTreeMap<TechnologyTag, TechnologyRecord>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum TechnologyTag {
    #[serde(rename = "LTE")]
    Lte,
    #[serde(rename = "NR")]
    Nr,
    // Tags written by a newer poller land here instead of failing the load.
    #[serde(other)]
    Unknown,
}

impl fmt::Display for TechnologyTag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TechnologyTag::Lte => write!(f, "LTE"),
            TechnologyTag::Nr => write!(f, "NR"),
            TechnologyTag::Unknown => write!(f, "Unknown"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum TechnologyRecord {
    Lte(FieldMap),
    Nr(FieldMap),
    Unknown(FieldMap),
}

impl TechnologyRecord {
    pub fn new(tag: TechnologyTag, fields: FieldMap) -> Self {
        match tag {
            TechnologyTag::Lte => TechnologyRecord::Lte(fields),
            TechnologyTag::Nr => TechnologyRecord::Nr(fields),
            TechnologyTag::Unknown => TechnologyRecord::Unknown(fields),
        }
    }

    pub fn tag(&self) -> TechnologyTag {
        match self {
            TechnologyRecord::Lte(_) => TechnologyTag::Lte,
            TechnologyRecord::Nr(_) => TechnologyTag::Nr,
            TechnologyRecord::Unknown(_) => TechnologyTag::Unknown,
        }
    }

    pub fn fields(&self) -> &FieldMap {
        match self {
            TechnologyRecord::Lte(fields)
            | TechnologyRecord::Nr(fields)
            | TechnologyRecord::Unknown(fields) => fields,
        }
    }

    pub fn get(&self, field: &str) -> Option<&str> {
        self.fields().get(field).map(String::as_str)
    }
}

/// One poll tick worth of readings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Sample {
    pub timestamp: DateTime<Utc>,
    #[serde(default, with = "readings_by_tag")]
    pub readings: Readings,
}

impl Sample {
    pub fn new(timestamp: DateTime<Utc>) -> Self {
        Self {
            timestamp,
            readings: Readings::new(),
        }
    }

    /// Merge a parse result; a later record replaces an earlier one of the same tag.
    pub fn merge(&mut self, readings: Readings) {
        self.readings.extend(readings);
    }

    pub fn is_empty(&self) -> bool {
        self.readings.is_empty()
    }

    pub fn reading(&self, tag: TechnologyTag) -> Option<&TechnologyRecord> {
        self.readings.get(&tag)
    }
}

// Readings are stored as `tag -> fields`; the record variant is rebuilt from
// the key so the tag is only written once per reading.
mod readings_by_tag {
    use super::{FieldMap, Readings, TechnologyRecord, TechnologyTag};
    use serde::{Deserialize, Deserializer, Serialize, Serializer};
    use std::collections::BTreeMap;

    pub fn serialize<S: Serializer>(readings: &Readings, serializer: S) -> Result<S::Ok, S::Error> {
        readings
            .iter()
            .map(|(tag, record)| (*tag, record.fields()))
            .collect::<BTreeMap<TechnologyTag, &FieldMap>>()
            .serialize(serializer)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Readings, D::Error> {
        let raw = BTreeMap::<TechnologyTag, FieldMap>::deserialize(deserializer)?;
        Ok(raw
            .into_iter()
            .map(|(tag, fields)| (tag, TechnologyRecord::new(tag, fields)))
            .collect())
    }
}
