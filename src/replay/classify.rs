//! Record classification and per-flow-point deduplication.

use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::errors::PayloadParseError;

const IDENTITY_PATH: &str = "/applicants/0/applicantinfo/app_id";
const FLOW_POINT_PATH: &str = "/requestdesc/fromflowpoint";

/// Priority category of a decision request.
///
/// Declaration order is replay order: every `Af1001` record must be applied downstream
/// before any `Af1002` record is sent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum FlowPoint {
    #[serde(rename = "AF1001")]
    Af1001,
    #[serde(rename = "AF1002")]
    Af1002,
}

impl FlowPoint {
    pub const PRIORITY_ORDER: [FlowPoint; 2] = [FlowPoint::Af1001, FlowPoint::Af1002];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Af1001 => "AF1001",
            Self::Af1002 => "AF1002",
        }
    }

    /// Exact, case-sensitive match on the token found in the payload.
    pub fn from_token(token: &str) -> Option<Self> {
        Self::PRIORITY_ORDER
            .into_iter()
            .find(|fp| fp.as_str() == token)
    }
}

impl fmt::Display for FlowPoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Category {
    Known(FlowPoint),
    /// Token that matched no flow point. Such records are never replayed.
    Unknown(String),
}

/// A parsed capture. `payload` is forwarded downstream byte for byte.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequestRecord {
    pub identity: String,
    pub category: Category,
    pub payload: String,
}

impl RequestRecord {
    pub fn flow_point(&self) -> Option<FlowPoint> {
        match self.category {
            Category::Known(fp) => Some(fp),
            Category::Unknown(_) => None,
        }
    }
}

/// Parses one raw payload into a [`RequestRecord`].
pub fn classify_payload(raw: &str) -> Result<RequestRecord, PayloadParseError> {
    let value: Value = serde_json::from_str(raw).map_err(PayloadParseError::InvalidJson)?;

    let identity = value
        .pointer(IDENTITY_PATH)
        .and_then(scalar_text)
        .ok_or(PayloadParseError::MissingField("applicants[0].applicantinfo.app_id"))?;
    let token = value
        .pointer(FLOW_POINT_PATH)
        .and_then(scalar_text)
        .ok_or(PayloadParseError::MissingField("requestdesc.fromflowpoint"))?;

    let category = match FlowPoint::from_token(&token) {
        Some(fp) => Category::Known(fp),
        None => Category::Unknown(token),
    };

    Ok(RequestRecord {
        identity,
        category,
        payload: raw.to_string(),
    })
}

// Identifiers are sometimes logged as bare numbers.
fn scalar_text(value: &Value) -> Option<String> {
    match value {
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

/// Identity -> surviving record for one flow point.
pub type CategoryMap = HashMap<String, Arc<RequestRecord>>;

/// What happened to a record offered to [`CategoryMaps::insert`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Insertion {
    Inserted(FlowPoint),
    /// An earlier record with the same identity in the same flow point was overwritten.
    Replaced(FlowPoint),
    Discarded { token: String },
}

/// Last-write-wins maps, one per flow point. Built single-threaded during the scan and
/// read-only once replay starts.
#[derive(Debug, Default)]
pub struct CategoryMaps {
    maps: BTreeMap<FlowPoint, CategoryMap>,
}

impl CategoryMaps {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, record: RequestRecord) -> Insertion {
        let flow_point = match &record.category {
            Category::Known(fp) => *fp,
            Category::Unknown(token) => {
                return Insertion::Discarded {
                    token: token.clone(),
                }
            }
        };

        let map = self.maps.entry(flow_point).or_default();
        match map.insert(record.identity.clone(), Arc::new(record)) {
            Some(_) => Insertion::Replaced(flow_point),
            None => Insertion::Inserted(flow_point),
        }
    }

    pub fn get(&self, flow_point: FlowPoint) -> Option<&CategoryMap> {
        self.maps.get(&flow_point)
    }

    pub fn len(&self, flow_point: FlowPoint) -> usize {
        self.maps.get(&flow_point).map_or(0, HashMap::len)
    }

    /// Records that will be replayed across all flow points.
    pub fn total(&self) -> usize {
        self.maps.values().map(HashMap::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.total() == 0
    }
}
