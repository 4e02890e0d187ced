//! Line item model for fieldops-service.

use super::DocumentRef;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;
use validator::Validate;

/// Category of a priced row.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LineItemType {
    #[default]
    Service,
    Labor,
    Material,
    Equipment,
    Other,
}

impl LineItemType {
    pub fn as_str(&self) -> &'static str {
        match self {
            LineItemType::Service => "service",
            LineItemType::Labor => "labor",
            LineItemType::Material => "material",
            LineItemType::Equipment => "equipment",
            LineItemType::Other => "other",
        }
    }
}

impl fmt::Display for LineItemType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for LineItemType {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "service" => Ok(LineItemType::Service),
            "labor" => Ok(LineItemType::Labor),
            "material" => Ok(LineItemType::Material),
            "equipment" => Ok(LineItemType::Equipment),
            "other" => Ok(LineItemType::Other),
            other => Err(anyhow::anyhow!("Unknown line item type '{}'", other)),
        }
    }
}

/// Line item on a quote or invoice.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LineItem {
    pub line_item_id: Uuid,
    pub org_id: Uuid,
    pub document: DocumentRef,
    pub position: i32,
    pub item_type: LineItemType,
    pub description: String,
    pub quantity: Decimal,
    pub unit: Option<String>,
    pub unit_price: Decimal,
    pub line_total: Decimal,
    pub is_optional: bool,
    pub created_utc: DateTime<Utc>,
    pub updated_utc: DateTime<Utc>,
}

/// Input for a new line item.
#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
pub struct NewLineItem {
    #[serde(default)]
    pub item_type: LineItemType,
    #[validate(length(min = 1, max = 500, message = "Description is required"))]
    pub description: String,
    pub quantity: Decimal,
    #[serde(default)]
    pub unit: Option<String>,
    pub unit_price: Decimal,
    #[serde(default)]
    pub is_optional: bool,
    /// Requested position; appended after existing items when omitted.
    #[serde(default)]
    pub position: Option<i32>,
}

/// Field changes for an existing line item.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LineItemPatch {
    pub item_type: Option<LineItemType>,
    pub description: Option<String>,
    pub quantity: Option<Decimal>,
    pub unit: Option<String>,
    pub unit_price: Option<Decimal>,
    pub is_optional: Option<bool>,
    pub position: Option<i32>,
}

/// One command in a line item edit.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum LineItemChange {
    Add {
        #[serde(flatten)]
        item: NewLineItem,
    },
    Update {
        line_item_id: Uuid,
        #[serde(flatten)]
        patch: LineItemPatch,
    },
    Remove {
        line_item_id: Uuid,
    },
}
