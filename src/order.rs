//! Order records as delivered by the remote feed, plus the status chain that
//! bounds every order's lifecycle.

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use serde_json::Value;
use std::fmt;
use std::str::FromStr;

// ---------------------------------------------------------------------------
// Status
// ---------------------------------------------------------------------------

/// Lifecycle status of an order.
///
/// The only legal transitions are
/// `awaiting-approval -> processing | rejected`,
/// `processing -> out-for-delivery` and `out-for-delivery -> complete`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum OrderStatus {
    AwaitingApproval,
    Processing,
    OutForDelivery,
    Complete,
    Rejected,
}

impl OrderStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            OrderStatus::AwaitingApproval => "awaiting-approval",
            OrderStatus::Processing => "processing",
            OrderStatus::OutForDelivery => "out-for-delivery",
            OrderStatus::Complete => "complete",
            OrderStatus::Rejected => "rejected",
        }
    }

    /// Position in the lifecycle. Races between a poll echo and a local
    /// action resolve in favour of the higher rank.
    pub fn rank(self) -> u8 {
        match self {
            OrderStatus::AwaitingApproval => 0,
            OrderStatus::Processing => 1,
            OrderStatus::OutForDelivery => 2,
            OrderStatus::Complete | OrderStatus::Rejected => 3,
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, OrderStatus::Complete | OrderStatus::Rejected)
    }

    /// Single-step transition check.
    pub fn can_transition_to(self, next: OrderStatus) -> bool {
        matches!(
            (self, next),
            (OrderStatus::AwaitingApproval, OrderStatus::Processing)
                | (OrderStatus::AwaitingApproval, OrderStatus::Rejected)
                | (OrderStatus::Processing, OrderStatus::OutForDelivery)
                | (OrderStatus::OutForDelivery, OrderStatus::Complete)
        )
    }

    /// Legal steps leading from `self` to `target`, excluding `self`.
    ///
    /// Returns `None` when `target` is not reachable (lower rank, same
    /// status, or `rejected` after approval).
    pub fn path_to(self, target: OrderStatus) -> Option<Vec<OrderStatus>> {
        if target == OrderStatus::Rejected {
            return self
                .can_transition_to(OrderStatus::Rejected)
                .then(|| vec![OrderStatus::Rejected]);
        }
        if target.rank() <= self.rank() {
            return None;
        }
        let mut path = Vec::new();
        let mut current = self;
        while current != target {
            current = match current {
                OrderStatus::AwaitingApproval => OrderStatus::Processing,
                OrderStatus::Processing => OrderStatus::OutForDelivery,
                OrderStatus::OutForDelivery => OrderStatus::Complete,
                OrderStatus::Complete | OrderStatus::Rejected => return None,
            };
            path.push(current);
        }
        Some(path)
    }

    /// Actions the operator may trigger while an order sits in this status.
    pub fn available_actions(self) -> &'static [ActionKind] {
        match self {
            OrderStatus::AwaitingApproval => &[ActionKind::Approve, ActionKind::Reject],
            OrderStatus::Processing => &[ActionKind::UpdateEta, ActionKind::Advance],
            OrderStatus::OutForDelivery => &[ActionKind::Complete],
            OrderStatus::Complete | OrderStatus::Rejected => &[],
        }
    }
}

impl fmt::Display for OrderStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for OrderStatus {
    type Err = String;

    /// Accepts the canonical hyphenated names plus the underscore and legacy
    /// spellings the admin side has used over time.
    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        let normalized = raw.trim().to_ascii_lowercase().replace(['_', ' '], "-");
        match normalized.as_str() {
            "awaiting-approval" | "pending" | "new" => Ok(OrderStatus::AwaitingApproval),
            "processing" | "approved" | "confirmed" | "preparing" => Ok(OrderStatus::Processing),
            "out-for-delivery" | "out" | "delivering" => Ok(OrderStatus::OutForDelivery),
            "complete" | "completed" | "delivered" => Ok(OrderStatus::Complete),
            "rejected" | "declined" | "cancelled" | "canceled" => Ok(OrderStatus::Rejected),
            _ => Err(format!("unknown order status: {raw}")),
        }
    }
}

impl Serialize for OrderStatus {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(self.as_str())
    }
}

impl<'de> Deserialize<'de> for OrderStatus {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        raw.parse().map_err(serde::de::Error::custom)
    }
}

/// Operator-facing action affordances.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ActionKind {
    Approve,
    UpdateEta,
    Reject,
    Advance,
    Complete,
}

// ---------------------------------------------------------------------------
// Records
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LineItem {
    #[serde(default, deserialize_with = "text_or_number")]
    pub name: String,
    #[serde(default = "one", alias = "quantity")]
    pub qty: u32,
}

fn one() -> u32 {
    1
}

/// Capability URLs attached to an order. Each one authorises a single
/// state-changing call.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct OrderActions {
    #[serde(default, alias = "approve_url")]
    pub approve: Option<String>,
    #[serde(default, alias = "reject_url")]
    pub reject: Option<String>,
    #[serde(default, alias = "eta_url", alias = "setEta")]
    pub set_eta: Option<String>,
    #[serde(default, alias = "out_url", alias = "out_for_delivery")]
    pub out: Option<String>,
    #[serde(default, alias = "complete_url")]
    pub complete: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OrderRecord {
    #[serde(deserialize_with = "order_id")]
    pub id: u64,
    #[serde(default, alias = "order_number", deserialize_with = "text_or_number")]
    pub number: String,
    pub status: OrderStatus,
    #[serde(default, alias = "customer_name", deserialize_with = "text_or_number")]
    pub customer: String,
    #[serde(default, alias = "total_amount", deserialize_with = "text_or_number")]
    pub total: String,
    #[serde(default, deserialize_with = "text_or_number")]
    pub address: String,
    #[serde(default, deserialize_with = "text_or_number")]
    pub phone: String,
    #[serde(default, alias = "notes", deserialize_with = "text_or_number")]
    pub note: String,
    #[serde(default, alias = "estimated_time", deserialize_with = "optional_text")]
    pub arrival: Option<String>,
    #[serde(default)]
    pub items: Vec<LineItem>,
    /// Minutes promised to the customer; set locally on approve / update-eta.
    #[serde(default)]
    pub eta: Option<u32>,
    #[serde(default)]
    pub actions: OrderActions,
}

impl OrderRecord {
    pub fn from_value(value: &Value) -> Result<Self, String> {
        serde_json::from_value(value.clone()).map_err(|e| format!("invalid order record: {e}"))
    }

    /// Capability URL that performs `action` on this order.
    pub fn capability(&self, action: ActionKind) -> Option<&str> {
        let url = match action {
            ActionKind::Approve => self.actions.approve.as_deref(),
            // update-eta shares the approve endpoint unless a dedicated one is given
            ActionKind::UpdateEta => self
                .actions
                .set_eta
                .as_deref()
                .or(self.actions.approve.as_deref()),
            ActionKind::Reject => self.actions.reject.as_deref(),
            ActionKind::Advance => self.actions.out.as_deref(),
            ActionKind::Complete => self.actions.complete.as_deref(),
        };
        url.map(str::trim).filter(|u| !u.is_empty())
    }

    pub fn available_actions(&self) -> &'static [ActionKind] {
        self.status.available_actions()
    }
}

// ---------------------------------------------------------------------------
// Lenient field decoding
// ---------------------------------------------------------------------------

fn order_id<'de, D: Deserializer<'de>>(deserializer: D) -> Result<u64, D::Error> {
    match Value::deserialize(deserializer)? {
        Value::Number(n) => n
            .as_u64()
            .ok_or_else(|| serde::de::Error::custom("order id must be a non-negative integer")),
        Value::String(s) => s
            .trim()
            .parse::<u64>()
            .map_err(|_| serde::de::Error::custom(format!("invalid order id: {s}"))),
        other => Err(serde::de::Error::custom(format!("invalid order id: {other}"))),
    }
}

fn text_or_number<'de, D: Deserializer<'de>>(deserializer: D) -> Result<String, D::Error> {
    Ok(optional_text(deserializer)?.unwrap_or_default())
}

fn optional_text<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Option<String>, D::Error> {
    Ok(match Value::deserialize(deserializer)? {
        Value::String(s) => {
            let trimmed = s.trim();
            (!trimmed.is_empty()).then(|| trimmed.to_string())
        }
        Value::Number(n) => Some(n.to_string()),
        Value::Bool(b) => Some(b.to_string()),
        _ => None,
    })
}
