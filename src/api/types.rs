use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::{error::ErrorKind, error::MachineError, protocol::registers::validate_group};

/// Envelope returned by every command endpoint.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CommandResponse {
    pub success: bool,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub delivery_id: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorKind>,
}

impl CommandResponse {
    pub fn ok(message: impl Into<String>) -> Self {
        Self {
            success: true,
            message: message.into(),
            delivery_id: None,
            result: None,
            error: None,
        }
    }

    pub fn failed(err: &MachineError) -> Self {
        Self {
            success: false,
            message: err.to_string(),
            delivery_id: None,
            result: None,
            error: Some(err.kind()),
        }
    }

    pub fn with_delivery(mut self, id: Option<u64>) -> Self {
        self.delivery_id = id;
        self
    }

    pub fn with_result(mut self, result: Value) -> Self {
        self.result = Some(result);
        self
    }
}

/// `group_number` arrives as a JSON number or as a numeric string.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct GroupRequest {
    #[serde(default)]
    pub group_number: Option<Value>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct DeliverRequest {
    #[serde(default)]
    pub group_number: Option<Value>,
    #[serde(default)]
    pub coffee_type: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct ConnectRequest {
    #[serde(default)]
    pub port: Option<String>,
    #[serde(default)]
    pub baudrate: Option<u32>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct DispenserRequest {
    #[serde(default)]
    pub set: Option<Value>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct DeliveriesQuery {
    pub limit: Option<usize>,
}

fn parse_integer(field: &str, value: Option<&Value>) -> Result<i64, MachineError> {
    let value = value.ok_or_else(|| MachineError::invalid(format!("{field} is required")))?;
    let parsed = match value {
        Value::Number(n) => n.as_i64(),
        Value::String(s) => s.trim().parse::<i64>().ok(),
        _ => None,
    };
    parsed.ok_or_else(|| MachineError::invalid(format!("Invalid {field}: {value}")))
}

pub fn parse_group_number(value: Option<&Value>) -> Result<u8, MachineError> {
    let raw = parse_integer("group_number", value)?;
    let group = u8::try_from(raw)
        .map_err(|_| MachineError::invalid(format!("Group number must be 1-4, got {raw}")))?;
    validate_group(group)?;
    Ok(group)
}

pub fn parse_dispenser_set(value: Option<&Value>) -> Result<u16, MachineError> {
    let raw = parse_integer("set", value)?;
    u16::try_from(raw)
        .ok()
        .filter(|set| *set <= 2)
        .ok_or_else(|| MachineError::invalid(format!("Invalid set: {raw}. Must be 0, 1 or 2")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_group_number_accepts_int_and_string() {
        assert_eq!(parse_group_number(Some(&json!(2))).unwrap(), 2);
        assert_eq!(parse_group_number(Some(&json!(" 3 "))).unwrap(), 3);
    }

    #[test]
    fn test_group_number_rejections() {
        for value in [json!(0), json!(5), json!(-1), json!("two"), json!(1.5), json!(null)] {
            let err = parse_group_number(Some(&value)).unwrap_err();
            assert!(err.is_rejection(), "{value}");
        }
        let err = parse_group_number(None).unwrap_err();
        assert_eq!(err.to_string(), "group_number is required");
    }

    #[test]
    fn test_dispenser_set() {
        assert_eq!(parse_dispenser_set(Some(&json!(0))).unwrap(), 0);
        assert_eq!(parse_dispenser_set(Some(&json!("2"))).unwrap(), 2);
        assert!(parse_dispenser_set(Some(&json!(3))).is_err());
    }

    #[test]
    fn test_response_skips_empty_fields() {
        let json = serde_json::to_value(CommandResponse::ok("done")).unwrap();
        assert_eq!(json, json!({"success": true, "message": "done"}));

        let failed = CommandResponse::failed(&MachineError::GroupBusy { group: 1 }).with_delivery(Some(7));
        let json = serde_json::to_value(failed).unwrap();
        assert_eq!(json["error"], "group_busy");
        assert_eq!(json["delivery_id"], 7);
    }
}
