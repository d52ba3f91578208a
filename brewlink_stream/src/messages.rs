//! Messages exchanged with the appliance proxy

use aliri_braid::braid;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::StreamError;

/// The serial number identifying an appliance
#[braid(serde)]
pub struct SerialNumber;

/// A control message sent to the backend
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
#[serde(tag = "action", rename_all = "camelCase")]
pub enum ClientMessage {
    /// Asks for state reports from an appliance on this connection
    #[serde(rename_all = "camelCase")]
    AddAppliance {
        /// The appliance to register
        serial_number: SerialNumber,
        /// The application identifier
        app: String,
        /// The appliance model
        model: String,
    },
    /// Keeps the connection alive
    Ping,
}

impl ClientMessage {
    /// Encodes the message for the wire
    pub fn to_json(&self) -> Result<String, StreamError> {
        serde_json::to_string(self).map_err(|err| StreamError::Protocol(err.to_string()))
    }
}

/// A report of an appliance's state
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StateReport {
    /// The reporting appliance
    pub serial_number: SerialNumber,
    /// The appliance's state document
    pub data: Value,
    /// The version of the state document
    #[serde(default)]
    pub version: Option<u64>,
}

impl StateReport {
    /// The state last reported by the appliance
    pub fn reported(&self) -> Option<&Value> {
        self.data.get("reported")
    }

    /// The state most recently requested for the appliance
    pub fn desired(&self) -> Option<&Value> {
        self.data.get("desired")
    }

    /// The reported machine state, such as `asleep` or `ready`
    pub fn reported_state(&self) -> Option<&str> {
        self.reported()?.get("state")?.as_str()
    }

    /// The requested machine state
    pub fn desired_state(&self) -> Option<&str> {
        self.desired()?.get("state")?.as_str()
    }
}

/// A message received from the backend
#[derive(Clone, Debug, PartialEq)]
pub enum ServerMessage {
    /// A state report for a registered appliance
    StateReport(StateReport),
    /// The answer to a ping
    Pong,
    /// The backend refused the connection's credentials
    Forbidden,
    /// Any other well-formed message
    Other(Value),
}

impl ServerMessage {
    /// Decodes a message received as text
    pub fn from_json(text: &str) -> Result<Self, StreamError> {
        let value: Value =
            serde_json::from_str(text).map_err(|err| StreamError::Protocol(err.to_string()))?;

        match value.get("messageType").and_then(Value::as_str) {
            Some("stateReport") => serde_json::from_value(value)
                .map(Self::StateReport)
                .map_err(|err| StreamError::Protocol(format!("malformed state report: {err}"))),
            Some("pong") => Ok(Self::Pong),
            _ if value.get("message").and_then(Value::as_str) == Some("Forbidden") => {
                Ok(Self::Forbidden)
            }
            _ => Ok(Self::Other(value)),
        }
    }
}

#[cfg(test)]
mod tests {
    use color_eyre::Result;
    use serde_json::json;

    use super::*;

    #[test]
    fn add_appliance_uses_the_backend_field_names() -> Result<()> {
        let message = ClientMessage::AddAppliance {
            serial_number: SerialNumber::from_static("A1"),
            app: "sageCoffee".into(),
            model: "BES995".into(),
        };

        let encoded: Value = serde_json::from_str(&message.to_json()?)?;

        assert_eq!(
            encoded,
            json!({
                "action": "addAppliance",
                "serialNumber": "A1",
                "app": "sageCoffee",
                "model": "BES995",
            })
        );
        Ok(())
    }

    #[test]
    fn ping_is_a_bare_action() -> Result<()> {
        assert_eq!(ClientMessage::Ping.to_json()?, r#"{"action":"ping"}"#);
        Ok(())
    }

    mod when_decoding {
        use super::*;

        #[test]
        fn state_reports_expose_machine_state() -> Result<()> {
            let text = json!({
                "messageType": "stateReport",
                "serialNumber": "A1",
                "data": { "reported": { "state": "ready" }, "desired": { "state": "asleep" } },
                "version": 7,
            })
            .to_string();

            let ServerMessage::StateReport(report) = ServerMessage::from_json(&text)? else {
                panic!("expected a state report");
            };

            assert_eq!(report.serial_number.as_str(), "A1");
            assert_eq!(report.version, Some(7));
            assert_eq!(report.reported_state(), Some("ready"));
            assert_eq!(report.desired_state(), Some("asleep"));
            Ok(())
        }

        #[test]
        fn forbidden_is_recognized() -> Result<()> {
            assert_eq!(
                ServerMessage::from_json(r#"{"message":"Forbidden"}"#)?,
                ServerMessage::Forbidden
            );
            Ok(())
        }

        #[test]
        fn pong_is_recognized() -> Result<()> {
            assert_eq!(
                ServerMessage::from_json(r#"{"messageType":"pong"}"#)?,
                ServerMessage::Pong
            );
            Ok(())
        }

        #[test]
        fn unknown_messages_are_kept() -> Result<()> {
            let message = ServerMessage::from_json(r#"{"messageType":"hello"}"#)?;
            assert!(matches!(message, ServerMessage::Other(_)));
            Ok(())
        }

        #[test]
        fn invalid_json_is_a_protocol_failure() {
            assert!(matches!(
                ServerMessage::from_json("{not json"),
                Err(StreamError::Protocol(_))
            ));
        }

        #[test]
        fn a_report_without_serial_is_a_protocol_failure() {
            let text = json!({ "messageType": "stateReport", "data": {} }).to_string();
            assert!(matches!(
                ServerMessage::from_json(&text),
                Err(StreamError::Protocol(_))
            ));
        }
    }
}
