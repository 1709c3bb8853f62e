//! JSON requests from the operator.
//!
//! A request is `{"MessageType", "SequenceNumber", "MessageData"}`. The
//! response echoes the first two and carries either `MessageData` or
//! `Error`. Sequence number `0` asks for no response at all.

use relaymesh_transport::{type_hash, ByteWriter};
use serde::Deserialize;
use serde_json::{json, Value};

use crate::gate::GateRelay;
use crate::identifiers::{AgentId, DeviceId, RouteId};
use crate::procedures::command;
use crate::ProtocolError;

/// One construction argument, typed the way device builders read it.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(untagged)]
pub enum DeviceArgument {
    Bool(bool),
    Number(u32),
    Text(String),
}

/// Encode an argument list in the device codec layout.
pub fn encode_arguments(arguments: &[DeviceArgument]) -> Vec<u8> {
    let mut w = ByteWriter::new();
    for argument in arguments {
        match argument {
            DeviceArgument::Bool(b) => w.write_bool(*b),
            DeviceArgument::Number(n) => w.write_u32(*n),
            DeviceArgument::Text(s) => w.write_str(s),
        };
    }
    w.into_vec()
}

/// A relay command in operator form.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(tag = "Command", rename_all_fields = "PascalCase")]
pub enum CommandSpec {
    AddDevice {
        type_name: String,
        #[serde(default)]
        negotiation: bool,
        #[serde(default)]
        device: Option<DeviceId>,
        #[serde(default)]
        arguments: Vec<DeviceArgument>,
    },
    Close,
    UpdateJitter {
        min: f32,
        max: f32,
    },
    CreateRoute {
        route: RouteId,
        device: DeviceId,
        #[serde(default)]
        is_neighbour: bool,
    },
    RemoveRoute {
        route: RouteId,
    },
    #[serde(rename = "SetGRC")]
    SetGrc {
        device: DeviceId,
    },
    Ping,
    ClearNetwork,
    /// Pre-encoded command bytes, passed through as-is.
    Raw {
        hex: String,
    },
}

impl CommandSpec {
    pub fn encode(&self) -> Result<Vec<u8>, ProtocolError> {
        let bytes = match self {
            CommandSpec::AddDevice {
                type_name,
                negotiation,
                device,
                arguments,
            } => command::add_device(
                device.unwrap_or(DeviceId::NULL),
                *negotiation,
                type_hash(type_name),
                &encode_arguments(arguments),
            ),
            CommandSpec::Close => command::close(),
            CommandSpec::UpdateJitter { min, max } => command::update_jitter(*min, *max),
            CommandSpec::CreateRoute {
                route,
                device,
                is_neighbour,
            } => command::create_route(*route, *device, *is_neighbour),
            CommandSpec::RemoveRoute { route } => command::remove_route(*route),
            CommandSpec::SetGrc { device } => command::set_grc(*device),
            CommandSpec::Ping => command::ping(),
            CommandSpec::ClearNetwork => command::clear_network(),
            CommandSpec::Raw { hex } => hex::decode(hex)
                .map_err(|e| ProtocolError::Parse(format!("raw command is not hex: {e}")))?,
        };
        Ok(bytes)
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(tag = "Action", rename_all_fields = "PascalCase")]
pub enum OperatorAction {
    GetAgents,
    AgentCommand {
        agent: AgentId,
        command: CommandSpec,
    },
    DeviceCommand {
        agent: AgentId,
        device: DeviceId,
        command: CommandSpec,
    },
    GatewayCommand {
        command: CommandSpec,
    },
    BanAgent {
        agent: AgentId,
        #[serde(default = "banned_by_default")]
        banned: bool,
    },
    TurnOnConnector {
        name: String,
        #[serde(default)]
        arguments: Vec<DeviceArgument>,
    },
    TurnOffConnector {
        name: String,
    },
    /// Connector-specific command, payload in hex.
    ConnectorCommand {
        name: String,
        #[serde(default)]
        payload: String,
    },
}

fn banned_by_default() -> bool {
    true
}

impl GateRelay {
    /// Handle one decrypted operator request. `None` when no response is due.
    pub async fn handle_operator_message(&self, message: Value) -> Option<Value> {
        let message_type = message
            .get("MessageType")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string();
        let sequence = message
            .get("SequenceNumber")
            .and_then(Value::as_u64)
            .unwrap_or(0);
        let data = message.get("MessageData").cloned().unwrap_or(Value::Null);

        let result = match message_type.as_str() {
            "Action" => self.handle_action(data).await,
            "Error" => {
                tracing::warn!(error = %data, "operator reported an error");
                Ok(Value::Null)
            }
            other => Err(ProtocolError::Parse(format!(
                "unknown operator message type {other:?}"
            ))),
        };
        if let Err(e) = &result {
            e.report("operator request failed", None);
        }
        if sequence == 0 {
            return None;
        }

        let mut response = json!({
            "MessageType": message_type,
            "SequenceNumber": sequence,
        });
        match result {
            Ok(data) => response["MessageData"] = data,
            Err(e) => response["Error"] = Value::String(e.to_string()),
        }
        Some(response)
    }

    async fn handle_action(&self, data: Value) -> Result<Value, ProtocolError> {
        let action: OperatorAction = serde_json::from_value(data)
            .map_err(|e| ProtocolError::Parse(format!("operator action: {e}")))?;
        tracing::debug!(action = ?action, "operator action");
        match action {
            OperatorAction::GetAgents => Ok(self.describe_network().await),
            OperatorAction::AgentCommand { agent, command } => {
                self.run_command_on_agent(agent, command.encode()?).await?;
                Ok(Value::Null)
            }
            OperatorAction::DeviceCommand {
                agent,
                device,
                command,
            } => {
                let response = self
                    .run_command_on_device(agent, device, command.encode()?)
                    .await?;
                Ok(json!({ "Response": hex::encode(response) }))
            }
            OperatorAction::GatewayCommand { command } => {
                self.run_gateway_command(&command.encode()?).await?;
                Ok(Value::Null)
            }
            OperatorAction::BanAgent { agent, banned } => {
                self.ban_agent(agent, banned).await?;
                Ok(Value::Null)
            }
            OperatorAction::TurnOnConnector { name, arguments } => {
                self.turn_on_connector(type_hash(&name), &encode_arguments(&arguments))
                    .await?;
                Ok(Value::Null)
            }
            OperatorAction::TurnOffConnector { name } => {
                self.turn_off_connector(type_hash(&name)).await?;
                Ok(Value::Null)
            }
            OperatorAction::ConnectorCommand { name, payload } => {
                let payload = hex::decode(&payload).map_err(|e| {
                    ProtocolError::Parse(format!("connector payload is not hex: {e}"))
                })?;
                let response = self
                    .run_command_on_connector(type_hash(&name), &payload)
                    .await?;
                Ok(json!({ "Response": hex::encode(response) }))
            }
        }
    }

    /// The Gateway's own devices, routes and connectors plus every agent.
    async fn describe_network(&self) -> Value {
        let mut devices = Vec::new();
        for bridge in self.core().devices().await {
            devices.push(json!({
                "Device": bridge.did(),
                "TypeHash": bridge.type_hash(),
                "IsChannel": bridge.is_channel(),
                "IsNegotiation": bridge.is_negotiation(),
                "Error": bridge.error_status().await,
            }));
        }
        json!({
            "Gateway": {
                "Agent": self.agent_id(),
                "Name": self.name(),
                "Devices": devices,
                "Routes": self.core().routes().await,
                "Connectors": self.connector_names().await,
            },
            "Agents": self.agents().await,
        })
    }
}
