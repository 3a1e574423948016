//! Smart-light control over the WiZ local UDP protocol.
//!
//! Each light (or group) name maps to one or more device IPs in
//! `[lights.devices]`. Commands are `setPilot` JSON datagrams sent to port
//! 38899; the bulbs do not need to be acknowledged.

use async_trait::async_trait;
use serde_json::{json, Value};
use std::collections::BTreeMap;
use tokio::net::UdpSocket;
use tracing::{debug, warn};

use crate::config::LightsConfig;
use crate::error::DispatchError;

/// Target name that addresses every configured device.
pub const ALL_LIGHTS: [&str; 2] = ["todas", "all"];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LightColor {
    Rgb(u8, u8, u8),
    /// Color temperature in kelvin.
    Temperature(u16),
}

impl LightColor {
    /// Spanish and English color names.
    pub fn parse(name: &str) -> Option<Self> {
        let color = match name.to_lowercase().as_str() {
            "rojo" | "red" => Self::Rgb(255, 0, 0),
            "verde" | "green" => Self::Rgb(0, 255, 0),
            "azul" | "blue" => Self::Rgb(0, 0, 255),
            "amarillo" | "yellow" => Self::Rgb(255, 255, 0),
            "naranja" | "orange" => Self::Rgb(255, 165, 0),
            "rosa" | "pink" => Self::Rgb(255, 105, 180),
            "morado" | "purple" => Self::Rgb(128, 0, 128),
            "violeta" | "violet" => Self::Rgb(238, 130, 238),
            "celeste" | "sky" | "skyblue" => Self::Rgb(135, 206, 235),
            "blanco" | "white" => Self::Temperature(4000),
            "calido" | "cálido" | "warm" => Self::Temperature(2700),
            "frio" | "frío" | "cool" | "cold" => Self::Temperature(6500),
            _ => return None,
        };
        Some(color)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LightAction {
    On,
    Off,
    /// Percent, already clamped to 0..=100.
    Brightness(u8),
    Color(LightColor),
}

impl LightAction {
    pub fn describe(&self) -> String {
        match self {
            Self::On => "on".into(),
            Self::Off => "off".into(),
            Self::Brightness(level) => format!("brightness {level}%"),
            Self::Color(LightColor::Rgb(r, g, b)) => format!("color rgb({r}, {g}, {b})"),
            Self::Color(LightColor::Temperature(k)) => format!("white {k}K"),
        }
    }
}

/// The `setPilot` request for one action.
pub fn pilot_message(action: LightAction) -> Value {
    let params = match action {
        LightAction::Off => json!({ "state": false }),
        LightAction::On => json!({ "state": true, "dimming": 100 }),
        // bulbs reject dimming below 10
        LightAction::Brightness(level) => json!({ "state": true, "dimming": level.max(10) }),
        LightAction::Color(LightColor::Rgb(r, g, b)) => {
            json!({ "state": true, "r": r, "g": g, "b": b, "dimming": 100 })
        }
        LightAction::Color(LightColor::Temperature(temp)) => {
            json!({ "state": true, "temp": temp, "dimming": 100 })
        }
    };
    json!({ "method": "setPilot", "params": params })
}

#[async_trait]
pub trait LightController: Send + Sync {
    /// Apply `action` to every device of `target`. Returns a short notice.
    async fn apply(&self, target: &str, action: LightAction) -> Result<String, DispatchError>;

    fn names(&self) -> Vec<String>;
}

pub struct WizController {
    devices: BTreeMap<String, Vec<String>>,
    port: u16,
}

impl WizController {
    pub fn new(config: &LightsConfig) -> Self {
        Self {
            devices: config
                .devices
                .iter()
                .map(|(name, ips)| (name.to_lowercase(), ips.clone()))
                .collect(),
            port: config.port,
        }
    }

    fn resolve(&self, target: &str) -> Result<(String, Vec<String>), DispatchError> {
        if self.devices.is_empty() {
            return Err(DispatchError::Unavailable("no lights configured".into()));
        }
        let target = target.to_lowercase();
        if ALL_LIGHTS.contains(&target.as_str()) {
            let ips = self.devices.values().flatten().cloned().collect();
            return Ok(("all lights".into(), ips));
        }
        match self.devices.get(&target) {
            Some(ips) => Ok((format!("light {target}"), ips.clone())),
            None => Err(DispatchError::Unavailable(format!(
                "light {target:?} not found; available: {}",
                self.names().join(", ")
            ))),
        }
    }
}

#[async_trait]
impl LightController for WizController {
    async fn apply(&self, target: &str, action: LightAction) -> Result<String, DispatchError> {
        let (display, ips) = self.resolve(target)?;
        let payload = pilot_message(action).to_string();

        let socket = UdpSocket::bind("0.0.0.0:0")
            .await
            .map_err(|e| DispatchError::Unavailable(format!("udp socket: {e}")))?;

        let mut sent = 0;
        for ip in &ips {
            match socket.send_to(payload.as_bytes(), (ip.as_str(), self.port)).await {
                Ok(_) => {
                    debug!(ip = %ip, payload = %payload, "setPilot sent");
                    sent += 1;
                }
                Err(e) => warn!(ip = %ip, error = %e, "setPilot failed"),
            }
        }

        match sent {
            0 => Err(DispatchError::Unavailable(format!("could not reach {display}"))),
            n if n < ips.len() => Ok(format!("{display}: {} (some devices failed)", action.describe())),
            _ => Ok(format!("{display}: {}", action.describe())),
        }
    }

    fn names(&self) -> Vec<String> {
        self.devices.keys().cloned().collect()
    }
}
