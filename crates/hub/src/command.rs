//! Outbound actuator commands raised by threshold automation.

use anyhow::Result;

/// Where the hub sends actuator commands. The MQTT client is the
/// production sink.
pub trait ActuatorCommands: Send + Sync {
    /// Queue a command switching actuator `name` (a catalog payload key such
    /// as "pompe_irrigation"). Must not wait on the connection.
    fn switch(&self, name: &str, on: bool) -> Result<()>;
}
