//! Broker topic names for a single device

/// Remote commands the device subscribes to under `command/<device-id>/`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CommandTopic {
    Upgrade,
    Reboot,
    Reset,
    Time,
    Rpc,
}

impl CommandTopic {
    pub const ALL: [CommandTopic; 5] = [
        CommandTopic::Upgrade,
        CommandTopic::Reboot,
        CommandTopic::Reset,
        CommandTopic::Time,
        CommandTopic::Rpc,
    ];

    pub fn suffix(self) -> &'static str {
        match self {
            CommandTopic::Upgrade => "upgrade",
            CommandTopic::Reboot => "reboot",
            CommandTopic::Reset => "reset",
            CommandTopic::Time => "time",
            CommandTopic::Rpc => "rpc",
        }
    }
}

/// Topic builder bound to one device id
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Topics {
    device_id: String,
}

impl Topics {
    pub fn new(device_id: impl Into<String>) -> Self {
        Self { device_id: device_id.into() }
    }

    pub fn device_id(&self) -> &str {
        &self.device_id
    }

    pub fn command(&self, topic: CommandTopic) -> String {
        format!("command/{}/{}", self.device_id, topic.suffix())
    }

    pub fn version(&self) -> String {
        format!("stream/{}/version", self.device_id)
    }

    pub fn rpc_out(&self) -> String {
        format!("stream/{}/rpcout", self.device_id)
    }

    pub fn time_echo(&self) -> String {
        format!("time/{}", self.device_id)
    }

    /// Map an inbound topic back to the command it carries
    pub fn parse_command(&self, topic: &str) -> Option<CommandTopic> {
        let rest = topic.strip_prefix("command/")?;
        let (id, suffix) = rest.split_once('/')?;
        if id != self.device_id {
            return None;
        }
        CommandTopic::ALL.into_iter().find(|t| t.suffix() == suffix)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn topic_layout() {
        let t = Topics::new("A1B2C3D4E5F6");
        assert_eq!(t.command(CommandTopic::Upgrade), "command/A1B2C3D4E5F6/upgrade");
        assert_eq!(t.version(), "stream/A1B2C3D4E5F6/version");
        assert_eq!(t.rpc_out(), "stream/A1B2C3D4E5F6/rpcout");
        assert_eq!(t.time_echo(), "time/A1B2C3D4E5F6");
    }

    #[test]
    fn parse_command_checks_device_id() {
        let t = Topics::new("dev1");
        assert_eq!(t.parse_command("command/dev1/reboot"), Some(CommandTopic::Reboot));
        assert_eq!(t.parse_command("command/dev2/reboot"), None);
        assert_eq!(t.parse_command("command/dev1/unknown"), None);
        assert_eq!(t.parse_command("stream/dev1/version"), None);
    }
}
