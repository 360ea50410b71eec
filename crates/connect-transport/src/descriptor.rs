use serde::{Deserialize, Serialize};

/// Physical medium a descriptor was discovered on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum TransportKind {
    Usb,
    Ble,
    Bridge,
    MobileBle,
    Emulator,
}

impl TransportKind {
    pub fn is_ble(self) -> bool {
        matches!(self, Self::Ble | Self::MobileBle)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Usb => "usb",
            Self::Ble => "ble",
            Self::Bridge => "bridge",
            Self::MobileBle => "mobile-ble",
            Self::Emulator => "emulator",
        }
    }
}

/// A device as reported by [`crate::Transport::enumerate`].
///
/// `session` is the transport's live session handle for the path, if any
/// client currently holds it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Descriptor {
    pub path: String,
    #[serde(default)]
    pub id: Option<String>,
    #[serde(default)]
    pub session: Option<String>,
    pub kind: TransportKind,
    #[serde(default)]
    pub name: Option<String>,
}

impl Descriptor {
    pub fn new(path: impl Into<String>, kind: TransportKind) -> Self {
        Self {
            path: path.into(),
            id: None,
            session: None,
            kind,
            name: None,
        }
    }

    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = Some(id.into());
        self
    }

    /// Stable identifier used as the connect id: the BLE/bridge id when the
    /// transport reports one, the path otherwise.
    pub fn connect_id(&self) -> &str {
        self.id.as_deref().unwrap_or(&self.path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn connect_id_prefers_transport_id() {
        let usb = Descriptor::new("1-1.2", TransportKind::Usb);
        assert_eq!(usb.connect_id(), "1-1.2");

        let ble = Descriptor::new("hci0/aa", TransportKind::Ble).with_id("AA:BB");
        assert_eq!(ble.connect_id(), "AA:BB");
        assert!(ble.kind.is_ble());
        assert!(TransportKind::MobileBle.is_ble());
        assert!(!TransportKind::Bridge.is_ble());
    }
}
