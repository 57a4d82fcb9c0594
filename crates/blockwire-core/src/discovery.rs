//! Dynamic discovery: materializing a remote device's schema.
//!
//! A controller often knows nothing about a device until it connects. The
//! device's static "info" block carries a JSON description of its memory
//! blocks and signals; when that block arrives, the controller parses it
//! once and builds a dynamic network: a hash table of signal descriptors
//! plus a shortcut list resolving (device, block-name) to the local mirror
//! block without scanning the registry.
//!
//! Parsers tolerate unknown JSON fields; devices ship schemas from many
//! firmware generations.

use std::collections::{HashMap, HashSet};

use serde::Deserialize;

use crate::{
    connection::ConnId,
    error::FabricError,
    mblk::MblkId,
    signal::SignalKind,
};

/// Name of the static block carrying the device schema.
pub const INFO_BLOCK_NAME: &str = "info";

/// One signal descriptor from a device's info block.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DynamicSignal {
    /// Signal name
    pub name: String,
    /// Block the signal lives in
    pub mblk_name: String,
    /// Device the signal belongs to
    pub device_name: String,
    /// Device number
    pub device_nr: u32,
    /// Start address within the block (state byte)
    pub addr: usize,
    /// Element count
    pub n: usize,
    /// Matrix column count; 0 for plain signals
    pub ncolumns: usize,
    /// Element type
    pub kind: SignalKind,
}

/// Shortcut from block identity to the local mirror block.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MblkShortcut {
    /// Local id of the mirror block
    pub mblk_id: MblkId,
    /// Device name
    pub device_name: String,
    /// Device number
    pub device_nr: u32,
    /// Block name
    pub mblk_name: String,
}

/// Controller-side shadow of one IO network.
#[derive(Debug, Default)]
pub(crate) struct DynamicNetwork {
    /// Signal name -> descriptors (several devices may use the same name)
    pub signals: HashMap<String, Vec<DynamicSignal>>,
    /// Handles to blocks belonging to this network
    pub shortcuts: Vec<MblkShortcut>,
    /// Devices seen in this network and the connections serving them
    pub devices: HashMap<(String, u32), HashSet<ConnId>>,
}

impl DynamicNetwork {
    /// First signal matching `name`.
    pub fn find_signal(&self, name: &str) -> Option<&DynamicSignal> {
        self.signals.get(name).and_then(|list| list.first())
    }

    /// All signals matching `name`.
    pub fn find_signals(&self, name: &str) -> &[DynamicSignal] {
        self.signals.get(name).map_or(&[], Vec::as_slice)
    }

    /// Resolve a signal name to its descriptor and local mirror block.
    pub fn resolve(&self, name: &str) -> Option<(&DynamicSignal, MblkId)> {
        let signal = self.find_signal(name)?;
        let shortcut = self.shortcuts.iter().find(|sc| {
            sc.device_name == signal.device_name
                && sc.device_nr == signal.device_nr
                && sc.mblk_name == signal.mblk_name
        })?;
        Some((signal, shortcut.mblk_id))
    }

    /// Register a mirror block, replacing any stale entry.
    pub fn add_shortcut(&mut self, shortcut: MblkShortcut) {
        self.shortcuts.retain(|sc| {
            !(sc.device_name == shortcut.device_name
                && sc.device_nr == shortcut.device_nr
                && sc.mblk_name == shortcut.mblk_name)
        });
        self.shortcuts.push(shortcut);
    }

    /// Forget a mirror block and any signals resolved through it.
    pub fn mblk_deleted(&mut self, mblk_id: MblkId) {
        self.shortcuts.retain(|sc| sc.mblk_id != mblk_id);
    }

    /// Drop all signals of one device (it described them; it is gone).
    pub fn remove_device_signals(&mut self, device_name: &str, device_nr: u32) {
        for list in self.signals.values_mut() {
            list.retain(|sig| {
                !(sig.device_name == device_name && sig.device_nr == device_nr)
            });
        }
        self.signals.retain(|_, list| !list.is_empty());
    }

    /// Whether the network holds no devices and no blocks.
    pub fn is_empty(&self) -> bool {
        self.devices.is_empty() && self.shortcuts.is_empty()
    }

    /// Insert signals parsed from an info document.
    pub fn absorb_info(&mut self, device_name: &str, device_nr: u32, doc: &InfoDocument) {
        // Replace any previous schema from this device.
        self.remove_device_signals(device_name, device_nr);
        for block in &doc.memory_blocks {
            for sig in &block.signals {
                let Some(kind) = SignalKind::from_name(&sig.ty) else {
                    tracing::debug!(signal = %sig.name, ty = %sig.ty, "unknown signal type skipped");
                    continue;
                };
                self.signals.entry(sig.name.clone()).or_default().push(DynamicSignal {
                    name: sig.name.clone(),
                    mblk_name: block.name.clone(),
                    device_name: device_name.to_string(),
                    device_nr,
                    addr: sig.addr,
                    n: sig.n.max(1),
                    ncolumns: sig.ncolumns,
                    kind,
                });
            }
        }
    }
}

/// Parsed device info document.
#[derive(Debug, Clone, Default, Deserialize, PartialEq, Eq)]
pub struct InfoDocument {
    /// Memory blocks and their signals
    #[serde(default, alias = "mblk")]
    pub memory_blocks: Vec<InfoBlock>,
}

/// One block entry of the info document.
#[derive(Debug, Clone, Default, Deserialize, PartialEq, Eq)]
pub struct InfoBlock {
    /// Block name
    pub name: String,
    /// "up" or "down" from the device's point of view
    #[serde(default)]
    pub direction: String,
    /// Signals laid out in this block
    #[serde(default)]
    pub signals: Vec<InfoSignal>,
}

/// One signal entry of the info document.
#[derive(Debug, Clone, Default, Deserialize, PartialEq, Eq)]
pub struct InfoSignal {
    /// Signal name
    pub name: String,
    /// Start address
    #[serde(default)]
    pub addr: usize,
    /// Element count
    #[serde(default = "default_n")]
    pub n: usize,
    /// Matrix columns
    #[serde(default)]
    pub ncolumns: usize,
    /// Type name ("boolean", "ushort", "float", ...)
    #[serde(default, rename = "type")]
    pub ty: String,
}

fn default_n() -> usize {
    1
}

/// Parse an info block's JSON content.
///
/// # Errors
///
/// - [`FabricError::Failed`] when the payload is not a valid document
pub fn parse_info(content: &[u8]) -> Result<InfoDocument, FabricError> {
    // The info block is a fixed-size static block; the document ends at
    // the first NUL.
    let end = content.iter().position(|&b| b == 0).unwrap_or(content.len());
    serde_json::from_slice(&content[..end]).map_err(|err| {
        tracing::debug!(%err, "info block did not parse");
        FabricError::Failed
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    const INFO_JSON: &str = r#"{
        "memory_blocks": [
            {
                "name": "exp",
                "direction": "up",
                "groups": "ignored-unknown-field",
                "signals": [
                    { "name": "coast", "addr": 0, "type": "boolean" },
                    { "name": "temperature", "addr": 2, "n": 4, "type": "ushort" },
                    { "name": "label", "addr": 11, "n": 16, "type": "str" }
                ]
            },
            {
                "name": "imp",
                "direction": "down",
                "signals": [
                    { "name": "headlight", "addr": 0, "type": "boolean" },
                    { "name": "mystery", "addr": 4, "type": "quaternion" }
                ]
            }
        ]
    }"#;

    #[test]
    fn parses_and_tolerates_unknown_fields() {
        let doc = parse_info(INFO_JSON.as_bytes()).unwrap();
        assert_eq!(doc.memory_blocks.len(), 2);
        assert_eq!(doc.memory_blocks[0].signals[1].n, 4);
    }

    #[test]
    fn trailing_nul_padding_is_ignored() {
        let mut padded = INFO_JSON.as_bytes().to_vec();
        padded.extend_from_slice(&[0u8; 64]);
        assert!(parse_info(&padded).is_ok());
    }

    #[test]
    fn absorb_builds_constant_time_lookup() {
        let doc = parse_info(INFO_JSON.as_bytes()).unwrap();
        let mut network = DynamicNetwork::default();
        network.absorb_info("gina", 1, &doc);

        let sig = network.find_signal("temperature").unwrap();
        assert_eq!(sig.mblk_name, "exp");
        assert_eq!(sig.addr, 2);
        assert_eq!(sig.n, 4);
        assert_eq!(sig.kind, SignalKind::U16);

        // Unknown type entries are skipped, known ones kept.
        assert!(network.find_signal("mystery").is_none());
        assert!(network.find_signal("headlight").is_some());
    }

    #[test]
    fn resolve_goes_through_shortcuts() {
        let doc = parse_info(INFO_JSON.as_bytes()).unwrap();
        let mut network = DynamicNetwork::default();
        network.absorb_info("gina", 1, &doc);
        network.add_shortcut(MblkShortcut {
            mblk_id: 42,
            device_name: "gina".to_string(),
            device_nr: 1,
            mblk_name: "exp".to_string(),
        });

        let (sig, mblk_id) = network.resolve("coast").unwrap();
        assert_eq!(mblk_id, 42);
        assert_eq!(sig.addr, 0);

        // Signals of blocks without a mirror do not resolve.
        assert!(network.resolve("headlight").is_none());

        network.mblk_deleted(42);
        assert!(network.resolve("coast").is_none());
    }

    #[test]
    fn reabsorbing_replaces_the_old_schema() {
        let doc = parse_info(INFO_JSON.as_bytes()).unwrap();
        let mut network = DynamicNetwork::default();
        network.absorb_info("gina", 1, &doc);
        network.absorb_info("gina", 1, &doc);
        assert_eq!(network.find_signals("coast").len(), 1);
    }
}
