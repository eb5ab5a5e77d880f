use crate::Packet;
use std::collections::HashMap;

/// The set of packets known to be present in a cache directory, keyed by
/// filename.
#[derive(Debug, Default, Clone)]
pub struct PacketSet {
    entries: HashMap<String, Packet>,
}

impl PacketSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Look a packet up by its exact filename.
    pub fn by_filename(&self, filename: &str) -> Option<&Packet> {
        self.entries.get(filename)
    }

    /// All entries sharing (name, arch) with `packet`, regardless of their
    /// version. The caller decides what counts as older or newer.
    pub fn find_other_versions(&self, packet: &Packet) -> Vec<&Packet> {
        self.entries.values().filter(|other| other.same_identity(packet)).collect()
    }

    /// Record a packet under its filename.
    pub fn insert(&mut self, packet: Packet) {
        self.entries.insert(packet.filename(), packet);
    }

    /// Remove the entry for `filename`, returning it if it was present.
    pub fn delete(&mut self, filename: &str) -> Option<Packet> {
        self.entries.remove(filename)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
