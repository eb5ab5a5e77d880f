mod packet;
mod set;
mod version;

pub use packet::{Compression, Packet, ParsePacketError};
pub use set::PacketSet;
pub use version::Version;
