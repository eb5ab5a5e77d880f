use derive_more::{Display, Error};
use miette::Diagnostic;
use pacmirror_packet::{Packet, ParsePacketError};
use std::io;

/// Error when reading packet entries out of a repository database.
#[derive(Debug, Display, Error, Diagnostic)]
#[non_exhaustive]
pub enum ParseDatabaseError {
    #[display("Failed to read the database archive: {_0}")]
    #[diagnostic(code(pacmirror_repository::archive))]
    Archive(io::Error),
    #[display("Database names an invalid packet file {filename:?}: {error}")]
    #[diagnostic(code(pacmirror_repository::entry))]
    Entry {
        filename: String,
        #[error(source)]
        error: ParsePacketError,
    },
}

/// Capability interface of one repository layout.
///
/// There is one implementation per package format; repository configuration
/// decides which one serves a given path prefix.
pub trait RepoFormat: Send + Sync {
    /// Request path of the database file for the repository at `prefix`.
    /// The returned path routes through the same prefix again.
    fn database_path(&self, prefix: &str) -> String;

    /// Whether `remainder` (a repo-relative path) names the database file.
    fn is_database(&self, remainder: &str) -> bool;

    /// Iterate the packet entries of a downloaded database, invoking
    /// `visit` once per entry.
    fn parse_database(
        &self,
        database: &[u8],
        visit: &mut dyn FnMut(Packet),
    ) -> Result<(), ParseDatabaseError>;

    /// Parse a packet filename in this format.
    fn packet_from_filename(&self, filename: &str) -> Result<Packet, ParsePacketError>;
}
