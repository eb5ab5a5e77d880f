use crate::{ParseDatabaseError, RepoFormat};
use flate2::read::GzDecoder;
use pacmirror_packet::{Packet, ParsePacketError};
use std::io::Read;
use tar::Archive;

/// The pacman repository layout.
///
/// A repository lives under `{repo}/os/{arch}` and its database is
/// `{repo}.db` inside that directory: a gzipped tar archive with one
/// `{name}-{version}/desc` entry per packet. The `%FILENAME%` section of
/// each `desc` names the packet file the entry describes.
#[derive(Debug, Default, Clone, Copy)]
pub struct PacmanFormat;

impl RepoFormat for PacmanFormat {
    fn database_path(&self, prefix: &str) -> String {
        let repo = prefix.split('/').next().unwrap_or(prefix);
        format!("{prefix}/{repo}.db")
    }

    fn is_database(&self, remainder: &str) -> bool {
        remainder.ends_with(".db") || remainder.ends_with(".files")
    }

    fn parse_database(
        &self,
        database: &[u8],
        visit: &mut dyn FnMut(Packet),
    ) -> Result<(), ParseDatabaseError> {
        let mut archive = Archive::new(GzDecoder::new(database));
        for entry in archive.entries().map_err(ParseDatabaseError::Archive)? {
            let mut entry = entry.map_err(ParseDatabaseError::Archive)?;
            let is_desc = entry
                .path()
                .map_err(ParseDatabaseError::Archive)?
                .file_name()
                .is_some_and(|name| name == "desc");
            if !is_desc {
                continue;
            }

            let mut desc = String::new();
            entry.read_to_string(&mut desc).map_err(ParseDatabaseError::Archive)?;
            if let Some(filename) = field(&desc, "%FILENAME%") {
                let packet = self.packet_from_filename(filename).map_err(|error| {
                    ParseDatabaseError::Entry { filename: filename.to_string(), error }
                })?;
                visit(packet);
            }
        }
        Ok(())
    }

    fn packet_from_filename(&self, filename: &str) -> Result<Packet, ParsePacketError> {
        filename.parse()
    }
}

/// Value of a `%SECTION%` in a desc file: the first non-empty line after
/// the section header.
fn field<'a>(desc: &'a str, section: &str) -> Option<&'a str> {
    let mut lines = desc.lines();
    lines.by_ref().find(|line| line.trim() == section)?;
    lines.map(str::trim).find(|line| !line.is_empty())
}

#[cfg(test)]
mod tests {
    use super::*;
    use flate2::{write::GzEncoder, Compression};
    use pretty_assertions::assert_eq;
    use std::io::Write;

    /// Build a database archive the way a pacman repo-add would.
    fn database(filenames: &[&str]) -> Vec<u8> {
        let mut builder = tar::Builder::new(Vec::new());
        for filename in filenames {
            let packet: Packet = filename.parse().unwrap();
            let desc = format!(
                "%FILENAME%\n{filename}\n\n%NAME%\n{name}\n\n%VERSION%\n{version}\n",
                name = packet.name,
                version = packet.version,
            );
            let path = format!("{}-{}/desc", packet.name, packet.version);
            let mut header = tar::Header::new_gnu();
            header.set_size(desc.len() as u64);
            header.set_mode(0o644);
            header.set_cksum();
            builder.append_data(&mut header, path, desc.as_bytes()).unwrap();
        }
        let tarball = builder.into_inner().unwrap();

        let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
        encoder.write_all(&tarball).unwrap();
        encoder.finish().unwrap()
    }

    #[test]
    fn database_path_uses_the_repo_name() {
        assert_eq!(PacmanFormat.database_path("core/os/x86_64"), "core/os/x86_64/core.db");
        assert_eq!(PacmanFormat.database_path("extra/os/any"), "extra/os/any/extra.db");
    }

    #[test]
    fn is_database_matches_db_and_files() {
        assert!(PacmanFormat.is_database("core.db"));
        assert!(PacmanFormat.is_database("core.files"));
        assert!(!PacmanFormat.is_database("linux-6.1.1-1-x86_64.pkg.tar.zst"));
    }

    #[test]
    fn parse_database_yields_every_entry() {
        let db = database(&[
            "linux-6.1.1-1-x86_64.pkg.tar.zst",
            "vim-9.0.1-1-x86_64.pkg.tar.xz",
        ]);
        let mut seen = Vec::new();
        PacmanFormat.parse_database(&db, &mut |packet| seen.push(packet.filename())).unwrap();
        assert_eq!(
            seen,
            ["linux-6.1.1-1-x86_64.pkg.tar.zst", "vim-9.0.1-1-x86_64.pkg.tar.xz"]
        );
    }

    #[test]
    fn parse_database_rejects_invalid_entries() {
        let mut builder = tar::Builder::new(Vec::new());
        let desc = "%FILENAME%\nnot-a-packet.tar.gz\n";
        let mut header = tar::Header::new_gnu();
        header.set_size(desc.len() as u64);
        header.set_mode(0o644);
        header.set_cksum();
        builder.append_data(&mut header, "broken-1/desc", desc.as_bytes()).unwrap();
        let tarball = builder.into_inner().unwrap();
        let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
        encoder.write_all(&tarball).unwrap();
        let db = encoder.finish().unwrap();

        let error = PacmanFormat.parse_database(&db, &mut |_| {}).unwrap_err();
        assert!(matches!(error, ParseDatabaseError::Entry { .. }));
    }
}
