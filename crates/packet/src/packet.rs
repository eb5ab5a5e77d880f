use crate::Version;
use derive_more::{Display, Error};
use miette::Diagnostic;
use std::str::FromStr;

/// Compression of a packet archive.
#[derive(Debug, Display, Clone, Copy, PartialEq, Eq)]
pub enum Compression {
    #[display("xz")]
    Xz,
    #[display("zst")]
    Zst,
}

/// A versioned, architecture-stamped packet as identified by its filename.
///
/// Syntax: `{name}-{version}-{arch}.pkg.tar.{compression}`
///
/// Examples: `linux-6.1.1-1-x86_64.pkg.tar.zst`, `tzdata-2024a-1-any.pkg.tar.xz`
///
/// Two packets with the same name and architecture are versions of the same
/// thing; the compression suffix is part of the filename but not of the
/// identity.
#[derive(Debug, Display, Clone, PartialEq, Eq)]
#[display("{name}-{version}-{arch}.pkg.tar.{compression}")]
pub struct Packet {
    pub name: String,
    pub version: Version,
    pub arch: String,
    pub compression: Compression,
}

impl Packet {
    /// The filename the packet is stored under.
    pub fn filename(&self) -> String {
        self.to_string()
    }

    /// Whether `other` is another version of the same (name, arch) identity.
    pub fn same_identity(&self, other: &Packet) -> bool {
        self.name == other.name && self.arch == other.arch
    }
}

/// Error when parsing [`Packet`] from a filename.
#[derive(Debug, Display, Error, Diagnostic)]
#[non_exhaustive]
pub enum ParsePacketError {
    #[display("Filename does not end in .pkg.tar.xz or .pkg.tar.zst")]
    #[diagnostic(code(pacmirror_packet::suffix))]
    InvalidSuffix,
    #[display("Architecture is missing")]
    #[diagnostic(code(pacmirror_packet::arch))]
    MissingArch,
    #[display("Version is missing")]
    #[diagnostic(code(pacmirror_packet::version))]
    MissingVersion,
    #[display("Name is empty")]
    #[diagnostic(code(pacmirror_packet::name))]
    EmptyName,
}

impl FromStr for Packet {
    type Err = ParsePacketError;
    fn from_str(filename: &str) -> Result<Self, Self::Err> {
        let (stem, compression) = if let Some(stem) = filename.strip_suffix(".pkg.tar.zst") {
            (stem, Compression::Zst)
        } else if let Some(stem) = filename.strip_suffix(".pkg.tar.xz") {
            (stem, Compression::Xz)
        } else {
            return Err(ParsePacketError::InvalidSuffix);
        };

        // The name may itself contain dashes, so everything is taken from
        // the right: arch, then pkgrel, then pkgver.
        let (rest, arch) = stem.rsplit_once('-').ok_or(ParsePacketError::MissingArch)?;
        let (rest, pkgrel) = rest.rsplit_once('-').ok_or(ParsePacketError::MissingVersion)?;
        let (name, pkgver) = rest.rsplit_once('-').ok_or(ParsePacketError::MissingVersion)?;
        if name.is_empty() {
            return Err(ParsePacketError::EmptyName);
        }
        if arch.is_empty() {
            return Err(ParsePacketError::MissingArch);
        }
        if pkgver.is_empty() || pkgrel.is_empty() {
            return Err(ParsePacketError::MissingVersion);
        }

        Ok(Packet {
            name: name.to_string(),
            version: Version::new(format!("{pkgver}-{pkgrel}")),
            arch: arch.to_string(),
            compression,
        })
    }
}

impl<'a> TryFrom<&'a str> for Packet {
    type Error = ParsePacketError;
    fn try_from(filename: &'a str) -> Result<Self, Self::Error> {
        filename.parse()
    }
}
