//! Artifact identity: the parsed form of a requested filename.
//!
//! Accepted names:
//!
//! ```text
//! zig[-bootstrap | -<os>-<arch>]-<version>.(tar.xz|zip)[.minisig]
//! <version> = MAJOR.MINOR.PATCH[-dev.<N>+<hex>]
//! ```
//!
//! The `<os>-<arch>` pair is not checked against a platform list. Unknown
//! platforms are forwarded and the upstream answers 404 for them.

use regex::Regex;
use std::fmt;
use std::str::FromStr;
use std::sync::LazyLock;

use crate::error::InvalidFilename;

static FILENAME_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(concat!(
        r"^zig(?:-(?P<bootstrap>bootstrap)|-(?P<os>[a-zA-Z0-9_]+)-(?P<arch>[a-zA-Z0-9_]+))?",
        r"-(?P<version>[0-9]+\.[0-9]+\.[0-9]+(?P<dev>-dev\.[0-9]+\+[0-9a-f]+)?)",
        r"\.(?P<ext>tar\.xz|zip)(?P<sig>\.minisig)?$",
    ))
    .expect("filename grammar is a valid regex")
});

/// What the archive contains, as encoded in the middle of the filename.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ArtifactKind {
    /// `zig-<version>`: source tarball
    Source,
    /// `zig-bootstrap-<version>`
    Bootstrap,
    /// `zig-<os>-<arch>-<version>`: prebuilt toolchain
    Binary { os: String, arch: String },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArchiveFormat {
    TarXz,
    Zip,
}

/// A validated artifact filename. Doubles as the cache key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArtifactId {
    filename: String,
    version: String,
    is_dev: bool,
    kind: ArtifactKind,
    format: ArchiveFormat,
    signature: bool,
}

impl ArtifactId {
    /// Parse a bare filename. Never touches the filesystem or network.
    ///
    /// The caller passes only the final path segment of the request; a
    /// string containing `/` can never match the grammar.
    pub fn parse(filename: &str) -> Result<Self, InvalidFilename> {
        let caps = FILENAME_RE
            .captures(filename)
            .ok_or_else(|| InvalidFilename(filename.to_string()))?;

        let kind = if caps.name("bootstrap").is_some() {
            ArtifactKind::Bootstrap
        } else if let (Some(os), Some(arch)) = (caps.name("os"), caps.name("arch")) {
            ArtifactKind::Binary {
                os: os.as_str().to_string(),
                arch: arch.as_str().to_string(),
            }
        } else {
            ArtifactKind::Source
        };

        let format = match caps.name("ext").map(|m| m.as_str()) {
            Some("zip") => ArchiveFormat::Zip,
            _ => ArchiveFormat::TarXz,
        };

        Ok(ArtifactId {
            filename: filename.to_string(),
            version: caps["version"].to_string(),
            is_dev: caps.name("dev").is_some(),
            kind,
            format,
            signature: caps.name("sig").is_some(),
        })
    }

    pub fn filename(&self) -> &str {
        &self.filename
    }

    pub fn version(&self) -> &str {
        &self.version
    }

    /// True for nightly builds (`-dev.<N>+<hex>` version suffix).
    pub fn is_dev(&self) -> bool {
        self.is_dev
    }

    pub fn kind(&self) -> &ArtifactKind {
        &self.kind
    }

    pub fn format(&self) -> ArchiveFormat {
        self.format
    }

    /// True for detached `.minisig` signatures.
    pub fn is_signature(&self) -> bool {
        self.signature
    }

    /// Path of this artifact below the upstream base URL.
    ///
    /// Nightlies live in a flat `builds/` directory; tagged releases live
    /// under `download/<version>/`.
    pub fn upstream_path(&self) -> String {
        if self.is_dev {
            format!("builds/{}", self.filename)
        } else {
            format!("download/{}/{}", self.version, self.filename)
        }
    }
}

impl FromStr for ArtifactId {
    type Err = InvalidFilename;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        ArtifactId::parse(s)
    }
}

impl fmt::Display for ArtifactId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.filename)
    }
}
