use std::io;
use std::path::PathBuf;

/// Errors surfaced by the extraction engine.
///
/// Capability mismatches that are merely inconvenient (stripped attributes,
/// skipped short names, and so on) are demoted to warnings and never appear
/// here unless the corresponding `STRICT_*` flag was given.
#[derive(Debug, thiserror::Error)]
pub enum ExtractError {
    #[error("Invalid parameter: {0}")]
    InvalidParam(&'static str),

    #[error("Path does not exist in the image. Path: '{0}'")]
    PathDoesNotExist(String),

    #[error("Opening file failed. Path: '{}'", .1.display())]
    Open(#[source] io::Error, PathBuf),

    #[error("Reading from the archive failed")]
    Read(#[source] io::Error),

    #[error("Writing extracted data failed. Path: '{}'", .1.display())]
    Write(#[source] io::Error, PathBuf),

    #[error("Could not stat '{}'", .1.display())]
    Stat(#[source] io::Error, PathBuf),

    #[error("Creating directory failed. Path: '{}'", .1.display())]
    Mkdir(#[source] io::Error, PathBuf),

    #[error("'{}' exists and is not a directory", .0.display())]
    NotDir(PathBuf),

    #[error("'{0}' is not a regular file")]
    NotARegularFile(String),

    #[error("Could not read symbolic link target of '{0}'")]
    Readlink(String),

    #[error("Reparse point fixup of '{}' failed", .0.display())]
    ReparsePointFixupFailed(PathBuf),

    #[error("{0}")]
    Unsupported(String),

    #[error("The input is not a pipable archive")]
    NotPipable,

    #[error("Invalid pipable archive: {0}")]
    InvalidPipableWim(&'static str),

    #[error("'{0}' is not a valid image")]
    InvalidImage(String),

    #[error("Image count in XML data does not match the archive header")]
    ImageCount,

    #[error("XML data is inconsistent: {0}")]
    Xml(&'static str),

    #[error("Extraction aborted by the progress callback")]
    Aborted,
}

pub type Result<T, E = ExtractError> = std::result::Result<T, E>;
