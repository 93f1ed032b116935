//! Validation pipeline: the trust boundary every other component goes
//! through.
//!
//! All checks are pure. `Policy` carries the tunable limits (maximum blob
//! size, accepted types); the free functions apply the default policy.

use crate::models::media_type::MediaType;
use thiserror::Error;

/// Upper bound on a stored payload and on an accepted upload.
pub const MAX_BLOB_SIZE: usize = 50 * 1024 * 1024;

/// Maximum filename length, in characters.
pub const MAX_FILENAME_LEN: usize = 255;

const FORBIDDEN_CHARS: [char; 9] = ['<', '>', ':', '"', '/', '\\', '|', '?', '*'];

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ValidationError {
    #[error("media type `{0}` is not accepted")]
    UnsupportedType(String),
    #[error("file extension does not match declared type {declared}")]
    ExtensionMismatch { declared: MediaType },
    #[error("file is empty")]
    Empty,
    #[error("file is {size} bytes, limit is {max}")]
    TooLarge { size: usize, max: usize },
    #[error("filename is empty")]
    EmptyName,
    #[error("filename exceeds 255 characters")]
    NameTooLong,
    #[error("filename contains forbidden character {0:?}")]
    ForbiddenCharacter(char),
    #[error("filename contains `..`")]
    ParentReference,
    #[error("filename starts with `.`")]
    LeadingDot,
    #[error("unrecognized image signature")]
    UnrecognizedSignature,
    #[error("content is {detected} but was declared as {declared}")]
    SignatureMismatch {
        declared: MediaType,
        detected: MediaType,
    },
}

/// An upload as it arrives at the ingress boundary.
#[derive(Debug, Clone, Copy)]
pub struct IncomingFile<'a> {
    pub name: &'a str,
    pub declared_type: &'a str,
    pub bytes: &'a [u8],
}

/// Limits applied by the size and type checks.
#[derive(Debug, Clone)]
pub struct Policy {
    pub max_blob_size: usize,
    pub allowed: Vec<MediaType>,
}

impl Default for Policy {
    fn default() -> Self {
        Self {
            max_blob_size: MAX_BLOB_SIZE,
            allowed: MediaType::ALL.to_vec(),
        }
    }
}

impl Policy {
    pub fn with_max_blob_size(max_blob_size: usize) -> Self {
        Self {
            max_blob_size,
            ..Self::default()
        }
    }

    /// Resolve a declared MIME type against the accepted set.
    pub fn check_media_type(&self, declared: &str) -> Result<MediaType, ValidationError> {
        MediaType::from_mime(declared)
            .filter(|media| self.allowed.contains(media))
            .ok_or_else(|| ValidationError::UnsupportedType(declared.to_string()))
    }

    /// Declared type must be accepted and the extension must belong to it.
    pub fn check_type(
        &self,
        declared: &str,
        file_name: &str,
    ) -> Result<MediaType, ValidationError> {
        let media = self.check_media_type(declared)?;
        let extension = file_name
            .rsplit_once('.')
            .map(|(_, ext)| ext.to_ascii_lowercase())
            .unwrap_or_default();
        if media.extensions().contains(&extension.as_str()) {
            Ok(media)
        } else {
            Err(ValidationError::ExtensionMismatch { declared: media })
        }
    }

    pub fn check_size(&self, byte_length: usize) -> Result<(), ValidationError> {
        if byte_length == 0 {
            return Err(ValidationError::Empty);
        }
        if byte_length > self.max_blob_size {
            return Err(ValidationError::TooLarge {
                size: byte_length,
                max: self.max_blob_size,
            });
        }
        Ok(())
    }

    /// Type, size, name, then signature; stops at the first failure.
    ///
    /// The signature must also agree with the declared type, so a `.png`
    /// upload carrying GIF bytes is refused.
    pub fn validate(&self, file: &IncomingFile<'_>) -> Result<MediaType, ValidationError> {
        let declared = self.check_type(file.declared_type, file.name)?;
        self.check_size(file.bytes.len())?;
        check_name(file.name)?;
        let detected = check_magic_bytes(file.bytes)?;
        if detected != declared {
            return Err(ValidationError::SignatureMismatch { declared, detected });
        }
        Ok(declared)
    }
}

pub fn check_type(declared: &str, file_name: &str) -> Result<MediaType, ValidationError> {
    Policy::default().check_type(declared, file_name)
}

pub fn check_size(byte_length: usize) -> Result<(), ValidationError> {
    Policy::default().check_size(byte_length)
}

pub fn validate(file: &IncomingFile<'_>) -> Result<MediaType, ValidationError> {
    Policy::default().validate(file)
}

fn is_forbidden(c: char) -> bool {
    FORBIDDEN_CHARS.contains(&c) || (c as u32) < 0x20
}

pub fn check_name(file_name: &str) -> Result<(), ValidationError> {
    if file_name.is_empty() {
        return Err(ValidationError::EmptyName);
    }
    if file_name.chars().count() > MAX_FILENAME_LEN {
        return Err(ValidationError::NameTooLong);
    }
    if let Some(c) = file_name.chars().find(|c| is_forbidden(*c)) {
        return Err(ValidationError::ForbiddenCharacter(c));
    }
    if file_name.contains("..") {
        return Err(ValidationError::ParentReference);
    }
    if file_name.starts_with('.') {
        return Err(ValidationError::LeadingDot);
    }
    Ok(())
}

/// Identify the format from the leading bytes alone, independent of
/// whatever type was declared.
pub fn check_magic_bytes(first_bytes: &[u8]) -> Result<MediaType, ValidationError> {
    match first_bytes {
        [0xFF, 0xD8, 0xFF, ..] => Ok(MediaType::Jpeg),
        [0x89, b'P', b'N', b'G', ..] => Ok(MediaType::Png),
        [b'R', b'I', b'F', b'F', ..] => Ok(MediaType::Webp),
        [b'G', b'I', b'F', b'8', ..] => Ok(MediaType::Gif),
        _ => Err(ValidationError::UnrecognizedSignature),
    }
}

/// Strip forbidden characters, collapse dot runs, drop leading dots and cap
/// the length. `sanitize(sanitize(x)) == sanitize(x)`.
pub fn sanitize(file_name: &str) -> String {
    let mut out = String::with_capacity(file_name.len());
    for c in file_name.chars().filter(|c| !is_forbidden(*c)) {
        if c == '.' && (out.is_empty() || out.ends_with('.')) {
            continue;
        }
        out.push(c);
    }
    out.chars().take(MAX_FILENAME_LEN).collect()
}
