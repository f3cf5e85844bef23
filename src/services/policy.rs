//! Upload validation policy.
//!
//! The denylist is deliberately pluggable: a short extension list is easy to
//! bypass, so deployments can swap in a stricter [`UploadPolicy`].

use crate::services::error::ValidationError;

/// Longest extension carried over into a blob key.
const MAX_EXTENSION_LEN: usize = 16;

pub trait UploadPolicy: Send + Sync {
    /// Accept or reject an upload by name and declared content type.
    fn check(&self, file_name: &str, content_type: Option<&str>) -> Result<(), ValidationError>;
}

/// Rejects uploads whose extension or content type is on a denylist.
#[derive(Debug, Clone)]
pub struct DenylistPolicy {
    extensions: Vec<String>,
    content_types: Vec<String>,
}

impl Default for DenylistPolicy {
    fn default() -> Self {
        Self::new(
            ["exe", "dll", "sh", "bat"],
            ["application/x-msdownload", "application/x-msdos-program"],
        )
    }
}

impl DenylistPolicy {
    /// Extensions are matched case-insensitively, with or without a leading dot.
    pub fn new<E, C>(extensions: E, content_types: C) -> Self
    where
        E: IntoIterator,
        E::Item: AsRef<str>,
        C: IntoIterator,
        C::Item: AsRef<str>,
    {
        Self {
            extensions: extensions
                .into_iter()
                .map(|e| e.as_ref().trim().trim_start_matches('.').to_ascii_lowercase())
                .filter(|e| !e.is_empty())
                .collect(),
            content_types: content_types
                .into_iter()
                .map(|c| c.as_ref().trim().to_ascii_lowercase())
                .filter(|c| !c.is_empty())
                .collect(),
        }
    }
}

impl UploadPolicy for DenylistPolicy {
    fn check(&self, file_name: &str, content_type: Option<&str>) -> Result<(), ValidationError> {
        if let Some(ext) = file_extension(file_name) {
            if self.extensions.iter().any(|denied| *denied == ext) {
                return Err(ValidationError::DisallowedExtension(format!(".{ext}")));
            }
        }
        if let Some(ct) = content_type {
            // ignore parameters such as `; charset=...`
            let essence = ct.split(';').next().unwrap_or(ct).trim().to_ascii_lowercase();
            if self.content_types.iter().any(|denied| *denied == essence) {
                return Err(ValidationError::DisallowedContentType(essence));
            }
        }
        Ok(())
    }
}

/// Lowercased extension of `file_name`, without the dot.
///
/// Trailing dots and whitespace are stripped first, since some filesystems
/// drop them and `virus.exe.` would otherwise slip through as extensionless.
/// Extensions that are too long or not alphanumeric yield `None`.
pub fn file_extension(file_name: &str) -> Option<String> {
    let trimmed = file_name.trim_end_matches(|c: char| c == '.' || c.is_whitespace());
    let base = trimmed.rsplit(['/', '\\']).next().unwrap_or(trimmed);
    let (stem, ext) = base.rsplit_once('.')?;
    if stem.is_empty()
        || ext.is_empty()
        || ext.len() > MAX_EXTENSION_LEN
        || !ext.chars().all(|c| c.is_ascii_alphanumeric())
    {
        return None;
    }
    Some(ext.to_ascii_lowercase())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn extracts_lowercased_extension() {
        assert_eq!(file_extension("report.PDF"), Some("pdf".into()));
        assert_eq!(file_extension("archive.tar.gz"), Some("gz".into()));
        assert_eq!(file_extension("dir/sub\\virus.exe. "), Some("exe".into()));
        assert_eq!(file_extension(".bashrc"), None);
        assert_eq!(file_extension("README"), None);
        assert_eq!(file_extension("weird.ex e"), None);
    }

    #[test]
    fn default_policy_blocks_executables() {
        let policy = DenylistPolicy::default();
        assert_eq!(
            policy.check("virus.exe", None),
            Err(ValidationError::DisallowedExtension(".exe".into()))
        );
        assert!(policy.check("Setup.EXE", None).is_err());
        assert!(policy.check("install.sh", Some("text/plain")).is_err());
        assert!(policy.check("report.pdf", Some("application/pdf")).is_ok());
    }

    #[test]
    fn content_type_denylist_ignores_parameters_and_case() {
        let policy = DenylistPolicy::default();
        assert_eq!(
            policy.check("payload.bin", Some("Application/X-MSDownload; foo=bar")),
            Err(ValidationError::DisallowedContentType(
                "application/x-msdownload".into()
            ))
        );
    }

    #[test]
    fn custom_lists_are_normalized() {
        let policy = DenylistPolicy::new([".JS", " ps1 "], Vec::<String>::new());
        assert!(policy.check("x.js", None).is_err());
        assert!(policy.check("x.ps1", None).is_err());
        assert!(policy.check("x.exe", None).is_ok());
    }
}
