use crate::ReviewError;

pub const DEFAULT_MAX_ATTACHMENT_BYTES: usize = 8 * 1024 * 1024;
pub const MAX_FILENAME_BYTES: usize = 180;

/// Checks an uploaded file before anything is written. Returns the trimmed filename.
pub(crate) fn validate_upload<'a>(
    filename: &'a str,
    bytes: &[u8],
    max_bytes: usize,
) -> Result<&'a str, ReviewError> {
    let filename = filename.trim();
    if filename.is_empty() {
        return Err(ReviewError::Validation("filename is required".into()));
    }
    if filename.len() > MAX_FILENAME_BYTES {
        return Err(ReviewError::Validation(format!("filename '{filename}' is too long")));
    }
    if filename.contains('/') || filename.contains('\\') {
        return Err(ReviewError::Validation(format!(
            "filename '{filename}' must not contain path separators"
        )));
    }
    if bytes.is_empty() {
        return Err(ReviewError::Validation(format!("'{filename}' is empty")));
    }
    if bytes.len() > max_bytes {
        return Err(ReviewError::Validation(format!("'{filename}' exceeds {max_bytes} bytes")));
    }
    Ok(filename)
}
