//! File-policy enforcement.
//!
//! MIME patterns support a trailing `/*`; extensions match case-insensitively
//! with or without a leading dot; size limits are megabytes.

use pxb_schemas::{BrokerError, FileDescriptor, FilePolicy, Result};

const MB: i64 = 1024 * 1024;

/// Reject the batch on the first violated constraint.
pub fn enforce_policy(policy: &FilePolicy, files: &[FileDescriptor]) -> Result<()> {
    if let Some(max_file_mb) = policy.max_file_mb {
        let limit = (max_file_mb * MB as f64) as i64;
        for f in files {
            if f.size > limit {
                return Err(BrokerError::FilePolicyViolation(format!(
                    "{}: size {} exceeds maxFileMB {}",
                    f.name, f.size, max_file_mb
                )));
            }
        }
    }

    if let Some(max_total_mb) = policy.max_total_mb {
        let limit = (max_total_mb * MB as f64) as i64;
        let total: i64 = files.iter().map(|f| f.size).sum();
        if total > limit {
            return Err(BrokerError::FilePolicyViolation(format!(
                "total size {total} exceeds maxTotalMB {max_total_mb}"
            )));
        }
    }

    if let Some(patterns) = &policy.mime {
        for f in files {
            if !patterns.iter().any(|p| mime_matches(p, &f.mime)) {
                return Err(BrokerError::FilePolicyViolation(format!(
                    "{}: mime {} not allowed",
                    f.name, f.mime
                )));
            }
        }
    }

    if let Some(extensions) = &policy.extensions {
        for f in files {
            let ext = f
                .name
                .rsplit('.')
                .next()
                .map(|e| e.to_ascii_lowercase())
                .unwrap_or_default();
            let allowed = extensions
                .iter()
                .map(|e| e.trim_start_matches('.').to_ascii_lowercase())
                .any(|e| e == ext);
            if !allowed {
                return Err(BrokerError::FilePolicyViolation(format!(
                    "{}: extension not allowed",
                    f.name
                )));
            }
        }
    }

    Ok(())
}

fn mime_matches(pattern: &str, mime: &str) -> bool {
    if let Some(prefix) = pattern.strip_suffix("/*") {
        mime.split('/').next() == Some(prefix)
    } else {
        pattern.eq_ignore_ascii_case(mime)
    }
}
