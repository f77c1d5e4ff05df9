use std::path::PathBuf;

/// Split a submission's file reference into candidate paths. The reference is
/// either a JSON array of paths or a single path.
pub fn parse_file_refs(value: &str) -> Vec<String> {
    let trimmed = value.trim();
    if trimmed.is_empty() {
        return Vec::new();
    }
    if trimmed.starts_with('[') {
        if let Ok(paths) = serde_json::from_str::<Vec<serde_json::Value>>(trimmed) {
            return paths
                .into_iter()
                .filter_map(|p| match p {
                    serde_json::Value::String(s) => Some(s),
                    serde_json::Value::Null => None,
                    other => Some(other.to_string()),
                })
                .filter(|p| !p.trim().is_empty())
                .collect();
        }
    }
    vec![trimmed.to_string()]
}

/// Collect at most `max_images` evidence files no larger than `max_bytes`.
///
/// Missing, oversized, unreadable and non-image files are skipped and logged.
/// Never fails: a submission without usable evidence is graded on its text.
pub async fn collect_evidence(file_url: &str, max_images: usize, max_bytes: u64) -> Vec<PathBuf> {
    let mut kept = Vec::new();

    for candidate in parse_file_refs(file_url) {
        if kept.len() >= max_images {
            tracing::debug!(path = %candidate, max_images, "Evidence limit reached");
            break;
        }

        let path = PathBuf::from(&candidate);
        let metadata = match tokio::fs::metadata(&path).await {
            Ok(m) if m.is_file() => m,
            Ok(_) => {
                tracing::warn!(path = %candidate, "Skipping evidence that is not a file");
                continue;
            }
            Err(e) => {
                tracing::warn!(path = %candidate, error = %e, "Skipping missing evidence image");
                continue;
            }
        };

        if metadata.len() > max_bytes {
            tracing::warn!(
                path = %candidate,
                size_bytes = metadata.len(),
                max_bytes,
                "Skipping evidence image over size limit"
            );
            continue;
        }

        if !looks_like_image(&path).await {
            tracing::warn!(path = %candidate, "Skipping evidence with unrecognized image format");
            continue;
        }

        kept.push(path);
    }

    kept
}

/// Sniff the file header; the grader only accepts formats it can decode.
async fn looks_like_image(path: &std::path::Path) -> bool {
    use tokio::io::AsyncReadExt;

    let mut header = [0u8; 32];
    let read = match tokio::fs::File::open(path).await {
        Ok(mut file) => file.read(&mut header).await.unwrap_or(0),
        Err(_) => return false,
    };
    image::guess_format(&header[..read]).is_ok()
}
