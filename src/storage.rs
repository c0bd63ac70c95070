use anyhow::{anyhow, Context};
use sha2::{Digest, Sha256};
use std::fs::File;
use std::io::Read;
use std::path::Path;

const REPORT_DIR: &str = "report_files";

/// A report attachment copied into the store under a staging name. The
/// final path only becomes live via `promote_staged`, so a submission whose
/// database write fails never clobbers the previously stored file.
#[derive(Debug, Clone)]
pub struct StagedAttachment {
    /// Path relative to the workspace root, as persisted in the reports row.
    pub rel_path: String,
    staging_rel_path: String,
    pub checksum: String,
}

/// Copies a submitted report file into the workspace store next to its
/// final location (`report_files/<applicant>/<target_ym><ext>`), under a
/// `.uploading` staging name. Returns the final relative path and the
/// sha-256 of the staged bytes.
pub fn stage_report_file(
    workspace: &Path,
    applicant_id: &str,
    target_ym: i64,
    src: &Path,
) -> anyhow::Result<StagedAttachment> {
    let meta = std::fs::metadata(src)
        .with_context(|| format!("failed to stat upload file {}", src.to_string_lossy()))?;
    if !meta.is_file() {
        return Err(anyhow!("upload path is not a file: {}", src.to_string_lossy()));
    }
    if meta.len() == 0 {
        return Err(anyhow!("upload file is empty: {}", src.to_string_lossy()));
    }

    let ext = src
        .extension()
        .and_then(|e| e.to_str())
        .map(|e| format!(".{}", e))
        .unwrap_or_default();
    let rel_path = format!("{}/{}/{}{}", REPORT_DIR, applicant_id, target_ym, ext);
    let staging_rel_path = format!("{}.uploading", rel_path);

    let dst = workspace.join(&staging_rel_path);
    if let Some(parent) = dst.parent() {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("failed to create directory {}", parent.to_string_lossy()))?;
    }
    if dst.exists() {
        let _ = std::fs::remove_file(&dst);
    }
    std::fs::copy(src, &dst).with_context(|| {
        format!(
            "failed to copy report file from {} to {}",
            src.to_string_lossy(),
            dst.to_string_lossy()
        )
    })?;

    let checksum = file_sha256(&dst)?;

    Ok(StagedAttachment {
        rel_path,
        staging_rel_path,
        checksum,
    })
}

/// Moves a staged attachment onto its final path, replacing any prior
/// month's file. Called only after the reports row has committed.
pub fn promote_staged(workspace: &Path, staged: &StagedAttachment) -> anyhow::Result<()> {
    let from = workspace.join(&staged.staging_rel_path);
    let to = workspace.join(&staged.rel_path);
    if to.exists() {
        std::fs::remove_file(&to).with_context(|| {
            format!(
                "failed to remove existing report file {}",
                to.to_string_lossy()
            )
        })?;
    }
    std::fs::rename(&from, &to).with_context(|| {
        format!(
            "failed to move staged report file to {}",
            to.to_string_lossy()
        )
    })?;
    Ok(())
}

/// Best-effort cleanup of a staged file whose submission failed.
pub fn discard_staged(workspace: &Path, staged: &StagedAttachment) {
    let _ = std::fs::remove_file(workspace.join(&staged.staging_rel_path));
}

/// Copies a stored attachment out of the workspace, re-verifying the
/// checksum recorded at submission time when one is present.
pub fn export_report_file(
    workspace: &Path,
    rel_path: &str,
    expected_checksum: Option<&str>,
    out_path: &Path,
) -> anyhow::Result<u64> {
    let src = workspace.join(rel_path);
    if !src.is_file() {
        return Err(anyhow!(
            "stored report file not found: {}",
            src.to_string_lossy()
        ));
    }

    if let Some(expected) = expected_checksum {
        let actual = file_sha256(&src)?;
        if actual != expected {
            return Err(anyhow!(
                "stored report file checksum mismatch: expected {} got {}",
                expected,
                actual
            ));
        }
    }

    if let Some(parent) = out_path.parent() {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("failed to create directory {}", parent.to_string_lossy()))?;
    }
    let bytes = std::fs::copy(&src, out_path).with_context(|| {
        format!(
            "failed to copy report file from {} to {}",
            src.to_string_lossy(),
            out_path.to_string_lossy()
        )
    })?;

    Ok(bytes)
}

fn file_sha256(path: &Path) -> anyhow::Result<String> {
    let mut f = File::open(path)
        .with_context(|| format!("failed to open {}", path.to_string_lossy()))?;
    let mut hasher = Sha256::new();
    let mut buf = [0u8; 64 * 1024];
    loop {
        let n = f
            .read(&mut buf)
            .with_context(|| format!("failed to read {}", path.to_string_lossy()))?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }
    Ok(format!("{:x}", hasher.finalize()))
}
