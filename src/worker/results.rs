use std::cmp::Ordering;
use std::path::{Path, PathBuf};
use std::time::SystemTime;

/// Subdirectory of a job's output dir where workers drop per-document PDFs.
pub const SUPPLEMENTARY_DIR: &str = "pdfs";

const PRIMARY_EXTENSIONS: &[&str] = &["pdf", "json", "txt"];
const SUPPLEMENTARY_EXTENSIONS: &[&str] = &["pdf"];

#[derive(Debug)]
struct Artifact {
    reference: String,
    name: String,
    modified: SystemTime,
}

impl Artifact {
    fn is_pdf(&self) -> bool {
        has_extension(&self.name, "pdf")
    }

    /// 0 = combined report, 1 = other PDF, 2 = everything else
    fn rank(&self) -> u8 {
        if self.is_pdf() && self.name.contains("_report_") {
            0
        } else if self.is_pdf() {
            1
        } else {
            2
        }
    }
}

fn has_extension(name: &str, ext: &str) -> bool {
    Path::new(name)
        .extension()
        .is_some_and(|e| e.eq_ignore_ascii_case(ext))
}

fn artifact_order(a: &Artifact, b: &Artifact) -> Ordering {
    a.rank()
        .cmp(&b.rank())
        .then_with(|| b.modified.cmp(&a.modified))
        .then_with(|| a.reference.cmp(&b.reference))
}

/// Finds the files a worker generated and ranks them for download.
#[derive(Debug, Clone, Default)]
pub struct ResultLocator;

impl ResultLocator {
    pub fn new() -> Self {
        Self
    }

    /// Ranked result references for `output_dir`, relative to it.
    ///
    /// Combined reports come first, then other PDFs, then the rest; each
    /// group is newest first. A missing directory yields no results.
    pub async fn locate(&self, output_dir: &Path) -> Vec<String> {
        let mut artifacts = scan(output_dir, "", PRIMARY_EXTENSIONS).await;
        artifacts.extend(
            scan(
                &output_dir.join(SUPPLEMENTARY_DIR),
                &format!("{}/", SUPPLEMENTARY_DIR),
                SUPPLEMENTARY_EXTENSIONS,
            )
            .await,
        );
        artifacts.sort_by(artifact_order);
        artifacts.into_iter().map(|a| a.reference).collect()
    }

    /// Resolve a result reference back to a path inside `output_dir`.
    /// References that would escape the directory are refused.
    pub fn resolve(&self, output_dir: &Path, reference: &str) -> Option<PathBuf> {
        let relative = Path::new(reference);
        let safe = relative
            .components()
            .all(|c| matches!(c, std::path::Component::Normal(_)));
        if !safe || reference.is_empty() {
            return None;
        }
        Some(output_dir.join(relative))
    }
}

/// Number of per-document PDFs among located result references.
pub fn supplementary_pdf_count(references: &[String]) -> usize {
    let prefix = format!("{}/", SUPPLEMENTARY_DIR);
    references
        .iter()
        .filter(|r| r.starts_with(&prefix) && has_extension(r, "pdf"))
        .count()
}

async fn scan(dir: &Path, prefix: &str, extensions: &[&str]) -> Vec<Artifact> {
    let mut found = Vec::new();
    let mut entries = match tokio::fs::read_dir(dir).await {
        Ok(entries) => entries,
        Err(e) => {
            if e.kind() != std::io::ErrorKind::NotFound {
                tracing::warn!(dir = %dir.display(), error = %e, "Failed to scan result directory");
            }
            return found;
        }
    };

    loop {
        let entry = match entries.next_entry().await {
            Ok(Some(entry)) => entry,
            Ok(None) => break,
            Err(e) => {
                tracing::warn!(dir = %dir.display(), error = %e, "Failed to read directory entry");
                break;
            }
        };
        let name = entry.file_name().to_string_lossy().into_owned();
        if !extensions.iter().any(|ext| has_extension(&name, ext)) {
            continue;
        }
        let metadata = match entry.metadata().await {
            Ok(m) if m.is_file() => m,
            _ => continue,
        };
        found.push(Artifact {
            reference: format!("{}{}", prefix, name),
            modified: metadata.modified().unwrap_or(SystemTime::UNIX_EPOCH),
            name,
        });
    }
    found
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs::{self, File, FileTimes};
    use std::time::Duration;

    fn touch(path: &Path, age_secs: u64) {
        let file = File::create(path).unwrap();
        let mtime = SystemTime::now() - Duration::from_secs(age_secs);
        file.set_times(FileTimes::new().set_modified(mtime)).unwrap();
    }

    #[tokio::test]
    async fn missing_directory_is_empty() {
        let dir = tempfile::tempdir().unwrap();
        let results = ResultLocator::new().locate(&dir.path().join("nope")).await;
        assert!(results.is_empty());
    }

    #[tokio::test]
    async fn ranks_reports_then_pdfs_then_others() {
        let dir = tempfile::tempdir().unwrap();
        let out = dir.path();
        fs::create_dir(out.join(SUPPLEMENTARY_DIR)).unwrap();

        touch(&out.join("summary.json"), 1);
        touch(&out.join("notes.txt"), 50);
        touch(&out.join("tracking_report_2024.pdf"), 100);
        touch(&out.join("older.pdf"), 200);
        touch(&out.join("ignored.xlsx"), 0);
        touch(&out.join(SUPPLEMENTARY_DIR).join("bl_001.pdf"), 10);
        touch(&out.join(SUPPLEMENTARY_DIR).join("stray.json"), 0);

        let results = ResultLocator::new().locate(out).await;
        assert_eq!(
            results,
            vec![
                "tracking_report_2024.pdf",
                "pdfs/bl_001.pdf",
                "older.pdf",
                "summary.json",
                "notes.txt",
            ]
        );
    }

    #[tokio::test]
    async fn repeated_scans_agree() {
        let dir = tempfile::tempdir().unwrap();
        fs::create_dir(dir.path().join(SUPPLEMENTARY_DIR)).unwrap();
        for name in ["a.pdf", "b.pdf", "c.txt"] {
            touch(&dir.path().join(name), 5);
        }
        touch(&dir.path().join(SUPPLEMENTARY_DIR).join("a.pdf"), 5);

        let locator = ResultLocator::new();
        let first = locator.locate(dir.path()).await;
        let second = locator.locate(dir.path()).await;
        assert_eq!(first.len(), 4);
        assert_eq!(first, second);
    }

    #[test]
    fn counts_only_supplementary_pdfs() {
        let refs: Vec<String> = ["summary_report_1.pdf", "pdfs/a.pdf", "pdfs/b.PDF", "result.json"]
            .iter()
            .map(|s| s.to_string())
            .collect();
        assert_eq!(supplementary_pdf_count(&refs), 2);
        assert_eq!(supplementary_pdf_count(&[]), 0);
    }

    #[test]
    fn resolve_rejects_escapes() {
        let locator = ResultLocator::new();
        let root = Path::new("/results/job_1");
        assert_eq!(
            locator.resolve(root, "pdfs/a.pdf"),
            Some(PathBuf::from("/results/job_1/pdfs/a.pdf"))
        );
        assert!(locator.resolve(root, "../other/secret.pdf").is_none());
        assert!(locator.resolve(root, "/etc/passwd").is_none());
        assert!(locator.resolve(root, "").is_none());
    }
}
