//! Artifact writers. Every artifact name is claimed exactly once: an existing
//! file is reported and left alone, so re-running over the same window is
//! harmless.

use std::fs::{self, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::process;
use std::sync::atomic::{AtomicU64, Ordering};

use crate::error::Result;
use crate::message::Attachment;
use crate::perms::{self, Ownership};
use crate::render::Renderer;
use crate::report::ArtifactKind;

pub const HTML_FILE: &str = "content.html";
pub const PDF_FILE: &str = "content.pdf";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WriteOutcome {
    Written(PathBuf),
    AlreadyExists(PathBuf),
}

static TEMP_COUNTER: AtomicU64 = AtomicU64::new(0);

/// A sibling of `path` that no other writer (thread or process) will pick.
fn temp_path(path: &Path) -> PathBuf {
    let name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    let n = TEMP_COUNTER.fetch_add(1, Ordering::Relaxed);
    path.with_file_name(format!(".{name}.tmp-{}-{n}", process::id()))
}

/// Fill a private temporary file, secure it, then link it into place under
/// `path`. The link fails if `path` exists, so the first writer wins and a
/// crash never leaves a partial file under the final name.
fn write_new(path: &Path, content: &[u8], ownership: &Ownership) -> Result<WriteOutcome> {
    if path.exists() {
        return Ok(WriteOutcome::AlreadyExists(path.to_path_buf()));
    }

    let tmp = temp_path(path);
    let mut options = OpenOptions::new();
    options.write(true).create_new(true);
    #[cfg(unix)]
    {
        use std::os::unix::fs::OpenOptionsExt;
        options.mode(perms::FILE_MODE);
    }

    let mut file = options.open(&tmp)?;
    let linked = file
        .write_all(content)
        .and_then(|()| file.sync_all())
        .and_then(|()| perms::secure_file(&tmp, ownership))
        .and_then(|()| fs::hard_link(&tmp, path));
    drop(file);
    let _ = fs::remove_file(&tmp);

    match linked {
        Ok(()) => Ok(WriteOutcome::Written(path.to_path_buf())),
        Err(e) if e.kind() == io::ErrorKind::AlreadyExists => {
            Ok(WriteOutcome::AlreadyExists(path.to_path_buf()))
        }
        Err(e) => Err(e.into()),
    }
}

pub fn write_html(dir: &Path, html: &str, ownership: &Ownership) -> Result<WriteOutcome> {
    write_new(&dir.join(HTML_FILE), html.as_bytes(), ownership)
}

pub fn write_pdf(
    dir: &Path,
    html: &str,
    renderer: &dyn Renderer,
    ownership: &Ownership,
) -> Result<WriteOutcome> {
    let path = dir.join(PDF_FILE);
    // Skip the render entirely when the document is already archived.
    if path.exists() {
        return Ok(WriteOutcome::AlreadyExists(path));
    }
    let document = renderer.render(html)?;
    write_new(&path, &document, ownership)
}

/// Write every attachment independently, returning one outcome per attachment
/// in input order.
pub fn write_attachments(
    dir: &Path,
    attachments: &[Attachment],
    ownership: &Ownership,
) -> Vec<(ArtifactKind, Result<WriteOutcome>)> {
    attachments
        .iter()
        .enumerate()
        .map(|(index, attachment)| {
            let name = attachment_file_name(&attachment.filename, index);
            let outcome = write_new(&dir.join(&name), &attachment.content, ownership);
            (ArtifactKind::Attachment(name), outcome)
        })
        .collect()
}

/// Keep the attachment's own name, replacing only what can't appear in a
/// single path component.
pub fn attachment_file_name(filename: &str, index: usize) -> String {
    let name: String = filename
        .trim()
        .chars()
        .map(|c| match c {
            '/' | '\\' | '\0' => '_',
            c => c,
        })
        .collect();
    match name.as_str() {
        "" | "." | ".." => format!("attachment-{}", index + 1),
        _ => name,
    }
}

impl WriteOutcome {
    pub fn path(&self) -> &Path {
        match self {
            WriteOutcome::Written(path) | WriteOutcome::AlreadyExists(path) => path,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::MailstashError;
    use std::sync::atomic::AtomicUsize;

    struct CountingRenderer {
        calls: AtomicUsize,
    }

    impl Renderer for CountingRenderer {
        fn render(&self, html: &str) -> Result<Vec<u8>> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(format!("%PDF-{html}").into_bytes())
        }
    }

    struct BrokenRenderer;

    impl Renderer for BrokenRenderer {
        fn render(&self, _html: &str) -> Result<Vec<u8>> {
            Err(MailstashError::Render("backend crashed".to_string()))
        }
    }

    #[test]
    fn html_is_written_once() {
        let dir = tempfile::tempdir().unwrap();
        let owner = Ownership::default();

        let first = write_html(dir.path(), "<p>one</p>", &owner).unwrap();
        let second = write_html(dir.path(), "<p>two</p>", &owner).unwrap();

        assert!(matches!(first, WriteOutcome::Written(_)));
        assert_eq!(second, WriteOutcome::AlreadyExists(dir.path().join(HTML_FILE)));
        assert_eq!(fs::read_to_string(first.path()).unwrap(), "<p>one</p>");
    }

    #[cfg(unix)]
    #[test]
    fn written_files_are_not_executable() {
        use std::os::unix::fs::PermissionsExt;

        let dir = tempfile::tempdir().unwrap();
        let outcome = write_html(dir.path(), "<p>x</p>", &Ownership::default()).unwrap();

        let mode = fs::metadata(outcome.path()).unwrap().permissions().mode() & 0o777;
        assert_eq!(mode, perms::FILE_MODE);
    }

    #[test]
    fn existing_pdf_skips_rendering() {
        let dir = tempfile::tempdir().unwrap();
        let renderer = CountingRenderer {
            calls: AtomicUsize::new(0),
        };
        let owner = Ownership::default();

        write_pdf(dir.path(), "a", &renderer, &owner).unwrap();
        let again = write_pdf(dir.path(), "b", &renderer, &owner).unwrap();

        assert!(matches!(again, WriteOutcome::AlreadyExists(_)));
        assert_eq!(renderer.calls.load(Ordering::SeqCst), 1);
        assert_eq!(fs::read(dir.path().join(PDF_FILE)).unwrap(), b"%PDF-a");
    }

    #[test]
    fn render_failure_leaves_no_file() {
        let dir = tempfile::tempdir().unwrap();

        let err = write_pdf(dir.path(), "a", &BrokenRenderer, &Ownership::default()).unwrap_err();

        assert!(err.to_string().contains("backend crashed"));
        assert!(!dir.path().join(PDF_FILE).exists());
    }

    #[test]
    fn attachments_are_independent() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("b.txt"), "original").unwrap();
        let attachments = vec![
            Attachment {
                filename: "a.bin".into(),
                content: vec![0, 159, 146, 150],
            },
            Attachment {
                filename: "b.txt".into(),
                content: b"replacement".to_vec(),
            },
            Attachment {
                filename: "c.txt".into(),
                content: b"c".to_vec(),
            },
        ];

        let outcomes = write_attachments(dir.path(), &attachments, &Ownership::default());

        assert_eq!(outcomes.len(), 3);
        assert!(matches!(outcomes[0].1, Ok(WriteOutcome::Written(_))));
        assert!(matches!(outcomes[1].1, Ok(WriteOutcome::AlreadyExists(_))));
        assert!(matches!(outcomes[2].1, Ok(WriteOutcome::Written(_))));
        assert_eq!(fs::read(dir.path().join("a.bin")).unwrap(), [0u8, 159, 146, 150]);
        assert_eq!(fs::read_to_string(dir.path().join("b.txt")).unwrap(), "original");
    }

    #[test]
    fn attachment_names_stay_inside_the_directory() {
        assert_eq!(attachment_file_name("report 2024.pdf", 0), "report 2024.pdf");
        assert_eq!(attachment_file_name("../../etc/passwd", 0), ".._.._etc_passwd");
        assert_eq!(attachment_file_name("..", 1), "attachment-2");
        assert_eq!(attachment_file_name("  ", 2), "attachment-3");
    }

    #[test]
    fn no_temporary_files_are_left_behind() {
        let dir = tempfile::tempdir().unwrap();
        let owner = Ownership::default();

        write_html(dir.path(), "<p>x</p>", &owner).unwrap();
        write_pdf(dir.path(), "x", &BrokenRenderer, &owner).unwrap_err();
        write_html(dir.path(), "<p>y</p>", &owner).unwrap();

        let names: Vec<_> = fs::read_dir(dir.path())
            .unwrap()
            .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
            .collect();
        assert_eq!(names, [HTML_FILE]);
    }

    #[test]
    fn leftover_temporary_file_does_not_block_the_write() {
        let dir = tempfile::tempdir().unwrap();
        let target = dir.path().join(HTML_FILE);
        // What an interrupted earlier run leaves: a partial, hidden sibling.
        fs::write(temp_path(&target), "<p>trunc").unwrap();
        fs::write(dir.path().join(format!(".{HTML_FILE}.tmp-1-0")), "<p>trunc").unwrap();

        let outcome = write_html(dir.path(), "<p>complete</p>", &Ownership::default()).unwrap();

        assert_eq!(outcome, WriteOutcome::Written(target.clone()));
        assert_eq!(fs::read_to_string(&target).unwrap(), "<p>complete</p>");
    }
}
