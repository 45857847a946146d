use std::io::Write;
use std::path::PathBuf;
use std::process::{Command, Stdio};
use std::thread;

use crate::error::{MailstashError, Result};

/// HTML to paginated document conversion.
pub trait Renderer: Send + Sync {
    /// Returns the complete document, or an error and no bytes at all.
    fn render(&self, html: &str) -> Result<Vec<u8>>;
}

/// Renders through a `wkhtmltopdf`-compatible executable, streaming HTML on
/// stdin and reading the PDF from stdout.
#[derive(Debug, Clone)]
pub struct CommandRenderer {
    program: PathBuf,
    page_format: String,
}

impl CommandRenderer {
    pub fn new(program: impl Into<PathBuf>, page_format: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            page_format: page_format.into(),
        }
    }
}

impl Renderer for CommandRenderer {
    fn render(&self, html: &str) -> Result<Vec<u8>> {
        let mut child = Command::new(&self.program)
            .arg("--quiet")
            .arg("--page-size")
            .arg(&self.page_format)
            .arg("-")
            .arg("-")
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|e| {
                MailstashError::Render(format!(
                    "failed to run {}: {e}",
                    self.program.display()
                ))
            })?;

        let mut stdin = child
            .stdin
            .take()
            .ok_or_else(|| MailstashError::Render("renderer stdin unavailable".to_string()))?;
        let input = html.as_bytes().to_vec();
        // Feed stdin from a separate thread so a full stdout pipe can't deadlock us.
        let feeder = thread::spawn(move || stdin.write_all(&input));

        let output = child
            .wait_with_output()
            .map_err(|e| MailstashError::Render(format!("renderer did not finish: {e}")))?;
        let fed = feeder
            .join()
            .map_err(|_| MailstashError::Render("renderer stdin writer panicked".to_string()))?;

        if !output.status.success() {
            return Err(MailstashError::Render(format!(
                "{} exited with {}: {}",
                self.program.display(),
                output.status,
                String::from_utf8_lossy(&output.stderr).trim()
            )));
        }
        fed.map_err(|e| MailstashError::Render(format!("failed to send HTML: {e}")))?;
        if output.stdout.is_empty() {
            return Err(MailstashError::Render(format!(
                "{} produced no output",
                self.program.display()
            )));
        }
        Ok(output.stdout)
    }
}
