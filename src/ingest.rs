//! Document text extraction and audio transcription.
//!
//! Both produce plain text that is fed to the conversation as a user turn.

use anyhow::{anyhow, bail, Context, Result};
use async_trait::async_trait;
use regex::Regex;
use serde::Deserialize;
use std::io::Read;
use std::path::Path;
use std::sync::{Arc, LazyLock};
use std::time::Duration;
use tracing::{debug, info};

use crate::config::IngestConfig;
use crate::error::ValidationError;

pub const TRUNCATION_MARKER: &str = "\n\n[... document truncated ...]";

static XML_TAG: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"<[^>]+>").expect("xml tag regex"));

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DocumentKind {
    Text,
    Markdown,
    Pdf,
    Docx,
}

impl DocumentKind {
    /// Classify by file extension.
    pub fn from_file_name(file_name: &str) -> Result<Self, ValidationError> {
        let ext = Path::new(file_name)
            .extension()
            .and_then(|e| e.to_str())
            .map(str::to_lowercase)
            .unwrap_or_default();
        match ext.as_str() {
            "txt" | "text" | "log" | "csv" => Ok(Self::Text),
            "md" | "markdown" => Ok(Self::Markdown),
            "pdf" => Ok(Self::Pdf),
            "docx" => Ok(Self::Docx),
            _ => Err(ValidationError::UnsupportedDocument(file_name.to_string())),
        }
    }

    pub fn label(&self) -> &'static str {
        match self {
            Self::Text => "text",
            Self::Markdown => "Markdown",
            Self::Pdf => "PDF",
            Self::Docx => "DOCX",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExtractedDocument {
    pub kind: DocumentKind,
    pub text: String,
    pub truncated: bool,
}

/// Blocking extraction; callers run it on the worker pool.
pub trait DocumentExtractor: Send + Sync {
    fn extract(&self, path: &Path, file_name: &str) -> Result<ExtractedDocument>;
}

pub struct LocalExtractor {
    max_chars: usize,
}

impl LocalExtractor {
    pub fn new(max_chars: usize) -> Self {
        Self { max_chars }
    }
}

impl DocumentExtractor for LocalExtractor {
    fn extract(&self, path: &Path, file_name: &str) -> Result<ExtractedDocument> {
        let kind = DocumentKind::from_file_name(file_name)?;
        let raw = match kind {
            DocumentKind::Text | DocumentKind::Markdown => std::fs::read(path)
                .map(|bytes| String::from_utf8_lossy(&bytes).into_owned())
                .with_context(|| format!("failed to read {}", path.display()))?,
            DocumentKind::Pdf => pdf_extract::extract_text(path)
                .map_err(|e| anyhow!("failed to extract PDF text: {e}"))?,
            DocumentKind::Docx => docx_text(path)?,
        };

        let raw = raw.trim();
        if raw.is_empty() {
            bail!("{file_name} contains no extractable text");
        }
        let (text, truncated) = truncate_chars(raw, self.max_chars);
        debug!(file = %file_name, kind = kind.label(), chars = text.len(), truncated, "document extracted");
        Ok(ExtractedDocument {
            kind,
            text,
            truncated,
        })
    }
}

fn docx_text(path: &Path) -> Result<String> {
    let file = std::fs::File::open(path).with_context(|| format!("failed to open {}", path.display()))?;
    let mut archive = zip::ZipArchive::new(file).context("not a valid DOCX archive")?;
    let mut xml = String::new();
    archive
        .by_name("word/document.xml")
        .context("DOCX has no word/document.xml")?
        .read_to_string(&mut xml)?;

    let xml = xml
        .replace("</w:p>", "\n")
        .replace("<w:tab/>", "\t")
        .replace("<w:br/>", "\n");
    let text = XML_TAG.replace_all(&xml, "");
    Ok(text
        .replace("&lt;", "<")
        .replace("&gt;", ">")
        .replace("&quot;", "\"")
        .replace("&apos;", "'")
        .replace("&amp;", "&"))
}

fn truncate_chars(text: &str, max_chars: usize) -> (String, bool) {
    match text.char_indices().nth(max_chars) {
        Some((cut, _)) => (format!("{}{TRUNCATION_MARKER}", &text[..cut]), true),
        None => (text.to_string(), false),
    }
}

/// The user turn that carries a document into the conversation.
pub fn frame_document(file_name: &str, doc: &ExtractedDocument, caption: Option<&str>) -> String {
    let kind = doc.kind.label();
    match caption.map(str::trim).filter(|c| !c.is_empty()) {
        Some(caption) => format!(
            "[The user sent a {kind} document named '{file_name}' with the message: '{caption}']\n\n\
             Document content:\n{}\n\n\
             Respond taking into account the document and the user's message.",
            doc.text
        ),
        None => format!(
            "[The user sent a {kind} document named '{file_name}']\n\n\
             Document content:\n{}\n\n\
             Summarize or comment on the document's content.",
            doc.text
        ),
    }
}

#[async_trait]
pub trait Transcriber: Send + Sync {
    async fn transcribe(&self, audio: &Path) -> Result<String>;
}

/// Runs a local speech-to-text program; `{input}` in any argument is replaced
/// with the audio path and the program's stdout is the transcript.
pub struct CommandTranscriber {
    argv: Vec<String>,
}

impl CommandTranscriber {
    pub fn new(argv: Vec<String>) -> Result<Self> {
        anyhow::ensure!(!argv.is_empty(), "ingest.transcribe_command is empty");
        Ok(Self { argv })
    }
}

#[async_trait]
impl Transcriber for CommandTranscriber {
    async fn transcribe(&self, audio: &Path) -> Result<String> {
        let input = audio.display().to_string();
        let args: Vec<String> = self.argv[1..]
            .iter()
            .map(|arg| arg.replace("{input}", &input))
            .collect();

        let output = tokio::process::Command::new(&self.argv[0])
            .args(&args)
            .kill_on_drop(true)
            .stdin(std::process::Stdio::null())
            .output()
            .await
            .with_context(|| format!("failed to run {}", self.argv[0]))?;
        if !output.status.success() {
            bail!(
                "{} exited with {}: {}",
                self.argv[0],
                output.status,
                String::from_utf8_lossy(&output.stderr).trim()
            );
        }

        let transcript = String::from_utf8_lossy(&output.stdout).trim().to_string();
        anyhow::ensure!(!transcript.is_empty(), "transcription produced no text");
        info!(chars = transcript.len(), "audio transcribed");
        Ok(transcript)
    }
}

/// OpenAI-compatible `/v1/audio/transcriptions` endpoint.
pub struct HttpTranscriber {
    client: reqwest::Client,
    base_url: String,
    model: String,
}

#[derive(Deserialize)]
struct TranscriptionResponse {
    text: String,
}

impl HttpTranscriber {
    pub fn new(base_url: &str, model: &str) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(300))
            .build()
            .context("failed to build HTTP client")?;
        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            model: model.to_string(),
        })
    }
}

#[async_trait]
impl Transcriber for HttpTranscriber {
    async fn transcribe(&self, audio: &Path) -> Result<String> {
        let bytes = tokio::fs::read(audio)
            .await
            .with_context(|| format!("failed to read {}", audio.display()))?;
        let file_name = audio
            .file_name()
            .and_then(|n| n.to_str())
            .unwrap_or("audio")
            .to_string();

        let form = reqwest::multipart::Form::new()
            .text("model", self.model.clone())
            .part("file", reqwest::multipart::Part::bytes(bytes).file_name(file_name));

        let url = format!("{}/v1/audio/transcriptions", self.base_url);
        let response = self
            .client
            .post(&url)
            .multipart(form)
            .send()
            .await
            .with_context(|| format!("transcription request to {url} failed"))?;
        let status = response.status();
        anyhow::ensure!(status.is_success(), "transcription endpoint returned HTTP {status}");

        let body: TranscriptionResponse =
            response.json().await.context("invalid transcription response")?;
        Ok(body.text.trim().to_string())
    }
}

pub fn build_transcriber(config: &IngestConfig) -> Result<Arc<dyn Transcriber>> {
    match config.transcriber.as_str() {
        "command" => Ok(Arc::new(CommandTranscriber::new(config.transcribe_command.clone())?)),
        "http" => Ok(Arc::new(HttpTranscriber::new(
            &config.transcribe_url,
            &config.transcribe_model,
        )?)),
        other => bail!("unknown ingest.transcriber {other:?} (expected \"command\" or \"http\")"),
    }
}
