use crate::error::IngestError;
use lopdf::Document;
use std::path::Path;

pub const TEXT_PLAIN: &str = "text/plain";
pub const APPLICATION_PDF: &str = "application/pdf";
pub const OCTET_STREAM: &str = "application/octet-stream";

/// Turns a stored upload into raw text according to its content type.
///
/// Parsing is blocking file IO; async callers run it on the blocking pool.
pub trait DocumentParser: Send + Sync {
    fn parse(&self, path: &Path, content_type: &str) -> Result<String, IngestError>;
}

#[derive(Debug, Clone)]
pub struct PageText {
    pub number: u32,
    pub text: String,
}

pub trait PdfExtractor: Send + Sync {
    fn extract_pages(&self, path: &Path) -> Result<Vec<PageText>, IngestError>;
}

#[derive(Default)]
pub struct LopdfExtractor;

impl PdfExtractor for LopdfExtractor {
    fn extract_pages(&self, path: &Path) -> Result<Vec<PageText>, IngestError> {
        let document = Document::load(path).map_err(|error| IngestError::PdfParse(error.to_string()))?;

        let mut pages = Vec::new();
        for (page_no, _page_id) in document.get_pages() {
            let text = document
                .extract_text(&[page_no])
                .map_err(|error| IngestError::PdfParse(error.to_string()))?;

            if !text.trim().is_empty() {
                pages.push(PageText {
                    number: page_no,
                    text,
                });
            }
        }

        if pages.is_empty() {
            return Err(IngestError::PdfParse(format!(
                "pdf had no readable page text: {}",
                path.display()
            )));
        }

        Ok(pages)
    }
}

/// Dispatches on content type: plain text is decoded lossily, PDFs are
/// extracted page by page and joined with newlines in page order.
pub struct ContentTypeParser {
    pdf: Box<dyn PdfExtractor>,
}

impl ContentTypeParser {
    pub fn new(pdf: Box<dyn PdfExtractor>) -> Self {
        Self { pdf }
    }
}

impl Default for ContentTypeParser {
    fn default() -> Self {
        Self::new(Box::new(LopdfExtractor))
    }
}

impl DocumentParser for ContentTypeParser {
    fn parse(&self, path: &Path, content_type: &str) -> Result<String, IngestError> {
        match content_type {
            TEXT_PLAIN => {
                let bytes = std::fs::read(path)?;
                Ok(String::from_utf8_lossy(&bytes).into_owned())
            }
            APPLICATION_PDF => {
                let mut pages = self.pdf.extract_pages(path)?;
                pages.sort_by_key(|page| page.number);
                Ok(pages
                    .into_iter()
                    .map(|page| page.text)
                    .collect::<Vec<_>>()
                    .join("\n"))
            }
            other => Err(IngestError::UnsupportedContentType(other.to_string())),
        }
    }
}

/// Content type implied by a file extension.
pub fn guess_content_type(path: &Path) -> &'static str {
    let extension = path
        .extension()
        .and_then(|ext| ext.to_str())
        .map(str::to_ascii_lowercase);

    match extension.as_deref() {
        Some("txt") | Some("md") | Some("text") => TEXT_PLAIN,
        Some("pdf") => APPLICATION_PDF,
        _ => OCTET_STREAM,
    }
}
