//! Raw value annotation of per identifier CSV templates
//!
//! Each identifier has a template `did_<key>.csv` in the format directory. The first column
//! of every data row holds a 1-based index into the data bytes of the response. The annotated
//! copy gets one extra column holding the raw byte at that index, or `N/A`.

use std::{
    fs::File,
    io::{BufRead, BufReader, ErrorKind, Read, Write},
    path::{Path, PathBuf},
};

use crate::{aggregator::ResponseOutcome, uds::DataIdentifier};

/// Label of the appended column
pub const RAW_VALUE_COLUMN: &str = "Raw value";
/// Marker for rows whose index is outside the received data
pub const NOT_APPLICABLE: &str = "N/A";
/// Response SID plus the two identifier bytes
pub const RESPONSE_HEADER_LEN: usize = 3;

const UTF8_BOM: &[u8] = b"\xEF\xBB\xBF";

/// Reasons a response could not be annotated. None of them are fatal to a run
#[derive(Debug, thiserror::Error)]
pub enum AnnotateError {
    /// No positive response was received
    #[error("no data to output")]
    NoData,
    /// Payload does not even hold the response header
    #[error("the payload is too short ({0} bytes)")]
    PayloadTooShort(usize),
    /// No template exists for the identifier
    #[error("the source file '{}' does not exist", .0.display())]
    MissingTemplate(PathBuf),
    /// The template has no header row
    #[error("the source file '{}' is empty", .0.display())]
    EmptyTemplate(PathBuf),
    /// A data row's index column is not an integer
    #[error("line {line}: index '{value}' is not an integer")]
    InvalidIndex {
        /// Line in the template
        line: u64,
        /// Offending value
        value: String,
    },
    /// The documentation file to copy does not exist
    #[error("the source file '{}' does not exist", .0.display())]
    MissingReadme(PathBuf),
    /// File system error
    #[error("IO error on '{}'", path.display())]
    Io {
        /// File being accessed
        path: PathBuf,
        /// Underlying error
        #[source]
        source: std::io::Error,
    },
    /// Malformed CSV
    #[error("CSV error")]
    Csv(
        #[from]
        #[source]
        csv::Error,
    ),
}

fn io_err(path: &Path) -> impl FnOnce(std::io::Error) -> AnnotateError + '_ {
    move |source| AnnotateError::Io {
        path: path.to_path_buf(),
        source,
    }
}

/// Annotated CSV written by [TemplateStore::annotate]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AnnotatedCsv {
    /// Template key, lower case hex of the identifier (`fa13`)
    pub key: String,
    /// Output file
    pub path: PathBuf,
    /// Number of data rows
    pub rows: usize,
    /// Number of rows that received a raw value
    pub annotated_rows: usize,
}

/// Derives the template key from the identifier echoed in a positive response
pub fn template_key(payload: &[u8]) -> Result<String, AnnotateError> {
    match payload {
        [_, hi, lo, ..] => Ok(format!("{hi:02x}{lo:02x}")),
        _ => Err(AnnotateError::PayloadTooShort(payload.len())),
    }
}

/// Copies `template` to `out`, appending the raw value column.
/// Returns the number of data rows and how many of them got a value.
///
/// A leading UTF-8 byte order mark is copied to the output
pub fn annotate_records<R: Read, W: Write>(
    template: R,
    mut out: W,
    data: &[u8],
    template_path: &Path,
) -> Result<(usize, usize), AnnotateError> {
    let mut template = BufReader::new(template);
    // The csv reader strips the BOM from the first field
    if template
        .fill_buf()
        .map_err(io_err(template_path))?
        .starts_with(UTF8_BOM)
    {
        out.write_all(UTF8_BOM).map_err(io_err(template_path))?;
    }
    let mut reader = csv::ReaderBuilder::new()
        .has_headers(false)
        .flexible(true)
        .from_reader(template);
    let mut writer = csv::WriterBuilder::new()
        .flexible(true)
        .terminator(csv::Terminator::CRLF)
        .from_writer(out);

    let mut records = reader.byte_records();
    let mut header = match records.next() {
        Some(h) => h?,
        None => return Err(AnnotateError::EmptyTemplate(template_path.to_path_buf())),
    };
    header.push_field(RAW_VALUE_COLUMN.as_bytes());
    writer.write_byte_record(&header)?;

    let (mut rows, mut annotated) = (0, 0);
    for record in records {
        let mut record = record?;
        let line = record.position().map_or(0, |p| p.line());
        let raw_index = record.get(0).unwrap_or_default();
        let index = std::str::from_utf8(raw_index)
            .ok()
            .and_then(|s| s.trim().parse::<i64>().ok())
            .ok_or_else(|| AnnotateError::InvalidIndex {
                line,
                value: String::from_utf8_lossy(raw_index).into_owned(),
            })?;
        match usize::try_from(index) {
            Ok(n) if (1..=data.len()).contains(&n) => {
                record.push_field(data[n - 1].to_string().as_bytes());
                annotated += 1;
            }
            _ => record.push_field(NOT_APPLICABLE.as_bytes()),
        }
        writer.write_byte_record(&record)?;
        rows += 1;
    }
    writer
        .flush()
        .map_err(io_err(template_path))?;
    Ok((rows, annotated))
}

/// Template input and result output directories
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TemplateStore {
    format_dir: PathBuf,
    result_dir: PathBuf,
}

impl TemplateStore {
    /// Creates a store. Nothing is touched on disk until it is used
    pub fn new(format_dir: impl Into<PathBuf>, result_dir: impl Into<PathBuf>) -> Self {
        Self {
            format_dir: format_dir.into(),
            result_dir: result_dir.into(),
        }
    }

    /// Template of a key
    pub fn template_path(&self, key: &str) -> PathBuf {
        self.format_dir.join(format!("did_{key}.csv"))
    }

    /// Annotated output of a key
    pub fn output_path(&self, key: &str) -> PathBuf {
        self.result_dir.join(format!("did_{key}.csv"))
    }

    /// Writes the annotated copy of the template matching a positive response.
    ///
    /// The template is never modified and the output is only written once the whole
    /// template was processed, so a failure leaves no partial file behind.
    pub fn annotate(
        &self,
        outcome: &ResponseOutcome,
        did: DataIdentifier,
    ) -> Result<AnnotatedCsv, AnnotateError> {
        let payload = outcome.payload().ok_or(AnnotateError::NoData)?;
        let key = template_key(payload)?;
        let requested = format!("{did:04x}");
        if key != requested {
            log::warn!("Response echoes DID {key}, requested {requested}");
        }
        let data = &payload[RESPONSE_HEADER_LEN..];

        let source = self.template_path(&key);
        let file = match File::open(&source) {
            Ok(f) => f,
            Err(e) if e.kind() == ErrorKind::NotFound => {
                return Err(AnnotateError::MissingTemplate(source));
            }
            Err(e) => return Err(io_err(&source)(e)),
        };
        let mut buf = Vec::new();
        let (rows, annotated_rows) = annotate_records(file, &mut buf, data, &source)?;

        std::fs::create_dir_all(&self.result_dir).map_err(io_err(&self.result_dir))?;
        let path = self.output_path(&key);
        std::fs::write(&path, buf).map_err(io_err(&path))?;
        log::debug!(
            "Wrote {} ({rows} rows, {annotated_rows} with raw values)",
            path.display()
        );
        Ok(AnnotatedCsv {
            key,
            path,
            rows,
            annotated_rows,
        })
    }

    /// Copies a documentation file unchanged from the format to the result directory
    pub fn copy_readme(&self, name: &str) -> Result<PathBuf, AnnotateError> {
        let source = self.format_dir.join(name);
        if !source.is_file() {
            return Err(AnnotateError::MissingReadme(source));
        }
        std::fs::create_dir_all(&self.result_dir).map_err(io_err(&self.result_dir))?;
        let dest = self.result_dir.join(name);
        std::fs::copy(&source, &dest).map_err(io_err(&source))?;
        Ok(dest)
    }
}
