//! Package manifest: identity, target filename, size and the ordered chunk list.
//!
//! Text format, one field per line:
//!
//! ```text
//! ident:<identity>
//! filename:<file name>
//! size:<total bytes>
//! nhashes:<n>
//! hashes:
//!     <hex hash>            (n lines)
//! nchunks:<m>
//! chunks:
//!     <hex hash>,<offset>,<size>   (m lines)
//! ```

use std::iter::Peekable;
use std::path::{Component, Path};

use crate::integrity;

/// Longest accepted package identity, in bytes.
pub const MAX_IDENT_LEN: usize = 1024;
/// Longest accepted target filename, in bytes.
pub const MAX_FILENAME_LEN: usize = 255;

/// A contiguous byte range of the target file with its expected hash.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Chunk {
    pub hash: String,
    pub offset: u32,
    pub size: u32,
}

impl Chunk {
    /// One past the last byte of this chunk.
    pub fn end(&self) -> u64 {
        u64::from(self.offset) + u64::from(self.size)
    }
}

/// A validated package descriptor. Immutable once built.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Manifest {
    ident: String,
    filename: String,
    size: u32,
    hashes: Vec<String>,
    chunks: Vec<Chunk>,
}

/// Structurally invalid descriptor. The package is not added.
#[derive(Debug, thiserror::Error)]
pub enum ManifestError {
    #[error("failed to read manifest: {0}")]
    Io(#[from] std::io::Error),
    #[error("missing required field `{0}`")]
    MissingField(&'static str),
    #[error("line {line}: duplicate field `{field}`")]
    DuplicateField { field: &'static str, line: usize },
    #[error("line {line}: unexpected line")]
    UnexpectedLine { line: usize },
    #[error("line {line}: invalid number for `{field}`: {value:?}")]
    InvalidNumber {
        field: &'static str,
        line: usize,
        value: String,
    },
    #[error("`{section}` declares {declared} lines but {found} follow")]
    CountMismatch {
        section: &'static str,
        declared: usize,
        found: usize,
    },
    #[error("line {line}: chunk line must be `hash,offset,size`")]
    BadChunkLine { line: usize },
    #[error("invalid hash {0:?}")]
    InvalidHash(String),
    #[error("`{field}` is {len} bytes, limit is {max}")]
    FieldTooLong {
        field: &'static str,
        len: usize,
        max: usize,
    },
    #[error("`{0}` must not be empty")]
    EmptyField(&'static str),
    #[error("filename {0:?} must be a plain file name")]
    UnsafeFilename(String),
    #[error("package declares no chunks")]
    NoChunks,
    #[error("chunk {index} starts at {found}, expected {expected}")]
    NonContiguous { index: usize, expected: u64, found: u32 },
    #[error("chunk sizes sum to {sum}, manifest size is {size}")]
    SizeMismatch { sum: u64, size: u32 },
}

impl Manifest {
    /// Build a manifest from its parts, enforcing every structural invariant.
    pub fn new(
        ident: String,
        filename: String,
        size: u32,
        hashes: Vec<String>,
        chunks: Vec<Chunk>,
    ) -> Result<Self, ManifestError> {
        check_text("ident", &ident, MAX_IDENT_LEN)?;
        check_text("filename", &filename, MAX_FILENAME_LEN)?;
        if !is_plain_file_name(&filename) {
            return Err(ManifestError::UnsafeFilename(filename));
        }
        if let Some(bad) = hashes.iter().find(|h| !integrity::is_hex_digest(h)) {
            return Err(ManifestError::InvalidHash(bad.clone()));
        }
        if chunks.is_empty() {
            return Err(ManifestError::NoChunks);
        }
        let mut next = 0u64;
        for (index, chunk) in chunks.iter().enumerate() {
            if !integrity::is_hex_digest(&chunk.hash) {
                return Err(ManifestError::InvalidHash(chunk.hash.clone()));
            }
            if u64::from(chunk.offset) != next {
                return Err(ManifestError::NonContiguous {
                    index,
                    expected: next,
                    found: chunk.offset,
                });
            }
            next = chunk.end();
        }
        if next != u64::from(size) {
            return Err(ManifestError::SizeMismatch { sum: next, size });
        }
        Ok(Self {
            ident,
            filename,
            size,
            hashes,
            chunks,
        })
    }

    /// Read and parse a descriptor file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ManifestError> {
        let text = std::fs::read_to_string(path)?;
        Self::parse(&text)
    }

    /// Parse descriptor text. Either a fully validated manifest or an error.
    pub fn parse(text: &str) -> Result<Self, ManifestError> {
        let mut lines = text
            .lines()
            .enumerate()
            .map(|(i, l)| (i + 1, l.trim()))
            .filter(|(_, l)| !l.is_empty())
            .peekable();

        let mut ident = None;
        let mut filename = None;
        let mut size = None;
        let mut nhashes = None;
        let mut nchunks = None;
        let mut hashes = None;
        let mut chunks = None;

        while let Some((line, text)) = lines.next() {
            let Some((key, value)) = text.split_once(':') else {
                return Err(ManifestError::UnexpectedLine { line });
            };
            let value = value.trim();
            match key.trim() {
                "ident" => set_once(&mut ident, "ident", line, value.to_string())?,
                "filename" => set_once(&mut filename, "filename", line, value.to_string())?,
                "size" => set_once(&mut size, "size", line, parse_u32("size", line, value)?)?,
                "nhashes" => {
                    let n = parse_u32("nhashes", line, value)? as usize;
                    set_once(&mut nhashes, "nhashes", line, n)?
                }
                "nchunks" => {
                    let n = parse_u32("nchunks", line, value)? as usize;
                    set_once(&mut nchunks, "nchunks", line, n)?
                }
                "hashes" => {
                    let declared = nhashes.ok_or(ManifestError::MissingField("nhashes"))?;
                    let section = read_section(&mut lines, "hashes", declared, parse_hash_line)?;
                    set_once(&mut hashes, "hashes", line, section)?
                }
                "chunks" => {
                    let declared = nchunks.ok_or(ManifestError::MissingField("nchunks"))?;
                    let section = read_section(&mut lines, "chunks", declared, parse_chunk_line)?;
                    set_once(&mut chunks, "chunks", line, section)?
                }
                _ => return Err(ManifestError::UnexpectedLine { line }),
            }
        }

        let ident = ident.ok_or(ManifestError::MissingField("ident"))?;
        let filename = filename.ok_or(ManifestError::MissingField("filename"))?;
        let size = size.ok_or(ManifestError::MissingField("size"))?;
        let nchunks = nchunks.ok_or(ManifestError::MissingField("nchunks"))?;
        let chunks = section_or_empty(chunks, "chunks", nchunks)?;
        let hashes = section_or_empty(hashes, "hashes", nhashes.unwrap_or(0))?;

        Self::new(ident, filename, size, hashes, chunks)
    }

    pub fn ident(&self) -> &str {
        &self.ident
    }

    pub fn filename(&self) -> &str {
        &self.filename
    }

    /// Declared total byte size of the target file.
    pub fn size(&self) -> u32 {
        self.size
    }

    /// Precomputed internal-node hashes from the `hashes:` section (may be empty).
    pub fn hashes(&self) -> &[String] {
        &self.hashes
    }

    pub fn chunks(&self) -> &[Chunk] {
        &self.chunks
    }

    /// Index of the first chunk whose expected hash is `hash`.
    pub fn chunk_index(&self, hash: &str) -> Option<usize> {
        self.chunks.iter().position(|c| c.hash == hash)
    }
}

fn check_text(field: &'static str, value: &str, max: usize) -> Result<(), ManifestError> {
    if value.is_empty() {
        return Err(ManifestError::EmptyField(field));
    }
    if value.len() > max {
        return Err(ManifestError::FieldTooLong {
            field,
            len: value.len(),
            max,
        });
    }
    Ok(())
}

fn is_plain_file_name(name: &str) -> bool {
    if name.contains(['/', '\\', '\0']) {
        return false;
    }
    let mut components = Path::new(name).components();
    matches!(
        (components.next(), components.next()),
        (Some(Component::Normal(_)), None)
    )
}

fn set_once<T>(
    slot: &mut Option<T>,
    field: &'static str,
    line: usize,
    value: T,
) -> Result<(), ManifestError> {
    if slot.is_some() {
        return Err(ManifestError::DuplicateField { field, line });
    }
    *slot = Some(value);
    Ok(())
}

fn parse_u32(field: &'static str, line: usize, value: &str) -> Result<u32, ManifestError> {
    value.parse::<u32>().map_err(|_| ManifestError::InvalidNumber {
        field,
        line,
        value: value.to_string(),
    })
}

fn section_or_empty<T>(
    section: Option<Vec<T>>,
    name: &'static str,
    declared: usize,
) -> Result<Vec<T>, ManifestError> {
    match section {
        Some(items) => Ok(items),
        None if declared == 0 => Ok(Vec::new()),
        None => Err(ManifestError::CountMismatch {
            section: name,
            declared,
            found: 0,
        }),
    }
}

/// Consume exactly `declared` data lines. Data lines never contain `:`, so a
/// field line ends the section early; surplus data lines after it are counted
/// so the mismatch can be reported.
fn read_section<'a, I, T>(
    lines: &mut Peekable<I>,
    section: &'static str,
    declared: usize,
    parse: fn(usize, &str) -> Result<T, ManifestError>,
) -> Result<Vec<T>, ManifestError>
where
    I: Iterator<Item = (usize, &'a str)>,
{
    let mut out = Vec::with_capacity(declared);
    while out.len() < declared {
        match lines.next_if(|(_, l)| !l.contains(':')) {
            Some((line, text)) => out.push(parse(line, text)?),
            None => {
                return Err(ManifestError::CountMismatch {
                    section,
                    declared,
                    found: out.len(),
                })
            }
        }
    }
    let mut surplus = 0;
    while lines.next_if(|(_, l)| !l.contains(':')).is_some() {
        surplus += 1;
    }
    if surplus > 0 {
        return Err(ManifestError::CountMismatch {
            section,
            declared,
            found: declared + surplus,
        });
    }
    Ok(out)
}

fn parse_hash_line(line: usize, text: &str) -> Result<String, ManifestError> {
    let mut tokens = text.split_whitespace();
    match (tokens.next(), tokens.next()) {
        (Some(hash), None) => Ok(hash.to_string()),
        _ => Err(ManifestError::UnexpectedLine { line }),
    }
}

fn parse_chunk_line(line: usize, text: &str) -> Result<Chunk, ManifestError> {
    let fields: Vec<&str> = text.split(',').map(str::trim).collect();
    let [hash, offset, size] = fields.as_slice() else {
        return Err(ManifestError::BadChunkLine { line });
    };
    Ok(Chunk {
        hash: hash.to_string(),
        offset: parse_u32("offset", line, offset)?,
        size: parse_u32("size", line, size)?,
    })
}
