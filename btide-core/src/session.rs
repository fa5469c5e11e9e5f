//! Chunk transfer sessions over one peer channel.
//!
//! A [`Requester`] asks for one chunk (optionally resuming part way in) and
//! writes each received segment at its absolute offset in the package file.
//! A [`Responder`] answers one REQUEST by streaming the range back in
//! segments of at most [`SEGMENT_CAPACITY`] bytes, or a single error response.

use std::collections::BTreeMap;
use std::io::{ErrorKind, SeekFrom};
use std::path::PathBuf;
use std::time::Duration;

use tokio::fs::{File, OpenOptions};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncSeekExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::Mutex;

use crate::chunk::{segment_count, split_into_segments};
use crate::protocol::{
    ChunkRequest, ChunkResponse, ErrorCode, Message, Packet, PacketKind, SEGMENT_CAPACITY,
};
use crate::registry::{Package, SharedRegistry};
use crate::wire::{self, WireError};

#[derive(Debug, thiserror::Error)]
pub enum TransferError {
    #[error("package {0} is not managed here")]
    UnknownPackage(String),
    #[error("{0} is not a chunk hash of this package")]
    UnknownChunkHash(String),
    #[error("resume offset {offset} is past the end of a {size}-byte chunk")]
    ResumeOutOfRange { offset: u32, size: u32 },
    #[error("cannot open {path}: {source}")]
    FileUnavailable {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("source short at offset {offset}: wanted {wanted} bytes, have {have}")]
    TruncatedSource { offset: u64, wanted: u64, have: u64 },
    #[error("short write at offset {offset}")]
    TruncatedWrite { offset: u64 },
    #[error("expected {expected:?}, got {got}")]
    ProtocolMismatch { expected: PacketKind, got: String },
    #[error("peer transfer failed: {0}")]
    PeerTransfer(PeerFailure),
    #[error("peer closed the channel")]
    ChannelClosed,
    #[error("no packet from peer within {0:?}")]
    Timeout(Duration),
    #[error(transparent)]
    Wire(#[from] WireError),
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum PeerFailure {
    #[error("peer answered with error code {0}")]
    Remote(u16),
    #[error("{0} unusable packets from peer")]
    TooManyMismatches(usize),
}

impl PeerFailure {
    /// The protocol error code, when the peer sent a known one.
    pub fn error_code(&self) -> Option<ErrorCode> {
        match self {
            PeerFailure::Remote(code) => ErrorCode::from_code(*code),
            PeerFailure::TooManyMismatches(_) => None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct FetchOptions {
    /// Longest wait for any single packet once the request is sent.
    pub receive_timeout: Duration,
    /// Unusable packets tolerated before the fetch is abandoned.
    pub max_skipped: usize,
}

impl Default for FetchOptions {
    fn default() -> Self {
        Self {
            receive_timeout: Duration::from_secs(30),
            max_skipped: 16,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequesterState {
    Idle,
    AwaitingFirstSegment,
    ReceivingSegments,
    Done,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResponderState {
    Idle,
    Serving,
    Done,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FetchReport {
    pub segments: usize,
    pub bytes: u64,
    pub skipped: usize,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ServeReport {
    pub segments: usize,
    pub bytes: u64,
}

/// Byte ranges already written, merged into disjoint `start -> end` spans.
#[derive(Debug, Default)]
struct Coverage {
    spans: BTreeMap<u64, u64>,
    covered: u64,
}

impl Coverage {
    /// Record `start..end`; returns how many of its bytes were not covered yet.
    fn insert(&mut self, start: u64, end: u64) -> u64 {
        let mut lo = start;
        let mut hi = end;
        let mut merged = 0;
        let touching: Vec<(u64, u64)> = self
            .spans
            .range(..=end)
            .rev()
            .take_while(|(_, e)| **e >= start)
            .map(|(&s, &e)| (s, e))
            .collect();
        for (s, e) in touching {
            self.spans.remove(&s);
            merged += e - s;
            lo = lo.min(s);
            hi = hi.max(e);
        }
        self.spans.insert(lo, hi);
        let added = (hi - lo) - merged;
        self.covered += added;
        added
    }

    fn covered(&self) -> u64 {
        self.covered
    }
}

/// Requesting side of one chunk fetch.
#[derive(Debug)]
pub struct Requester {
    package: Package,
    request: ChunkRequest,
    expected: usize,
    coverage: Coverage,
    options: FetchOptions,
    state: RequesterState,
    report: FetchReport,
}

impl Requester {
    /// Plan a fetch of the chunk `hash` from `resume_offset` bytes into it.
    /// `hash` must name a leaf of the package tree.
    pub fn new(
        package: Package,
        hash: &str,
        resume_offset: u32,
        options: FetchOptions,
    ) -> Result<Self, TransferError> {
        let index = package
            .tree()
            .find_leaf(hash)
            .and_then(|leaf| leaf.chunk_index())
            .ok_or_else(|| TransferError::UnknownChunkHash(hash.to_string()))?;
        let chunk = &package.manifest().chunks()[index];
        if resume_offset > chunk.size {
            return Err(TransferError::ResumeOutOfRange {
                offset: resume_offset,
                size: chunk.size,
            });
        }
        let request = ChunkRequest {
            offset: chunk.offset + resume_offset,
            length: chunk.size - resume_offset,
            hash: chunk.hash.clone(),
            ident: package.ident().to_string(),
        };
        let expected = segment_count(u64::from(request.length), SEGMENT_CAPACITY);
        Ok(Self {
            package,
            request,
            expected,
            coverage: Coverage::default(),
            options,
            state: RequesterState::Idle,
            report: FetchReport::default(),
        })
    }

    pub fn state(&self) -> RequesterState {
        self.state
    }

    pub fn request(&self) -> &ChunkRequest {
        &self.request
    }

    /// Segments needed to cover the requested range.
    pub fn expected_segments(&self) -> usize {
        self.expected
    }

    /// Send the request and write every valid segment until the range is covered.
    /// A segment that adds no new bytes is rewritten but counts as skipped.
    /// Segments already written stay on disk if this fails part way.
    pub async fn run<S>(&mut self, channel: &mut S) -> Result<FetchReport, TransferError>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        let result = self.exchange(channel).await;
        self.state = RequesterState::Done;
        match &result {
            Ok(report) => tracing::info!(
                ident = %self.request.ident,
                hash = %self.request.hash,
                segments = report.segments,
                bytes = report.bytes,
                skipped = report.skipped,
                "chunk fetched"
            ),
            Err(e) => tracing::warn!(
                ident = %self.request.ident,
                hash = %self.request.hash,
                segments = self.report.segments,
                error = %e,
                "chunk fetch failed"
            ),
        }
        result
    }

    async fn exchange<S>(&mut self, channel: &mut S) -> Result<FetchReport, TransferError>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        if self.expected == 0 {
            return Ok(self.report);
        }
        let path = self.package.data_path().to_path_buf();
        let mut file = match OpenOptions::new().write(true).open(&path).await {
            Ok(file) => file,
            Err(source) => return Err(TransferError::FileUnavailable { path, source }),
        };

        wire::write_packet(channel, &Packet::new(Message::Request(self.request.clone()))).await?;
        self.state = RequesterState::AwaitingFirstSegment;
        tracing::debug!(
            offset = self.request.offset,
            length = self.request.length,
            segments = self.expected,
            "request sent"
        );

        let length = u64::from(self.request.length);
        while self.coverage.covered() < length {
            let wait = self.options.receive_timeout;
            let packet = match tokio::time::timeout(wait, wire::read_packet(channel)).await {
                Err(_) => return Err(TransferError::Timeout(wait)),
                Ok(Ok(Some(packet))) => packet,
                Ok(Ok(None)) => return Err(TransferError::ChannelClosed),
                Ok(Err(WireError::Decode(e))) => {
                    self.skip(e.to_string())?;
                    continue;
                }
                Ok(Err(e)) => return Err(e.into()),
            };
            let Packet { error, message } = packet;
            let response = match message {
                Message::Response(response) => response,
                other => {
                    self.skip(format!("{:?} packet", other.kind()))?;
                    continue;
                }
            };
            if error != 0 {
                return Err(TransferError::PeerTransfer(PeerFailure::Remote(error)));
            }
            if let Some(reason) = self.reject_reason(&response) {
                self.skip(reason)?;
                continue;
            }
            write_segment(
                &mut file,
                self.package.write_lock(),
                u64::from(response.offset),
                &response.data,
            )
            .await?;
            let start = u64::from(response.offset);
            let added = self.coverage.insert(start, response.end());
            if added == 0 {
                self.skip(format!(
                    "segment {}..{} already received",
                    response.offset,
                    response.end()
                ))?;
                continue;
            }
            tracing::debug!(
                offset = response.offset,
                len = response.data.len(),
                added,
                "segment written"
            );
            self.state = RequesterState::ReceivingSegments;
            self.report.segments += 1;
            self.report.bytes += added;
        }
        Ok(self.report)
    }

    fn reject_reason(&self, response: &ChunkResponse) -> Option<String> {
        let start = u64::from(self.request.offset);
        let end = start + u64::from(self.request.length);
        if response.hash != self.request.hash {
            Some(format!("segment for chunk {}", response.hash))
        } else if response.ident != self.request.ident {
            Some(format!("segment for package {}", response.ident))
        } else if response.data.is_empty() {
            Some("empty segment".to_string())
        } else if u64::from(response.offset) < start || response.end() > end {
            Some(format!(
                "segment {}..{} outside {start}..{end}",
                response.offset,
                response.end()
            ))
        } else {
            None
        }
    }

    fn skip(&mut self, got: String) -> Result<(), TransferError> {
        self.report.skipped += 1;
        let mismatch = TransferError::ProtocolMismatch {
            expected: PacketKind::Response,
            got,
        };
        tracing::warn!(skipped = self.report.skipped, "{mismatch}");
        if self.report.skipped > self.options.max_skipped {
            return Err(TransferError::PeerTransfer(PeerFailure::TooManyMismatches(
                self.report.skipped,
            )));
        }
        Ok(())
    }
}

/// Fetch one chunk of `package` over `channel`.
pub async fn fetch<S>(
    channel: &mut S,
    package: &Package,
    hash: &str,
    resume_offset: u32,
    options: &FetchOptions,
) -> Result<FetchReport, TransferError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    Requester::new(package.clone(), hash, resume_offset, options.clone())?
        .run(channel)
        .await
}

/// Write `data` at absolute `offset`, holding the package's write lock.
/// Rewriting the same segment leaves the file unchanged.
async fn write_segment(
    file: &mut File,
    lock: &Mutex<()>,
    offset: u64,
    data: &[u8],
) -> Result<(), TransferError> {
    let _guard = lock.lock().await;
    file.seek(SeekFrom::Start(offset)).await?;
    file.write_all(data).await.map_err(|e| match e.kind() {
        ErrorKind::WriteZero => TransferError::TruncatedWrite { offset },
        _ => TransferError::Io(e),
    })?;
    file.flush().await?;
    Ok(())
}

/// Responding side of one REQUEST.
#[derive(Debug)]
pub struct Responder {
    request: ChunkRequest,
    state: ResponderState,
}

impl Responder {
    pub fn new(request: ChunkRequest) -> Self {
        Self {
            request,
            state: ResponderState::Idle,
        }
    }

    pub fn state(&self) -> ResponderState {
        self.state
    }

    /// Stream the requested range, or send one error response and stop.
    pub async fn run<W>(
        &mut self,
        channel: &mut W,
        registry: &SharedRegistry,
    ) -> Result<ServeReport, TransferError>
    where
        W: AsyncWrite + Unpin,
    {
        self.state = ResponderState::Serving;
        let result = self.serve(channel, registry).await;
        self.state = ResponderState::Done;
        match &result {
            Ok(report) => tracing::debug!(
                ident = %self.request.ident,
                offset = self.request.offset,
                segments = report.segments,
                "request served"
            ),
            Err(e) => tracing::warn!(
                ident = %self.request.ident,
                offset = self.request.offset,
                error = %e,
                "request refused"
            ),
        }
        result
    }

    async fn serve<W>(
        &mut self,
        channel: &mut W,
        registry: &SharedRegistry,
    ) -> Result<ServeReport, TransferError>
    where
        W: AsyncWrite + Unpin,
    {
        let request = &self.request;
        let package = registry.lock().await.get(&request.ident).cloned();
        let Some(package) = package else {
            refuse(channel, ErrorCode::UnknownPackage, request).await?;
            return Err(TransferError::UnknownPackage(request.ident.clone()));
        };

        let start = u64::from(request.offset);
        let size = u64::from(package.manifest().size());
        if start + u64::from(request.length) > size {
            refuse(channel, ErrorCode::TruncatedSource, request).await?;
            return Err(TransferError::TruncatedSource {
                offset: start,
                wanted: u64::from(request.length),
                have: size.saturating_sub(start),
            });
        }

        let mut file = match File::open(package.data_path()).await {
            Ok(file) => file,
            Err(source) => {
                refuse(channel, ErrorCode::FileUnavailable, request).await?;
                return Err(TransferError::FileUnavailable {
                    path: package.data_path().to_path_buf(),
                    source,
                });
            }
        };

        let mut report = ServeReport::default();
        let mut buf = vec![0u8; SEGMENT_CAPACITY];
        for segment in split_into_segments(start, u64::from(request.length), SEGMENT_CAPACITY) {
            file.seek(SeekFrom::Start(segment.offset)).await?;
            let have = read_full(&mut file, &mut buf[..segment.len]).await?;
            if have < segment.len {
                refuse(channel, ErrorCode::TruncatedSource, request).await?;
                return Err(TransferError::TruncatedSource {
                    offset: segment.offset,
                    wanted: segment.len as u64,
                    have: have as u64,
                });
            }
            let response = ChunkResponse {
                // range end is within the manifest size, a u32
                offset: segment.offset as u32,
                data: buf[..segment.len].to_vec(),
                hash: request.hash.clone(),
                ident: request.ident.clone(),
            };
            wire::write_packet(channel, &Packet::new(Message::Response(response))).await?;
            tracing::debug!(offset = segment.offset, len = segment.len, "segment sent");
            report.segments += 1;
            report.bytes += segment.len as u64;
        }
        Ok(report)
    }
}

/// Answer one REQUEST on `channel` using packages from `registry`.
pub async fn serve_request<W>(
    channel: &mut W,
    registry: &SharedRegistry,
    request: ChunkRequest,
) -> Result<ServeReport, TransferError>
where
    W: AsyncWrite + Unpin,
{
    Responder::new(request).run(channel, registry).await
}

async fn refuse<W>(channel: &mut W, code: ErrorCode, request: &ChunkRequest) -> Result<(), WireError>
where
    W: AsyncWrite + Unpin,
{
    wire::write_packet(channel, &Packet::error_response(code, request)).await
}

async fn read_full(file: &mut File, buf: &mut [u8]) -> std::io::Result<usize> {
    let mut filled = 0;
    while filled < buf.len() {
        let n = file.read(&mut buf[filled..]).await?;
        if n == 0 {
            break;
        }
        filled += n;
    }
    Ok(filled)
}

#[cfg(test)]
mod tests {
    use std::io::{Seek, Write};
    use std::path::Path;

    use tempfile::TempDir;
    use tokio::io::DuplexStream;

    use super::*;
    use crate::manifest::tests::descriptor;
    use crate::registry::Registry;

    const IDENT: &str = "session-test-package-0000000000";
    const FILE: &str = "payload.bin";

    struct Fixture {
        dir: TempDir,
        source: SharedRegistry,
        target: Package,
        data: Vec<u8>,
    }

    impl Fixture {
        fn hash(&self, index: usize) -> String {
            self.target.manifest().chunks()[index].hash.clone()
        }

        fn source_path(&self) -> PathBuf {
            self.dir.path().join("src").join(FILE)
        }
    }

    fn pattern(n: usize) -> String {
        (0..n).map(|i| char::from(b'a' + (i % 26) as u8)).collect()
    }

    // chunk 0: 7000 bytes (three segments), chunk 1: 10 bytes
    fn fixture() -> Fixture {
        let dir = tempfile::tempdir().unwrap();
        let src = dir.path().join("src");
        let dst = dir.path().join("dst");
        std::fs::create_dir_all(&src).unwrap();
        std::fs::create_dir_all(&dst).unwrap();

        let chunks = [pattern(7000), "tail-chunk".to_string()];
        let refs: Vec<&str> = chunks.iter().map(String::as_str).collect();
        let bpkg = dir.path().join("pkg.bpkg");
        std::fs::write(&bpkg, descriptor(IDENT, FILE, &refs)).unwrap();
        let data = chunks.concat().into_bytes();
        std::fs::write(src.join(FILE), &data).unwrap();

        let mut source = Registry::new();
        source.insert(Package::open(&bpkg, &src).unwrap().0).unwrap();
        let (target, _) = Package::open(&bpkg, &dst).unwrap();
        Fixture {
            dir,
            source: source.shared(),
            target,
            data,
        }
    }

    async fn serve_one(
        mut channel: DuplexStream,
        registry: SharedRegistry,
    ) -> Result<ServeReport, TransferError> {
        let packet = wire::read_packet(&mut channel).await.unwrap().unwrap();
        let Message::Request(request) = packet.message else {
            panic!("expected Request, got {:?}", packet.kind());
        };
        serve_request(&mut channel, &registry, request).await
    }

    async fn expect_request(channel: &mut DuplexStream) -> ChunkRequest {
        match wire::read_packet(channel).await.unwrap().unwrap().message {
            Message::Request(request) => request,
            other => panic!("expected Request, got {other:?}"),
        }
    }

    fn segment(fx: &Fixture, offset: usize, len: usize) -> Packet {
        Packet::new(Message::Response(ChunkResponse {
            offset: offset as u32,
            data: fx.data[offset..offset + len].to_vec(),
            hash: fx.hash(0),
            ident: IDENT.to_string(),
        }))
    }

    fn read_target(path: &Path) -> Vec<u8> {
        std::fs::read(path).unwrap()
    }

    #[tokio::test]
    async fn fetch_whole_chunk() {
        let fx = fixture();
        let (mut a, b) = tokio::io::duplex(64 * 1024);
        let server = tokio::spawn(serve_one(b, fx.source.clone()));

        let report = fetch(&mut a, &fx.target, &fx.hash(0), 0, &FetchOptions::default())
            .await
            .unwrap();
        assert_eq!(report.segments, 3);
        assert_eq!(report.bytes, 7000);
        assert_eq!(report.skipped, 0);
        let served = server.await.unwrap().unwrap();
        assert_eq!(served, ServeReport { segments: 3, bytes: 7000 });

        let done = fx.target.scan().unwrap();
        assert!(done.contains(0));
        assert!(!done.contains(1));
        assert_eq!(&read_target(fx.target.data_path())[..7000], &fx.data[..7000]);
    }

    #[tokio::test]
    async fn second_fetch_rewrites_identically() {
        let fx = fixture();
        for _ in 0..2 {
            let (mut a, b) = tokio::io::duplex(64 * 1024);
            let server = tokio::spawn(serve_one(b, fx.source.clone()));
            fetch(&mut a, &fx.target, &fx.hash(1), 0, &FetchOptions::default())
                .await
                .unwrap();
            server.await.unwrap().unwrap();
        }
        let written = read_target(fx.target.data_path());
        assert_eq!(written.len(), fx.data.len());
        assert_eq!(&written[7000..], b"tail-chunk");
        assert!(written[..7000].iter().all(|&b| b == 0));
    }

    #[tokio::test]
    async fn resume_fetches_only_the_tail() {
        let fx = fixture();
        let mut file = std::fs::OpenOptions::new()
            .write(true)
            .open(fx.target.data_path())
            .unwrap();
        file.seek(SeekFrom::Start(0)).unwrap();
        file.write_all(&fx.data[..3000]).unwrap();
        drop(file);

        let mut requester =
            Requester::new(fx.target.clone(), &fx.hash(0), 3000, FetchOptions::default()).unwrap();
        assert_eq!(requester.state(), RequesterState::Idle);
        assert_eq!(requester.request().offset, 3000);
        assert_eq!(requester.request().length, 4000);
        assert_eq!(requester.expected_segments(), 2);

        let (mut a, b) = tokio::io::duplex(64 * 1024);
        let server = tokio::spawn(serve_one(b, fx.source.clone()));
        let report = requester.run(&mut a).await.unwrap();
        assert_eq!(requester.state(), RequesterState::Done);
        assert_eq!(report.bytes, 4000);
        server.await.unwrap().unwrap();
        assert!(fx.target.scan().unwrap().contains(0));
    }

    #[tokio::test]
    async fn resume_at_chunk_end_sends_nothing() {
        let fx = fixture();
        let (mut a, mut b) = tokio::io::duplex(64 * 1024);
        let report = fetch(&mut a, &fx.target, &fx.hash(1), 10, &FetchOptions::default())
            .await
            .unwrap();
        assert_eq!(report, FetchReport::default());
        drop(a);
        assert!(wire::read_packet(&mut b).await.unwrap().is_none());
    }

    #[test]
    fn requester_rejects_bad_plans() {
        let fx = fixture();
        assert!(matches!(
            Requester::new(fx.target.clone(), &fx.hash(1), 11, FetchOptions::default()),
            Err(TransferError::ResumeOutOfRange { offset: 11, size: 10 })
        ));
        let root = fx.target.tree().root().hash().to_string();
        assert!(matches!(
            Requester::new(fx.target.clone(), &root, 0, FetchOptions::default()),
            Err(TransferError::UnknownChunkHash(_))
        ));
    }

    #[tokio::test]
    async fn unknown_package_is_refused() {
        let fx = fixture();
        let (mut a, b) = tokio::io::duplex(64 * 1024);
        let server = tokio::spawn(serve_one(b, Registry::new().shared()));

        let err = fetch(&mut a, &fx.target, &fx.hash(0), 0, &FetchOptions::default())
            .await
            .unwrap_err();
        match err {
            TransferError::PeerTransfer(failure) => {
                assert_eq!(failure, PeerFailure::Remote(1));
                assert_eq!(failure.error_code(), Some(ErrorCode::UnknownPackage));
            }
            other => panic!("unexpected {other:?}"),
        }
        assert!(matches!(
            server.await.unwrap(),
            Err(TransferError::UnknownPackage(_))
        ));
    }

    #[tokio::test]
    async fn missing_source_file_is_refused() {
        let fx = fixture();
        std::fs::remove_file(fx.source_path()).unwrap();
        let (mut a, b) = tokio::io::duplex(64 * 1024);
        let server = tokio::spawn(serve_one(b, fx.source.clone()));

        let err = fetch(&mut a, &fx.target, &fx.hash(0), 0, &FetchOptions::default())
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            TransferError::PeerTransfer(PeerFailure::Remote(2))
        ));
        assert!(matches!(
            server.await.unwrap(),
            Err(TransferError::FileUnavailable { .. })
        ));
    }

    #[tokio::test]
    async fn truncated_source_aborts_after_good_segments() {
        let fx = fixture();
        let file = std::fs::OpenOptions::new()
            .write(true)
            .open(fx.source_path())
            .unwrap();
        file.set_len(5000).unwrap();
        drop(file);

        let (mut a, b) = tokio::io::duplex(64 * 1024);
        let server = tokio::spawn(serve_one(b, fx.source.clone()));
        let err = fetch(&mut a, &fx.target, &fx.hash(0), 0, &FetchOptions::default())
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            TransferError::PeerTransfer(PeerFailure::Remote(3))
        ));
        assert!(matches!(
            server.await.unwrap(),
            Err(TransferError::TruncatedSource {
                offset: 2998,
                wanted: 2998,
                have: 2002
            })
        ));
        // first segment landed before the failure
        assert_eq!(
            &read_target(fx.target.data_path())[..2998],
            &fx.data[..2998]
        );
    }

    #[tokio::test]
    async fn request_past_manifest_size_is_refused() {
        let fx = fixture();
        let (mut a, mut b) = tokio::io::duplex(64 * 1024);
        let request = ChunkRequest {
            offset: 7000,
            length: 11,
            hash: fx.hash(1),
            ident: IDENT.to_string(),
        };
        let mut responder = Responder::new(request);
        assert_eq!(responder.state(), ResponderState::Idle);
        let err = responder.run(&mut b, &fx.source).await.unwrap_err();
        assert_eq!(responder.state(), ResponderState::Done);
        assert!(matches!(
            err,
            TransferError::TruncatedSource { have: 10, .. }
        ));
        let reply = wire::read_packet(&mut a).await.unwrap().unwrap();
        assert_eq!(reply.error, ErrorCode::TruncatedSource.code());
    }

    #[tokio::test]
    async fn unusable_packets_are_skipped() {
        let fx = fixture();
        let (mut a, mut b) = tokio::io::duplex(64 * 1024);
        let hash = fx.hash(0);
        let target = fx.target.clone();
        let options = FetchOptions {
            max_skipped: 2,
            ..FetchOptions::default()
        };
        let client = tokio::spawn(async move { fetch(&mut a, &target, &hash, 0, &options).await });

        expect_request(&mut b).await;
        wire::write_packet(&mut b, &Packet::new(Message::Pong)).await.unwrap();
        let mut stray = segment(&fx, 0, 2998);
        if let Message::Response(res) = &mut stray.message {
            res.hash = fx.hash(1);
        }
        wire::write_packet(&mut b, &stray).await.unwrap();
        for (offset, len) in [(0, 2998), (2998, 2998), (5996, 1004)] {
            wire::write_packet(&mut b, &segment(&fx, offset, len)).await.unwrap();
        }

        let report = client.await.unwrap().unwrap();
        assert_eq!(report.segments, 3);
        assert_eq!(report.skipped, 2);
        assert!(fx.target.scan().unwrap().contains(0));
    }

    #[tokio::test]
    async fn repeated_segment_is_not_progress() {
        let fx = fixture();
        let (mut a, mut b) = tokio::io::duplex(64 * 1024);
        let hash = fx.hash(0);
        let target = fx.target.clone();
        let options = FetchOptions {
            max_skipped: 2,
            ..FetchOptions::default()
        };
        let client = tokio::spawn(async move { fetch(&mut a, &target, &hash, 0, &options).await });

        expect_request(&mut b).await;
        for _ in 0..3 {
            wire::write_packet(&mut b, &segment(&fx, 0, 2998)).await.unwrap();
        }
        for (offset, len) in [(2998, 2998), (5996, 1004)] {
            wire::write_packet(&mut b, &segment(&fx, offset, len)).await.unwrap();
        }

        let report = client.await.unwrap().unwrap();
        assert_eq!(
            report,
            FetchReport {
                segments: 3,
                bytes: 7000,
                skipped: 2
            }
        );
        assert!(fx.target.scan().unwrap().contains(0));
    }

    #[tokio::test]
    async fn repeated_segments_alone_never_finish() {
        let fx = fixture();
        let (mut a, mut b) = tokio::io::duplex(64 * 1024);
        let hash = fx.hash(0);
        let target = fx.target.clone();
        let client = tokio::spawn(async move {
            fetch(&mut a, &target, &hash, 0, &FetchOptions::default()).await
        });

        expect_request(&mut b).await;
        for _ in 0..3 {
            wire::write_packet(&mut b, &segment(&fx, 0, 2998)).await.unwrap();
        }
        drop(b);

        assert!(matches!(
            client.await.unwrap(),
            Err(TransferError::ChannelClosed)
        ));
        assert!(!fx.target.scan().unwrap().contains(0));
    }

    #[test]
    fn coverage_merges_overlaps() {
        let mut cov = Coverage::default();
        assert_eq!(cov.insert(10, 20), 10);
        assert_eq!(cov.insert(10, 20), 0);
        assert_eq!(cov.insert(15, 30), 10);
        assert_eq!(cov.insert(0, 10), 10);
        assert_eq!(cov.insert(5, 25), 0);
        assert_eq!(cov.covered(), 30);
        assert_eq!(cov.spans.len(), 1);
        assert_eq!(cov.insert(40, 50), 10);
        assert_eq!(cov.insert(0, 50), 10);
        assert_eq!(cov.covered(), 50);
    }

    #[tokio::test]
    async fn too_many_unusable_packets_fail() {
        let fx = fixture();
        let (mut a, mut b) = tokio::io::duplex(64 * 1024);
        let hash = fx.hash(0);
        let target = fx.target.clone();
        let options = FetchOptions {
            max_skipped: 1,
            ..FetchOptions::default()
        };
        let client = tokio::spawn(async move { fetch(&mut a, &target, &hash, 0, &options).await });

        let request = expect_request(&mut b).await;
        // outside the requested range
        let mut outside = segment(&fx, 0, 10);
        if let Message::Response(res) = &mut outside.message {
            res.offset = request.offset + request.length;
        }
        wire::write_packet(&mut b, &outside).await.unwrap();
        wire::write_packet(&mut b, &Packet::new(Message::Ack)).await.unwrap();

        assert!(matches!(
            client.await.unwrap(),
            Err(TransferError::PeerTransfer(PeerFailure::TooManyMismatches(2)))
        ));
    }

    #[tokio::test]
    async fn closed_channel_keeps_written_segments() {
        let fx = fixture();
        let (mut a, mut b) = tokio::io::duplex(64 * 1024);
        let hash = fx.hash(0);
        let target = fx.target.clone();
        let client = tokio::spawn(async move {
            fetch(&mut a, &target, &hash, 0, &FetchOptions::default()).await
        });

        expect_request(&mut b).await;
        wire::write_packet(&mut b, &segment(&fx, 2998, 2998)).await.unwrap();
        drop(b);

        assert!(matches!(
            client.await.unwrap(),
            Err(TransferError::ChannelClosed)
        ));
        let written = read_target(fx.target.data_path());
        assert_eq!(&written[2998..5996], &fx.data[2998..5996]);
        assert!(written[..2998].iter().all(|&b| b == 0));
    }

    #[tokio::test]
    async fn silent_peer_times_out() {
        let fx = fixture();
        let (mut a, _b) = tokio::io::duplex(64 * 1024);
        let options = FetchOptions {
            receive_timeout: Duration::from_millis(50),
            max_skipped: 0,
        };
        let err = fetch(&mut a, &fx.target, &fx.hash(0), 0, &options)
            .await
            .unwrap_err();
        assert!(matches!(err, TransferError::Timeout(_)));
    }
}
