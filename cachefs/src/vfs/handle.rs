//! 文件句柄：带缓冲的顺序写（create/append）与可 seek 的读。
//!
//! Primary writers keep a block-aligned buffer. Only whole blocks leave it on
//! rollover; the trailing partial block is written by `flush`/`close` but stays
//! buffered so later bytes rewrite it in place. Every flush re-checks, under
//! the file's key lock, that the file still exists and that this handle still
//! owns its write lock.

use super::session::{HandleId, Session};
use crate::block::FileBlocks;
use crate::block::layout::BlockLayout;
use crate::error::{FsError, FsResult};
use crate::meta::inode::InodeId;
use crate::meta::path::FsPath;
use crate::secondary::{SecondaryReader, SecondaryWriter};
use bytes::{Buf, Bytes, BytesMut};
use futures::future::try_join_all;
use std::io::SeekFrom;
use std::sync::Arc;
use tokio::io::{AsyncReadExt, AsyncSeekExt, AsyncWriteExt};
use tracing::{debug, warn};

pub(crate) struct PrimaryWrite {
    pub session: Arc<Session>,
    pub handle: HandleId,
    pub file: FileBlocks,
    pub layout: BlockLayout,
    pub buffer_limit: usize,
    /// File length when the handle was opened (0 for create).
    pub length: u64,
    /// Optional write-through sink (DUAL mode).
    pub mirror: Option<SecondaryWriter>,
}

struct PrimaryWriter {
    session: Arc<Session>,
    handle: HandleId,
    file: FileBlocks,
    layout: BlockLayout,
    buffer: BytesMut,
    /// File offset of `buffer[0]`; always block aligned.
    buffer_start: u64,
    buffer_limit: usize,
    /// Bytes known to be stored in the block store.
    durable_len: u64,
    mirror: Option<SecondaryWriter>,
}

impl PrimaryWriter {
    async fn open(params: PrimaryWrite) -> FsResult<Self> {
        let PrimaryWrite {
            session,
            handle,
            file,
            layout,
            buffer_limit,
            length,
            mirror,
        } = params;
        let tail_index = layout.block_index_of(length);
        let buffer_start = layout.block_start(tail_index);
        let mut buffer = BytesMut::with_capacity(buffer_limit.max(layout.block_size as usize));
        let tail_len = (length - buffer_start) as usize;
        if tail_len > 0 {
            // 追加写：预读尾块，之后整体重写
            let tail = session.blocks().read_block(file, tail_index).await?;
            if tail.len() < tail_len {
                return Err(FsError::NotFound(format!(
                    "tail block {tail_index} of file {} is incomplete",
                    file.id
                )));
            }
            buffer.extend_from_slice(&tail[..tail_len]);
        }
        Ok(Self {
            session,
            handle,
            file,
            layout,
            buffer,
            buffer_start,
            buffer_limit,
            durable_len: length,
            mirror,
        })
    }

    fn position(&self) -> u64 {
        self.buffer_start + self.buffer.len() as u64
    }

    async fn write(&mut self, data: &[u8]) -> FsResult<()> {
        self.buffer.extend_from_slice(data);
        if let Some(mirror) = self.mirror.as_mut() {
            mirror.write_all(data).await?;
        }
        if self.buffer.len() >= self.buffer_limit {
            self.flush_blocks(false).await?;
        }
        Ok(())
    }

    /// Writes every whole buffered block and, with `include_tail`, the
    /// trailing partial block.
    async fn flush_blocks(&mut self, include_tail: bool) -> FsResult<()> {
        let block_size = self.layout.block_size as usize;
        let full = self.buffer.len() / block_size;
        let tail = self.buffer.len() % block_size;
        if full == 0 && (tail == 0 || !include_tail) {
            return Ok(());
        }
        let blocks = self.session.blocks();
        let _locked = self
            .session
            .meta()
            .lock_owned_file(self.file.id, self.handle)
            .await?;

        let first = self.layout.block_index_of(self.buffer_start);
        let whole = Bytes::copy_from_slice(&self.buffer[..full * block_size]);
        let file = self.file;
        try_join_all((0..full).map(|i| {
            let data = whole.slice(i * block_size..(i + 1) * block_size);
            blocks.write_block(file, first + i as u64, data)
        }))
        .await?;
        self.buffer.advance(full * block_size);
        self.buffer_start += (full * block_size) as u64;
        self.durable_len = self.durable_len.max(self.buffer_start);

        if include_tail && tail > 0 {
            let index = self.layout.block_index_of(self.buffer_start);
            blocks
                .write_block(file, index, Bytes::copy_from_slice(&self.buffer))
                .await?;
            self.durable_len = self.position();
        }
        debug!(file = %file.id, blocks = full, tail = include_tail && tail > 0, "flushed blocks");
        Ok(())
    }

    async fn flush(&mut self) -> FsResult<()> {
        self.flush_blocks(true).await?;
        self.session
            .meta()
            .commit_write(self.file.id, self.handle, self.durable_len, false)
            .await?;
        if let Some(mirror) = self.mirror.as_mut() {
            mirror.flush().await?;
        }
        Ok(())
    }

    async fn close(&mut self) -> FsResult<()> {
        let result = async {
            self.session.ensure_active()?;
            self.flush_blocks(true).await?;
            self.session
                .meta()
                .commit_write(self.file.id, self.handle, self.durable_len, true)
                .await?;
            Ok::<_, FsError>(())
        }
        .await;
        let mirrored = match self.mirror.take() {
            Some(mut mirror) => mirror.shutdown().await.map_err(FsError::from),
            None => Ok(()),
        };
        self.session.unregister(self.handle);
        self.session.observe(result.and(mirrored))
    }
}

enum WriteTarget {
    Primary(Box<PrimaryWriter>),
    Proxy {
        session: Arc<Session>,
        handle: HandleId,
        sink: SecondaryWriter,
        position: u64,
    },
}

/// Output stream returned by `create` and `append`.
pub struct FileWriter {
    path: FsPath,
    target: WriteTarget,
    closed: bool,
}

impl std::fmt::Debug for FileWriter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FileWriter")
            .field("path", &self.path)
            .field("closed", &self.closed)
            .finish_non_exhaustive()
    }
}

impl FileWriter {
    pub(crate) async fn primary(path: FsPath, params: PrimaryWrite) -> FsResult<Self> {
        Ok(Self {
            path,
            target: WriteTarget::Primary(Box::new(PrimaryWriter::open(params).await?)),
            closed: false,
        })
    }

    pub(crate) fn proxy(
        path: FsPath,
        session: Arc<Session>,
        handle: HandleId,
        sink: SecondaryWriter,
        position: u64,
    ) -> Self {
        Self {
            path,
            target: WriteTarget::Proxy {
                session,
                handle,
                sink,
                position,
            },
            closed: false,
        }
    }

    pub fn path(&self) -> &FsPath {
        &self.path
    }

    /// Inode id for primary handles.
    pub fn id(&self) -> Option<InodeId> {
        match &self.target {
            WriteTarget::Primary(w) => Some(w.file.id),
            WriteTarget::Proxy { .. } => None,
        }
    }

    /// Bytes accepted so far, counted from the start of the file.
    pub fn position(&self) -> u64 {
        match &self.target {
            WriteTarget::Primary(w) => w.position(),
            WriteTarget::Proxy { position, .. } => *position,
        }
    }

    fn session(&self) -> &Arc<Session> {
        match &self.target {
            WriteTarget::Primary(w) => &w.session,
            WriteTarget::Proxy { session, .. } => session,
        }
    }

    fn ensure_usable(&self) -> FsResult<()> {
        if self.closed {
            return Err(FsError::Closed);
        }
        self.session().ensure_active()
    }

    pub async fn write(&mut self, data: &[u8]) -> FsResult<()> {
        self.ensure_usable()?;
        let result = match &mut self.target {
            WriteTarget::Primary(w) => w.write(data).await,
            WriteTarget::Proxy { sink, position, .. } => {
                sink.write_all(data).await.map_err(FsError::from).map(|_| {
                    *position += data.len() as u64;
                })
            }
        };
        self.session().observe(result)
    }

    /// Makes everything written so far visible to readers; the write lock is kept.
    pub async fn flush(&mut self) -> FsResult<()> {
        self.ensure_usable()?;
        let result = match &mut self.target {
            WriteTarget::Primary(w) => w.flush().await,
            WriteTarget::Proxy { sink, .. } => sink.flush().await.map_err(FsError::from),
        };
        self.session().observe(result)
    }

    /// Flushes the remainder, commits length and times, and releases the
    /// write lock. A second call is a no-op.
    pub async fn close(&mut self) -> FsResult<()> {
        if self.closed {
            return Ok(());
        }
        self.closed = true;
        match &mut self.target {
            WriteTarget::Primary(w) => w.close().await,
            WriteTarget::Proxy {
                session,
                handle,
                sink,
                ..
            } => {
                let result = sink.shutdown().await.map_err(FsError::from);
                session.unregister(*handle);
                result
            }
        }
    }
}

impl Drop for FileWriter {
    fn drop(&mut self) {
        if self.closed {
            return;
        }
        match &self.target {
            WriteTarget::Primary(w) => {
                w.session.unregister(w.handle);
                if !w.session.is_active() {
                    return;
                }
                warn!(path = %self.path, "writer dropped without close, releasing its lock");
                let Ok(runtime) = tokio::runtime::Handle::try_current() else {
                    return;
                };
                let session = w.session.clone();
                let (id, handle, length) = (w.file.id, w.handle, w.durable_len);
                runtime.spawn(async move {
                    if let Err(e) = session.meta().commit_write(id, handle, length, true).await {
                        debug!(%id, error = %e, "could not release dropped writer's lock");
                    }
                });
            }
            WriteTarget::Proxy {
                session, handle, ..
            } => session.unregister(*handle),
        }
    }
}

pub(crate) struct PrimaryRead {
    pub session: Arc<Session>,
    pub handle: HandleId,
    pub file: FileBlocks,
    pub length: u64,
    pub read_buffer_size: usize,
    pub prefetch_blocks: u64,
}

struct PrimaryReader {
    session: Arc<Session>,
    handle: HandleId,
    file: FileBlocks,
    length: u64,
    fetch_size: usize,
    buffer: Bytes,
    buffer_start: u64,
}

impl PrimaryReader {
    fn new(params: PrimaryRead) -> Self {
        let layout = params.session.blocks().layout();
        // 读取粒度按整块对齐，另加预取块
        let blocks =
            layout.blocks_for(params.read_buffer_size as u64).max(1) + params.prefetch_blocks;
        Self {
            fetch_size: (blocks * layout.block_size) as usize,
            session: params.session,
            handle: params.handle,
            file: params.file,
            length: params.length,
            buffer: Bytes::new(),
            buffer_start: 0,
        }
    }

    fn buffered(&self, position: u64) -> bool {
        position >= self.buffer_start && position < self.buffer_start + self.buffer.len() as u64
    }

    async fn read(&mut self, position: u64, out: &mut [u8]) -> FsResult<usize> {
        if position >= self.length || out.is_empty() {
            return Ok(0);
        }
        if !self.buffered(position) {
            let layout = self.session.blocks().layout();
            let start = layout.block_start(layout.block_index_of(position));
            self.buffer = self
                .session
                .blocks()
                .read_range(self.file, self.length, start, self.fetch_size)
                .await?;
            self.buffer_start = start;
            if !self.buffered(position) {
                return Ok(0);
            }
        }
        let offset = (position - self.buffer_start) as usize;
        let n = out.len().min(self.buffer.len() - offset);
        out[..n].copy_from_slice(&self.buffer[offset..offset + n]);
        Ok(n)
    }
}

enum ReadTarget {
    Primary(PrimaryReader),
    Proxy {
        session: Arc<Session>,
        handle: HandleId,
        source: SecondaryReader,
        length: u64,
        /// Seek not yet applied to `source`.
        pending_seek: Option<u64>,
    },
}

/// Input stream returned by `open`.
pub struct FileReader {
    path: FsPath,
    target: ReadTarget,
    position: u64,
    closed: bool,
}

impl FileReader {
    pub(crate) fn primary(path: FsPath, params: PrimaryRead) -> Self {
        Self {
            path,
            target: ReadTarget::Primary(PrimaryReader::new(params)),
            position: 0,
            closed: false,
        }
    }

    pub(crate) fn proxy(
        path: FsPath,
        session: Arc<Session>,
        handle: HandleId,
        source: SecondaryReader,
        length: u64,
    ) -> Self {
        Self {
            path,
            target: ReadTarget::Proxy {
                session,
                handle,
                source,
                length,
                pending_seek: None,
            },
            position: 0,
            closed: false,
        }
    }

    pub fn path(&self) -> &FsPath {
        &self.path
    }

    /// Length of the file as seen when the handle was opened.
    pub fn length(&self) -> u64 {
        match &self.target {
            ReadTarget::Primary(r) => r.length,
            ReadTarget::Proxy { length, .. } => *length,
        }
    }

    pub fn position(&self) -> u64 {
        self.position
    }

    fn session(&self) -> &Arc<Session> {
        match &self.target {
            ReadTarget::Primary(r) => &r.session,
            ReadTarget::Proxy { session, .. } => session,
        }
    }

    /// Moves the cursor without I/O. Positions past the end read as EOF.
    pub fn seek(&mut self, position: u64) -> FsResult<()> {
        if self.closed {
            return Err(FsError::Closed);
        }
        self.position = position;
        if let ReadTarget::Proxy { pending_seek, .. } = &mut self.target {
            *pending_seek = Some(position);
        }
        Ok(())
    }

    /// Reads into `out`; `Ok(0)` signals end of file.
    pub async fn read(&mut self, out: &mut [u8]) -> FsResult<usize> {
        if self.closed {
            return Err(FsError::Closed);
        }
        self.session().ensure_active()?;
        let position = self.position;
        let result = match &mut self.target {
            ReadTarget::Primary(r) => r.read(position, out).await,
            ReadTarget::Proxy {
                source,
                pending_seek,
                ..
            } => async {
                if let Some(target) = pending_seek.take() {
                    source.seek(SeekFrom::Start(target)).await?;
                }
                Ok::<usize, FsError>(source.read(out).await?)
            }
            .await,
        };
        let n = self.session().observe(result)?;
        self.position += n as u64;
        Ok(n)
    }

    /// Reads from the cursor to end of file.
    pub async fn read_to_end(&mut self) -> FsResult<Vec<u8>> {
        let mut out = Vec::with_capacity(self.length().saturating_sub(self.position) as usize);
        let mut chunk = vec![0u8; 64 * 1024];
        loop {
            let n = self.read(&mut chunk).await?;
            if n == 0 {
                return Ok(out);
            }
            out.extend_from_slice(&chunk[..n]);
        }
    }

    pub fn close(&mut self) {
        if self.closed {
            return;
        }
        self.closed = true;
        match &self.target {
            ReadTarget::Primary(r) => r.session.unregister(r.handle),
            ReadTarget::Proxy {
                session, handle, ..
            } => session.unregister(*handle),
        }
    }
}

impl Drop for FileReader {
    fn drop(&mut self) {
        self.close();
    }
}
