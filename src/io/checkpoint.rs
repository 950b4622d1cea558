//! Checkpoint blobs with single-coordinator semantics.
//!
//! Rank [`COORDINATOR`] is the only rank that encodes a blob, touches the
//! filesystem, or decodes what was read; everyone else receives the payload by
//! broadcast (or their own piece by scatter). A blob is a bincode-encoded
//! [`CheckpointHeader`] followed by the bincode-encoded object. Files hold the
//! blob gzip-compressed.
//!
//! Everything except `encode`, `decode` and `persist` is collective. A failure on the coordinator is forwarded
//! to every rank, so nobody is left waiting for a payload that never comes.

use std::fs::File;
use std::io::{BufReader, BufWriter, Cursor, Read, Write};
use std::path::Path;

use flate2::Compression;
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tempfile::TempPath;

use crate::algs::communicator::{
    CommTag, Communicator, Wait, all_reduce_max, broadcast_bytes, gather_bytes,
};
use crate::mesh_error::MeshSolveError;

/// Rank that performs all encoding and file I/O.
pub const COORDINATOR: usize = 0;

pub const CHECKPOINT_VERSION: u32 = 1;
const MAGIC: [u8; 4] = *b"MLSC";

const FRAME_OK: u8 = 1;
const FRAME_ERR: u8 = 0;

#[derive(Copy, Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum BlobKind {
    /// One object, identical on every rank.
    Replicated,
    /// One piece per rank, in rank order.
    Gathered,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct CheckpointHeader {
    pub magic: [u8; 4],
    pub version: u32,
    pub kind: BlobKind,
    /// Group size at persist time.
    pub ranks: u32,
}

impl CheckpointHeader {
    fn new(kind: BlobKind, ranks: usize) -> Self {
        Self {
            magic: MAGIC,
            version: CHECKPOINT_VERSION,
            kind,
            ranks: ranks as u32,
        }
    }

    fn check(&self, kind: BlobKind) -> Result<(), MeshSolveError> {
        if self.magic != MAGIC {
            return Err(MeshSolveError::Checkpoint("not a checkpoint blob".into()));
        }
        if self.version != CHECKPOINT_VERSION {
            return Err(MeshSolveError::Checkpoint(format!(
                "unsupported checkpoint version {} (expected {CHECKPOINT_VERSION})",
                self.version
            )));
        }
        if self.kind != kind {
            return Err(MeshSolveError::Checkpoint(format!(
                "expected a {kind:?} checkpoint, found {:?}",
                self.kind
            )));
        }
        Ok(())
    }
}

/// Communication tags used by checkpoint collectives.
#[derive(Copy, Clone, Debug)]
pub struct CheckpointTags {
    pub broadcast: CommTag,
    pub gather: CommTag,
    pub scatter: CommTag,
    pub agree: CommTag,
}

impl CheckpointTags {
    #[inline]
    pub const fn from_base(base: CommTag) -> Self {
        Self {
            broadcast: base,
            gather: base.offset(1),
            scatter: base.offset(2),
            agree: base.offset(3),
        }
    }
}

impl Default for CheckpointTags {
    fn default() -> Self {
        Self::from_base(CommTag::new(0x5700))
    }
}

fn codec_err(e: bincode::Error) -> MeshSolveError {
    MeshSolveError::Checkpoint(e.to_string())
}

/// Encode `obj` behind a header; no communication.
pub fn encode<T: Serialize + ?Sized>(
    obj: &T,
    kind: BlobKind,
    ranks: usize,
) -> Result<Vec<u8>, MeshSolveError> {
    let mut blob = Vec::new();
    bincode::serialize_into(&mut blob, &CheckpointHeader::new(kind, ranks)).map_err(codec_err)?;
    bincode::serialize_into(&mut blob, obj).map_err(codec_err)?;
    Ok(blob)
}

/// Check the header and decode the object; no communication.
pub fn decode<T: DeserializeOwned>(
    blob: &[u8],
    kind: BlobKind,
) -> Result<(CheckpointHeader, T), MeshSolveError> {
    let mut cursor = Cursor::new(blob);
    let header: CheckpointHeader = bincode::deserialize_from(&mut cursor).map_err(codec_err)?;
    header.check(kind)?;
    let obj = bincode::deserialize_from(&mut cursor).map_err(codec_err)?;
    Ok((header, obj))
}

/// Blob for an object every rank holds identically.
///
/// `Some` on the coordinator, `None` elsewhere; no communication.
pub fn persist<T: Serialize + ?Sized, C: Communicator>(
    obj: &T,
    comm: &C,
) -> Result<Option<Vec<u8>>, MeshSolveError> {
    if comm.rank() != COORDINATOR {
        return Ok(None);
    }
    encode(obj, BlobKind::Replicated, comm.size()).map(Some)
}

/// Gather every rank's `local` piece to the coordinator and encode them
/// together. `Some` on the coordinator, `None` elsewhere. Collective.
pub fn persist_gathered<T: Serialize, C: Communicator>(
    local: &T,
    comm: &C,
) -> Result<Option<Vec<u8>>, MeshSolveError> {
    let tags = CheckpointTags::default();
    let piece = bincode::serialize(local).map_err(codec_err);
    let gathered = gather_bytes(
        comm,
        tags.gather,
        COORDINATOR,
        piece.as_deref().unwrap_or_default(),
    )?;
    let any_failed = all_reduce_max(comm, tags.agree, if piece.is_err() { 1.0 } else { 0.0 })?;
    piece?;
    if any_failed > 0.0 {
        return Err(MeshSolveError::Checkpoint(
            "another rank failed to encode its piece".into(),
        ));
    }
    match gathered {
        Some(pieces) => encode(&pieces, BlobKind::Gathered, comm.size()).map(Some),
        None => Ok(None),
    }
}

/// Decode a replicated blob on the coordinator and broadcast it; every rank
/// returns an identical object. Non-coordinator ranks pass `None`. Collective.
pub fn restore<T: DeserializeOwned, C: Communicator>(
    blob: Option<&[u8]>,
    comm: &C,
) -> Result<T, MeshSolveError> {
    let tags = CheckpointTags::default();
    let checked = (comm.rank() == COORDINATOR).then(|| match blob {
        Some(b) => decode::<T>(b, BlobKind::Replicated).map(|_| b.to_vec()),
        None => Err(MeshSolveError::Checkpoint("coordinator has no blob to restore".into())),
    });
    let payload = broadcast_frame(comm, tags.broadcast, checked)?;
    decode::<T>(&payload, BlobKind::Replicated).map(|(_, obj)| obj)
}

/// Decode a gathered blob on the coordinator and hand each rank its own
/// piece. Collective; the group must have the size the blob was written with.
pub fn restore_pieces<T: DeserializeOwned, C: Communicator>(
    blob: Option<&[u8]>,
    comm: &C,
) -> Result<T, MeshSolveError> {
    let tags = CheckpointTags::default();
    let me = comm.rank();
    if me != COORDINATOR {
        let frame = comm
            .irecv(COORDINATOR, tags.scatter.as_u16())
            .wait()
            .ok_or_else(|| MeshSolveError::CommError {
                neighbor: COORDINATOR,
                source: "checkpoint piece never arrived".into(),
            })?;
        let piece = open_frame(frame)?;
        return bincode::deserialize(&piece).map_err(codec_err);
    }

    let pieces: Result<Vec<Vec<u8>>, MeshSolveError> = match blob {
        Some(b) => decode::<Vec<Vec<u8>>>(b, BlobKind::Gathered).and_then(|(header, pieces)| {
            if header.ranks as usize == comm.size() && pieces.len() == comm.size() {
                Ok(pieces)
            } else {
                Err(MeshSolveError::Checkpoint(format!(
                    "checkpoint holds {} pieces, group has {} ranks",
                    pieces.len(),
                    comm.size()
                )))
            }
        }),
        None => Err(MeshSolveError::Checkpoint("coordinator has no blob to restore".into())),
    };

    let frames: Vec<Vec<u8>> = match &pieces {
        Ok(p) => p.iter().map(|piece| ok_frame(piece)).collect(),
        Err(e) => vec![err_frame(e); comm.size()],
    };
    let pending: Vec<_> = (0..comm.size())
        .filter(|&peer| peer != me)
        .map(|peer| comm.isend(peer, tags.scatter.as_u16(), &frames[peer]))
        .collect();
    for send in pending {
        let _ = send.wait();
    }
    let mut pieces = pieces?;
    bincode::deserialize(&pieces.swap_remove(me)).map_err(codec_err)
}

/// Persist a replicated object to `path`; only the coordinator writes.
/// Collective: every rank returns the coordinator's outcome.
pub fn write_checkpoint<T: Serialize + ?Sized, C: Communicator>(
    obj: &T,
    path: impl AsRef<Path>,
    comm: &C,
) -> Result<(), MeshSolveError> {
    let tags = CheckpointTags::default();
    let outcome = match persist(obj, comm) {
        Ok(Some(blob)) => Some(write_compressed(path.as_ref(), &blob)),
        Ok(None) => None,
        Err(e) => Some(Err(e)),
    };
    if let Some(Ok(())) = outcome {
        log::debug!("checkpoint written to {}", path.as_ref().display());
    }
    broadcast_status(comm, tags.broadcast, outcome)
}

/// Read a replicated checkpoint on the coordinator and restore it everywhere.
/// Collective.
pub fn read_checkpoint<T: DeserializeOwned, C: Communicator>(
    path: impl AsRef<Path>,
    comm: &C,
) -> Result<T, MeshSolveError> {
    let tags = CheckpointTags::default();
    let checked = (comm.rank() == COORDINATOR).then(|| {
        read_compressed(path.as_ref())
            .and_then(|b| decode::<T>(&b, BlobKind::Replicated).map(|_| b))
    });
    let payload = broadcast_frame(comm, tags.broadcast, checked)?;
    decode::<T>(&payload, BlobKind::Replicated).map(|(_, obj)| obj)
}

/// Checkpoint file in the system temp directory, held by the coordinator.
///
/// The file is removed when the handle is dropped or read back with
/// [`read_temp_checkpoint`].
#[derive(Debug)]
pub struct TempCheckpoint {
    path: TempPath,
}

impl TempCheckpoint {
    pub fn path(&self) -> &Path {
        &self.path
    }
}

/// Like [`write_checkpoint`], but into a fresh temporary file whose name ends
/// in `suffix`. `Some` on the coordinator, `None` elsewhere. Collective.
pub fn write_temp_checkpoint<T: Serialize + ?Sized, C: Communicator>(
    obj: &T,
    suffix: &str,
    comm: &C,
) -> Result<Option<TempCheckpoint>, MeshSolveError> {
    let tags = CheckpointTags::default();
    let outcome = match persist(obj, comm) {
        Ok(Some(blob)) => Some(temp_path(suffix).and_then(|path| {
            write_compressed(&path, &blob)?;
            Ok(TempCheckpoint { path })
        })),
        Ok(None) => None,
        Err(e) => Some(Err(e)),
    };
    let (status, temp) = match outcome {
        Some(Ok(temp)) => (Some(Ok(())), Some(temp)),
        Some(Err(e)) => (Some(Err(e)), None),
        None => (None, None),
    };
    if let Some(t) = &temp {
        log::debug!("checkpoint written to {}", t.path().display());
    }
    broadcast_status(comm, tags.broadcast, status)?;
    Ok(temp)
}

/// Read a temporary checkpoint back everywhere and remove its file.
/// The coordinator passes the handle from [`write_temp_checkpoint`], every
/// other rank `None`. Collective.
pub fn read_temp_checkpoint<T: DeserializeOwned, C: Communicator>(
    temp: Option<TempCheckpoint>,
    comm: &C,
) -> Result<T, MeshSolveError> {
    let tags = CheckpointTags::default();
    let checked = (comm.rank() == COORDINATOR).then(|| match temp {
        Some(t) => {
            let read = read_compressed(t.path())
                .and_then(|b| decode::<T>(&b, BlobKind::Replicated).map(|_| b));
            let removed = t.path.close().map_err(MeshSolveError::from);
            read.and_then(|b| removed.map(|()| b))
        }
        None => Err(MeshSolveError::Checkpoint(
            "coordinator has no temporary checkpoint to read".into(),
        )),
    });
    let payload = broadcast_frame(comm, tags.broadcast, checked)?;
    decode::<T>(&payload, BlobKind::Replicated).map(|(_, obj)| obj)
}

fn temp_path(suffix: &str) -> Result<TempPath, MeshSolveError> {
    Ok(tempfile::Builder::new()
        .prefix("mesh-linsolve-")
        .suffix(suffix)
        .tempfile()?
        .into_temp_path())
}

fn write_compressed(path: &Path, blob: &[u8]) -> Result<(), MeshSolveError> {
    let mut gz = GzEncoder::new(BufWriter::new(File::create(path)?), Compression::default());
    gz.write_all(blob)?;
    gz.finish()?.flush()?;
    Ok(())
}

fn read_compressed(path: &Path) -> Result<Vec<u8>, MeshSolveError> {
    let mut blob = Vec::new();
    GzDecoder::new(BufReader::new(File::open(path)?)).read_to_end(&mut blob)?;
    Ok(blob)
}

fn ok_frame(payload: &[u8]) -> Vec<u8> {
    let mut frame = Vec::with_capacity(payload.len() + 1);
    frame.push(FRAME_OK);
    frame.extend_from_slice(payload);
    frame
}

fn err_frame(err: &MeshSolveError) -> Vec<u8> {
    let mut frame = vec![FRAME_ERR];
    frame.extend_from_slice(err.to_string().as_bytes());
    frame
}

fn open_frame(mut frame: Vec<u8>) -> Result<Vec<u8>, MeshSolveError> {
    match frame.first() {
        Some(&FRAME_OK) => {
            frame.remove(0);
            Ok(frame)
        }
        Some(_) => Err(MeshSolveError::Checkpoint(format!(
            "coordinator failed: {}",
            String::from_utf8_lossy(&frame[1..])
        ))),
        None => Err(MeshSolveError::Checkpoint("empty checkpoint frame".into())),
    }
}

/// Broadcast the coordinator's payload or error. The coordinator passes
/// `Some`, everyone else `None`.
fn broadcast_frame<C: Communicator>(
    comm: &C,
    tag: CommTag,
    payload: Option<Result<Vec<u8>, MeshSolveError>>,
) -> Result<Vec<u8>, MeshSolveError> {
    match payload {
        Some(Ok(bytes)) => {
            broadcast_bytes(comm, tag, COORDINATOR, Some(ok_frame(&bytes)))?;
            Ok(bytes)
        }
        Some(Err(e)) => {
            broadcast_bytes(comm, tag, COORDINATOR, Some(err_frame(&e)))?;
            Err(e)
        }
        None => open_frame(broadcast_bytes(comm, tag, COORDINATOR, None)?),
    }
}

fn broadcast_status<C: Communicator>(
    comm: &C,
    tag: CommTag,
    status: Option<Result<(), MeshSolveError>>,
) -> Result<(), MeshSolveError> {
    let payload = status.map(|s| s.map(|()| Vec::new()));
    broadcast_frame(comm, tag, payload).map(drop)
}
