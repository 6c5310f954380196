//! Collective agreement on per-rank outcomes and small integer exchanges.

use crate::algs::communicator::Communicator;
use crate::writer_error::{ErrorKind, Result, WriterError};

/// Make a per-rank result collective: if any rank failed, every rank fails.
///
/// A failing rank keeps its own error; the others report the lowest failing
/// rank as a [`WriterError::PeerFailure`]. Collective.
pub fn agree<C, T>(comm: &C, local: Result<T>) -> Result<T>
where
    C: Communicator + ?Sized,
{
    let status = match &local {
        Ok(_) => vec![0u8],
        Err(err) => {
            let mut buf = vec![1u8, err.kind().code()];
            buf.extend_from_slice(err.to_string().as_bytes());
            buf
        }
    };
    let statuses = comm.all_gather(&status);
    if local.is_err() {
        return local;
    }
    for (rank, status) in statuses.iter().enumerate() {
        if status.first() == Some(&1) {
            let kind = status
                .get(1)
                .and_then(|&code| ErrorKind::from_code(code))
                .unwrap_or(ErrorKind::BackendIo);
            let message = String::from_utf8_lossy(status.get(2..).unwrap_or_default()).into_owned();
            return Err(WriterError::PeerFailure {
                rank,
                kind,
                message,
            });
        }
    }
    local
}

/// Exchange a fixed number of `u64` values per rank; result is indexed by rank.
pub fn all_gather_u64<C>(comm: &C, values: &[u64]) -> Result<Vec<Vec<u64>>>
where
    C: Communicator + ?Sized,
{
    let bytes: Vec<u8> = values.iter().flat_map(|v| v.to_le_bytes()).collect();
    comm.all_gather(&bytes)
        .into_iter()
        .enumerate()
        .map(|(rank, raw)| {
            if raw.len() != values.len() * 8 {
                return Err(WriterError::InvalidMesh(format!(
                    "rank {rank} sent {} bytes, expected {}",
                    raw.len(),
                    values.len() * 8
                )));
            }
            Ok(raw
                .chunks_exact(8)
                .map(|c| u64::from_le_bytes([c[0], c[1], c[2], c[3], c[4], c[5], c[6], c[7]]))
                .collect())
        })
        .collect()
}

/// Broadcast a boolean decided on `root`.
pub fn broadcast_flag<C>(comm: &C, root: usize, flag: bool) -> bool
where
    C: Communicator + ?Sized,
{
    let mut buf = vec![flag as u8];
    comm.broadcast(root, &mut buf);
    buf.first() == Some(&1)
}
