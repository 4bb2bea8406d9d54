//! Chunked transfer engine.
//!
//! Files move in a fixed schedule of byte ranges, each CTR-crypted under
//! the file key with a per-chunk nonce derived from the range start.
//! Workers fan out over the schedule; chunk MACs are collected under a
//! mutex and folded in ascending start order once all chunks land, never
//! in completion order.

use aes::cipher::generic_array::GenericArray;
use aes::cipher::{BlockEncryptMut, KeyIvInit, StreamCipher};
use std::io::SeekFrom;
use std::path::Path;
use std::sync::Arc;
use tokio::io::{AsyncReadExt, AsyncSeekExt, AsyncWriteExt};
use tokio::sync::{mpsc, watch, Mutex};
use tracing::debug;

use crate::api::Transport;
use crate::crypto::{a32_to_bytes, bytes_to_a32, pad_null, Aes128CbcEnc, Aes128Ctr};
use crate::error::Error;

// ─── Chunk schedule ─────────────────────────────────────────────────────────

/// One entry of the transfer schedule.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Chunk {
    pub start: u64,
    pub len: u64,
}

/// Deterministic chunk schedule for a file of `size` bytes: the first
/// eight chunks ramp up by 128 KiB each, every later chunk is 1 MiB,
/// and the last chunk absorbs the remainder.
pub fn chunk_schedule(size: u64) -> Vec<Chunk> {
    let mut chunks = Vec::new();
    let mut start = 0u64;
    let mut remaining = size;
    let mut i = 1u64;
    while remaining > 0 {
        let len = if i <= 8 { i * 131_072 } else { 1_048_576 }.min(remaining);
        chunks.push(Chunk { start, len });
        start += len;
        remaining -= len;
        i += 1;
    }
    chunks
}

// ─── Chained CBC-MAC ────────────────────────────────────────────────────────

const ZERO_IV: [u8; 16] = [0u8; 16];

/// Per-chunk MAC IV: the CTR nonce prefix words doubled.
pub(crate) fn mac_iv(iv: &[u8; 16]) -> [u8; 16] {
    let w = bytes_to_a32(iv);
    let mut out = [0u8; 16];
    out.copy_from_slice(&a32_to_bytes(&[w[0], w[1], w[0], w[1]]));
    out
}

/// CBC-MAC one chunk: zero-pad to the block size, encrypt, keep the
/// final ciphertext block.
pub(crate) fn chunk_mac(key: &[u8; 16], iv: &[u8; 16], chunk: &[u8]) -> [u8; 16] {
    let mut enc = Aes128CbcEnc::new(key.into(), iv.into());
    let padded = pad_null(chunk.to_vec(), 16);
    let mut block = [0u8; 16];
    for b in padded.chunks_exact(16) {
        block.copy_from_slice(b);
        enc.encrypt_block_mut(GenericArray::from_mut_slice(&mut block));
    }
    block
}

/// Chain chunk MACs (in ascending start order) through a single
/// zero-IV CBC encrypter; the last ciphertext block is the accumulator.
pub(crate) fn fold_macs<I: IntoIterator<Item = [u8; 16]>>(key: &[u8; 16], macs: I) -> [u8; 16] {
    let mut enc = Aes128CbcEnc::new(key.into(), (&ZERO_IV).into());
    let mut acc = [0u8; 16];
    for mac in macs {
        acc = mac;
        enc.encrypt_block_mut(GenericArray::from_mut_slice(&mut acc));
    }
    acc
}

/// Reduce the 128-bit accumulator to the 64-bit content MAC.
pub(crate) fn reduce_mac(acc: &[u8; 16]) -> [u8; 8] {
    let w = bytes_to_a32(acc);
    let mut out = [0u8; 8];
    out.copy_from_slice(&a32_to_bytes(&[w[0] ^ w[1], w[2] ^ w[3]]));
    out
}

/// Per-chunk CTR nonce: the file nonce prefix followed by the chunk's
/// block offset split across two words.
pub(crate) fn chunk_nonce(iv: &[u8; 16], start: u64) -> [u8; 16] {
    let w = bytes_to_a32(iv);
    let mut out = [0u8; 16];
    out.copy_from_slice(&a32_to_bytes(&[
        w[0],
        w[1],
        (start / 0x10_0000_0000) as u32,
        (start / 0x10) as u32,
    ]));
    out
}

// ─── Download engine ────────────────────────────────────────────────────────

/// Everything the download workers need for one transfer.
pub(crate) struct DownloadParams {
    pub url: String,
    pub size: u64,
    pub key: [u8; 16],
    pub iv: [u8; 16],
    pub expected_mac: [u8; 8],
}

struct DownloadCtx {
    transport: Arc<dyn Transport>,
    url: String,
    key: [u8; 16],
    iv: [u8; 16],
    mac_iv: [u8; 16],
    schedule: Vec<Chunk>,
    macs: Mutex<Vec<Option<[u8; 16]>>>,
    out: Mutex<tokio::fs::File>,
    retries: u32,
}

/// Stream a file into `dst`, decrypting each chunk at its exact offset
/// and verifying the folded MAC at the end. On any failure the partial
/// destination file is removed.
pub(crate) async fn download_file(
    transport: Arc<dyn Transport>,
    params: DownloadParams,
    dst: &Path,
    workers: usize,
    retries: u32,
) -> Result<(), Error> {
    let schedule = chunk_schedule(params.size);
    let total = schedule.len();

    let file = tokio::fs::OpenOptions::new()
        .read(true)
        .write(true)
        .create(true)
        .truncate(true)
        .open(dst)
        .await?;

    let ctx = Arc::new(DownloadCtx {
        transport,
        url: params.url,
        key: params.key,
        iv: params.iv,
        mac_iv: mac_iv(&params.iv),
        schedule,
        macs: Mutex::new(vec![None; total]),
        out: Mutex::new(file),
        retries,
    });

    let status = run_workers(total, workers, |work_rx, done_tx, quit_rx| {
        let ctx = ctx.clone();
        tokio::spawn(async move {
            worker_loop(work_rx, done_tx, quit_rx, |id| {
                let ctx = ctx.clone();
                async move { dl_chunk(&ctx, id).await }
            })
            .await;
        })
    })
    .await;

    if let Err(e) = status {
        drop(ctx);
        let _ = tokio::fs::remove_file(dst).await;
        return Err(e);
    }

    let folded = {
        let macs = ctx.macs.lock().await;
        let mut ordered = Vec::with_capacity(total);
        for &mac in macs.iter() {
            ordered.push(mac.ok_or_else(|| Error::BadResp("chunk MAC missing after completion".into()))?);
        }
        reduce_mac(&fold_macs(&ctx.key, ordered))
    };

    {
        let mut f = ctx.out.lock().await;
        f.flush().await?;
    }
    drop(ctx);

    if folded != params.expected_mac {
        let _ = tokio::fs::remove_file(dst).await;
        return Err(Error::MacMismatch);
    }
    Ok(())
}

async fn dl_chunk(ctx: &DownloadCtx, id: usize) -> Result<(), Error> {
    let Chunk { start, len } = ctx.schedule[id];
    let url = format!("{}/{}-{}", ctx.url, start, start + len - 1);

    let mut fetched = None;
    let mut last_err = Error::Network("no attempts made".into());
    for attempt in 0..=ctx.retries {
        match ctx.transport.get_chunk(&url).await {
            Ok(body) => {
                fetched = Some(body);
                break;
            }
            Err(e) => {
                debug!(target: "mega::transfer", "chunk {} fetch attempt {} failed: {}", id, attempt + 1, e);
                last_err = e;
            }
        }
    }
    let mut chunk = match fetched {
        Some(body) => body,
        None => return Err(last_err),
    };

    let nonce = chunk_nonce(&ctx.iv, start);
    let mut ctr = Aes128Ctr::new((&ctx.key).into(), (&nonce).into());
    ctr.apply_keystream(&mut chunk);

    {
        let mut f = ctx.out.lock().await;
        f.seek(SeekFrom::Start(start)).await?;
        f.write_all(&chunk).await?;
    }

    let mac = chunk_mac(&ctx.key, &ctx.mac_iv, &chunk);
    ctx.macs.lock().await[id] = Some(mac);
    Ok(())
}

// ─── Upload engine ──────────────────────────────────────────────────────────

/// What the coordinator hands back after all chunks are pushed.
pub(crate) struct UploadOutcome {
    /// Last non-empty chunk response body, the server-issued completion
    /// handle.
    pub completion_handle: String,
    /// Folded content MAC as two words.
    pub meta_mac: [u32; 2],
}

struct UploadShared {
    macs: Vec<Option<[u8; 16]>>,
    completion: Vec<u8>,
}

struct UploadCtx {
    transport: Arc<dyn Transport>,
    url: String,
    key: [u8; 16],
    iv: [u8; 16],
    mac_iv: [u8; 16],
    schedule: Vec<Chunk>,
    shared: Mutex<UploadShared>,
    input: Mutex<tokio::fs::File>,
}

/// Push `src` to the upload url chunk by chunk, encrypting in flight and
/// collecting chunk MACs.
pub(crate) async fn upload_file(
    transport: Arc<dyn Transport>,
    url: String,
    src: &Path,
    size: u64,
    key: [u8; 16],
    iv: [u8; 16],
    workers: usize,
) -> Result<UploadOutcome, Error> {
    let schedule = chunk_schedule(size);
    let total = schedule.len();
    let file = tokio::fs::File::open(src).await?;

    let ctx = Arc::new(UploadCtx {
        transport,
        url,
        key,
        iv,
        mac_iv: mac_iv(&iv),
        schedule,
        shared: Mutex::new(UploadShared {
            macs: vec![None; total],
            completion: Vec::new(),
        }),
        input: Mutex::new(file),
    });

    let status = run_workers(total, workers, |work_rx, done_tx, quit_rx| {
        let ctx = ctx.clone();
        tokio::spawn(async move {
            worker_loop(work_rx, done_tx, quit_rx, |id| {
                let ctx = ctx.clone();
                async move { ul_chunk(&ctx, id).await }
            })
            .await;
        })
    })
    .await;
    status?;

    let shared = ctx.shared.lock().await;
    let mut ordered = Vec::with_capacity(total);
    for &mac in shared.macs.iter() {
        ordered.push(mac.ok_or_else(|| Error::BadResp("chunk MAC missing after completion".into()))?);
    }
    let acc = fold_macs(&ctx.key, ordered);
    let w = bytes_to_a32(&acc);

    Ok(UploadOutcome {
        completion_handle: String::from_utf8_lossy(&shared.completion).into_owned(),
        meta_mac: [w[0] ^ w[1], w[2] ^ w[3]],
    })
}

async fn ul_chunk(ctx: &UploadCtx, id: usize) -> Result<(), Error> {
    let Chunk { start, len } = ctx.schedule[id];

    let mut chunk = vec![0u8; len as usize];
    {
        let mut f = ctx.input.lock().await;
        f.seek(SeekFrom::Start(start)).await?;
        f.read_exact(&mut chunk).await?;
    }

    let mac = chunk_mac(&ctx.key, &ctx.mac_iv, &chunk);

    let nonce = chunk_nonce(&ctx.iv, start);
    let mut ctr = Aes128Ctr::new((&ctx.key).into(), (&nonce).into());
    ctr.apply_keystream(&mut chunk);

    let url = format!("{}/{}", ctx.url, start);
    let resp = ctx.transport.post_chunk(&url, chunk).await?;

    let mut shared = ctx.shared.lock().await;
    shared.macs[id] = Some(mac);
    if !resp.is_empty() {
        shared.completion = resp;
    }
    Ok(())
}

// ─── Worker pool ────────────────────────────────────────────────────────────

type WorkRx = Arc<Mutex<mpsc::Receiver<usize>>>;
type DoneTx = mpsc::Sender<Result<(), Error>>;

/// Spawn `workers` tasks over a job channel and drive the schedule:
/// prime one job per worker, then trade one completion for one dispatch.
/// The first completion error broadcasts the quit signal to every
/// spawned worker and becomes the pool's result.
async fn run_workers<S>(total: usize, workers: usize, spawn: S) -> Result<(), Error>
where
    S: Fn(WorkRx, DoneTx, watch::Receiver<bool>) -> tokio::task::JoinHandle<()>,
{
    if total == 0 {
        return Ok(());
    }
    let n_workers = workers.max(1).min(total);

    let (work_tx, work_rx) = mpsc::channel::<usize>(n_workers);
    let work_rx = Arc::new(Mutex::new(work_rx));
    let (done_tx, mut done_rx) = mpsc::channel::<Result<(), Error>>(n_workers);
    let (quit_tx, quit_rx) = watch::channel(false);

    let mut handles = Vec::with_capacity(n_workers);
    for _ in 0..n_workers {
        handles.push(spawn(work_rx.clone(), done_tx.clone(), quit_rx.clone()));
    }
    drop(done_tx);
    drop(quit_rx);

    let mut status: Result<(), Error> = Ok(());
    let mut dispatched = 0usize;
    while dispatched < n_workers.min(total) {
        if work_tx.send(dispatched).await.is_err() {
            break;
        }
        dispatched += 1;
    }

    let mut completed = 0usize;
    while completed < total {
        match done_rx.recv().await {
            Some(Ok(())) => {
                completed += 1;
                if dispatched < total {
                    if work_tx.send(dispatched).await.is_err() {
                        status = Err(Error::Network("worker pool stopped early".into()));
                        break;
                    }
                    dispatched += 1;
                }
            }
            Some(Err(e)) => {
                let _ = quit_tx.send(true);
                status = Err(e);
                break;
            }
            None => {
                status = Err(Error::Network("worker pool stopped early".into()));
                break;
            }
        }
    }

    drop(work_tx);
    for handle in handles {
        let _ = handle.await;
    }
    status
}

/// One worker: pull a chunk index, process it, report the result. Exits
/// when the quit signal fires or the job channel closes.
async fn worker_loop<F, Fut>(work: WorkRx, done: DoneTx, mut quit: watch::Receiver<bool>, process: F)
where
    F: Fn(usize) -> Fut,
    Fut: std::future::Future<Output = Result<(), Error>>,
{
    loop {
        let id = {
            let mut rx = work.lock().await;
            tokio::select! {
                _ = quit.changed() => return,
                id = rx.recv() => match id {
                    Some(id) => id,
                    None => return,
                },
            }
        };
        let result = process(id).await;
        if done.send(result).await.is_err() {
            return;
        }
    }
}
