//! Request bodies that report upload progress as chunks are handed to the wire

use crate::transfer::progress::AttemptProgress;
use futures::StreamExt;
use reqwest::Body;
use tokio::fs::File;
use tokio_util::io::ReaderStream;

const CHUNK_SIZE: usize = 64 * 1024;

/// Stream `file` from its current position, crediting every chunk the HTTP
/// client pulls to `ledger`
pub fn counting_body(file: File, ledger: AttemptProgress) -> Body {
    let stream = ReaderStream::with_capacity(file, CHUNK_SIZE).inspect(move |chunk| {
        if let Ok(bytes) = chunk {
            ledger.add(bytes.len() as u64);
        }
    });
    Body::wrap_stream(stream)
}
