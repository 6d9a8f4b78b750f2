//! PTY output pump
//!
//! PTY reads land on arbitrary byte boundaries, but `data` frames carry
//! text. [`Utf8Chunker`] holds back a trailing partial code point until the
//! next read completes it.

use std::io::Read;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use tr_protocol::SessionId;

const READ_BUFFER_SIZE: usize = 4096;

/// Output from a PTY reader task to the event loop
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PtyOutput {
    /// Shell output, decoded
    Data { session_id: SessionId, data: String },
    /// Reader hit EOF or an error; the shell is gone
    Exited { session_id: SessionId },
}

/// Incremental UTF-8 decoder
#[derive(Debug, Default)]
pub struct Utf8Chunker {
    pending: Vec<u8>,
}

impl Utf8Chunker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Decode as much as possible.
    ///
    /// Invalid sequences become U+FFFD. An incomplete sequence at the end is
    /// kept for the next call.
    pub fn push(&mut self, bytes: &[u8]) -> String {
        self.pending.extend_from_slice(bytes);

        let mut out = String::with_capacity(self.pending.len());
        let mut rest: &[u8] = &self.pending;

        loop {
            match std::str::from_utf8(rest) {
                Ok(valid) => {
                    out.push_str(valid);
                    rest = &[];
                    break;
                }
                Err(e) => {
                    let (valid, after) = rest.split_at(e.valid_up_to());
                    // valid_up_to guarantees this prefix decodes
                    out.push_str(&String::from_utf8_lossy(valid));
                    match e.error_len() {
                        Some(bad) => {
                            out.push(char::REPLACEMENT_CHARACTER);
                            rest = &after[bad..];
                        }
                        None => {
                            rest = after;
                            break;
                        }
                    }
                }
            }
        }

        let remainder = rest.to_vec();
        self.pending = remainder;
        out
    }

    /// Flush whatever is left, lossily
    pub fn finish(&mut self) -> String {
        let tail = String::from_utf8_lossy(&self.pending).into_owned();
        self.pending.clear();
        tail
    }
}

/// Drain a PTY reader on a blocking thread.
///
/// Sends [`PtyOutput::Data`] per read and a final [`PtyOutput::Exited`]
/// when the PTY closes. The token is checked between reads.
pub fn spawn_pty_reader(
    session_id: SessionId,
    mut reader: Box<dyn Read + Send>,
    tx: mpsc::Sender<PtyOutput>,
    cancel_token: CancellationToken,
) -> JoinHandle<()> {
    tokio::task::spawn_blocking(move || {
        let mut buf = [0u8; READ_BUFFER_SIZE];
        let mut chunker = Utf8Chunker::new();

        loop {
            if cancel_token.is_cancelled() {
                tracing::debug!("PTY reader cancelled for session {}", session_id);
                return;
            }

            match reader.read(&mut buf) {
                Ok(0) => {
                    tracing::debug!("PTY reader EOF for session {}", session_id);
                    break;
                }
                Ok(n) => {
                    let data = chunker.push(&buf[..n]);
                    if data.is_empty() {
                        continue;
                    }
                    let output = PtyOutput::Data {
                        session_id: session_id.clone(),
                        data,
                    };
                    if tx.blocking_send(output).is_err() {
                        tracing::debug!("PTY output channel closed for session {}", session_id);
                        return;
                    }
                }
                Err(e) => {
                    // Linux reports EIO once the slave side is gone
                    if cancel_token.is_cancelled() {
                        tracing::debug!("PTY reader stopped for session {} (cancelled)", session_id);
                        return;
                    } else if matches!(
                        e.kind(),
                        std::io::ErrorKind::Other | std::io::ErrorKind::BrokenPipe
                    ) {
                        tracing::debug!("PTY reader closed for session {}: {}", session_id, e);
                    } else {
                        tracing::error!("PTY read error for session {}: {}", session_id, e);
                    }
                    break;
                }
            }
        }

        let tail = chunker.finish();
        if !tail.is_empty() {
            let _ = tx.blocking_send(PtyOutput::Data {
                session_id: session_id.clone(),
                data: tail,
            });
        }
        let _ = tx.blocking_send(PtyOutput::Exited { session_id });
    })
}
