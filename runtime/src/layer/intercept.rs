//! Pass-through layer reader that decodes a copy of the stream on the side.
//!
//! The sink uses this to log every entry of the original layers while their
//! compressed bytes are copied verbatim into the destination. The decoder
//! runs on its own thread, fed over a bounded channel. Decode failures only
//! end the side channel; the pass-through keeps going.

use std::io::{self, Read};
use std::sync::mpsc::{sync_channel, Receiver, SyncSender};
use std::thread::JoinHandle;

use super::blob::tar_stream;
use super::reader::{FileMetadata, LayerReader};

/// Chunks buffered between the reader and the decoder thread.
const CHANNEL_DEPTH: usize = 16;

/// Callback invoked by the decoder thread for each entry.
pub type EntryCallback = Box<dyn FnMut(&FileMetadata) + Send>;

/// Reader that forwards everything it reads to a decoder thread.
pub struct InterceptingReader<R: Read> {
    inner: R,
    sender: Option<SyncSender<Vec<u8>>>,
    decoder: Option<JoinHandle<()>>,
}

impl<R: Read> InterceptingReader<R> {
    /// Wrap a raw layer stream of the given media type.
    pub fn new(inner: R, media_type: &str, callback: EntryCallback) -> Self {
        let (sender, receiver) = sync_channel(CHANNEL_DEPTH);
        let media_type = media_type.to_string();
        let decoder = std::thread::spawn(move || decode_entries(receiver, &media_type, callback));

        Self {
            inner,
            sender: Some(sender),
            decoder: Some(decoder),
        }
    }

    /// Close the side channel and wait for the decoder to finish.
    pub fn finish(mut self) {
        self.close();
    }

    fn close(&mut self) {
        self.sender = None;
        if let Some(decoder) = self.decoder.take() {
            if decoder.join().is_err() {
                tracing::debug!("Layer interceptor thread panicked");
            }
        }
    }
}

impl<R: Read> Read for InterceptingReader<R> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let n = self.inner.read(buf)?;
        if n == 0 {
            self.sender = None;
        } else if let Some(sender) = &self.sender {
            // Decoder gave up; stop copying.
            if sender.send(buf[..n].to_vec()).is_err() {
                self.sender = None;
            }
        }
        Ok(n)
    }
}

impl<R: Read> Drop for InterceptingReader<R> {
    fn drop(&mut self) {
        self.close();
    }
}

/// Read side of the channel.
struct ChannelReader {
    receiver: Receiver<Vec<u8>>,
    chunk: Vec<u8>,
    offset: usize,
}

impl Read for ChannelReader {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        while self.offset >= self.chunk.len() {
            match self.receiver.recv() {
                Ok(chunk) => {
                    self.chunk = chunk;
                    self.offset = 0;
                }
                // Sender dropped
                Err(_) => return Ok(0),
            }
        }
        let n = buf.len().min(self.chunk.len() - self.offset);
        buf[..n].copy_from_slice(&self.chunk[self.offset..self.offset + n]);
        self.offset += n;
        Ok(n)
    }
}

fn decode_entries(receiver: Receiver<Vec<u8>>, media_type: &str, mut callback: EntryCallback) {
    let channel = ChannelReader {
        receiver,
        chunk: Vec::new(),
        offset: 0,
    };

    let stream = match tar_stream(channel, media_type) {
        Ok(stream) => stream,
        Err(e) => {
            tracing::debug!(error = %e, "Layer interceptor stopped");
            return;
        }
    };

    let mut reader = LayerReader::new(stream);
    let entries = match reader.entries() {
        Ok(entries) => entries,
        Err(e) => {
            tracing::debug!(error = %e, "Layer interceptor stopped");
            return;
        }
    };

    for entry in entries {
        match entry {
            Ok(entry) => callback(&entry.metadata),
            Err(e) => {
                tracing::debug!(error = %e, "Layer interceptor stopped");
                return;
            }
        }
    }
}
