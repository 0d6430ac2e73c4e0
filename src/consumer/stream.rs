//! Stream fan-out: from fetched blocks to user-visible message batches
//!
//! Each `(topic, threadId)` owns one [`StreamSlot`]: a bounded block queue
//! fed by the fetch layer and a worker task that decodes blocks into
//! [`Message`] batches on the stream's output channel. The worker blocks on
//! the user's consumption, which backs up through the bounded block queue to
//! the fetchers; the queue bound is the only backpressure mechanism.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use thiserror::Error;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

/// A decoded message as delivered to the user
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    pub topic: String,
    pub partition: i32,
    pub offset: i64,
    pub key: Option<Bytes>,
    pub value: Bytes,
}

/// A fetched chunk of one partition's log, pushed by the fetch layer into
/// the owning stream's block queue
#[derive(Debug, Clone)]
pub struct FetchedBlock {
    pub topic: String,
    pub partition: i32,
    /// Length-prefixed record framing; see [`encode_block`]
    pub payload: Bytes,
}

/// Sender side of a stream's bounded block queue
pub type BlockQueue = mpsc::Sender<FetchedBlock>;

/// One record before framing
#[derive(Debug, Clone)]
pub struct BlockRecord {
    pub offset: i64,
    pub key: Option<Bytes>,
    pub value: Bytes,
}

#[derive(Debug, Error)]
#[error("malformed block: {0}")]
pub struct BlockDecodeError(String);

/// Frame records into a block payload.
///
/// Each record is `offset: i64 | key_len: i32 | key | value_len: i32 |
/// value`, big-endian, with `key_len == -1` marking a missing key.
pub fn encode_block(records: &[BlockRecord]) -> Bytes {
    let mut buf = BytesMut::new();
    for record in records {
        buf.put_i64(record.offset);
        match &record.key {
            Some(key) => {
                buf.put_i32(key.len() as i32);
                buf.put_slice(key);
            }
            None => buf.put_i32(-1),
        }
        buf.put_i32(record.value.len() as i32);
        buf.put_slice(&record.value);
    }
    buf.freeze()
}

/// Parse a block payload into messages for the given partition
pub fn decode_block(
    topic: &str,
    partition: i32,
    payload: &Bytes,
) -> std::result::Result<Vec<Message>, BlockDecodeError> {
    let mut buf = payload.clone();
    let mut messages = Vec::new();

    while buf.has_remaining() {
        if buf.remaining() < 12 {
            return Err(BlockDecodeError(format!(
                "truncated record header, {} bytes left",
                buf.remaining()
            )));
        }
        let offset = buf.get_i64();
        let key_len = buf.get_i32();
        let key = match key_len {
            -1 => None,
            len if len < 0 => {
                return Err(BlockDecodeError(format!("negative key length {}", len)));
            }
            len => {
                let len = len as usize;
                if buf.remaining() < len {
                    return Err(BlockDecodeError("truncated key".to_string()));
                }
                Some(buf.copy_to_bytes(len))
            }
        };
        if buf.remaining() < 4 {
            return Err(BlockDecodeError("missing value length".to_string()));
        }
        let value_len = buf.get_i32();
        if value_len < 0 {
            return Err(BlockDecodeError(format!(
                "negative value length {}",
                value_len
            )));
        }
        let value_len = value_len as usize;
        if buf.remaining() < value_len {
            return Err(BlockDecodeError("truncated value".to_string()));
        }
        let value = buf.copy_to_bytes(value_len);

        messages.push(Message {
            topic: topic.to_string(),
            partition,
            offset,
            key,
            value,
        });
    }

    Ok(messages)
}

/// User-visible stream of decoded message batches for one `(topic, threadId)`
pub struct MessageStream {
    messages: mpsc::Receiver<Vec<Message>>,
}

impl MessageStream {
    /// Next batch, or `None` once the consumer has shut the stream down
    pub async fn recv(&mut self) -> Option<Vec<Message>> {
        self.messages.recv().await
    }
}

/// Coordinator-side handle to one stream: the block queue the fetch layer
/// feeds and the close signal that ends the worker
pub(crate) struct StreamSlot {
    pub(crate) blocks: BlockQueue,
    close_tx: watch::Sender<bool>,
    worker: JoinHandle<()>,
}

impl StreamSlot {
    /// Signal the worker to exit. Idempotent.
    pub(crate) fn close(&self) {
        let _ = self.close_tx.send(true);
    }

    #[cfg(test)]
    pub(crate) fn worker_handle(&mut self) -> &mut JoinHandle<()> {
        &mut self.worker
    }
}

impl Drop for StreamSlot {
    fn drop(&mut self) {
        self.close();
        self.worker.abort();
    }
}

/// Create a stream and spawn its worker. `queued_max_messages` bounds the
/// block queue.
pub(crate) fn spawn_stream(queued_max_messages: usize) -> (StreamSlot, MessageStream) {
    let (block_tx, block_rx) = mpsc::channel(queued_max_messages);
    let (out_tx, out_rx) = mpsc::channel(1);
    let (close_tx, close_rx) = watch::channel(false);

    let worker = tokio::spawn(process_incoming_blocks(block_rx, out_tx, close_rx));

    (
        StreamSlot {
            blocks: block_tx,
            close_tx,
            worker,
        },
        MessageStream { messages: out_rx },
    )
}

async fn process_incoming_blocks(
    mut blocks: mpsc::Receiver<FetchedBlock>,
    out: mpsc::Sender<Vec<Message>>,
    mut close: watch::Receiver<bool>,
) {
    debug!("stream worker started");
    loop {
        let block = tokio::select! {
            changed = close.changed() => {
                if changed.is_err() || *close.borrow() {
                    break;
                }
                continue;
            }
            block = blocks.recv() => match block {
                Some(block) => block,
                None => break,
            },
        };

        let batch = match decode_block(&block.topic, block.partition, &block.payload) {
            Ok(batch) => batch,
            Err(e) => {
                // A bad block must not stall the stream
                warn!(
                    topic = %block.topic,
                    partition = block.partition,
                    error = %e,
                    "skipping undecodable block"
                );
                continue;
            }
        };
        if batch.is_empty() {
            continue;
        }

        tokio::select! {
            changed = close.changed() => {
                if changed.is_err() || *close.borrow() {
                    break;
                }
            }
            sent = out.send(batch) => {
                if sent.is_err() {
                    // User dropped the stream
                    break;
                }
            }
        }
    }
    debug!("stream worker stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn record(offset: i64, value: &str) -> BlockRecord {
        BlockRecord {
            offset,
            key: None,
            value: Bytes::from(value.to_string()),
        }
    }

    fn block(topic: &str, partition: i32, records: &[BlockRecord]) -> FetchedBlock {
        FetchedBlock {
            topic: topic.to_string(),
            partition,
            payload: encode_block(records),
        }
    }

    #[test]
    fn test_decode_keyed_and_keyless() {
        let records = vec![
            BlockRecord {
                offset: 7,
                key: Some(Bytes::from_static(b"k")),
                value: Bytes::from_static(b"v1"),
            },
            record(8, "v2"),
        ];
        let messages = decode_block("events", 2, &encode_block(&records)).unwrap();

        assert_eq!(messages.len(), 2);
        assert_eq!(messages[0].offset, 7);
        assert_eq!(messages[0].key.as_deref(), Some(b"k".as_slice()));
        assert_eq!(messages[1].offset, 8);
        assert_eq!(messages[1].key, None);
        assert_eq!(messages[1].topic, "events");
        assert_eq!(messages[1].partition, 2);
    }

    #[test]
    fn test_decode_rejects_truncated_payload() {
        let payload = encode_block(&[record(0, "value")]);
        let truncated = payload.slice(0..payload.len() - 2);
        assert!(decode_block("events", 0, &truncated).is_err());
    }

    #[test]
    fn test_decode_rejects_negative_value_length() {
        let mut buf = BytesMut::new();
        buf.put_i64(0);
        buf.put_i32(-1);
        buf.put_i32(-7);
        assert!(decode_block("events", 0, &buf.freeze()).is_err());
    }

    #[tokio::test]
    async fn test_worker_delivers_batches() {
        let (slot, mut stream) = spawn_stream(4);

        slot.blocks
            .send(block("events", 0, &[record(0, "a"), record(1, "b")]))
            .await
            .unwrap();

        let batch = stream.recv().await.unwrap();
        assert_eq!(batch.len(), 2);
        assert_eq!(batch[0].value, Bytes::from_static(b"a"));
        assert_eq!(batch[1].offset, 1);
    }

    #[tokio::test]
    async fn test_worker_skips_bad_block() {
        let (slot, mut stream) = spawn_stream(4);

        slot.blocks
            .send(FetchedBlock {
                topic: "events".to_string(),
                partition: 0,
                payload: Bytes::from_static(b"\x00\x01garbage"),
            })
            .await
            .unwrap();
        slot.blocks
            .send(block("events", 0, &[record(5, "good")]))
            .await
            .unwrap();

        // The malformed block is skipped; the stream keeps flowing
        let batch = stream.recv().await.unwrap();
        assert_eq!(batch[0].offset, 5);
    }

    #[tokio::test]
    async fn test_empty_block_not_emitted() {
        let (slot, mut stream) = spawn_stream(4);

        slot.blocks.send(block("events", 0, &[])).await.unwrap();
        slot.blocks
            .send(block("events", 0, &[record(1, "x")]))
            .await
            .unwrap();

        let batch = stream.recv().await.unwrap();
        assert_eq!(batch[0].offset, 1);
    }

    #[tokio::test]
    async fn test_close_signal_ends_worker_and_stream() {
        let (mut slot, mut stream) = spawn_stream(4);

        slot.close();
        tokio::time::timeout(Duration::from_secs(1), slot.worker_handle())
            .await
            .expect("worker should exit after close")
            .unwrap();

        assert!(stream.recv().await.is_none());
    }
}
