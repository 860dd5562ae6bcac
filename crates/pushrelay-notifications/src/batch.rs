//! Groups queued single-device messages into provider-ready multi-device requests.
//!
//! Messages are keyed by [`BatchingKey`]. Each key owns a list of chunks; a token goes into the
//! last chunk for its key unless that chunk already holds `max_recipients` tokens, in which case a
//! new chunk is started. A token already present in any chunk of its key is dropped.
//! Output is ordered by first occurrence of each key, then chunk order.

use indexmap::IndexMap;

use crate::types::{BatchingKey, MultiDeviceMessage, SingleDeviceMessage};

/// Max recipients per multicast request according to the FCM docs. Also applied to APNs, which
/// has no documented limit but misbehaves with very large fan-outs.
pub const MAX_MULTICAST_RECIPIENTS: usize = 500;

pub fn batch_messages(
    messages: &[SingleDeviceMessage],
    max_recipients: usize,
) -> Vec<MultiDeviceMessage> {
    let limit = max_recipients.max(1);
    let mut chunks: IndexMap<BatchingKey, Vec<MultiDeviceMessage>> = IndexMap::new();

    for message in messages {
        let per_key = chunks.entry(message.batching_key()).or_default();
        if per_key
            .iter()
            .any(|chunk| chunk.device_tokens.contains(&message.device_token))
        {
            continue;
        }
        match per_key.last_mut() {
            Some(open) if open.len() < limit => {
                open.device_tokens.insert(message.device_token.clone());
            }
            _ => per_key.push(MultiDeviceMessage::seeded_from(message)),
        }
    }

    chunks.into_values().flatten().collect()
}
