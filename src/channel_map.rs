//! Owner of every [`AudioChannel`], keyed by the producer's opaque stream
//! identifier. Guarded by the outermost lock in the ordering discipline
//! from SPEC_FULL.md §5: `channel_map_mutex` before any individual
//! `channel.audio_buf_mutex`.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use log::info;

use crate::audio_channel::AudioChannel;
use crate::resampler::AudioDesc;

/// Strict tree ownership: the map owns every channel exclusively; channels
/// never reference each other or the map back.
#[derive(Default)]
pub struct ChannelMap {
    channels: Mutex<HashMap<u64, Arc<Mutex<AudioChannel>>>>,
}

impl ChannelMap {
    pub fn new() -> Self {
        Self { channels: Mutex::new(HashMap::new()) }
    }

    /// Returns the channel for `stream_id`, creating it against `out_desc`
    /// on first sight. `in_desc` seeds the new channel's resampler; an
    /// existing channel renegotiates its own resampler lazily on ingest
    /// when the producer's format changes.
    pub fn get_or_create(
        &self,
        stream_id: u64,
        in_desc: AudioDesc,
        out_desc: AudioDesc,
        output_frames: usize,
    ) -> anyhow::Result<Arc<Mutex<AudioChannel>>> {
        let mut channels = self.channels.lock().map_err(|_| anyhow::anyhow!("channel map mutex poisoned"))?;
        if let Some(existing) = channels.get(&stream_id) {
            return Ok(existing.clone());
        }
        info!("new audio stream observed: {stream_id:#x}");
        let channel = Arc::new(Mutex::new(AudioChannel::new(in_desc, out_desc, output_frames)?));
        channels.insert(stream_id, channel.clone());
        Ok(channel)
    }

    /// Snapshot of all channels for one mix tick. Taken under the map
    /// mutex and released immediately, per the locking discipline: a
    /// channel appended by the capture reader mid-tick becomes visible
    /// only on the next tick's snapshot.
    pub fn snapshot(&self) -> Vec<(u64, Arc<Mutex<AudioChannel>>)> {
        match self.channels.lock() {
            Ok(channels) => channels.iter().map(|(id, ch)| (*id, ch.clone())).collect(),
            Err(_) => Vec::new(),
        }
    }

    pub fn len(&self) -> usize {
        self.channels.lock().map(|c| c.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Drops a channel entirely, e.g. after the mix engine clears it and
    /// the producer has also signalled the stream is gone. Not currently
    /// invoked by the mix tick itself (a cleared channel simply sits idle
    /// at `audio_ts == 0` until it either receives more data or the
    /// capture service stops), but kept as the map's teardown primitive.
    pub fn remove(&self, stream_id: u64) {
        if let Ok(mut channels) = self.channels.lock() {
            channels.remove(&stream_id);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::resampler::SampleFormat;

    #[test]
    fn get_or_create_reuses_existing_channel() {
        let map = ChannelMap::new();
        let desc = AudioDesc::new(48_000, SampleFormat::F32, 2);
        let a = map.get_or_create(1, desc, desc, 480).unwrap();
        let b = map.get_or_create(1, desc, desc, 480).unwrap();
        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(map.len(), 1);
    }

    #[test]
    fn snapshot_does_not_hold_the_map_lock() {
        let map = ChannelMap::new();
        let desc = AudioDesc::new(48_000, SampleFormat::F32, 2);
        map.get_or_create(1, desc, desc, 480).unwrap();
        let snap = map.snapshot();
        // Still able to create another channel after taking a snapshot.
        map.get_or_create(2, desc, desc, 480).unwrap();
        assert_eq!(snap.len(), 1);
        assert_eq!(map.len(), 2);
    }
}
