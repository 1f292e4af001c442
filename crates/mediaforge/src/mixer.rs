use std::path::Path;

use crate::diagnostics::Level;
use crate::engine::{check_output, Engine};
use crate::error::{MediaError, MediaResult};
use crate::filtergraph::{Filter, FilterGraph, StreamRef};
use crate::media::{AudioTrack, MediaHandle};
use crate::process::ProcessRunner;

/// Per-track filters: gain, then the start delay
fn track_filters(track: &AudioTrack) -> Vec<Filter> {
    let mut filters = Vec::with_capacity(2);
    if track.volume_db != 0.0 {
        filters.push(Filter::Volume(track.gain()));
    }
    if track.start_offset_seconds > 0.0 {
        let millis = (track.start_offset_seconds * 1000.0).round() as u64;
        filters.push(Filter::ADelay { millis });
    }
    if filters.is_empty() {
        filters.push(Filter::ANull);
    }
    filters
}

/// Graph summing every track into `[aout]`
pub fn mix_graph(tracks: &[AudioTrack]) -> MediaResult<FilterGraph> {
    if tracks.is_empty() {
        return Err(MediaError::EmptyTrackList);
    }
    let mut graph = FilterGraph::new();
    if tracks.len() == 1 {
        graph.chain(vec![StreamRef::audio(0)], track_filters(&tracks[0]), vec!["aout".to_string()])?;
        return Ok(graph);
    }

    let mut mixed = Vec::with_capacity(tracks.len());
    for (i, track) in tracks.iter().enumerate() {
        let label = graph.chain_to(vec![StreamRef::audio(i)], track_filters(track), "a")?;
        mixed.push(StreamRef::label(label));
    }
    graph.chain(mixed, vec![Filter::AMix { inputs: tracks.len() }], vec!["aout".to_string()])?;
    Ok(graph)
}

impl<R: ProcessRunner> Engine<R> {
    /// Attenuate, shift and sum `tracks` into one audio file as long as the
    /// longest shifted track.
    pub async fn mix(&self, tracks: &[AudioTrack], output: &Path) -> MediaResult<MediaHandle> {
        if tracks.is_empty() {
            return Err(MediaError::EmptyTrackList);
        }
        for track in tracks {
            track.handle.ensure_exists()?;
            if !track.volume_db.is_finite() {
                return Err(MediaError::InvalidParameter(format!("volume of {} dB", track.volume_db)));
            }
            if !track.start_offset_seconds.is_finite() || track.start_offset_seconds < 0.0 {
                return Err(MediaError::InvalidParameter(format!(
                    "start offset of {}s for {}",
                    track.start_offset_seconds, track.handle
                )));
            }
        }
        check_output(output, tracks.iter().map(|t| &t.handle))?;

        for track in tracks {
            let info = self.inspect(&track.handle).await?;
            if !info.has_audio() {
                return Err(MediaError::NoAudioStream(track.handle.path().to_path_buf()));
            }
        }

        let mut graph = mix_graph(tracks)?;
        let mut args = Vec::with_capacity(tracks.len() * 2 + 5);
        for track in tracks {
            args.push("-i".to_string());
            args.push(track.handle.arg());
        }
        args.push("-filter_complex".to_string());
        args.push(graph.render());
        args.push("-map".to_string());
        args.push(graph.map("aout")?);
        args.push(output.to_string_lossy().to_string());

        self.emit(Level::Info, "mix", format!("mixing {} track(s)", tracks.len()));
        self.transcode("mix", args, output).await
    }
}
