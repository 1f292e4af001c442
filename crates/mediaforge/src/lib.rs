pub mod config;
pub mod diagnostics;
pub mod error;
pub mod process;
pub mod media;
pub mod filtergraph;
pub mod engine;
pub mod probe;
pub mod clip;
pub mod compose;
pub mod mixer;
pub mod render;
pub mod pipeline;

#[cfg(test)]
mod testkit;

pub use config::ForgeConfig;
pub use diagnostics::{DiagnosticsSink, Event, Level, LogSink, MemorySink, NullSink};
pub use engine::{Engine, FfmpegVersion, Toolchain};
pub use error::{MediaError, MediaResult, ProbeError, ProcessFailure};
pub use media::{
    AudioFormat, AudioTrack, MediaHandle, MediaInfo, OverlaySpec, Position, RenderInput, RenderSpec, RenderTarget,
    Resolution, TimeRange,
};
pub use pipeline::{Artifact, Manifest, Pipeline, PipelineError, PipelineReport, SourceClip, Stage};
pub use process::{cancel_pair, CancelHandle, CancelSignal, ProcessOutput, ProcessRunner, TokioRunner};
