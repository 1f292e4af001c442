//! Typed builder for `-filter_complex` graphs.
//!
//! A graph is a list of chains. Each chain reads from input pads (`[0:v]`)
//! or labels produced by earlier chains, runs a sequence of typed filters and
//! writes one or more new labels. The builder refuses to reference a label
//! that does not exist yet, to consume a label twice, or to define it twice,
//! so a rendered graph always has consistent wiring.

use std::collections::HashSet;
use std::fmt;

use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum GraphError {
    #[error("label [{0}] is referenced before it is defined")]
    Undefined(String),
    #[error("label [{0}] is already consumed")]
    AlreadyConsumed(String),
    #[error("label [{0}] is defined twice")]
    Redefined(String),
    #[error("chain has no filters")]
    EmptyChain,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StreamKind {
    Video,
    Audio,
}

impl StreamKind {
    fn specifier(&self) -> char {
        match self {
            StreamKind::Video => 'v',
            StreamKind::Audio => 'a',
        }
    }
}

/// Where a chain reads from
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum StreamRef {
    /// Stream of the Nth `-i` input
    Input { index: usize, kind: StreamKind },
    /// Output of an earlier chain
    Label(String),
}

impl StreamRef {
    pub fn video(index: usize) -> Self {
        StreamRef::Input { index, kind: StreamKind::Video }
    }

    pub fn audio(index: usize) -> Self {
        StreamRef::Input { index, kind: StreamKind::Audio }
    }

    pub fn label(name: impl Into<String>) -> Self {
        StreamRef::Label(name.into())
    }
}

impl fmt::Display for StreamRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StreamRef::Input { index, kind } => write!(f, "[{}:{}]", index, kind.specifier()),
            StreamRef::Label(name) => write!(f, "[{}]", name),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FadeDirection {
    In,
    Out,
}

impl FadeDirection {
    fn as_str(&self) -> &'static str {
        match self {
            FadeDirection::In => "in",
            FadeDirection::Out => "out",
        }
    }
}

/// One filter with its options
#[derive(Debug, Clone, PartialEq)]
pub enum Filter {
    Null,
    ANull,
    Scale { width: u32, height: u32 },
    SetSar,
    Fps(f64),
    SetTb,
    PixelFormat(String),
    AFormat { sample_rate: u32, channel_layout: String },
    Fade { direction: FadeDirection, start: f64, duration: f64 },
    AFade { direction: FadeDirection, start: f64, duration: f64 },
    Volume(f64),
    ADelay { millis: u64 },
    AMix { inputs: usize },
    Concat { segments: usize, video: usize, audio: usize },
    XFade { duration: f64, offset: f64 },
    ACrossfade { duration: f64 },
    Overlay { x: i32, y: i32, enable_until: Option<f64> },
    DrawText { text: String, font: String, size: u32, color: String, x: i32, y: i32 },
    /// Centre crop to the aspect ratio `width:height`
    CropToAspect { width: u32, height: u32 },
    Loudnorm { integrated_lufs: f64 },
    SelectScene { threshold: f64 },
    ShowInfo,
}

impl Filter {
    fn render(&self) -> String {
        match self {
            Filter::Null => "null".to_string(),
            Filter::ANull => "anull".to_string(),
            Filter::Scale { width, height } => format!("scale={}:{}", width, height),
            Filter::SetSar => "setsar=1".to_string(),
            Filter::Fps(rate) => format!("fps={}", trim_float(*rate, 6)),
            Filter::SetTb => "settb=AVTB".to_string(),
            Filter::PixelFormat(fmt) => format!("format={}", escape_value(fmt)),
            Filter::AFormat { sample_rate, channel_layout } => {
                format!("aformat=sample_rates={}:channel_layouts={}", sample_rate, escape_value(channel_layout))
            }
            Filter::Fade { direction, start, duration } => {
                format!("fade=t={}:st={:.3}:d={:.3}", direction.as_str(), start, duration)
            }
            Filter::AFade { direction, start, duration } => {
                format!("afade=t={}:st={:.3}:d={:.3}", direction.as_str(), start, duration)
            }
            // Fixed notation would round very quiet gains down to a mute
            Filter::Volume(gain) if *gain != 0.0 && gain.abs() < 1e-3 => format!("volume={:.6e}", gain),
            Filter::Volume(gain) => format!("volume={:.6}", gain),
            Filter::ADelay { millis } => format!("adelay={}|{}", millis, millis),
            Filter::AMix { inputs } => format!("amix=inputs={}:duration=longest:normalize=0", inputs),
            Filter::Concat { segments, video, audio } => format!("concat=n={}:v={}:a={}", segments, video, audio),
            Filter::XFade { duration, offset } => {
                format!("xfade=transition=fade:duration={:.3}:offset={:.3}", duration, offset)
            }
            Filter::ACrossfade { duration } => format!("acrossfade=d={:.3}", duration),
            Filter::Overlay { x, y, enable_until } => match enable_until {
                Some(until) => format!(
                    "overlay=x={}:y={}:enable={}",
                    x,
                    y,
                    escape_graph(&format!("between(t,0,{:.3})", until))
                ),
                None => format!("overlay=x={}:y={}", x, y),
            },
            Filter::DrawText { text, font, size, color, x, y } => format!(
                "drawtext=fontfile={}:text={}:x={}:y={}:fontsize={}:fontcolor={}:expansion=none",
                escape_value(font),
                escape_value(text),
                x,
                y,
                size,
                escape_value(color)
            ),
            Filter::CropToAspect { width, height } => format!(
                "crop=w={}:h={}",
                escape_graph(&format!("min(iw,ih*{}/{})", width, height)),
                escape_graph(&format!("min(ih,iw*{}/{})", height, width))
            ),
            Filter::Loudnorm { integrated_lufs } => format!("loudnorm=I={:.1}", integrated_lufs),
            Filter::SelectScene { threshold } => {
                format!("select={}", escape_graph(&format!("gt(scene,{})", trim_float(*threshold, 4))))
            }
            Filter::ShowInfo => "showinfo".to_string(),
        }
    }
}

/// Fixed-precision float with trailing zeros removed
pub(crate) fn trim_float(value: f64, precision: usize) -> String {
    let s = format!("{:.*}", precision, value);
    if s.contains('.') {
        s.trim_end_matches('0').trim_end_matches('.').to_string()
    } else {
        s
    }
}

/// First escaping level: the filter's own option parser
pub fn escape_option(value: &str) -> String {
    let mut out = String::with_capacity(value.len());
    for c in value.chars() {
        if matches!(c, '\\' | '\'' | ':') {
            out.push('\\');
        }
        out.push(c);
    }
    out
}

/// Second escaping level: the graph description parser
pub fn escape_graph(value: &str) -> String {
    let mut out = String::with_capacity(value.len());
    for c in value.chars() {
        if matches!(c, '\\' | '\'' | '[' | ']' | ',' | ';') {
            out.push('\\');
        }
        out.push(c);
    }
    out
}

/// Arbitrary text as a filter option value inside a graph
pub fn escape_value(value: &str) -> String {
    escape_graph(&escape_option(value))
}

#[derive(Debug, Clone)]
struct Chain {
    inputs: Vec<StreamRef>,
    filters: Vec<Filter>,
    outputs: Vec<String>,
}

impl fmt::Display for Chain {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for input in &self.inputs {
            write!(f, "{}", input)?;
        }
        let filters: Vec<String> = self.filters.iter().map(Filter::render).collect();
        write!(f, "{}", filters.join(","))?;
        for output in &self.outputs {
            write!(f, "[{}]", output)?;
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Default)]
pub struct FilterGraph {
    chains: Vec<Chain>,
    defined: HashSet<String>,
    consumed: HashSet<String>,
    next_label: usize,
}

impl FilterGraph {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fresh label name, unique within this graph
    pub fn label(&mut self, prefix: &str) -> String {
        loop {
            let candidate = format!("{}{}", prefix, self.next_label);
            self.next_label += 1;
            if !self.defined.contains(&candidate) {
                return candidate;
            }
        }
    }

    /// Append a chain reading `inputs` and writing `outputs`
    pub fn chain(
        &mut self,
        inputs: Vec<StreamRef>,
        filters: Vec<Filter>,
        outputs: Vec<String>,
    ) -> Result<(), GraphError> {
        if filters.is_empty() {
            return Err(GraphError::EmptyChain);
        }
        let mut claimed = HashSet::new();
        for input in &inputs {
            if let StreamRef::Label(name) = input {
                self.check_consumable(name)?;
                if !claimed.insert(name.clone()) {
                    return Err(GraphError::AlreadyConsumed(name.clone()));
                }
            }
        }
        let mut fresh = HashSet::new();
        for output in &outputs {
            if self.defined.contains(output) || !fresh.insert(output.clone()) {
                return Err(GraphError::Redefined(output.clone()));
            }
        }
        self.consumed.extend(claimed);
        self.defined.extend(fresh);
        self.chains.push(Chain { inputs, filters, outputs });
        Ok(())
    }

    /// Single-output chain into a freshly allocated label, which is returned
    pub fn chain_to(
        &mut self,
        inputs: Vec<StreamRef>,
        filters: Vec<Filter>,
        prefix: &str,
    ) -> Result<String, GraphError> {
        let out = self.label(prefix);
        self.chain(inputs, filters, vec![out.clone()])?;
        Ok(out)
    }

    /// `-map` argument for a label, consuming it
    pub fn map(&mut self, label: &str) -> Result<String, GraphError> {
        self.check_consumable(label)?;
        self.consumed.insert(label.to_string());
        Ok(format!("[{}]", label))
    }

    fn check_consumable(&self, name: &str) -> Result<(), GraphError> {
        if !self.defined.contains(name) {
            return Err(GraphError::Undefined(name.to_string()));
        }
        if self.consumed.contains(name) {
            return Err(GraphError::AlreadyConsumed(name.to_string()));
        }
        Ok(())
    }

    pub fn is_empty(&self) -> bool {
        self.chains.is_empty()
    }

    /// Labels defined but never consumed by a chain or a `-map`
    pub fn dangling(&self) -> Vec<String> {
        let mut names: Vec<String> = self.defined.difference(&self.consumed).cloned().collect();
        names.sort();
        names
    }

    /// The graph description passed to `-filter_complex`
    pub fn render(&self) -> String {
        self.chains.iter().map(|c| c.to_string()).collect::<Vec<_>>().join(";")
    }
}
