/// Shared output/input types threaded through the trace decoding pipeline:
/// a captured byte from the logic analyzer in, an annotated result frame
/// out. Kept as its own leaf crate so `tpiu`, `itm` and `appframe` can all
/// produce `AnnotatedFrame`s without depending on one another.
use std::fmt;

/// A single captured byte, timestamped at the analyzer's own granularity.
///
/// `start_time`/`end_time` are opaque ticks: the decoders never do
/// arithmetic on them beyond carrying the earliest start and latest end
/// time of whatever they accumulate.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ByteEvent {
    pub start_time: u64,
    pub end_time: u64,
    pub data: u8,
    /// Set when the upstream source (e.g. a UART framing error) already
    /// knows this byte is suspect.
    pub error: bool,
}

impl ByteEvent {
    pub fn new(start_time: u64, end_time: u64, data: u8) -> Self {
        ByteEvent {
            start_time,
            end_time,
            data,
            error: false,
        }
    }
}

/// Which stage produced an [`AnnotatedFrame`], mirroring the analyzer
/// result-type tags of the original extension (`tpiu`, `itm`, `dwt`,
/// `console`, `err`) plus `data` for TPIU passthrough bytes and `ext` for
/// ITM extension/stimulus-page directives.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FrameTag {
    Tpiu,
    Itm,
    Dwt,
    Ext,
    Console,
    Err,
    Data,
}

impl fmt::Display for FrameTag {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let s = match self {
            FrameTag::Tpiu => "TPIU",
            FrameTag::Itm => "ITM",
            FrameTag::Dwt => "DWT",
            FrameTag::Ext => "EXT",
            FrameTag::Console => "Console",
            FrameTag::Err => "Error",
            FrameTag::Data => "Data",
        };
        write!(f, "{}", s)
    }
}

/// One decoded/derived result, ready for display or further consumption.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AnnotatedFrame {
    pub tag: FrameTag,
    pub start_time: u64,
    pub end_time: u64,
    pub text: String,
}

impl AnnotatedFrame {
    pub fn new(tag: FrameTag, start_time: u64, end_time: u64, text: impl Into<String>) -> Self {
        AnnotatedFrame {
            tag,
            start_time,
            end_time,
            text: text.into(),
        }
    }
}

impl fmt::Display for AnnotatedFrame {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}: {}", self.tag, self.text)
    }
}
