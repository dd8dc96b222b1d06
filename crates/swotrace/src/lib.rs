//! Wires the TPIU deframer and the ITM/DWT packet parser into a single
//! byte-in, frame-out pipeline, the way a capture tool composes its
//! decode stages.

use frame::{AnnotatedFrame, ByteEvent, FrameTag};
use itm::{DecodeStyle, PacketParser};
use log::info;
use tpiu::{TpiuConfigError, TpiuDecodeStyle, TpiuDeframer};

/// A single decode stage: feed it one byte, get back whatever complete
/// frames that byte produced.
pub trait Stage {
    fn push(&mut self, ev: ByteEvent) -> Vec<AnnotatedFrame>;
}

impl Stage for TpiuDeframer {
    fn push(&mut self, ev: ByteEvent) -> Vec<AnnotatedFrame> {
        TpiuDeframer::push(self, ev)
    }
}

impl Stage for PacketParser {
    fn push(&mut self, ev: ByteEvent) -> Vec<AnnotatedFrame> {
        PacketParser::push(self, ev)
    }
}

/// End-to-end pipeline configuration, mirroring the flags a capture tool
/// would expose on its command line.
#[derive(Debug, Clone, Copy)]
pub struct Config {
    /// What the ITM/DWT parser surfaces, and how.
    pub decode_style: DecodeStyle,
    /// Stimulus port address used by `Port`/`Console`/`Instrumentation`
    /// decode styles.
    pub port: u8,
    /// Whether the byte stream is TPIU-framed. When `false`, bytes are
    /// handed to the ITM/DWT parser directly.
    pub tpiu_enabled: bool,
    /// TPIU stream ID carrying the ITM/DWT traffic.
    pub tpiu_stream: u8,
    /// TPIU startup skew, in bytes.
    pub tpiu_offset: u8,
}

impl Config {
    pub fn new(decode_style: DecodeStyle, port: u8) -> Self {
        Config {
            decode_style,
            port,
            tpiu_enabled: false,
            tpiu_stream: 0,
            tpiu_offset: 0,
        }
    }

    pub fn with_tpiu(mut self, stream: u8, offset: u8) -> Self {
        self.tpiu_enabled = true;
        self.tpiu_stream = stream;
        self.tpiu_offset = offset;
        self
    }
}

/// The composed pipeline: an optional TPIU deframer feeding an ITM/DWT
/// packet parser.
pub struct Pipeline {
    tpiu: Option<TpiuDeframer>,
    itm: PacketParser,
}

impl Pipeline {
    pub fn new(config: Config) -> Result<Self, TpiuConfigError> {
        let tpiu = if config.tpiu_enabled {
            info!(
                "TPIU deframing enabled: stream {} offset {}",
                config.tpiu_stream, config.tpiu_offset
            );
            Some(TpiuDeframer::new(
                TpiuDecodeStyle::SaleaePassthrough,
                config.tpiu_stream,
                config.tpiu_offset,
            )?)
        } else {
            info!("TPIU deframing bypassed; feeding bytes directly to the ITM/DWT parser");
            None
        };
        Ok(Pipeline {
            tpiu,
            itm: PacketParser::new(config.decode_style, config.port),
        })
    }

    /// Feed one captured byte through the pipeline.
    pub fn push(&mut self, ev: ByteEvent) -> Vec<AnnotatedFrame> {
        let Some(deframer) = self.tpiu.as_mut() else {
            return self.itm.push(ev);
        };

        let mut out = Vec::new();
        for staged in deframer.push(ev) {
            match staged.tag {
                FrameTag::Data => {
                    if let Ok(byte) = u8::from_str_radix(&staged.text, 16) {
                        let unwrapped = ByteEvent::new(staged.start_time, staged.end_time, byte);
                        out.extend(self.itm.push(unwrapped));
                    }
                }
                _ => out.push(staged),
            }
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ev(t: u64, b: u8) -> ByteEvent {
        ByteEvent::new(t, t + 1, b)
    }

    #[test]
    fn bypasses_tpiu_when_disabled() {
        let mut p = Pipeline::new(Config::new(DecodeStyle::All, 0)).unwrap();
        let out = p.push(ev(0, 0x19));
        assert!(out.is_empty());
        let out = p.push(ev(1, 0xAA));
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].text, "Port#3 Size#1 Data#AA");
    }

    #[test]
    fn decodes_itm_stacked_on_tpiu_stream() {
        let config = Config::new(DecodeStyle::All, 0).with_tpiu(1, 0);
        let mut p = Pipeline::new(config).unwrap();
        // stream-1 marker, then the ITM header and its data byte on odd
        // positions, padded to a full 16-byte TPIU frame with no delayed markers.
        let frame = [
            0x03, 0x19, 0x03, 0xAA, 0x03, 0x00, 0x03, 0x00, 0x03, 0x00, 0x03, 0x00, 0x03, 0x00,
            0x00, 0x00,
        ];
        let mut out = Vec::new();
        for (i, b) in frame.iter().enumerate() {
            out.extend(p.push(ev(i as u64, *b)));
        }
        assert!(out.iter().any(|f| f.tag == FrameTag::Itm && f.text == "Port#3 Size#1 Data#AA"));
    }
}
