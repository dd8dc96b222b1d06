//! TPIU (Trace Port Interface Unit) deframer
//!
//! Recovers multiple interleaved logical trace streams from the fixed-size
//! 16-byte frames a CoreSight TPIU wraps formatter output in (ARM DDI 0314H
//! §8.12), re-synchronising on an `0xFF..0x7F` marker run whenever one
//! appears. Byte-granular and push-based: every captured byte goes in via
//! [`TpiuDeframer::push`], zero or more annotated frames come out.

use frame::{AnnotatedFrame, ByteEvent, FrameTag};
use log::{debug, warn};

const FRAME_LEN: usize = 16;
const BITVEC_INDEX: usize = 15;

/// How reconstructed stream bytes are packaged for the caller.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TpiuDecodeStyle {
    /// One aggregate `tpiu` frame per logical-stream run within a TPIU frame.
    All,
    /// As `All`, but runs whose stream id does not match the configured filter are dropped.
    Stream,
    /// One `data` frame per reconstructed payload byte of the filtered stream, for
    /// a stacked ITM/DWT parser to consume as though TPIU framing were absent.
    SaleaePassthrough,
}

/// Errors constructing a [`TpiuDeframer`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum TpiuConfigError {
    #[error("startup offset {0} out of range 0..15")]
    OffsetOutOfRange(u8),
    #[error("stream filter {0} out of range 0..127")]
    StreamOutOfRange(u8),
}

/// Running counters, useful for diagnostics.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TpiuStats {
    pub frames_total: u64,
    pub sync_count: u64,
    pub bad_sync_count: u64,
    pub bytes_emitted: u64,
}

#[derive(Debug, Clone, Copy)]
struct Slot {
    data: u8,
    start: u64,
    end: u64,
}

#[derive(Debug, Clone, Copy)]
enum Phase {
    Framing,
    /// Scanning an `0xFF..0x7F` sync run; `ff_run` is the count of consecutive
    /// `0xFF` bytes seen so far (including the one that triggered entry).
    Syncing { ff_run: u32 },
}

/// Deframes a TPIU byte stream into per-stream payload bytes.
pub struct TpiuDeframer {
    buffer: [Option<Slot>; FRAME_LEN],
    buffer_index: usize,
    active_stream: u8,
    decode_style: TpiuDecodeStyle,
    stream_filter: u8,
    phase: Phase,
    stats: TpiuStats,
}

impl TpiuDeframer {
    /// `offset` prefills the buffer with `offset` empty slots, so a capture
    /// that begins mid-frame is decoded correctly starting at the next frame
    /// boundary instead of misaligning every frame thereafter.
    pub fn new(
        decode_style: TpiuDecodeStyle,
        stream_filter: u8,
        offset: u8,
    ) -> Result<Self, TpiuConfigError> {
        if offset as usize >= FRAME_LEN {
            return Err(TpiuConfigError::OffsetOutOfRange(offset));
        }
        if stream_filter > 127 {
            return Err(TpiuConfigError::StreamOutOfRange(stream_filter));
        }
        Ok(TpiuDeframer {
            buffer: [None; FRAME_LEN],
            buffer_index: offset as usize,
            active_stream: 0,
            decode_style,
            stream_filter,
            phase: Phase::Framing,
            stats: TpiuStats::default(),
        })
    }

    pub fn stats(&self) -> &TpiuStats {
        &self.stats
    }

    /// Feed one captured byte, receiving zero or more annotated frames back.
    pub fn push(&mut self, ev: ByteEvent) -> Vec<AnnotatedFrame> {
        if ev.error {
            return Vec::new();
        }
        match self.phase {
            Phase::Syncing { ff_run } => self.continue_sync(ff_run, ev.data, ev.start_time, ev.end_time),
            Phase::Framing => self.continue_framing(ev.data, ev.start_time, ev.end_time),
        }
    }

    fn continue_framing(&mut self, data: u8, start: u64, end: u64) -> Vec<AnnotatedFrame> {
        if self.buffer_index % 2 == 0 && data == 0xFF {
            debug!("sync scan entered at buffer position {}", self.buffer_index);
            self.phase = Phase::Syncing { ff_run: 1 };
            return Vec::new();
        }
        self.buffer[self.buffer_index] = Some(Slot { data, start, end });
        self.buffer_index += 1;
        if self.buffer_index < FRAME_LEN {
            return Vec::new();
        }
        self.buffer_index = 0;
        self.drain_frame()
    }

    fn continue_sync(&mut self, ff_run: u32, data: u8, start: u64, end: u64) -> Vec<AnnotatedFrame> {
        if data == 0xFF {
            self.phase = Phase::Syncing { ff_run: ff_run + 1 };
            return Vec::new();
        }
        if data == 0x7F && ff_run % 2 == 1 {
            self.stats.sync_count += 1;
            match ff_run {
                1 => debug!("short TPIU sync acquired"),
                3 => debug!("full TPIU sync acquired"),
                _ => {
                    self.stats.bad_sync_count += 1;
                    warn!("non-standard TPIU sync ({} leading 0xFF bytes)", ff_run);
                }
            }
            self.phase = Phase::Framing;
            self.buffer_index = 0;
            return Vec::new();
        }
        warn!(
            "malformed TPIU sync: expected 0xFF or sync terminator, saw {:#04X}",
            data
        );
        self.stats.bad_sync_count += 1;
        self.phase = Phase::Framing;
        self.buffer_index = 0;
        let err = AnnotatedFrame::new(
            FrameTag::Err,
            start,
            end,
            format!("Expected 0xFF or sync terminator, saw {:#04X}", data),
        );
        let mut out = self.continue_framing(data, start, end);
        out.insert(0, err);
        out
    }

    fn drain_frame(&mut self) -> Vec<AnnotatedFrame> {
        self.stats.frames_total += 1;
        let bitvec = self.buffer[BITVEC_INDEX].map(|s| s.data).unwrap_or(0);
        let mut runs: Vec<(u8, Vec<Slot>)> = Vec::new();
        // A delayed marker's stream id applies starting the byte *after* the
        // very next data byte, not to that next byte itself.
        let mut pending_stream: Option<u8> = None;

        let mut even_idx = 0;
        while even_idx < BITVEC_INDEX {
            let bit = (bitvec >> (even_idx / 2)) & 1;
            if let Some(slot) = self.buffer[even_idx] {
                if slot.data & 1 == 1 {
                    let new_stream = slot.data >> 1;
                    if bit == 1 {
                        pending_stream = Some(new_stream);
                    } else {
                        self.active_stream = new_stream;
                        pending_stream = None;
                    }
                } else {
                    let value = (slot.data & 0xFE) | bit;
                    Self::push_run(&mut runs, self.active_stream, Slot { data: value, ..slot });
                }
            }
            if even_idx + 1 < BITVEC_INDEX {
                if let Some(odd_slot) = self.buffer[even_idx + 1] {
                    Self::push_run(&mut runs, self.active_stream, odd_slot);
                    if let Some(new_stream) = pending_stream.take() {
                        self.active_stream = new_stream;
                    }
                }
            }
            even_idx += 2;
        }

        self.buffer = [None; FRAME_LEN];
        self.emit(runs)
    }

    fn push_run(runs: &mut Vec<(u8, Vec<Slot>)>, stream: u8, slot: Slot) {
        if let Some(last) = runs.last_mut() {
            if last.0 == stream {
                last.1.push(slot);
                return;
            }
        }
        runs.push((stream, vec![slot]));
    }

    fn emit(&mut self, runs: Vec<(u8, Vec<Slot>)>) -> Vec<AnnotatedFrame> {
        let mut out = Vec::new();
        for (stream, slots) in runs {
            if slots.is_empty() {
                continue;
            }
            match self.decode_style {
                TpiuDecodeStyle::All => out.push(self.aggregate_frame(stream, &slots)),
                TpiuDecodeStyle::Stream => {
                    if stream == self.stream_filter {
                        out.push(self.aggregate_frame(stream, &slots));
                    }
                }
                TpiuDecodeStyle::SaleaePassthrough => {
                    if stream == self.stream_filter {
                        for s in &slots {
                            self.stats.bytes_emitted += 1;
                            out.push(AnnotatedFrame::new(
                                FrameTag::Data,
                                s.start,
                                s.end,
                                format!("{:02X}", s.data),
                            ));
                        }
                    }
                }
            }
        }
        out
    }

    fn aggregate_frame(&mut self, stream: u8, slots: &[Slot]) -> AnnotatedFrame {
        self.stats.bytes_emitted += slots.len() as u64;
        let start = slots.first().expect("non-empty run").start;
        let end = slots.last().expect("non-empty run").end;
        let hex: String = slots.iter().map(|s| format!("{:02X}", s.data)).collect();
        AnnotatedFrame::new(FrameTag::Tpiu, start, end, format!("Stream#{} Data#{}", stream, hex))
    }
}
