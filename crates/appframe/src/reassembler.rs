use frame::{AnnotatedFrame, FrameTag};
use log::warn;

/// Reassembles one stimulus port's ITM writes into complete application
/// records: a 2-byte head (`0xNNSS`, field count / sequence number), `N`
/// 4-byte data words, and a 1-byte tail (`0xSS`) confirming the sequence.
///
/// `expected_sequence == None` is the idle sentinel: no head has been seen
/// since the last record closed.
pub struct Reassembler {
    expected_sequence: Option<u8>,
    last_sequence: u8,
    expected_words: u8,
    seen_words: u8,
    dvector: Vec<u32>,
    start_time: u64,
    end_time: u64,
}

impl Default for Reassembler {
    fn default() -> Self {
        Self::new()
    }
}

impl Reassembler {
    pub fn new() -> Self {
        Reassembler {
            expected_sequence: None,
            last_sequence: 0,
            expected_words: 0,
            seen_words: 0,
            dvector: Vec::new(),
            start_time: 0,
            end_time: 0,
        }
    }

    /// Feed one ITM write (`size` bytes, `pdata` its little-endian value)
    /// destined for the instrumented stimulus port.
    pub fn packet(&mut self, start_time: u64, end_time: u64, size: u8, pdata: u32) -> Option<AnnotatedFrame> {
        match size {
            2 => self.head(start_time, end_time, pdata),
            4 => {
                self.dvector.push(pdata);
                self.seen_words += 1;
                self.end_time = end_time;
                None
            }
            1 => self.tail(end_time, pdata),
            _ => {
                let start = self.start_time;
                self.expected_sequence = None;
                Some(AnnotatedFrame::new(
                    FrameTag::Err,
                    start,
                    end_time,
                    format!("Unexpected field size {}", size),
                ))
            }
        }
    }

    fn head(&mut self, start_time: u64, end_time: u64, pdata: u32) -> Option<AnnotatedFrame> {
        let partial = self.expected_sequence.map(|seq| {
            warn!("new record head arrived while seq# {:02X} was still open", seq);
            AnnotatedFrame::new(
                FrameTag::Err,
                self.start_time,
                self.end_time,
                format!("Partial record for seq# {:02X}", seq),
            )
        });
        self.seen_words = 0;
        self.expected_sequence = Some((pdata & 0xFF) as u8);
        self.expected_words = ((pdata >> 8) & 0xFF) as u8;
        self.start_time = start_time;
        self.end_time = end_time;
        self.dvector.clear();
        partial
    }

    fn tail(&mut self, end_time: u64, pdata: u32) -> Option<AnnotatedFrame> {
        let snum = (pdata & 0xFF) as u8;
        let frame = match self.expected_sequence {
            None => AnnotatedFrame::new(
                FrameTag::Err,
                self.start_time,
                end_time,
                format!("Seq# mismatch: saw {:02X} expected idle", snum),
            ),
            Some(expected) if expected != snum => AnnotatedFrame::new(
                FrameTag::Err,
                self.start_time,
                end_time,
                format!("Seq# mismatch: saw {:02X} expected {:02X}", snum, expected),
            ),
            Some(expected) => {
                let mut text = String::new();
                if snum != self.last_sequence.wrapping_add(1) {
                    text.push_str("[Missed packets] ");
                } else if self.seen_words != self.expected_words {
                    text.push_str(&format!(
                        "[Fields saw {} expected {}] ",
                        self.seen_words, self.expected_words
                    ));
                }
                text.push_str(&format!("Seq#{:02X}", expected));
                for word in &self.dvector {
                    text.push_str(&format!(" {:08X}", word));
                }
                AnnotatedFrame::new(FrameTag::Console, self.start_time, end_time, text)
            }
        };
        self.last_sequence = snum;
        self.expected_sequence = None;
        Some(frame)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn head(nf: u8, seq: u8) -> u32 {
        ((nf as u32) << 8) | seq as u32
    }

    #[test]
    fn well_formed_record_emits_one_console_frame() {
        let mut r = Reassembler::new();
        assert!(r.packet(0, 1, 2, head(2, 1)).is_none());
        assert!(r.packet(1, 2, 4, 0xDEAD_BEEF).is_none());
        assert!(r.packet(2, 3, 4, 0xCAFE_BABE).is_none());
        let out = r.packet(3, 4, 1, 1).expect("tail must emit");
        assert_eq!(out.tag, FrameTag::Console);
        assert!(out.text.contains("Seq#01"), "{}", out.text);
        assert!(out.text.contains("DEADBEEF"), "{}", out.text);
        assert!(out.text.contains("CAFEBABE"), "{}", out.text);
        assert!(!out.text.contains("Missed"));
    }

    #[test]
    fn sequence_mismatch_is_an_error() {
        let mut r = Reassembler::new();
        r.packet(0, 1, 2, head(0, 5));
        let out = r.packet(1, 2, 1, 6).unwrap();
        assert_eq!(out.tag, FrameTag::Err);
        assert!(out.text.contains("saw 06 expected 05"), "{}", out.text);
    }

    #[test]
    fn unclosed_head_reports_partial_record() {
        let mut r = Reassembler::new();
        r.packet(0, 1, 2, head(0, 1));
        let out = r.packet(1, 2, 2, head(0, 2)).expect("new head while open must emit");
        assert_eq!(out.tag, FrameTag::Err);
        assert!(out.text.contains("Partial record for seq# 01"));
    }

    #[test]
    fn missed_packet_gap_is_reported() {
        let mut r = Reassembler::new();
        // initial last_sequence is 0, so a first record at seq 1 is clean.
        r.packet(0, 1, 2, head(0, 1));
        r.packet(1, 2, 1, 1);
        // sequence jumps from 1 straight to 5: a gap.
        r.packet(2, 3, 2, head(0, 5));
        let out = r.packet(3, 4, 1, 5).unwrap();
        assert_eq!(out.tag, FrameTag::Console);
        assert!(out.text.contains("[Missed packets]"), "{}", out.text);
    }

    #[test]
    fn field_count_mismatch_is_noted() {
        let mut r = Reassembler::new();
        r.packet(0, 1, 2, head(2, 1));
        r.packet(1, 2, 4, 0x1111_1111);
        let out = r.packet(2, 3, 1, 1).unwrap();
        assert!(out.text.contains("[Fields saw 1 expected 2]"), "{}", out.text);
    }

    #[test]
    fn unexpected_payload_size_is_an_error() {
        let mut r = Reassembler::new();
        let out = r.packet(0, 1, 3, 0).unwrap();
        assert_eq!(out.tag, FrameTag::Err);
        assert!(out.text.contains("Unexpected field size 3"));
    }
}
