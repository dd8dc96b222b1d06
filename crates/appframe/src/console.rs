use frame::{AnnotatedFrame, FrameTag};
use log::trace;

/// Accumulates printable stimulus-port bytes between line terminators into
/// whole console messages, so a message split across many TPIU/ITM packets
/// is reported as a single frame.
pub struct ConsoleGrouper {
    buffer: String,
    start_time: Option<u64>,
}

impl Default for ConsoleGrouper {
    fn default() -> Self {
        Self::new()
    }
}

impl ConsoleGrouper {
    pub fn new() -> Self {
        ConsoleGrouper {
            buffer: String::new(),
            start_time: None,
        }
    }

    /// Feed one stimulus-port byte. Returns a completed message frame when
    /// `byte` is a terminator (`\n` or NUL) and the buffer is non-empty.
    pub fn push(&mut self, start_time: u64, end_time: u64, byte: u8) -> Option<AnnotatedFrame> {
        if byte == b'\n' || byte == 0x00 {
            if self.buffer.is_empty() {
                return None;
            }
            let start = self.start_time.take().unwrap_or(start_time);
            let text = std::mem::take(&mut self.buffer);
            trace!("console message closed: {:?}", text);
            return Some(AnnotatedFrame::new(FrameTag::Console, start, end_time, text));
        }
        let ch = byte as char;
        if !ch.is_control() {
            if self.start_time.is_none() {
                self.start_time = Some(start_time);
            }
            self.buffer.push(ch);
        }
        None
    }
}
