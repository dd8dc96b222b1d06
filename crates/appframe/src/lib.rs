//! Application-level grouping above the raw ITM stream: the eCosPro-style
//! multi-field instrumentation record reassembler, and a console-message
//! grouper that coalesces stimulus bytes between line terminators.

mod console;
mod reassembler;

pub use console::ConsoleGrouper;
pub use reassembler::Reassembler;
