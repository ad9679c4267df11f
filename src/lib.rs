//! Stack unwinding through precompiled "quicken" tables.
//!
//! Each image's ARM exidx or DWARF CFI is compiled once into a compact
//! bytecode table, which is then interpreted for every frame of every
//! backtrace that passes through the image.

pub mod arch;
mod error;
mod fp;
mod frame_info;
mod generator;
mod interface;
mod maps;
mod memory;
pub mod quicken;
mod unwinder;

pub use arch::{Arch, ArchInfo, MachineState, Regs};
pub use error::QutErrorCode;
pub use fp::{fp_unwind, FramePointerWalker};
pub use frame_info::{CfiSource, FrameInfo, FrameInfos};
pub use generator::{decode_ehabi, EhabiOp};
pub use interface::QuickenInterface;
pub use maps::{MapInfo, QuickenMaps};
pub use memory::{Memory, MemoryBuffer};
pub use quicken::QutSections;
pub use unwinder::{quicken_unwind, Unwinder};
