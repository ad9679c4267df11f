//! The compiled quicken table: bytecode, the sorted entry table and the
//! interpreter that replays a program against a frame.

mod instructions;
pub(crate) mod stepper;
mod table;
mod width;

pub use instructions::{ProgramIter, QutInstruction, QutProgram};
pub use table::{QutEntry, QutSections, TableBuilder};
pub use width::{Addr32, Addr64, AddressWidth};
