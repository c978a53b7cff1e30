//! Guest OS personality layer for an ARMv7 user-mode emulator: calling
//! convention marshalling between host and guest functions, uid-tagged
//! kernel object tables, and the blocking synchronization primitives
//! (event flags, semaphores, mutexes, condition variables) guest threads
//! block on.

mod abi;
mod dispatch;
mod error;
mod kernel;
mod marshal;
mod memory;
mod registers;
mod sync;
mod table;
mod thread;
mod uid;

pub use abi::*;
pub use dispatch::*;
pub use error::*;
pub use kernel::*;
pub use marshal::*;
pub use memory::*;
pub use registers::*;
pub use sync::*;
pub use table::*;
pub use thread::*;
pub use uid::*;
