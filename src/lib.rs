//! # BSP Runtime
//!
//! A bulk synchronous parallel (BSP) runtime on top of a message-passing
//! transport. A program runs as a fixed group of processes that alternate
//! between purely local computation and synchronization barriers; one-sided
//! memory operations (`put`/`get` against registered regions), bulk message
//! passing, and registration changes issued during a superstep all become
//! visible at the next barrier, never earlier.
//!
//! Two levels of API are provided:
//!
//! - [`Bsp`]: the classic flat model, one logical process per transport
//!   rank, with process enquiry, DRMA, BSMP, global arrays, collectives and
//!   timing.
//! - [`ContextGroup`]: the composable layer, where one transport rank (a
//!   *node*) hosts many logical processes driven by a shared thread pool,
//!   with an in-process fast path for local peers and named variables
//!   shared and reduced across both thread and node boundaries.
//!
//! The transport is pluggable ([`Transport`]): a TCP mesh for distributed
//! runs, an in-process channel mesh for threaded runs and tests, and a
//! single-process stub.

pub mod collectives;
pub mod delivery;
pub mod engine;
pub mod error;
pub mod global;
pub mod logging;
pub mod memreg;
pub mod mesgqueue;
pub mod multi;
pub mod request;
pub mod table;
pub mod timing;
pub mod transport;

pub use engine::{Bsp, BspState};
pub use error::{BspError, Result};
pub use global::GlobalHandle;
pub use multi::shared::SharedDef;
pub use multi::{Context, ContextGroup, TaskMapper};
pub use timing::{warmup, Timer};
pub use transport::{ChannelMesh, SingleProcess, TcpMesh, TcpMeshConfig, Transport};

/// The current version of the runtime.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Address of a value, for registration and as a DRMA translation key.
pub fn addr_of<T: ?Sized>(value: &T) -> usize {
    value as *const T as *const u8 as usize
}

/// Address of a value the runtime will write through (a registered region
/// or a get destination). Deriving it from `&mut` keeps the provenance of
/// the later raw write anchored to a mutable borrow.
pub fn addr_of_mut<T: ?Sized>(value: &mut T) -> usize {
    value as *mut T as *mut u8 as usize
}

/// Default sizes and limits.
pub mod defaults {
    /// Initial payload slots per delivery-table column.
    pub const DELIV_MIN_SLOTS: usize = 16;

    /// Initial records per request-table column.
    pub const REQ_MIN_ROWS: usize = 16;

    /// Live global arrays per process.
    pub const MAX_GLOBAL_ARRAYS: usize = 128;

    /// Registration requests a context may issue per superstep; the count
    /// must fit in the upper bits of the pre-exchange flag word.
    pub const MAX_REG_REQUESTS: usize = 0x0fff_ffff;
}
